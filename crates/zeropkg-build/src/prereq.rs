use crate::sandbox::IsolationMode;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Locate an executable on the host `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn user_namespaces_work() -> bool {
    Command::new("unshare")
        .args(["--user", "--map-root-user", "--fork", "true"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the host tools a build with the given isolation needs.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_build_prereqs(mode: IsolationMode, fakeroot: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if find_in_path("tar").is_none() {
        missing.push(MissingPrereq {
            name: "tar",
            purpose: "extracting source archives",
            install_hint: "part of the base system on every distribution",
        });
    }

    if find_in_path("curl").is_none() {
        missing.push(MissingPrereq {
            name: "curl",
            purpose: "downloading package sources",
            install_hint:
                "zypper install curl | apt install curl | dnf install curl | pacman -S curl",
        });
    }

    match mode {
        IsolationMode::Host => {
            if fakeroot && find_in_path("fakeroot").is_none() {
                missing.push(MissingPrereq {
                    name: "fakeroot",
                    purpose: "simulated root ownership during install steps",
                    install_hint: "apt install fakeroot | dnf install fakeroot | pacman -S fakeroot",
                });
            }
        }
        IsolationMode::Chroot => {
            if find_in_path("chroot").is_none() {
                missing.push(MissingPrereq {
                    name: "chroot",
                    purpose: "isolated build root",
                    install_hint: "part of coreutils (usually pre-installed)",
                });
            }
        }
        IsolationMode::UserNamespace => {
            if find_in_path("unshare").is_none() {
                missing.push(MissingPrereq {
                    name: "unshare",
                    purpose: "unprivileged build isolation",
                    install_hint: "part of util-linux (usually pre-installed)",
                });
            } else if !user_namespaces_work() {
                missing.push(MissingPrereq {
                    name: "user namespaces",
                    purpose: "unprivileged chroot builds",
                    install_hint:
                        "enable CONFIG_USER_NS=y in kernel, or: sysctl kernel.unprivileged_userns_clone=1",
                });
            }
        }
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nZeropkg needs these tools to fetch and build packages.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "fakeroot",
            purpose: "ownership",
            install_hint: "apt install fakeroot",
        };
        let s = format!("{m}");
        assert!(s.contains("fakeroot"));
        assert!(s.contains("ownership"));
        assert!(s.contains("apt install fakeroot"));
    }

    #[test]
    fn format_missing_lists_every_item() {
        let items = vec![
            MissingPrereq {
                name: "curl",
                purpose: "downloads",
                install_hint: "apt install curl",
            },
            MissingPrereq {
                name: "unshare",
                purpose: "isolation",
                install_hint: "util-linux",
            },
        ];
        let output = format_missing(&items);
        assert!(output.starts_with("missing prerequisites:"));
        assert!(output.contains("curl"));
        assert!(output.contains("unshare"));
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-tool-zeropkg").is_none());
    }
}
