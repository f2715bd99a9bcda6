//! `post_install` and `post_remove` hooks.
//!
//! These run on the live system as the invoking user, with the working
//! directory and `$ROOT` set to the install root.

use crate::sandbox::SANDBOX_PATH;
use crate::{BuildError, OUTPUT_TAIL_LINES};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Run `commands` in order, stopping at the first failure.
pub fn run_system_hooks(
    package: &str,
    version: &str,
    hook: &str,
    commands: &[String],
    root: &Path,
) -> Result<(), BuildError> {
    for command in commands {
        debug!("{package}: {hook} hook: {command}");
        let output = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(root)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("LC_ALL", "C")
            .env("ROOT", root)
            .env("ZEROPKG_PACKAGE", package)
            .env("ZEROPKG_VERSION", version)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| BuildError::HookFailed {
                package: package.to_owned(),
                hook: hook.to_owned(),
                command: command.clone(),
                status: format!("cannot spawn: {e}"),
                output_tail: String::new(),
            })?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            let lines: Vec<&str> = text.lines().collect();
            return Err(BuildError::HookFailed {
                package: package.to_owned(),
                hook: hook.to_owned(),
                command: command.clone(),
                status: output.status.to_string(),
                output_tail: lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n"),
            });
        }
    }
    if !commands.is_empty() {
        info!("{package}: ran {} {hook} hook(s)", commands.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hooks_run_in_the_root_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            "echo \"$ZEROPKG_PACKAGE $ZEROPKG_VERSION\" > marker".to_owned(),
            "test \"$ROOT\" = \"$(pwd)\" && echo same >> marker".to_owned(),
        ];
        run_system_hooks("ca-certs", "1.0", "post_install", &commands, dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("marker")).unwrap(),
            "ca-certs 1.0\nsame\n"
        );
    }

    #[test]
    fn failing_hook_stops_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let commands = vec![
            "echo nope >&2; exit 4".to_owned(),
            "touch never".to_owned(),
        ];
        let err = run_system_hooks("x", "1", "post_remove", &commands, dir.path()).unwrap_err();
        let BuildError::HookFailed {
            hook,
            status,
            output_tail,
            ..
        } = err
        else {
            panic!("expected hook failure");
        };
        assert_eq!(hook, "post_remove");
        assert!(status.contains('4'));
        assert_eq!(output_tail, "nope");
        assert!(!dir.path().join("never").exists());
    }
}
