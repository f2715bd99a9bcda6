use crate::{BuildError, CancelFlag, OUTPUT_TAIL_LINES};
use std::collections::BTreeMap;
use std::fmt::{Display, Write as _};
use std::fs::{self, File};
use std::io::Write as _;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zeropkg_schema::{BuildPhase, BuildStep, BuildUser};

/// `PATH` seen by build steps.
pub const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Quote a string for safe inclusion in a POSIX shell script.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

pub fn shell_quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

#[allow(unsafe_code)]
pub(crate) fn effective_uid() -> u32 {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

#[allow(unsafe_code)]
fn kill_process_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill() with a negative pid signals the process group the step
    // was spawned into; it touches no memory.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

/// How build steps are isolated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Run in the sandbox directory on the host filesystem.
    Host,
    /// `chroot` into the sandbox root; requires real root.
    Chroot,
    /// `chroot` inside an unprivileged user + mount namespace.
    UserNamespace,
}

impl IsolationMode {
    pub fn select(chroot_enabled: bool) -> Self {
        if !chroot_enabled {
            IsolationMode::Host
        } else if effective_uid() == 0 {
            IsolationMode::Chroot
        } else {
            IsolationMode::UserNamespace
        }
    }

    pub fn is_chrooted(self) -> bool {
        !matches!(self, IsolationMode::Host)
    }
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Host => write!(f, "host"),
            IsolationMode::Chroot => write!(f, "chroot"),
            IsolationMode::UserNamespace => write!(f, "user-namespace"),
        }
    }
}

/// Execution settings shared by every step of one build.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    pub mode: IsolationMode,
    pub fakeroot: bool,
    pub build_user: Option<BuildUser>,
}

impl StepPolicy {
    /// Whether `phase` runs under `fakeroot`. A user namespace already maps
    /// the builder to root, and real root without a build user needs no
    /// simulation.
    fn wants_fakeroot(&self, phase: BuildPhase) -> bool {
        if !self.fakeroot || phase != BuildPhase::Install {
            return false;
        }
        match self.mode {
            IsolationMode::UserNamespace => false,
            IsolationMode::Host | IsolationMode::Chroot => {
                effective_uid() != 0 || self.build_user.is_some()
            }
        }
    }

    /// The build user, applied only when we actually hold root.
    fn drop_to(&self) -> Option<BuildUser> {
        self.build_user.filter(|_| effective_uid() == 0)
    }
}

fn setup_failed(package: &str, reason: impl Display) -> BuildError {
    BuildError::SandboxSetupFailed {
        package: package.to_owned(),
        reason: reason.to_string(),
    }
}

/// An isolated build root for one attempt at building one package.
///
/// Layout under `<build_root>/<name>-<version>-<attempt>/`:
/// - `root/`            the isolated filesystem root (copy of the base root)
/// - `root/build/src/`  extracted sources
/// - `logs/`            per-step output
#[derive(Debug)]
pub struct SandboxInstance {
    package: String,
    dir: PathBuf,
    attempt: u32,
}

impl SandboxInstance {
    /// Create a fresh sandbox. The attempt number is the first one whose
    /// directory does not exist yet, so concurrent builds never share a root.
    pub fn create(
        build_root: &Path,
        package: &str,
        version: &str,
        base_root: Option<&Path>,
    ) -> Result<Self, BuildError> {
        fs::create_dir_all(build_root)
            .map_err(|e| setup_failed(package, format!("{}: {e}", build_root.display())))?;

        let mut attempt = 1u32;
        let dir = loop {
            let candidate = build_root.join(format!("{package}-{version}-{attempt}"));
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => {
                    return Err(setup_failed(
                        package,
                        format!("{}: {e}", candidate.display()),
                    ))
                }
            }
        };

        let instance = Self {
            package: package.to_owned(),
            dir,
            attempt,
        };

        if let Some(base) = base_root {
            if !base.is_dir() {
                return Err(setup_failed(
                    package,
                    format!("base root {} is not a directory", base.display()),
                ));
            }
            copy_tree(base, &instance.root())
                .map_err(|e| setup_failed(package, format!("copying base root: {e}")))?;
        }

        for d in [
            instance.src_dir(),
            instance.logs_dir(),
            instance.root().join("tmp"),
            instance.root().join("proc"),
            instance.root().join("dev"),
        ] {
            fs::create_dir_all(&d)
                .map_err(|e| setup_failed(package, format!("{}: {e}", d.display())))?;
        }

        debug!(
            "created sandbox {} (attempt {attempt})",
            instance.dir.display()
        );
        Ok(instance)
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> PathBuf {
        self.dir.join("root")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root().join("build")
    }

    pub fn src_dir(&self) -> PathBuf {
        self.work_dir().join("src")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    pub fn step_log(&self, index: usize) -> PathBuf {
        self.logs_dir().join(format!("step-{index}.log"))
    }

    /// Directory steps run in: the single top-level directory of the
    /// extracted sources when there is exactly one, otherwise `src/` itself.
    pub fn step_workdir(&self) -> PathBuf {
        let src = self.src_dir();
        let Ok(entries) = fs::read_dir(&src) else {
            return src;
        };
        let entries: Vec<_> = entries.filter_map(Result::ok).collect();
        if let [only] = entries.as_slice() {
            if only.file_type().is_ok_and(|t| t.is_dir()) {
                return only.path();
            }
        }
        src
    }

    /// Path of a host location as a step running in `mode` sees it.
    pub fn step_path(&self, host: &Path, mode: IsolationMode) -> String {
        if mode.is_chrooted() {
            self.inner_path(host)
        } else {
            host.to_string_lossy().into_owned()
        }
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.work_dir().join("patches")
    }

    /// Path of a host location as seen from inside the chroot.
    fn inner_path(&self, host: &Path) -> String {
        let root = self.root();
        match host.strip_prefix(&root) {
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => host.to_string_lossy().into_owned(),
        }
    }

    /// Give the build user ownership of the sandbox root so it can write there.
    pub fn hand_over(&self, user: BuildUser) -> Result<(), BuildError> {
        for entry in WalkDir::new(self.root()).follow_links(false) {
            let entry = entry.map_err(|e| setup_failed(&self.package, e))?;
            std::os::unix::fs::lchown(entry.path(), Some(user.uid), Some(user.gid))
                .map_err(|e| setup_failed(&self.package, format!("chown: {e}")))?;
        }
        Ok(())
    }

    fn userns_script(&self, inner_workdir: &str, command: &str) -> String {
        let qr = shell_quote_path(&self.root());
        let mut script = String::new();
        let _ = writeln!(script, "mount -t proc proc {qr}/proc 2>/dev/null || true");
        let _ = writeln!(
            script,
            "mount --rbind /dev {qr}/dev 2>/dev/null && mount --make-rslave {qr}/dev 2>/dev/null || true"
        );
        let inner = format!("cd {} && {command}", shell_quote(inner_workdir));
        let _ = writeln!(script, "exec chroot {qr} /bin/sh -c {}", shell_quote(&inner));
        script
    }

    /// Construct the process for one step. `env` is applied after the fixed
    /// variables, except `DESTDIR`, `HOME` and `ZEROPKG_SRCDIR`, which always
    /// point into the sandbox.
    pub fn step_command(
        &self,
        step: &BuildStep,
        workdir: &Path,
        env: &BTreeMap<String, String>,
        policy: &StepPolicy,
    ) -> Command {
        let fakeroot = policy.wants_fakeroot(step.phase);
        let inner_workdir = self.inner_path(workdir);

        let (mut cmd, destdir, home, srcdir) = match policy.mode {
            IsolationMode::Host => {
                let mut cmd = if fakeroot {
                    let mut c = Command::new("fakeroot");
                    c.args(["--", "/bin/sh"]);
                    c
                } else {
                    Command::new("/bin/sh")
                };
                cmd.arg("-c").arg(&step.command);
                cmd.current_dir(workdir);
                (
                    cmd,
                    self.root().to_string_lossy().into_owned(),
                    self.work_dir().to_string_lossy().into_owned(),
                    workdir.to_string_lossy().into_owned(),
                )
            }
            IsolationMode::Chroot => {
                let mut cmd = Command::new("chroot");
                if let Some(user) = policy.build_user {
                    cmd.arg(format!("--userspec={}:{}", user.uid, user.gid));
                }
                cmd.arg(self.root());
                if fakeroot {
                    cmd.args(["fakeroot", "--"]);
                }
                cmd.arg("/bin/sh").arg("-c").arg(format!(
                    "cd {} && {}",
                    shell_quote(&inner_workdir),
                    step.command
                ));
                (cmd, "/".to_owned(), "/build".to_owned(), inner_workdir)
            }
            IsolationMode::UserNamespace => {
                let mut cmd = Command::new("unshare");
                cmd.args([
                    "--user",
                    "--map-root-user",
                    "--mount",
                    "--pid",
                    "--fork",
                    "--kill-child=SIGKILL",
                ]);
                cmd.arg("/bin/sh")
                    .arg("-c")
                    .arg(self.userns_script(&inner_workdir, &step.command));
                (cmd, "/".to_owned(), "/build".to_owned(), inner_workdir)
            }
        };

        if policy.mode != IsolationMode::Chroot {
            if let Some(user) = policy.drop_to() {
                cmd.uid(user.uid).gid(user.gid);
            }
        }

        cmd.env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("LC_ALL", "C")
            .env("SOURCE_DATE_EPOCH", "0")
            .env("TERM", "dumb")
            .envs(env)
            .env("HOME", home)
            .env("ZEROPKG_SRCDIR", srcdir)
            .env("DESTDIR", destdir);
        cmd.process_group(0);
        cmd
    }

    /// Run one step to completion, writing its combined output to
    /// `logs/step-<index>.log`. A raised cancel flag kills the step.
    pub fn run_step(
        &self,
        index: usize,
        step: &BuildStep,
        env: &BTreeMap<String, String>,
        policy: &StepPolicy,
        cancel: &CancelFlag,
    ) -> Result<(), BuildError> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                package: self.package.clone(),
            });
        }

        let log_path = self.step_log(index);
        let mut log = File::create(&log_path)?;
        writeln!(log, "$ {}", step.command)?;

        let workdir = self.step_workdir();
        let mut cmd = self.step_command(step, &workdir, env, policy);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        debug!(
            "{}: step {index} ({}) in {}: {}",
            self.package,
            step.phase,
            policy.mode,
            step.command
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| setup_failed(&self.package, format!("cannot spawn step {index}: {e}")))?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                warn!("{}: killing step {index} on cancel", self.package);
                kill_process_group(child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(BuildError::Cancelled {
                    package: self.package.clone(),
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if status.success() {
            return Ok(());
        }
        Err(BuildError::BuildStepFailed {
            package: self.package.clone(),
            index,
            phase: step.phase,
            command: step.command.clone(),
            status: describe_status(status),
            output_tail: read_tail(&log_path, OUTPUT_TAIL_LINES),
            log: log_path,
        })
    }

    pub fn remove(self) -> Result<(), std::io::Error> {
        debug!("removing sandbox {}", self.dir.display());
        fs::remove_dir_all(&self.dir)
    }

    /// Keep the sandbox on disk and return its location.
    pub fn preserve(self) -> PathBuf {
        self.dir
    }
}

fn describe_status(status: ExitStatus) -> String {
    status.to_string()
}

fn read_tail(path: &Path, lines: usize) -> String {
    let Ok(data) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&data);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Copy a directory tree, preserving symlinks and permission bits.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
            let mode = entry
                .metadata()
                .map_err(std::io::Error::other)?
                .permissions()
                .mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))?;
        } else if ft.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if ft.is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            debug!("not copying special file {}", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_policy() -> StepPolicy {
        StepPolicy {
            mode: IsolationMode::Host,
            fakeroot: false,
            build_user: None,
        }
    }

    fn step(phase: BuildPhase, command: &str) -> BuildStep {
        BuildStep {
            phase,
            command: command.to_owned(),
        }
    }

    #[test]
    fn attempts_get_unique_directories() {
        let dir = tempfile::tempdir().unwrap();
        let a = SandboxInstance::create(dir.path(), "zlib", "1.3", None).unwrap();
        let b = SandboxInstance::create(dir.path(), "zlib", "1.3", None).unwrap();
        assert_eq!(a.attempt(), 1);
        assert_eq!(b.attempt(), 2);
        assert_ne!(a.dir(), b.dir());
        assert!(a.src_dir().is_dir());
        assert!(a.logs_dir().is_dir());
    }

    #[test]
    fn base_root_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::write(base.join("etc/os-release"), "NAME=lfs").unwrap();
        std::os::unix::fs::symlink("os-release", base.join("etc/release")).unwrap();

        let sb = SandboxInstance::create(&dir.path().join("build"), "a", "1", Some(&base)).unwrap();
        assert_eq!(
            fs::read_to_string(sb.root().join("etc/os-release")).unwrap(),
            "NAME=lfs"
        );
        assert!(sb
            .root()
            .join("etc/release")
            .symlink_metadata()
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn missing_base_root_is_a_setup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = SandboxInstance::create(dir.path(), "a", "1", Some(&dir.path().join("nope")))
            .unwrap_err();
        assert!(matches!(err, BuildError::SandboxSetupFailed { .. }));
    }

    #[test]
    fn host_step_installs_into_destdir() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "hello", "1", None).unwrap();
        let s = step(
            BuildPhase::Install,
            "mkdir -p \"$DESTDIR/usr/bin\" && echo hi > \"$DESTDIR/usr/bin/hello\"",
        );
        sb.run_step(1, &s, &BTreeMap::new(), &host_policy(), &CancelFlag::new())
            .unwrap();
        assert_eq!(
            fs::read_to_string(sb.root().join("usr/bin/hello")).unwrap(),
            "hi\n"
        );
        assert!(fs::read_to_string(sb.step_log(1))
            .unwrap()
            .starts_with("$ mkdir"));
    }

    #[test]
    fn environment_is_cleared_and_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "env", "1", None).unwrap();
        let mut env = BTreeMap::new();
        env.insert("CFLAGS".to_owned(), "-O2".to_owned());
        env.insert("DESTDIR".to_owned(), "/somewhere/else".to_owned());
        let s = step(
            BuildPhase::Compile,
            "echo \"$LC_ALL|$SOURCE_DATE_EPOCH|$CFLAGS|${CARGO:-unset}\" > \"$DESTDIR/env.txt\"",
        );
        sb.run_step(1, &s, &env, &host_policy(), &CancelFlag::new())
            .unwrap();
        assert_eq!(
            fs::read_to_string(sb.root().join("env.txt")).unwrap(),
            "C|0|-O2|unset\n"
        );
    }

    #[test]
    fn failing_step_reports_index_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "broken", "1", None).unwrap();
        let s = step(BuildPhase::Compile, "echo compiling; echo oops >&2; exit 3");
        let err = sb
            .run_step(2, &s, &BTreeMap::new(), &host_policy(), &CancelFlag::new())
            .unwrap_err();
        match err {
            BuildError::BuildStepFailed {
                package,
                index,
                phase,
                output_tail,
                status,
                log,
                ..
            } => {
                assert_eq!(package, "broken");
                assert_eq!(index, 2);
                assert_eq!(phase, BuildPhase::Compile);
                assert!(output_tail.contains("compiling"));
                assert!(output_tail.contains("oops"));
                assert!(status.contains('3'));
                assert_eq!(log, sb.step_log(2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn output_tail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "noisy", "1", None).unwrap();
        let s = step(
            BuildPhase::Compile,
            "i=0; while [ $i -lt 100 ]; do echo line$i; i=$((i+1)); done; exit 1",
        );
        let err = sb
            .run_step(1, &s, &BTreeMap::new(), &host_policy(), &CancelFlag::new())
            .unwrap_err();
        let BuildError::BuildStepFailed { output_tail, .. } = err else {
            panic!("expected step failure");
        };
        assert_eq!(output_tail.lines().count(), OUTPUT_TAIL_LINES);
        assert!(output_tail.ends_with("line99"));
    }

    #[test]
    fn cancelled_step_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "slow", "1", None).unwrap();
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = sb
            .run_step(
                1,
                &step(BuildPhase::Compile, "sleep 30"),
                &BTreeMap::new(),
                &host_policy(),
                &cancel,
            )
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, BuildError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn single_source_directory_becomes_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "zlib", "1.3", None).unwrap();
        assert_eq!(sb.step_workdir(), sb.src_dir());
        fs::create_dir_all(sb.src_dir().join("zlib-1.3")).unwrap();
        assert_eq!(sb.step_workdir(), sb.src_dir().join("zlib-1.3"));
        fs::write(sb.src_dir().join("fix.patch"), "").unwrap();
        assert_eq!(sb.step_workdir(), sb.src_dir());
    }

    #[test]
    fn chroot_commands_use_inner_paths() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "pkg", "1", None).unwrap();
        let workdir = sb.src_dir().join("pkg-1");
        let policy = StepPolicy {
            mode: IsolationMode::Chroot,
            fakeroot: false,
            build_user: Some(BuildUser { uid: 1000, gid: 1000 }),
        };
        let cmd = sb.step_command(
            &step(BuildPhase::Compile, "make"),
            &workdir,
            &BTreeMap::new(),
            &policy,
        );
        assert_eq!(cmd.get_program(), "chroot");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "--userspec=1000:1000");
        assert_eq!(args.last().unwrap(), "cd '/build/src/pkg-1' && make");
        let destdir = cmd
            .get_envs()
            .find(|(k, _)| *k == "DESTDIR")
            .and_then(|(_, v)| v);
        assert_eq!(destdir, Some(std::ffi::OsStr::new("/")));
    }

    #[test]
    fn step_paths_follow_isolation_mode() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "pkg", "1", None).unwrap();
        let patch = sb.patches_dir().join("01-fix.patch");
        assert_eq!(sb.step_path(&patch, IsolationMode::Chroot), "/build/patches/01-fix.patch");
        assert_eq!(
            sb.step_path(&patch, IsolationMode::UserNamespace),
            "/build/patches/01-fix.patch"
        );
        assert_eq!(
            sb.step_path(&patch, IsolationMode::Host),
            patch.to_string_lossy()
        );
    }

    #[test]
    fn userns_script_mounts_and_chroots() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "pkg", "1", None).unwrap();
        let script = sb.userns_script("/build/src", "make install");
        assert!(script.contains("mount -t proc"));
        assert!(script.contains("mount --rbind /dev"));
        assert!(script.contains("exec chroot"));
        assert!(script.contains("make install"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("hello"), "'hello'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn remove_deletes_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let sb = SandboxInstance::create(dir.path(), "tmp", "1", None).unwrap();
        let path = sb.dir().to_path_buf();
        sb.remove().unwrap();
        assert!(!path.exists());
    }
}
