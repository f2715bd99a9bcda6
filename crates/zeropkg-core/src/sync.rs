//! Refreshing the ports tree.

use crate::CoreError;
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};
use zeropkg_schema::RepoSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Cloned,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub action: SyncAction,
    /// Revision the tree is at afterwards, when the backend knows one.
    pub revision: Option<String>,
}

/// Brings the ports tree at `ports_dir` up to date.
pub trait PortsSync {
    fn sync(&self, ports_dir: &Path) -> Result<SyncReport, CoreError>;
}

/// Clones or fast-forwards a git checkout of the ports repository.
#[derive(Debug, Clone)]
pub struct GitSync {
    remote: Option<String>,
    branch: String,
}

impl GitSync {
    pub fn new(remote: Option<String>, branch: impl Into<String>) -> Self {
        Self {
            remote,
            branch: branch.into(),
        }
    }

    pub fn from_config(repo: &RepoSection) -> Self {
        Self::new(repo.remote.clone(), repo.branch.clone())
    }

    fn git(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, CoreError> {
        let mut cmd = Command::new("git");
        if let Some(dir) = cwd {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args);
        debug!("running git {}", args.join(" "));
        let output = cmd
            .output()
            .map_err(|e| CoreError::Sync(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Sync(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

impl PortsSync for GitSync {
    fn sync(&self, ports_dir: &Path) -> Result<SyncReport, CoreError> {
        let action = if ports_dir.join(".git").exists() {
            info!("updating ports tree in {}", ports_dir.display());
            self.git(
                Some(ports_dir),
                &["pull", "--ff-only", "origin", &self.branch],
            )?;
            SyncAction::Updated
        } else {
            let remote = self.remote.as_deref().ok_or_else(|| {
                CoreError::Sync(format!(
                    "{} is not a git checkout and no [repo] remote is configured",
                    ports_dir.display()
                ))
            })?;
            if ports_dir.exists() && ports_dir.read_dir()?.next().is_some() {
                return Err(CoreError::Sync(format!(
                    "{} exists, is not empty, and is not a git checkout",
                    ports_dir.display()
                )));
            }
            info!("cloning {remote} ({}) into {}", self.branch, ports_dir.display());
            let target = ports_dir.to_string_lossy();
            self.git(
                None,
                &["clone", "--branch", &self.branch, remote, &target],
            )?;
            SyncAction::Cloned
        };
        let revision = self.git(Some(ports_dir), &["rev-parse", "HEAD"]).ok();
        Ok(SyncReport { action, revision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use zeropkg_build::find_in_path;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=zeropkg", "-c", "user.email=zeropkg@localhost"])
            .args(args)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {args:?} failed");
    }

    #[test]
    fn clone_then_update() {
        if find_in_path("git").is_none() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        fs::create_dir_all(upstream.join("zlib")).unwrap();
        git(&upstream, &["init", "--quiet", "--initial-branch=main"]);
        fs::write(
            upstream.join("zlib/recipe.toml"),
            "name = \"zlib\"\nversion = \"1.3\"\n",
        )
        .unwrap();
        git(&upstream, &["add", "."]);
        git(&upstream, &["commit", "--quiet", "-m", "zlib"]);

        let ports = dir.path().join("ports");
        let sync = GitSync::new(Some(upstream.to_string_lossy().into_owned()), "main");
        let first = sync.sync(&ports).unwrap();
        assert_eq!(first.action, SyncAction::Cloned);
        assert!(ports.join("zlib/recipe.toml").exists());

        fs::write(
            upstream.join("zlib/recipe.toml"),
            "name = \"zlib\"\nversion = \"1.3.1\"\n",
        )
        .unwrap();
        git(&upstream, &["commit", "--quiet", "-am", "zlib 1.3.1"]);
        let second = sync.sync(&ports).unwrap();
        assert_eq!(second.action, SyncAction::Updated);
        assert_ne!(first.revision, second.revision);
        assert!(fs::read_to_string(ports.join("zlib/recipe.toml"))
            .unwrap()
            .contains("1.3.1"));
    }

    #[test]
    fn refuses_without_remote() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitSync::new(None, "main")
            .sync(&dir.path().join("ports"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Sync(_)));
    }

    #[test]
    fn refuses_to_clone_over_a_populated_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stray"), "x").unwrap();
        let err = GitSync::new(Some("/nonexistent".into()), "main")
            .sync(dir.path())
            .unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }
}
