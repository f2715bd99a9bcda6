use crate::{atomic_write, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current database format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of the package database rooted at `db_path`.
///
/// ```text
/// <db>/version
/// <db>/packages/<name>.json
/// <db>/journal/<txid>/{intent.json,staged/,backup/,COMMITTED}
/// <db>/locks/<name>.lock
/// <db>/events.jsonl
/// <db>/.lock
/// ```
#[derive(Debug, Clone)]
pub struct DbLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl DbLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn packages_dir(&self) -> PathBuf {
        self.root.join("packages")
    }

    #[inline]
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.packages_dir().join(format!("{name}.json"))
    }

    #[inline]
    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    /// Per-package build locks live next to the database so they are
    /// shared by every invocation that uses the same database.
    #[inline]
    pub fn build_lock_path(&self, name: &str) -> PathBuf {
        self.root.join("locks").join(format!("{name}.lock"))
    }

    #[inline]
    pub fn events_file(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.packages_dir())?;
        fs::create_dir_all(self.journal_dir())?;
        fs::create_dir_all(self.root.join("locks"))?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            atomic_write(&version_path, content.as_bytes())?;
        }
        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;
        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = DbLayout::new("/var/lib/zeropkg/db");
        assert_eq!(
            layout.record_path("zlib"),
            PathBuf::from("/var/lib/zeropkg/db/packages/zlib.json")
        );
        assert_eq!(
            layout.build_lock_path("zlib"),
            PathBuf::from("/var/lib/zeropkg/db/locks/zlib.lock")
        );
        assert_eq!(
            layout.events_file(),
            PathBuf::from("/var/lib/zeropkg/db/events.jsonl")
        );
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DbLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        assert!(layout.packages_dir().is_dir());
        assert!(layout.journal_dir().is_dir());
        layout.verify_version().unwrap();
    }

    #[test]
    fn foreign_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DbLayout::new(dir.path());
        fs::write(dir.path().join(VERSION_FILE), r#"{"format_version": 99}"#).unwrap();
        assert!(matches!(
            layout.initialize(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
