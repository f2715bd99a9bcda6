//! Transactional package database for Zeropkg.
//!
//! This crate provides the storage layer: `DbLayout` for the on-disk
//! directory structure, `RecordStore` for checksummed installed-package
//! records, the `Journal` (write-ahead log with commit marker) used for
//! crash recovery, deterministic package archives, the append-only event
//! log, and `PackageDb`, the single handle through which every install,
//! upgrade and uninstall is applied as one atomic transaction.

pub mod archive;
pub mod db;
pub mod events;
pub mod integrity;
pub mod layout;
pub mod lock;
pub mod records;
pub mod wal;

pub use archive::{list_archive, unpack_archive, write_archive, ArchiveEntry, ArchiveEntryKind};
pub use db::{
    BrokenPackage, InstallOutcome, PackageDb, Transaction, UninstallReport, UpgradeReport,
};
pub use events::{Event, EventLevel, EventLog};
pub use integrity::{verify_integrity, IntegrityIssue, IntegrityReport};
pub use layout::{DbLayout, STORE_FORMAT_VERSION};
pub use lock::FileLock;
pub use records::{FileOwnership, InstalledPackageRecord, RecordStore};
pub use wal::{Journal, JournalAction, JournalEntry, RecoveryReport, TxKind};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` atomically: temp file, fsync, rename, fsync dir.
pub(crate) fn atomic_write(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    use std::io::Write;
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for record '{package}': expected {expected}, got {actual}")]
    IntegrityFailure {
        package: String,
        expected: String,
        actual: String,
    },
    #[error("package not installed: {0}")]
    NotFound(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("database format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid package name: {0}")]
    InvalidName(String),
    #[error("cannot uninstall '{package}': required by {}", dependents.join(", "))]
    DependentsExist {
        package: String,
        dependents: Vec<String>,
    },
    #[error("transaction for '{package}' rejected: '{dependent}' depends on '{dependency}', which would not be installed")]
    DanglingDependency {
        package: String,
        dependent: String,
        dependency: String,
    },
    #[error("'{package}' would overwrite {path}, owned by '{owner}'")]
    FileConflict {
        package: String,
        path: String,
        owner: String,
    },
    #[error("'{package}' would overwrite {path}, which no installed package owns")]
    UntrackedFile { package: String, path: String },
    #[error("archive entry '{0}' escapes the install root")]
    UnsafePath(String),
    #[error("transaction {txid} failed: {reason}")]
    Transaction { txid: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependents_exist_lists_all_dependents() {
        let e = StoreError::DependentsExist {
            package: "zlib".to_owned(),
            dependents: vec!["bash".to_owned(), "curl".to_owned()],
        };
        assert_eq!(
            e.to_string(),
            "cannot uninstall 'zlib': required by bash, curl"
        );
    }

    #[test]
    fn dangling_dependency_names_both_sides() {
        let e = StoreError::DanglingDependency {
            package: "a".to_owned(),
            dependent: "b".to_owned(),
            dependency: "a".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("'b' depends on 'a'"));
    }

    #[test]
    fn version_mismatch_display() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f");
        atomic_write(&dest, b"one").unwrap();
        atomic_write(&dest, b"two").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"two");
    }
}
