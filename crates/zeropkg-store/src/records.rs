use crate::layout::DbLayout;
use crate::{atomic_write, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use zeropkg_schema::{validate_package_name, FileDigest, PackageName, Version};

/// Ownership a file claims once installed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOwnership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstalledPackageRecord {
    pub name: PackageName,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Absolute paths inside the install root, e.g. `/usr/bin/bash`.
    pub files: BTreeSet<String>,
    /// Runtime dependencies at install time. Always present as records.
    pub dependencies: BTreeSet<PackageName>,
    #[serde(default)]
    pub build_dependencies: BTreeSet<PackageName>,
    /// Runtime dependencies removed from under this package by a forced uninstall.
    #[serde(default)]
    pub missing_dependencies: BTreeSet<PackageName>,
    /// Requested by the user rather than pulled in as a dependency.
    #[serde(default)]
    pub explicit: bool,
    #[serde(default)]
    pub ownership: BTreeMap<String, FileOwnership>,
    #[serde(default)]
    pub digests: BTreeMap<String, FileDigest>,
    /// Directories the install created; pruned on uninstall when empty.
    #[serde(default)]
    pub created_dirs: BTreeSet<String>,
    /// The recipe's `post_remove` hooks, run after uninstall even when the
    /// recipe has left the ports tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_hooks: Vec<String>,
    pub installed_at: String,
    /// blake3 checksum for integrity verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl InstalledPackageRecord {
    pub fn new(name: PackageName, version: Version) -> Self {
        Self {
            name,
            version,
            variant: None,
            files: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            build_dependencies: BTreeSet::new(),
            missing_dependencies: BTreeSet::new(),
            explicit: false,
            ownership: BTreeMap::new(),
            digests: BTreeMap::new(),
            created_dirs: BTreeSet::new(),
            remove_hooks: Vec::new(),
            installed_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    /// Checksum over the record content, excluding the checksum field itself.
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    /// Serialize with an embedded checksum, ready to be written to disk.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut sealed = self.clone();
        sealed.checksum = Some(sealed.compute_checksum()?);
        Ok(serde_json::to_vec_pretty(&sealed)?)
    }

    /// Parse and verify a record produced by [`encode`](Self::encode).
    pub fn decode(name: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        let record: InstalledPackageRecord = serde_json::from_slice(bytes)?;
        let Some(expected) = record.checksum.as_ref() else {
            return Err(StoreError::IntegrityFailure {
                package: name.to_owned(),
                expected: "checksum".to_owned(),
                actual: "none".to_owned(),
            });
        };
        let actual = record.compute_checksum()?;
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                package: name.to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
        if record.name != *name {
            return Err(StoreError::IntegrityFailure {
                package: name.to_owned(),
                expected: name.to_owned(),
                actual: record.name.to_string(),
            });
        }
        Ok(record)
    }

    /// Location of a recorded path under `root`.
    pub fn live_path(root: &Path, recorded: &str) -> PathBuf {
        root.join(recorded.trim_start_matches('/'))
    }
}

/// Committed installed-package records, one checksummed JSON file each.
///
/// Writes go through [`crate::Journal`] replay; this type only reads and
/// applies already-committed state.
#[derive(Debug, Clone)]
pub struct RecordStore {
    layout: DbLayout,
}

impl RecordStore {
    pub fn new(layout: DbLayout) -> Self {
        Self { layout }
    }

    pub(crate) fn put_encoded(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        fs::create_dir_all(self.layout.packages_dir())?;
        atomic_write(&self.layout.record_path(name), bytes)
    }

    pub fn get(&self, name: &str) -> Result<InstalledPackageRecord, StoreError> {
        validate_name(name)?;
        let path = self.layout.record_path(name);
        if !path.exists() {
            return Err(StoreError::NotFound(name.to_owned()));
        }
        let bytes = fs::read(&path)?;
        InstalledPackageRecord::decode(name, &bytes)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_name(name).is_ok() && self.layout.record_path(name).exists()
    }

    pub(crate) fn remove(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        let path = self.layout.record_path(name);
        if path.exists() {
            fs::remove_file(path)?;
            crate::fsync_dir(&self.layout.packages_dir())?;
        }
        Ok(())
    }

    /// Names of every committed record, sorted.
    pub fn names(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.packages_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if !name.starts_with('.') {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// All readable records. Corrupt entries are skipped with a warning.
    pub fn list(&self) -> Result<Vec<InstalledPackageRecord>, StoreError> {
        let mut records = Vec::new();
        for name in self.names()? {
            match self.get(&name) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!("skipping corrupted record '{name}': {e}"),
            }
        }
        Ok(records)
    }

    /// Like `list()`, but surfaces per-entry errors for integrity reports.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(
        &self,
    ) -> Result<Vec<Result<InstalledPackageRecord, (String, StoreError)>>, StoreError> {
        Ok(self
            .names()?
            .into_iter()
            .map(|name| self.get(&name).map_err(|e| (name, e)))
            .collect())
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    validate_package_name(name).map_err(|_| StoreError::InvalidName(name.to_owned()))
}
