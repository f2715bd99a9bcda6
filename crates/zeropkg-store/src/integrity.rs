use crate::db::PackageDb;
use crate::records::InstalledPackageRecord;
use crate::StoreError;
use std::collections::BTreeSet;
use std::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// The record file is unreadable or its checksum does not match.
    CorruptRecord { package: String, reason: String },
    /// A runtime dependency is not installed.
    DanglingDependency { package: String, dependency: String },
    MissingFile { package: String, path: String },
    ModifiedFile { package: String, path: String },
    /// A transaction was interrupted and has not been recovered yet.
    PendingTransaction { txid: String, package: String },
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::CorruptRecord { package, reason } => {
                write!(f, "{package}: corrupt record: {reason}")
            }
            IntegrityIssue::DanglingDependency {
                package,
                dependency,
            } => write!(f, "{package}: dependency '{dependency}' is not installed"),
            IntegrityIssue::MissingFile { package, path } => {
                write!(f, "{package}: missing file {path}")
            }
            IntegrityIssue::ModifiedFile { package, path } => {
                write!(f, "{package}: modified file {path}")
            }
            IntegrityIssue::PendingTransaction { txid, package } => {
                write!(f, "{package}: unrecovered transaction {txid}")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub records_checked: usize,
    pub records_passed: usize,
    pub files_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check record checksums, referential integrity, and that every recorded
/// file is still present (and unmodified, where a digest was recorded).
pub fn verify_integrity(db: &PackageDb) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport::default();
    let mut records: Vec<InstalledPackageRecord> = Vec::new();

    for result in db.records().list_with_errors()? {
        report.records_checked += 1;
        match result {
            Ok(rec) => {
                report.records_passed += 1;
                records.push(rec);
            }
            Err((package, e)) => report.issues.push(IntegrityIssue::CorruptRecord {
                package,
                reason: e.to_string(),
            }),
        }
    }

    let installed: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
    for rec in &records {
        for dep in &rec.dependencies {
            if !installed.contains(dep.as_str()) {
                report.issues.push(IntegrityIssue::DanglingDependency {
                    package: rec.name.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
        for path in &rec.files {
            report.files_checked += 1;
            let live = InstalledPackageRecord::live_path(db.root(), path);
            let Ok(meta) = live.symlink_metadata() else {
                report.issues.push(IntegrityIssue::MissingFile {
                    package: rec.name.to_string(),
                    path: path.clone(),
                });
                continue;
            };
            let Some(expected) = rec.digests.get(path) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = match fs::read(&live) {
                Ok(data) => blake3::hash(&data).to_hex().as_str() != expected.as_str(),
                Err(_) => true,
            };
            if modified {
                report.issues.push(IntegrityIssue::ModifiedFile {
                    package: rec.name.to_string(),
                    path: path.clone(),
                });
            }
        }
    }

    for entry in db.journal().list_incomplete()? {
        report.issues.push(IntegrityIssue::PendingTransaction {
            txid: entry.txid,
            package: entry.package,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::write_archive;
    use std::collections::BTreeMap;
    use std::path::Path;
    use zeropkg_schema::{FileDigest, PackageName, Version};

    fn install_one(db: &PackageDb, stage: &Path, name: &str, content: &str) {
        let rel = format!("usr/bin/{name}");
        fs::create_dir_all(stage.join("usr/bin")).unwrap();
        fs::write(stage.join(&rel), content).unwrap();
        let path = format!("/{rel}");
        let files: BTreeSet<String> = [path.clone()].into_iter().collect();
        let tar = stage.join(format!("{name}.tar"));
        write_archive(stage, &files, &BTreeMap::new(), &tar).unwrap();
        let mut rec =
            InstalledPackageRecord::new(PackageName::new(name), Version::parse("1").unwrap());
        rec.digests.insert(
            path,
            FileDigest::new(blake3::hash(content.as_bytes()).to_hex().to_string()),
        );
        db.install(rec, &tar).unwrap();
    }

    #[test]
    fn clean_database_passes() {
        let dir = tempfile::tempdir().unwrap();
        let db = PackageDb::open(&dir.path().join("db"), &dir.path().join("root")).unwrap();
        install_one(&db, &dir.path().join("stage"), "tool", "hello");
        let report = verify_integrity(&db).unwrap();
        assert!(report.is_clean(), "{:?}", report.issues);
        assert_eq!(report.records_checked, 1);
        assert_eq!(report.files_checked, 1);
    }

    #[test]
    fn detects_missing_and_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let db = PackageDb::open(&dir.path().join("db"), &root).unwrap();
        install_one(&db, &dir.path().join("stage"), "a", "aaa");
        install_one(&db, &dir.path().join("stage"), "b", "bbb");
        fs::remove_file(root.join("usr/bin/a")).unwrap();
        fs::write(root.join("usr/bin/b"), "tampered").unwrap();

        let report = verify_integrity(&db).unwrap();
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::MissingFile { package, .. } if package == "a")));
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i, IntegrityIssue::ModifiedFile { package, .. } if package == "b")));
    }

    #[test]
    fn detects_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = PackageDb::open(&dir.path().join("db"), &dir.path().join("root")).unwrap();
        install_one(&db, &dir.path().join("stage"), "tool", "x");
        let path = db.layout().record_path("tool");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"explicit\": false", "\"explicit\": true")).unwrap();

        let report = verify_integrity(&db).unwrap();
        assert_eq!(report.records_passed, 0);
        assert!(matches!(
            report.issues[0],
            IntegrityIssue::CorruptRecord { .. }
        ));
    }
}
