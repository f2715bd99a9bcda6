//! The package database handle.
//!
//! `PackageDb` is passed explicitly to every operation; it owns no global
//! state. All mutation goes through a [`Transaction`], which holds the
//! database lock from `begin` until it commits or rolls back.

use crate::archive::{list_archive, unpack_archive};
use crate::events::{Event, EventLevel, EventLog};
use crate::layout::DbLayout;
use crate::lock::FileLock;
use crate::records::{InstalledPackageRecord, RecordStore};
use crate::wal::{Journal, JournalAction, JournalEntry, RecoveryReport, TxKind};
use crate::StoreError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeropkg_schema::{PackageName, Version};

#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() is always safe to call and cannot fail.
    unsafe { libc::geteuid() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Upgraded(UpgradeReport),
    /// The same version was already installed.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: Version,
    pub to: Version,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub removal_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UninstallReport {
    pub version: Version,
    pub removed_files: usize,
    pub removal_failures: usize,
    /// Dependents left with a missing dependency by a forced uninstall.
    pub broken_dependents: Vec<String>,
}

/// An installed package whose runtime dependencies are not all installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenPackage {
    pub name: String,
    pub missing: Vec<String>,
}

pub struct PackageDb {
    layout: DbLayout,
    root: PathBuf,
    records: RecordStore,
    journal: Journal,
    events: EventLog,
    preserve_ownership: bool,
}

impl PackageDb {
    /// Open (creating if needed) the database at `db_path` managing files
    /// under `root`, and recover any interrupted transaction.
    pub fn open(db_path: &Path, root: &Path) -> Result<Self, StoreError> {
        let layout = DbLayout::new(db_path);
        layout.initialize()?;
        let db = Self {
            records: RecordStore::new(layout.clone()),
            journal: Journal::new(&layout),
            events: EventLog::new(layout.events_file()),
            root: root.to_path_buf(),
            preserve_ownership: effective_uid() == 0,
            layout,
        };
        if let Some(_lock) = FileLock::try_acquire(&db.layout.lock_file())? {
            let report = db.journal.recover()?;
            if report != RecoveryReport::default() {
                info!(
                    "database recovery: {} replayed, {} rolled back",
                    report.replayed, report.rolled_back
                );
            }
        } else {
            debug!("database busy, skipping startup recovery");
        }
        Ok(db)
    }

    /// Apply recorded ownership to installed files. Defaults to whether the
    /// process runs as root.
    #[must_use]
    pub fn with_preserve_ownership(mut self, preserve: bool) -> Self {
        self.preserve_ownership = preserve;
        self
    }

    /// Run recovery explicitly, waiting for the lock.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let _lock = FileLock::acquire(&self.layout.lock_file())?;
        self.journal.recover()
    }

    pub fn layout(&self) -> &DbLayout {
        &self.layout
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn query(&self, name: &str) -> Result<InstalledPackageRecord, StoreError> {
        self.records.get(name)
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.records.exists(name)
    }

    pub fn list(&self) -> Result<Vec<InstalledPackageRecord>, StoreError> {
        self.records.list()
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Installed packages that list `name` as a runtime dependency.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .list()?
            .into_iter()
            .filter(|r| r.dependencies.iter().any(|d| d == name))
            .map(|r| r.name.into_inner())
            .collect())
    }

    /// Installed path -> owning package, skipping `exclude`.
    fn file_owners(&self, exclude: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let mut owners = BTreeMap::new();
        for rec in self.records.list()? {
            if rec.name == *exclude {
                continue;
            }
            for f in &rec.files {
                owners.insert(f.clone(), rec.name.to_string());
            }
        }
        Ok(owners)
    }

    pub fn begin(&self, kind: TxKind, package: &str) -> Result<Transaction<'_>, StoreError> {
        let lock = FileLock::acquire(&self.layout.lock_file())?;
        let entry = self.journal.begin(kind, package)?;
        Ok(Transaction {
            db: self,
            entry,
            _lock: lock,
            finished: false,
        })
    }

    fn log_event(&self, level: EventLevel, package: &str, action: &str, message: String) {
        if let Err(e) = self.events.append(&Event::new(level, package, action, message)) {
            warn!("failed to append event for {package}: {e}");
        }
    }

    /// Install the files in `archive` and record them.
    ///
    /// Installing the version already present is a no-op; a different
    /// version is an upgrade.
    pub fn install(
        &self,
        mut record: InstalledPackageRecord,
        archive: &Path,
    ) -> Result<InstallOutcome, StoreError> {
        let name = record.name.to_string();
        match self.records.get(&name) {
            Ok(existing) if existing.version == record.version => {
                if record.explicit && !existing.explicit {
                    self.mark_explicit(&name)?;
                }
                debug!("{name} {} already installed", record.version);
                return Ok(InstallOutcome::Unchanged);
            }
            Ok(existing) => {
                return self
                    .upgrade(&existing, record, archive)
                    .map(InstallOutcome::Upgraded);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let mut tx = self.begin(TxKind::Install, &name)?;
        tx.stage_payload(&mut record, archive, None)?;
        tx.put_record(&record)?;
        tx.commit()?;
        info!("installed {name} {} ({} files)", record.version, record.files.len());
        self.log_event(
            EventLevel::Info,
            &name,
            "install",
            format!("installed {} ({} files)", record.version, record.files.len()),
        );
        Ok(InstallOutcome::Installed)
    }

    /// Mark an installed package as requested by the user. Returns whether
    /// the record changed.
    pub fn mark_explicit(&self, name: &str) -> Result<bool, StoreError> {
        let mut rec = self.records.get(name)?;
        if rec.explicit {
            return Ok(false);
        }
        rec.explicit = true;
        let mut tx = self.begin(TxKind::Install, name)?;
        tx.put_record(&rec)?;
        tx.commit()?;
        Ok(true)
    }

    /// Replace `old` with `new`: new files are written first, files only in
    /// the old manifest are removed after the commit.
    pub fn upgrade(
        &self,
        old: &InstalledPackageRecord,
        mut new: InstalledPackageRecord,
        archive: &Path,
    ) -> Result<UpgradeReport, StoreError> {
        let name = new.name.to_string();
        if old.name != new.name {
            return Err(StoreError::Transaction {
                txid: String::new(),
                reason: format!("cannot upgrade '{}' with '{name}'", old.name),
            });
        }
        let mut tx = self.begin(TxKind::Upgrade, &name)?;
        tx.stage_payload(&mut new, archive, Some(old))?;
        new.explicit |= old.explicit;

        let owners = self.file_owners(&name)?;
        let removed: Vec<String> = old
            .files
            .difference(&new.files)
            .filter(|p| !owners.contains_key(*p))
            .cloned()
            .collect();
        let added: Vec<String> = new.files.difference(&old.files).cloned().collect();
        tx.defer(removed.iter().map(|p| {
            JournalAction::RemoveFile(InstalledPackageRecord::live_path(&self.root, p))
        }))?;
        tx.defer(old.created_dirs.iter().rev().map(|d| {
            JournalAction::RemoveEmptyDir(InstalledPackageRecord::live_path(&self.root, d))
        }))?;
        tx.put_record(&new)?;
        let removal_failures = tx.commit()?;

        info!("upgraded {name} {} -> {}", old.version, new.version);
        self.log_event(
            if removal_failures > 0 {
                EventLevel::Warn
            } else {
                EventLevel::Info
            },
            &name,
            "upgrade",
            format!(
                "{} -> {}: {} added, {} removed, {removal_failures} removal failures",
                old.version,
                new.version,
                added.len(),
                removed.len()
            ),
        );
        Ok(UpgradeReport {
            from: old.version.clone(),
            to: new.version,
            added,
            removed,
            removal_failures,
        })
    }

    /// Remove a package and its files.
    ///
    /// Refused with `DependentsExist` while other packages depend on it,
    /// unless `force` is set; a forced removal moves the name into each
    /// dependent's `missing_dependencies` and logs a warning event.
    pub fn uninstall(&self, name: &str, force: bool) -> Result<UninstallReport, StoreError> {
        let record = self.records.get(name)?;
        let dependents = self.dependents_of(name)?;
        if !dependents.is_empty() && !force {
            return Err(StoreError::DependentsExist {
                package: name.to_owned(),
                dependents,
            });
        }

        let mut tx = self.begin(TxKind::Uninstall, name)?;
        tx.delete_record(name)?;
        for dependent in &dependents {
            let mut rec = self.records.get(dependent)?;
            rec.dependencies.retain(|d| d != name);
            rec.missing_dependencies.insert(PackageName::new(name));
            tx.put_record(&rec)?;
        }
        let owners = self.file_owners(name)?;
        let files: Vec<&String> = record
            .files
            .iter()
            .filter(|f| !owners.contains_key(*f))
            .collect();
        tx.defer(files.iter().map(|f| {
            JournalAction::RemoveFile(InstalledPackageRecord::live_path(&self.root, f))
        }))?;
        tx.defer(record.created_dirs.iter().rev().map(|d| {
            JournalAction::RemoveEmptyDir(InstalledPackageRecord::live_path(&self.root, d))
        }))?;
        let removal_failures = tx.commit()?;

        if dependents.is_empty() {
            info!("uninstalled {name} {}", record.version);
            self.log_event(
                EventLevel::Info,
                name,
                "uninstall",
                format!("removed {}", record.version),
            );
        } else {
            warn!(
                "forced uninstall of {name} left dependents without it: {}",
                dependents.join(", ")
            );
            self.log_event(
                EventLevel::Warn,
                name,
                "uninstall",
                format!(
                    "forced removal of {}; dependents now missing it: {}",
                    record.version,
                    dependents.join(", ")
                ),
            );
        }
        Ok(UninstallReport {
            version: record.version,
            removed_files: files.len(),
            removal_failures,
            broken_dependents: dependents,
        })
    }

    /// Installed packages with missing runtime dependencies.
    pub fn revdep(&self) -> Result<Vec<BrokenPackage>, StoreError> {
        let records = self.records.list()?;
        let installed: BTreeSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
        let mut broken = Vec::new();
        for rec in &records {
            let missing: BTreeSet<String> = rec
                .missing_dependencies
                .iter()
                .chain(rec.dependencies.iter())
                .filter(|d| !installed.contains(d.as_str()))
                .map(ToString::to_string)
                .collect();
            if !missing.is_empty() {
                broken.push(BrokenPackage {
                    name: rec.name.to_string(),
                    missing: missing.into_iter().collect(),
                });
            }
        }
        Ok(broken)
    }

    /// Packages pulled in as dependencies that nothing needs any more,
    /// in an order that can be uninstalled one by one without `force`.
    pub fn depclean(&self) -> Result<Vec<String>, StoreError> {
        let records = self.records.list()?;
        let mut remaining: BTreeMap<&str, &InstalledPackageRecord> =
            records.iter().map(|r| (r.name.as_str(), r)).collect();
        let mut orphans = Vec::new();
        loop {
            let round: Vec<String> = remaining
                .values()
                .filter(|r| !r.explicit)
                .filter(|r| {
                    !remaining
                        .values()
                        .any(|o| o.dependencies.contains(r.name.as_str()))
                })
                .map(|r| r.name.to_string())
                .collect();
            if round.is_empty() {
                break;
            }
            for name in round {
                remaining.remove(name.as_str());
                orphans.push(name);
            }
        }
        Ok(orphans)
    }
}

/// An open database transaction. Dropping it without `commit` rolls back.
pub struct Transaction<'db> {
    db: &'db PackageDb,
    entry: JournalEntry,
    _lock: FileLock,
    finished: bool,
}

impl Transaction<'_> {
    pub fn txid(&self) -> &str {
        &self.entry.txid
    }

    pub fn kind(&self) -> TxKind {
        self.entry.kind
    }

    /// Stage a record write. Visible only after commit.
    pub fn put_record(&mut self, record: &InstalledPackageRecord) -> Result<(), StoreError> {
        self.db.journal.stage_record(&mut self.entry, record)
    }

    pub fn delete_record(&mut self, name: &str) -> Result<(), StoreError> {
        self.db.journal.stage_delete(&mut self.entry, name)
    }

    /// Register removals that run only after a successful commit.
    pub fn defer(
        &mut self,
        actions: impl IntoIterator<Item = JournalAction>,
    ) -> Result<(), StoreError> {
        let before = self.entry.deferred.len();
        self.entry.deferred.extend(actions);
        if self.entry.deferred.len() == before {
            return Ok(());
        }
        self.db.journal.save(&self.entry)
    }

    /// Write the archive's files into the live root with every change
    /// journaled first. Fills in `record.files` and `record.created_dirs`.
    fn stage_payload(
        &mut self,
        record: &mut InstalledPackageRecord,
        archive: &Path,
        previous: Option<&InstalledPackageRecord>,
    ) -> Result<(), StoreError> {
        let name = record.name.to_string();
        let root = self.db.root.clone();
        let entries = list_archive(archive)?;
        let owners = self.db.file_owners(&name)?;
        for e in &entries {
            if let Some(owner) = owners.get(&e.path) {
                return Err(StoreError::FileConflict {
                    package: name,
                    path: e.path.clone(),
                    owner: owner.clone(),
                });
            }
            // Unowned files already on disk are never taken over.
            let ours = previous.is_some_and(|p| p.files.contains(&e.path));
            if !ours
                && InstalledPackageRecord::live_path(&root, &e.path)
                    .symlink_metadata()
                    .is_ok()
            {
                return Err(StoreError::UntrackedFile {
                    package: name,
                    path: e.path.clone(),
                });
            }
        }

        let mut new_dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for e in &entries {
            let live = InstalledPackageRecord::live_path(&root, &e.path);
            for ancestor in live.ancestors().skip(1) {
                if ancestor == root || !ancestor.starts_with(&root) {
                    break;
                }
                if ancestor.symlink_metadata().is_err() {
                    new_dirs.insert(ancestor.to_path_buf());
                }
            }
        }
        self.db.journal.push_rollback(
            &mut self.entry,
            new_dirs.iter().cloned().map(JournalAction::RemoveEmptyDir),
        )?;

        let live_paths: Vec<PathBuf> = entries
            .iter()
            .map(|e| InstalledPackageRecord::live_path(&root, &e.path))
            .collect();
        self.db
            .journal
            .backup(&mut self.entry, live_paths.iter().map(PathBuf::as_path))?;
        // Backed-up paths are restored; everything else must be removed.
        let created: Vec<JournalAction> = live_paths
            .iter()
            .filter(|p| p.symlink_metadata().is_err())
            .cloned()
            .map(JournalAction::RemoveFile)
            .collect();
        self.db.journal.push_rollback(&mut self.entry, created)?;

        unpack_archive(archive, &root, self.db.preserve_ownership)?;

        record.files = entries.into_iter().map(|e| e.path).collect();
        let mut created_dirs: BTreeSet<String> = previous
            .map(|p| p.created_dirs.clone())
            .unwrap_or_default();
        for d in &new_dirs {
            if let Ok(rel) = d.strip_prefix(&root) {
                created_dirs.insert(format!("/{}", rel.display()));
            }
        }
        record.created_dirs = created_dirs;
        Ok(())
    }

    /// Every record the transaction would leave behind must have all of its
    /// runtime dependencies present.
    fn check_references(&self) -> Result<(), StoreError> {
        let mut names: BTreeSet<String> = self.db.records.names()?.into_iter().collect();
        for d in &self.entry.record_deletes {
            names.remove(d);
        }
        names.extend(self.entry.record_puts.iter().cloned());

        for put in &self.entry.record_puts {
            let rec = self.db.journal.staged_record(&self.entry.txid, put)?;
            if let Some(dep) = rec.dependencies.iter().find(|d| !names.contains(d.as_str())) {
                return Err(StoreError::DanglingDependency {
                    package: self.entry.package.clone(),
                    dependent: put.clone(),
                    dependency: dep.to_string(),
                });
            }
        }
        if self.entry.record_deletes.is_empty() {
            return Ok(());
        }
        for rec in self.db.records.list()? {
            if !names.contains(rec.name.as_str())
                || self.entry.record_puts.iter().any(|p| rec.name == *p)
            {
                continue;
            }
            if let Some(dep) = rec.dependencies.iter().find(|d| !names.contains(d.as_str())) {
                return Err(StoreError::DanglingDependency {
                    package: self.entry.package.clone(),
                    dependent: rec.name.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Check referential integrity, write the commit marker, then apply.
    /// Returns the number of deferred removals that failed.
    pub fn commit(mut self) -> Result<usize, StoreError> {
        self.finished = true;
        if let Err(e) = self.check_references() {
            self.db.journal.rollback(&self.entry);
            return Err(e);
        }
        if let Err(e) = self.db.journal.mark_committed(&self.entry.txid) {
            self.db.journal.rollback(&self.entry);
            return Err(e);
        }
        // Past the marker the transaction has happened; a failed replay is
        // finished by the next recovery rather than undone.
        self.db
            .journal
            .replay(&self.entry)
            .map_err(|e| StoreError::Transaction {
                txid: self.entry.txid.clone(),
                reason: format!("committed but not yet applied: {e}"),
            })
    }

    pub fn rollback(mut self) {
        self.finished = true;
        self.db.journal.rollback(&self.entry);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("rolling back abandoned transaction {}", self.entry.txid);
            self.db.journal.rollback(&self.entry);
        }
    }
}
