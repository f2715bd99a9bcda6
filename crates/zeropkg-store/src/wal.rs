//! Write-ahead journal for database transactions.
//!
//! Each transaction owns a directory under `<db>/journal/<txid>/` holding
//! its intent (filesystem rollback actions, staged record writes and
//! deletes, deferred removals), the staged record files, backups of any
//! live files it overwrote, and finally a `COMMITTED` marker.
//!
//! Recovery looks only at the marker: with it, the staged records are
//! replayed into the record store; without it, the rollback actions run in
//! reverse and the staged records are discarded.

use crate::layout::DbLayout;
use crate::records::{InstalledPackageRecord, RecordStore};
use crate::{atomic_write, fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const INTENT_FILE: &str = "intent.json";
const COMMIT_MARKER: &str = "COMMITTED";

static TX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A filesystem action recorded in the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalAction {
    RemoveFile(PathBuf),
    /// Remove a directory only if it is empty.
    RemoveEmptyDir(PathBuf),
    /// Copy a backup taken before the transaction over `target`.
    RestoreFile { backup: PathBuf, target: PathBuf },
    /// Recreate a symlink that the transaction replaced.
    RestoreSymlink { link: PathBuf, target: PathBuf },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TxKind {
    Install,
    Upgrade,
    Uninstall,
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxKind::Install => write!(f, "install"),
            TxKind::Upgrade => write!(f, "upgrade"),
            TxKind::Uninstall => write!(f, "uninstall"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub txid: String,
    pub kind: TxKind,
    pub package: String,
    pub timestamp: String,
    /// Undo steps for filesystem changes made so far, applied in reverse.
    pub rollback: Vec<JournalAction>,
    pub record_puts: Vec<String>,
    pub record_deletes: Vec<String>,
    /// Removals that only happen once the transaction has committed.
    pub deferred: Vec<JournalAction>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub rolled_back: usize,
}

pub struct Journal {
    dir: PathBuf,
    records: RecordStore,
}

impl Journal {
    pub fn new(layout: &DbLayout) -> Self {
        Self {
            dir: layout.journal_dir(),
            records: RecordStore::new(layout.clone()),
        }
    }

    pub fn entry_dir(&self, txid: &str) -> PathBuf {
        self.dir.join(txid)
    }

    fn staged_path(&self, txid: &str, name: &str) -> PathBuf {
        self.entry_dir(txid)
            .join("staged")
            .join(format!("{name}.json"))
    }

    /// Start a transaction entry and persist its (empty) intent.
    pub fn begin(&self, kind: TxKind, package: &str) -> Result<JournalEntry, StoreError> {
        let seq = TX_COUNTER.fetch_add(1, Ordering::SeqCst);
        let txid = format!(
            "{}-{}-{seq}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            std::process::id(),
            &blake3::hash(package.as_bytes()).to_hex()[..8]
        );
        let entry = JournalEntry {
            txid,
            kind,
            package: package.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback: Vec::new(),
            record_puts: Vec::new(),
            record_deletes: Vec::new(),
            deferred: Vec::new(),
        };
        let entry_dir = self.entry_dir(&entry.txid);
        fs::create_dir_all(entry_dir.join("staged"))?;
        fs::create_dir_all(entry_dir.join("backup"))?;
        fsync_dir(&self.dir)?;
        self.save(&entry)?;
        debug!("journal begin: {kind} {package} (txid={})", entry.txid);
        Ok(entry)
    }

    /// Rewrite the intent file. Must happen before the change it describes.
    pub fn save(&self, entry: &JournalEntry) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(entry)?;
        atomic_write(&self.entry_dir(&entry.txid).join(INTENT_FILE), &content)
    }

    /// Register undo steps and persist them before the caller acts.
    pub fn push_rollback(
        &self,
        entry: &mut JournalEntry,
        actions: impl IntoIterator<Item = JournalAction>,
    ) -> Result<(), StoreError> {
        entry.rollback.extend(actions);
        self.save(entry)
    }

    /// Save copies of `targets` so rollback can put them back.
    ///
    /// The copies are durable before the intent mentions them, so a crash
    /// never restores a partial backup over an untouched file. Missing
    /// targets are skipped.
    pub fn backup<'p>(
        &self,
        entry: &mut JournalEntry,
        targets: impl IntoIterator<Item = &'p Path>,
    ) -> Result<(), StoreError> {
        let backup_dir = self.entry_dir(&entry.txid).join("backup");
        let mut actions = Vec::new();
        for target in targets {
            let meta = match target.symlink_metadata() {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if meta.file_type().is_symlink() {
                actions.push(JournalAction::RestoreSymlink {
                    link: fs::read_link(target)?,
                    target: target.to_path_buf(),
                });
            } else if meta.is_file() {
                let backup = backup_dir.join((entry.rollback.len() + actions.len()).to_string());
                fs::copy(target, &backup)?;
                fs::File::open(&backup)?.sync_all()?;
                actions.push(JournalAction::RestoreFile {
                    backup,
                    target: target.to_path_buf(),
                });
            } else {
                return Err(StoreError::Io(io::Error::other(format!(
                    "cannot replace non-file {}",
                    target.display()
                ))));
            }
        }
        if actions.is_empty() {
            return Ok(());
        }
        fsync_dir(&backup_dir)?;
        self.push_rollback(entry, actions)
    }

    /// Write the new version of a record to the staging area.
    pub fn stage_record(
        &self,
        entry: &mut JournalEntry,
        record: &InstalledPackageRecord,
    ) -> Result<(), StoreError> {
        let name = record.name.to_string();
        atomic_write(&self.staged_path(&entry.txid, &name), &record.encode()?)?;
        entry.record_deletes.retain(|n| *n != name);
        if !entry.record_puts.contains(&name) {
            entry.record_puts.push(name);
        }
        self.save(entry)
    }

    pub fn stage_delete(&self, entry: &mut JournalEntry, name: &str) -> Result<(), StoreError> {
        entry.record_puts.retain(|n| n != name);
        if !entry.record_deletes.iter().any(|n| n == name) {
            entry.record_deletes.push(name.to_owned());
        }
        self.save(entry)
    }

    /// Read back a staged record.
    pub fn staged_record(
        &self,
        txid: &str,
        name: &str,
    ) -> Result<InstalledPackageRecord, StoreError> {
        let bytes = fs::read(self.staged_path(txid, name))?;
        InstalledPackageRecord::decode(name, &bytes)
    }

    /// The commit point. Once the marker is durable the transaction wins.
    pub fn mark_committed(&self, txid: &str) -> Result<(), StoreError> {
        atomic_write(&self.entry_dir(txid).join(COMMIT_MARKER), txid.as_bytes())
    }

    pub fn is_committed(&self, txid: &str) -> bool {
        self.entry_dir(txid).join(COMMIT_MARKER).exists()
    }

    /// Apply a committed entry: staged records first, then deferred removals.
    ///
    /// Idempotent, so an interrupted replay can simply run again. Returns
    /// the number of deferred removals that failed.
    pub fn replay(&self, entry: &JournalEntry) -> Result<usize, StoreError> {
        for name in &entry.record_puts {
            let bytes = fs::read(self.staged_path(&entry.txid, name))?;
            InstalledPackageRecord::decode(name, &bytes)?;
            self.records.put_encoded(name, &bytes)?;
        }
        for name in &entry.record_deletes {
            self.records.remove(name)?;
        }
        let mut failures = 0;
        for action in &entry.deferred {
            if let Err(e) = apply(action) {
                warn!("{} {}: deferred removal failed: {e}", entry.kind, entry.package);
                failures += 1;
            }
        }
        self.discard(&entry.txid);
        Ok(failures)
    }

    /// Undo an uncommitted entry and forget it.
    pub fn rollback(&self, entry: &JournalEntry) {
        for action in entry.rollback.iter().rev() {
            match apply(action) {
                Ok(()) => debug!("journal rollback: {action:?}"),
                Err(e) => warn!("journal rollback: {action:?} failed: {e}"),
            }
        }
        self.discard(&entry.txid);
    }

    fn discard(&self, txid: &str) {
        let dir = self.entry_dir(txid);
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove journal entry {}: {e}", dir.display());
            }
        }
    }

    /// All entries left behind by interrupted transactions, oldest first.
    pub fn list_incomplete(&self) -> Result<Vec<JournalEntry>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let path = dir_entry.path().join(INTENT_FILE);
            match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|b| Ok(serde_json::from_slice::<JournalEntry>(&b)?))
            {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // The intent is written before any other change, so an
                    // unreadable one means nothing else happened yet.
                    warn!("corrupt journal entry {}: {e}", path.display());
                    let _ = fs::remove_dir_all(dir_entry.path());
                }
            }
        }
        entries.sort_by(|a, b| a.txid.cmp(&b.txid));
        Ok(entries)
    }

    /// Replay committed entries and roll back the rest.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for entry in self.list_incomplete()? {
            if self.is_committed(&entry.txid) {
                info!(
                    "journal recovery: replaying committed {} of {} (txid={})",
                    entry.kind, entry.package, entry.txid
                );
                self.replay(&entry)?;
                report.replayed += 1;
            } else {
                info!(
                    "journal recovery: rolling back {} of {} (txid={})",
                    entry.kind, entry.package, entry.txid
                );
                self.rollback(&entry);
                report.rolled_back += 1;
            }
        }
        Ok(report)
    }
}

fn apply(action: &JournalAction) -> io::Result<()> {
    match action {
        JournalAction::RemoveFile(path) => match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
        JournalAction::RemoveEmptyDir(path) => match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            // Still in use by something else; leave it.
            Err(_) if path.read_dir().is_ok_and(|mut d| d.next().is_some()) => Ok(()),
            Err(e) => Err(e),
        },
        JournalAction::RestoreFile { backup, target } => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            remove_if_symlink(target)?;
            fs::copy(backup, target).map(|_| ())
        }
        JournalAction::RestoreSymlink { link, target } => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match fs::remove_file(target) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
            std::os::unix::fs::symlink(link, target)
        }
    }
}

fn remove_if_symlink(path: &Path) -> io::Result<()> {
    if path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(path)?;
    }
    Ok(())
}
