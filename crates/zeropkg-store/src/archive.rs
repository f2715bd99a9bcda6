//! Deterministic package archives.
//!
//! A built package is packed into a plain tar whose bytes depend only on the
//! file contents, the manifest and the ownership layer:
//! - entries sorted lexicographically by path
//! - all timestamps set to 0
//! - uid/gid and mode taken from the ownership layer (default root:root,
//!   on-disk mode)
//!
//! Only regular files and symlinks are stored; directories are implied.

use crate::records::FileOwnership;
use crate::{atomic_write, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveEntryKind {
    File,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Absolute install path, e.g. `/usr/bin/bash`.
    pub path: String,
    pub kind: ArchiveEntryKind,
}

/// Pack `files` (absolute install paths found under `source_root`) into `dest`.
/// Returns the blake3 digest of the archive.
pub fn write_archive(
    source_root: &Path,
    files: &BTreeSet<String>,
    ownership: &BTreeMap<String, FileOwnership>,
    dest: &Path,
) -> Result<String, StoreError> {
    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);

    for path in files {
        let rel = relative(path)?;
        let full = source_root.join(rel);
        let meta = match full.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                return Err(StoreError::Io(std::io::Error::new(
                    e.kind(),
                    format!("{}: {e}", full.display()),
                )))
            }
        };
        let owner = ownership.get(path);
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(owner.map_or(0, |o| u64::from(o.uid)));
        header.set_gid(owner.map_or(0, |o| u64::from(o.gid)));
        header.set_mode(owner.map_or(meta.permissions().mode() & 0o7777, |o| o.mode));

        let ft = meta.file_type();
        if ft.is_symlink() {
            let target = fs::read_link(&full)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_cksum();
            ar.append_link(&mut header, rel, &target)?;
        } else if ft.is_file() {
            let data = fs::read(&full)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, rel, data.as_slice())?;
        } else {
            warn!("skipping unsupported file type: {path}");
        }
    }

    let data = ar.into_inner()?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write(dest, &data)?;
    Ok(blake3::hash(&data).to_hex().to_string())
}

/// List an archive's entries, rejecting any path that would escape the root.
pub fn list_archive(archive: &Path) -> Result<Vec<ArchiveEntry>, StoreError> {
    let file = fs::File::open(archive)?;
    let mut ar = tar::Archive::new(file);
    let mut entries = Vec::new();
    for entry in ar.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        let path_str = path.to_string_lossy().to_string();
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StoreError::UnsafePath(path_str));
        }
        let kind = match entry.header().entry_type() {
            tar::EntryType::Symlink => ArchiveEntryKind::Symlink,
            tar::EntryType::Regular => ArchiveEntryKind::File,
            other => {
                return Err(StoreError::UnsafePath(format!(
                    "{path_str} (unsupported entry type {other:?})"
                )))
            }
        };
        let trimmed = path_str.trim_start_matches("./");
        entries.push(ArchiveEntry {
            path: format!("/{trimmed}"),
            kind,
        });
    }
    Ok(entries)
}

/// Extract every entry of `archive` beneath `root`.
///
/// Ownership from the archive is applied only when `preserve_ownership` is
/// set, which requires real root privileges.
pub fn unpack_archive(
    archive: &Path,
    root: &Path,
    preserve_ownership: bool,
) -> Result<(), StoreError> {
    fs::create_dir_all(root)?;
    let file = fs::File::open(archive)?;
    let mut ar = tar::Archive::new(file);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_preserve_ownerships(preserve_ownership);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);
    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        if !entry.unpack_in(root)? {
            return Err(StoreError::UnsafePath(path));
        }
    }
    Ok(())
}

fn relative(path: &str) -> Result<&str, StoreError> {
    let rel = path.trim_start_matches('/');
    if rel.is_empty()
        || Path::new(rel)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StoreError::UnsafePath(path.to_owned()));
    }
    Ok(rel)
}
