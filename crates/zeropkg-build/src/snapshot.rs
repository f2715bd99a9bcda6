use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

/// Top-level directories of a sandbox root that never belong to a manifest.
pub const EXCLUDED_TOP_LEVEL: [&str; 6] = ["build", "tmp", "proc", "dev", "sys", "run"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    File {
        size: u64,
        mode: u32,
        mtime: i64,
        mtime_nsec: i64,
        ino: u64,
    },
    Symlink {
        target: String,
    },
}

/// Files and symlinks under a root, keyed by absolute install path.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    entries: BTreeMap<String, EntryState>,
}

/// What a build changed in its root. Each list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDelta {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl TreeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Added and modified paths, i.e. the files the package provides.
    pub fn changed(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.modified.iter())
    }
}

impl TreeSnapshot {
    /// Walk `root`, skipping the scratch directories in `EXCLUDED_TOP_LEVEL`.
    /// Directories themselves are not recorded; they are implied by the files.
    pub fn capture(root: &Path) -> Result<Self, std::io::Error> {
        let mut entries = BTreeMap::new();
        if !root.exists() {
            return Ok(Self { entries });
        }
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() != 1
                    || !EXCLUDED_TOP_LEVEL
                        .iter()
                        .any(|x| e.file_name().to_str() == Some(x))
            });
        for entry in walker {
            let entry = entry.map_err(std::io::Error::other)?;
            let ft = entry.file_type();
            if ft.is_dir() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let key = format!("/{}", rel.to_string_lossy());
            let state = if ft.is_symlink() {
                let target = std::fs::read_link(entry.path())?;
                EntryState::Symlink {
                    target: target.to_string_lossy().into_owned(),
                }
            } else {
                let meta = entry.metadata().map_err(std::io::Error::other)?;
                EntryState::File {
                    size: meta.len(),
                    mode: meta.mode(),
                    mtime: meta.mtime(),
                    mtime_nsec: meta.mtime_nsec(),
                    ino: meta.ino(),
                }
            };
            entries.insert(key, state);
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Changes from `self` (before) to `after`.
    pub fn delta(&self, after: &TreeSnapshot) -> TreeDelta {
        let mut delta = TreeDelta::default();
        for (path, state) in &after.entries {
            match self.entries.get(path) {
                None => delta.added.push(path.clone()),
                Some(prev) if prev != state => delta.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.entries.keys() {
            if !after.entries.contains_key(path) {
                delta.removed.push(path.clone());
            }
        }
        delta
    }
}
