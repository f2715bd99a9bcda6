use crate::snapshot::TreeDelta;
use crate::BuildError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::warn;
use zeropkg_schema::{FileDigest, PackageDefinition, PackageName, Version};
use zeropkg_store::{FileOwnership, InstalledPackageRecord};

/// The files one build produced, with their digests and the ownership
/// overrides they claim once installed. Files without an override install
/// as root:root with their built mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildManifest {
    pub package: PackageName,
    pub version: Version,
    pub files: BTreeSet<String>,
    pub digests: BTreeMap<String, FileDigest>,
    pub ownership: BTreeMap<String, FileOwnership>,
}

impl BuildManifest {
    /// Build the manifest from the delta of a sandbox root.
    pub fn capture(
        pkg: &PackageDefinition,
        root: &Path,
        delta: &TreeDelta,
    ) -> Result<Self, BuildError> {
        let mut files = BTreeSet::new();
        let mut digests = BTreeMap::new();
        for path in delta.changed() {
            let live = InstalledPackageRecord::live_path(root, path);
            let meta = live.symlink_metadata()?;
            if meta.is_file() {
                let data = fs::read(&live)?;
                digests.insert(
                    path.clone(),
                    FileDigest::new(blake3::hash(&data).to_hex().to_string()),
                );
            }
            files.insert(path.clone());
        }
        for path in &delta.removed {
            warn!("{}: build removed {path} from the base root; ignored", pkg.name);
        }

        let mut ownership = BTreeMap::new();
        for o in &pkg.ownership {
            if !files.contains(&o.path) {
                warn!(
                    "{}: ownership override for {} matches no built file",
                    pkg.name, o.path
                );
                continue;
            }
            let mode = match o.mode {
                Some(mode) => mode,
                None => {
                    InstalledPackageRecord::live_path(root, &o.path)
                        .symlink_metadata()?
                        .permissions()
                        .mode()
                        & 0o7777
                }
            };
            ownership.insert(
                o.path.clone(),
                FileOwnership {
                    uid: o.uid,
                    gid: o.gid,
                    mode,
                },
            );
        }

        Ok(Self {
            package: pkg.name.clone(),
            version: pkg.version.clone(),
            files,
            digests,
            ownership,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The database record for installing this manifest. Only runtime
    /// dependencies are recorded as dependencies; build dependencies are
    /// kept for information.
    pub fn to_record(&self, pkg: &PackageDefinition, explicit: bool) -> InstalledPackageRecord {
        let mut rec = InstalledPackageRecord::new(self.package.clone(), self.version.clone());
        rec.files = self.files.clone();
        rec.digests = self.digests.clone();
        rec.ownership = self.ownership.clone();
        rec.dependencies = pkg.runtime_dependency_names();
        rec.build_dependencies = pkg.build_dependency_names();
        rec.variant.clone_from(&pkg.variant);
        rec.remove_hooks.clone_from(&pkg.hooks.post_remove);
        rec.explicit = explicit;
        rec
    }
}
