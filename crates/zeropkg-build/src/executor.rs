use crate::fetch::{extract_source, CacheFetcher, SourceFetcher};
use crate::manifest::BuildManifest;
use crate::patch::{ordered_steps, stage_patches};
use crate::prereq::find_in_path;
use crate::sandbox::{effective_uid, IsolationMode, SandboxInstance, StepPolicy};
use crate::snapshot::TreeSnapshot;
use crate::{BuildError, CancelFlag};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use zeropkg_schema::{BuildUser, Config, NetworkSection, PackageDefinition};
use zeropkg_store::write_archive;

/// Everything the executor needs to know about where and how to build.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub build_root: PathBuf,
    pub cache_dir: PathBuf,
    pub packages_dir: PathBuf,
    pub base_root: Option<PathBuf>,
    pub chroot: bool,
    pub fakeroot: bool,
    pub build_user: Option<BuildUser>,
    pub preserve_on_failure: bool,
    pub auto_clean: bool,
    pub network: NetworkSection,
}

impl SandboxConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            build_root: config.paths.build_root.clone(),
            cache_dir: config.paths.cache_dir.clone(),
            packages_dir: config.paths.packages_dir.clone(),
            base_root: config.paths.base_root.clone(),
            chroot: config.general.chroot_enabled,
            fakeroot: config.general.fakeroot,
            build_user: config.general.build_user,
            preserve_on_failure: config.general.preserve_on_failure,
            auto_clean: config.general.auto_clean,
            network: config.network.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BuildOutput {
    pub manifest: BuildManifest,
    /// Deterministic package archive in `packages_dir`.
    pub archive: PathBuf,
    pub archive_digest: String,
    /// The sandbox, when `auto_clean` left it on disk.
    pub sandbox: Option<PathBuf>,
}

pub struct Builder<'a> {
    config: &'a SandboxConfig,
    fetcher: &'a dyn SourceFetcher,
    cancel: CancelFlag,
}

impl<'a> Builder<'a> {
    pub fn new(config: &'a SandboxConfig, fetcher: &'a dyn SourceFetcher) -> Self {
        Self {
            config,
            fetcher,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn policy_for(&self, mode: IsolationMode, sandbox: &SandboxInstance) -> StepPolicy {
        let mut fakeroot = self.config.fakeroot;
        if fakeroot {
            let available = match mode {
                IsolationMode::Host => find_in_path("fakeroot").is_some(),
                IsolationMode::Chroot => ["usr/bin/fakeroot", "bin/fakeroot"]
                    .iter()
                    .any(|p| sandbox.root().join(p).exists()),
                IsolationMode::UserNamespace => true,
            };
            if !available {
                warn!(
                    "{}: fakeroot not available, install steps run without it",
                    sandbox.package()
                );
                fakeroot = false;
            }
        }
        StepPolicy {
            mode,
            fakeroot,
            build_user: self.build_user(sandbox.package()),
        }
    }

    /// The identity steps run as. As root without a configured build user,
    /// that is `nobody`.
    fn build_user(&self, package: &str) -> Option<BuildUser> {
        if effective_uid() != 0 {
            return self.config.build_user;
        }
        Some(self.config.build_user.unwrap_or_else(|| {
            debug!(
                "{package}: no build user configured, steps run as {}:{}",
                BuildUser::NOBODY.uid,
                BuildUser::NOBODY.gid
            );
            BuildUser::NOBODY
        }))
    }

    /// Build one package. The sandbox is removed after success when
    /// `auto_clean` is set, and after failure unless `preserve_on_failure`
    /// is set. A cancelled build always keeps its sandbox.
    pub fn build(&self, pkg: &PackageDefinition) -> Result<BuildOutput, BuildError> {
        let name = pkg.name.as_str();
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled {
                package: name.to_owned(),
            });
        }

        let mode = IsolationMode::select(self.config.chroot);
        if mode.is_chrooted() && self.config.base_root.is_none() {
            return Err(BuildError::SandboxSetupFailed {
                package: name.to_owned(),
                reason: "chroot builds need paths.base_root".to_owned(),
            });
        }

        let sandbox = SandboxInstance::create(
            &self.config.build_root,
            name,
            pkg.version.as_str(),
            self.config.base_root.as_deref(),
        )?;
        info!(
            "{}: building in {} ({mode})",
            pkg.ident(),
            sandbox.dir().display()
        );

        match self.build_in(pkg, &sandbox, mode) {
            Ok((manifest, archive, archive_digest)) => {
                let kept = if self.config.auto_clean {
                    if let Err(e) = sandbox.remove() {
                        warn!("{name}: failed to remove sandbox: {e}");
                    }
                    None
                } else {
                    Some(sandbox.preserve())
                };
                Ok(BuildOutput {
                    manifest,
                    archive,
                    archive_digest,
                    sandbox: kept,
                })
            }
            Err(e) => {
                if self.config.preserve_on_failure || matches!(e, BuildError::Cancelled { .. }) {
                    let dir = sandbox.preserve();
                    warn!("{name}: build failed, sandbox kept at {}", dir.display());
                } else if let Err(rm) = sandbox.remove() {
                    warn!("{name}: failed to remove sandbox: {rm}");
                }
                Err(e)
            }
        }
    }

    fn build_in(
        &self,
        pkg: &PackageDefinition,
        sandbox: &SandboxInstance,
        mode: IsolationMode,
    ) -> Result<(BuildManifest, PathBuf, String), BuildError> {
        let name = pkg.name.as_str();

        // Every source is fetched and verified before any step runs.
        let origin = pkg.recipe_path.as_deref().and_then(std::path::Path::parent);
        let mut fetched = Vec::with_capacity(pkg.sources.len());
        for source in &pkg.sources {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled {
                    package: name.to_owned(),
                });
            }
            fetched.push(self.fetcher.fetch(name, source, origin)?);
        }
        for file in &fetched {
            extract_source(name, file, &sandbox.src_dir())?;
        }
        let patches = stage_patches(pkg, sandbox, mode)?;

        let policy = self.policy_for(mode, sandbox);
        if let Some(user) = policy.build_user {
            if effective_uid() == 0 {
                sandbox.hand_over(user)?;
            }
        }

        let before = TreeSnapshot::capture(&sandbox.root())?;

        let mut env: BTreeMap<String, String> = pkg.environment.clone();
        env.insert("ZEROPKG_PACKAGE".to_owned(), name.to_owned());
        env.insert("ZEROPKG_VERSION".to_owned(), pkg.version.to_string());

        for (i, step) in ordered_steps(pkg, patches).iter().enumerate() {
            sandbox.run_step(i + 1, step, &env, &policy, &self.cancel)?;
        }

        let after = TreeSnapshot::capture(&sandbox.root())?;
        let delta = before.delta(&after);
        let manifest = BuildManifest::capture(pkg, &sandbox.root(), &delta)?;
        if manifest.is_empty() {
            warn!("{}: build installed no files", pkg.ident());
        }
        debug!("{}: manifest has {} files", pkg.ident(), manifest.len());

        let archive = self
            .config
            .packages_dir
            .join(format!("{}.tar", pkg.ident()));
        let digest = write_archive(
            &sandbox.root(),
            &manifest.files,
            &manifest.ownership,
            &archive,
        )
        .map_err(|source| BuildError::Packaging {
            package: name.to_owned(),
            source,
        })?;
        info!("{}: packaged {}", pkg.ident(), archive.display());
        Ok((manifest, archive, digest))
    }
}

/// Build `pkg` with the distfiles-cache fetcher and no cancellation.
pub fn build(pkg: &PackageDefinition, config: &SandboxConfig) -> Result<BuildOutput, BuildError> {
    let fetcher = CacheFetcher::new(config.cache_dir.clone(), config.network.clone());
    Builder::new(config, &fetcher).build(pkg)
}
