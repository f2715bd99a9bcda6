use crate::concurrency::BuildLock;
use crate::resolver::{
    explain, resolve, reverse_dependencies, BuildPlan, DependencyGraph, PlannedPackage,
    ResolveOptions,
};
use crate::scheduler::run_plan;
use crate::sync::{PortsSync, SyncReport};
use crate::{CoreError, ErrorKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use zeropkg_build::{
    check_build_prereqs, run_system_hooks, Builder, CacheFetcher, CancelFlag, IsolationMode,
    MissingPrereq, SandboxConfig, SourceFetcher,
};
use zeropkg_schema::{Config, PortsTree};
use zeropkg_store::{
    verify_integrity, BrokenPackage, Event, EventLevel, InstallOutcome, InstalledPackageRecord,
    IntegrityReport, PackageDb, UninstallReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Build the requested packages without touching the database.
    Build,
    Install,
    Upgrade,
}

impl RunMode {
    fn action(self) -> &'static str {
        match self {
            RunMode::Build => "build",
            RunMode::Install => "install",
            RunMode::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub resolve: ResolveOptions,
    /// Resolve and classify only; nothing is built or committed.
    pub dry_run: bool,
    /// Worker count; `general.jobs` when unset.
    pub jobs: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    /// Would be built (dry run).
    Planned,
    Built { archive: PathBuf },
    Installed,
    Upgraded { from: String },
    /// Already installed; left as is.
    Unchanged { installed: String },
    Failed { kind: ErrorKind, error: String },
    Skipped { dependency: String },
    NotStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageOutcome {
    pub name: String,
    pub version: String,
    pub target: bool,
    #[serde(flatten)]
    pub status: Status,
}

/// Per-package result of a build, install or upgrade run, in plan order.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub dry_run: bool,
    pub outcomes: Vec<PackageOutcome>,
    #[serde(skip)]
    pub errors: Vec<CoreError>,
}

impl RunReport {
    fn empty(mode: RunMode, dry_run: bool) -> Self {
        Self {
            mode,
            dry_run,
            outcomes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| {
            !matches!(
                o.status,
                Status::Failed { .. } | Status::Skipped { .. } | Status::NotStarted
            )
        })
    }

    pub fn first_error(&self) -> Option<&CoreError> {
        self.errors.first()
    }

    /// Kind of the first failure; `Cancelled` when packages were left
    /// unstarted without any failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        if let Some(e) = self.first_error() {
            return Some(e.kind());
        }
        self.outcomes
            .iter()
            .any(|o| o.status == Status::NotStarted)
            .then_some(ErrorKind::Cancelled)
    }

    pub fn outcome(&self, name: &str) -> Option<&PackageOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Central orchestration engine for Zeropkg.
///
/// Owns the resolved configuration, the loaded ports tree and the package
/// database handle; every operation goes through it.
pub struct Engine {
    config: Config,
    ports: PortsTree,
    db: PackageDb,
    sandbox: SandboxConfig,
    fetcher: Box<dyn SourceFetcher>,
    cancel: CancelFlag,
}

fn load_ports(config: &Config) -> Result<PortsTree, CoreError> {
    let dir = &config.paths.ports_dir;
    if !dir.exists() {
        warn!(
            "ports tree {} does not exist; run `zeropkg sync`",
            dir.display()
        );
        return Ok(PortsTree::new());
    }
    Ok(PortsTree::load(dir)?)
}

impl Engine {
    /// Open the database (recovering any interrupted transaction) and load
    /// the ports tree.
    pub fn new(config: Config) -> Result<Self, CoreError> {
        config.validate()?;
        let db = PackageDb::open(&config.paths.db_path, &config.paths.root)?;
        let ports = load_ports(&config)?;
        info!(
            "{} recipes in {}, database at {}",
            ports.len(),
            config.paths.ports_dir.display(),
            config.paths.db_path.display()
        );
        let sandbox = SandboxConfig::from_config(&config);
        let fetcher: Box<dyn SourceFetcher> = Box::new(CacheFetcher::new(
            config.paths.cache_dir.clone(),
            config.network.clone(),
        ));
        Ok(Self {
            config,
            ports,
            db,
            sandbox,
            fetcher,
            cancel: CancelFlag::new(),
        })
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Box<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ports(&self) -> &PortsTree {
        &self.ports
    }

    pub fn db(&self) -> &PackageDb {
        &self.db
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn reload_ports(&mut self) -> Result<(), CoreError> {
        self.ports = load_ports(&self.config)?;
        Ok(())
    }

    /// Refresh the ports tree through `syncer` and reload it.
    pub fn sync(&mut self, syncer: &dyn PortsSync) -> Result<SyncReport, CoreError> {
        let report = syncer.sync(&self.config.paths.ports_dir)?;
        self.reload_ports()?;
        info!(
            "ports tree {:?} at {}, {} recipes",
            report.action,
            report.revision.as_deref().unwrap_or("unknown revision"),
            self.ports.len()
        );
        Ok(report)
    }

    /// Host tools missing for builds with the configured isolation.
    pub fn prerequisites(&self) -> Vec<MissingPrereq> {
        check_build_prereqs(
            IsolationMode::select(self.sandbox.chroot),
            self.sandbox.fakeroot,
        )
    }

    pub fn plan<S: AsRef<str>>(
        &self,
        targets: &[S],
        options: ResolveOptions,
    ) -> Result<BuildPlan<'_>, CoreError> {
        let graph = DependencyGraph::from_ports(&self.ports, options);
        Ok(resolve(targets, &graph)?)
    }

    pub fn explain(&self, target: &str, options: ResolveOptions) -> Result<String, CoreError> {
        let graph = DependencyGraph::from_ports(&self.ports, options);
        Ok(explain(&graph, target)?)
    }

    /// Ports packages depending on `name`, directly or transitively.
    pub fn reverse_dependencies(
        &self,
        name: &str,
        options: ResolveOptions,
    ) -> Result<Vec<String>, CoreError> {
        let graph = DependencyGraph::from_ports(&self.ports, options);
        if !graph.contains(name) {
            return Err(crate::ResolveError::UnknownPackage(name.to_owned()).into());
        }
        Ok(reverse_dependencies(&graph, name))
    }

    /// Resolve and build `targets` only; nothing is installed.
    pub fn build(&self, targets: &[String], options: &RunOptions) -> Result<RunReport, CoreError> {
        self.run(RunMode::Build, targets, options)
    }

    /// Resolve, build and install `targets` with every missing dependency.
    pub fn install(&self, targets: &[String], options: &RunOptions) -> Result<RunReport, CoreError> {
        self.run(RunMode::Install, targets, options)
    }

    /// Rebuild installed packages whose ports version is newer. An empty
    /// `targets` means every installed package.
    pub fn upgrade(&self, targets: &[String], options: &RunOptions) -> Result<RunReport, CoreError> {
        let names: Vec<String> = if targets.is_empty() {
            self.db.records().names()?
        } else {
            targets.to_vec()
        };
        let mut selected = Vec::new();
        for name in names {
            let installed = self.db.query(&name)?;
            match self.ports.get(&name) {
                None => warn!(
                    "{name}: not in the ports tree, keeping {}",
                    installed.version
                ),
                Some(def) if def.version > installed.version => {
                    info!("{name}: {} -> {}", installed.version, def.version);
                    selected.push(name);
                }
                Some(def) if def.version < installed.version => warn!(
                    "{name}: installed {} is newer than ports {}; not downgrading",
                    installed.version, def.version
                ),
                Some(_) => debug!("{name} is up to date"),
            }
        }
        if selected.is_empty() {
            info!("nothing to upgrade");
            return Ok(RunReport::empty(RunMode::Upgrade, options.dry_run));
        }
        self.run(RunMode::Upgrade, &selected, options)
    }

    fn run(
        &self,
        mode: RunMode,
        targets: &[String],
        options: &RunOptions,
    ) -> Result<RunReport, CoreError> {
        let graph = DependencyGraph::from_ports(&self.ports, options.resolve);
        let mut plan = resolve(targets, &graph)?;
        if mode == RunMode::Build {
            plan.retain(|p| p.target);
        }

        let mut settled: BTreeMap<String, Status> = BTreeMap::new();
        for p in plan.iter() {
            let name = p.name();
            if mode == RunMode::Build {
                for dep in &p.dependencies {
                    if !plan.contains(dep) && !self.db.is_installed(dep) {
                        warn!("{name}: dependency {dep} is not installed");
                    }
                }
                continue;
            }
            if !self.db.is_installed(name) {
                continue;
            }
            let installed = self.db.query(name)?;
            let keep = if installed.version == p.def.version {
                true
            } else if p.target {
                false
            } else {
                // A dependency stays at its installed version while that
                // version satisfies every requester in the plan.
                plan.iter()
                    .flat_map(|q| graph.dependencies(q.name()))
                    .filter(|d| d.name == *name)
                    .all(|d| {
                        d.constraint
                            .as_ref()
                            .map_or(true, |c| c.matches(&installed.version))
                    })
            };
            if keep {
                if mode == RunMode::Install && p.target && !options.dry_run {
                    self.db.mark_explicit(name)?;
                }
                settled.insert(
                    name.to_owned(),
                    Status::Unchanged {
                        installed: installed.version.to_string(),
                    },
                );
            }
        }

        let outcomes_order: Vec<(String, String, bool)> = plan
            .iter()
            .map(|p| (p.name().to_owned(), p.def.version.to_string(), p.target))
            .collect();
        plan.retain(|p| !settled.contains_key(p.name()));
        info!(
            "{mode:?}: {} package(s) to build, {} already installed",
            plan.len(),
            settled.len()
        );

        let mut report = RunReport::empty(mode, options.dry_run);
        if options.dry_run {
            for p in plan.iter() {
                settled.insert(p.name().to_owned(), Status::Planned);
            }
        } else if !plan.is_empty() {
            self.execute(mode, &plan, options, &mut settled, &mut report.errors);
        }

        for (name, version, target) in outcomes_order {
            let status = settled.remove(&name).unwrap_or(Status::NotStarted);
            report.outcomes.push(PackageOutcome {
                name,
                version,
                target,
                status,
            });
        }
        Ok(report)
    }

    fn execute(
        &self,
        mode: RunMode,
        plan: &BuildPlan<'_>,
        options: &RunOptions,
        settled: &mut BTreeMap<String, Status>,
        errors: &mut Vec<CoreError>,
    ) {
        let builder = Builder::new(&self.sandbox, self.fetcher.as_ref()).with_cancel(self.cancel.clone());
        let done: Mutex<BTreeMap<String, Status>> = Mutex::new(BTreeMap::new());
        let jobs = options.jobs.unwrap_or(self.config.general.jobs);

        let report = run_plan(plan, jobs, &self.cancel, |p| {
            let status = self.run_one(mode, &builder, p)?;
            if let Ok(mut done) = done.lock() {
                done.insert(p.name().to_owned(), status);
            }
            Ok::<(), CoreError>(())
        });

        if let Ok(done) = done.into_inner() {
            settled.extend(done);
        }
        for (name, err) in report.failed {
            warn!("{name}: {err}");
            self.log_event(EventLevel::Error, &name, mode, err.to_string());
            settled.insert(
                name,
                Status::Failed {
                    kind: err.kind(),
                    error: err.to_string(),
                },
            );
            errors.push(err);
        }
        for (name, dependency) in report.skipped {
            settled.insert(name, Status::Skipped { dependency });
        }
        if !report.not_started.is_empty() {
            warn!(
                "cancelled before starting: {}",
                report.not_started.join(", ")
            );
        }
    }

    fn run_one(
        &self,
        mode: RunMode,
        builder: &Builder<'_>,
        p: &PlannedPackage<'_>,
    ) -> Result<Status, CoreError> {
        let name = p.name();
        let explicit = mode == RunMode::Install && p.target;
        let _lock = BuildLock::acquire(self.db.layout(), name)?;

        if mode != RunMode::Build {
            // Another invocation may have installed it while we waited.
            if let Ok(rec) = self.db.query(name) {
                if rec.version == p.def.version {
                    if explicit {
                        self.db.mark_explicit(name)?;
                    }
                    return Ok(Status::Unchanged {
                        installed: rec.version.to_string(),
                    });
                }
            }
        }

        let output = builder.build(p.def)?;
        if mode == RunMode::Build {
            return Ok(Status::Built {
                archive: output.archive,
            });
        }

        let record = output.manifest.to_record(p.def, explicit);
        let status = match self.db.install(record, &output.archive)? {
            InstallOutcome::Installed => Status::Installed,
            InstallOutcome::Upgraded(r) => Status::Upgraded {
                from: r.from.to_string(),
            },
            InstallOutcome::Unchanged => {
                return Ok(Status::Unchanged {
                    installed: p.def.version.to_string(),
                })
            }
        };
        self.system_hooks(
            name,
            &p.def.version.to_string(),
            "post_install",
            &p.def.hooks.post_install,
            mode.action(),
        );
        Ok(status)
    }

    /// Hooks run after the transaction committed; a failing hook is reported
    /// but leaves the package as it is.
    fn system_hooks(
        &self,
        name: &str,
        version: &str,
        hook: &str,
        commands: &[String],
        action: &str,
    ) {
        if commands.is_empty() {
            return;
        }
        if let Err(e) = run_system_hooks(name, version, hook, commands, self.db.root()) {
            warn!("{e}");
            self.append_event(EventLevel::Warn, name, action, e.to_string());
        }
    }

    fn log_event(&self, level: EventLevel, package: &str, mode: RunMode, message: String) {
        self.append_event(level, package, mode.action(), message);
    }

    fn append_event(&self, level: EventLevel, package: &str, action: &str, message: String) {
        if let Err(e) = self
            .db
            .events()
            .append(&Event::new(level, package, action, message))
        {
            warn!("failed to append event: {e}");
        }
    }

    pub fn uninstall(&self, name: &str, force: bool) -> Result<UninstallReport, CoreError> {
        let _lock = BuildLock::acquire(self.db.layout(), name)?;
        let installed = self.db.query(name)?;
        let report = self.db.uninstall(name, force)?;
        self.system_hooks(
            name,
            &installed.version.to_string(),
            "post_remove",
            &installed.remove_hooks,
            "uninstall",
        );
        Ok(report)
    }

    pub fn query(&self, name: &str) -> Result<InstalledPackageRecord, CoreError> {
        Ok(self.db.query(name)?)
    }

    pub fn list(&self) -> Result<Vec<InstalledPackageRecord>, CoreError> {
        Ok(self.db.list()?)
    }

    pub fn revdep(&self) -> Result<Vec<BrokenPackage>, CoreError> {
        Ok(self.db.revdep()?)
    }

    /// Orphaned dependencies, removed one by one when `apply` is set.
    pub fn depclean(&self, apply: bool) -> Result<Vec<String>, CoreError> {
        let orphans = self.db.depclean()?;
        if apply {
            for name in &orphans {
                if self.cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                self.uninstall(name, false)?;
            }
        }
        Ok(orphans)
    }

    pub fn verify(&self) -> Result<IntegrityReport, CoreError> {
        Ok(verify_integrity(&self.db)?)
    }

    /// Database events, optionally for one package.
    pub fn history(&self, package: Option<&str>) -> Result<Vec<Event>, CoreError> {
        let events = self.db.events();
        Ok(match package {
            Some(name) => events.for_package(name)?,
            None => events.read_all()?,
        })
    }

    /// Installed packages missing from the ports tree.
    pub fn foreign(&self) -> Result<BTreeSet<String>, CoreError> {
        Ok(self
            .db
            .records()
            .names()?
            .into_iter()
            .filter(|n| !self.ports.contains(n))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use zeropkg_schema::PathsSection;

    fn write_recipe(ports: &Path, name: &str, version: &str, deps: &str, install: &str) {
        let dir = ports.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("recipe.toml"),
            format!(
                "name = \"{name}\"\nversion = \"{version}\"\ndependencies = [{deps}]\n\n[build]\ninstall = ['{install}']\n"
            ),
        )
        .unwrap();
    }

    fn installs(name: &str) -> String {
        format!("mkdir -p \"$DESTDIR/usr/share/{name}\" && echo {name} > \"$DESTDIR/usr/share/{name}/data\"")
    }

    fn engine(dir: &Path) -> Engine {
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = Config::default();
        config.paths = PathsSection::rooted_at(dir);
        config.general.fakeroot = false;
        config.general.chroot_enabled = false;
        config.general.jobs = 2;
        fs::create_dir_all(&config.paths.root).unwrap();
        Engine::new(config).unwrap()
    }

    fn status<'r>(report: &'r RunReport, name: &str) -> &'r Status {
        &report.outcome(name).unwrap().status
    }

    #[test]
    fn install_builds_dependencies_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "", &installs("a"));
        write_recipe(&ports, "b", "1.0", "\"a\"", &installs("b"));
        write_recipe(&ports, "c", "1.0", "\"a\", \"b\"", &installs("c"));
        e.reload_ports().unwrap();

        let report = e.install(&["c".into()], &RunOptions::default()).unwrap();
        assert!(report.is_success(), "{:?}", report.errors);
        let names: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(report.outcomes.iter().all(|o| o.status == Status::Installed));

        let c = e.query("c").unwrap();
        assert!(c.explicit);
        assert!(!e.query("a").unwrap().explicit);
        let deps: Vec<&str> = c.dependencies.iter().map(|d| d.as_str()).collect();
        assert_eq!(deps, vec!["a", "b"]);
        assert!(e.db().root().join("usr/share/c/data").is_file());
    }

    #[test]
    fn reinstall_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "", &installs("a"));
        e.reload_ports().unwrap();

        e.install(&["a".into()], &RunOptions::default()).unwrap();
        let again = e.install(&["a".into()], &RunOptions::default()).unwrap();
        assert_eq!(
            status(&again, "a"),
            &Status::Unchanged {
                installed: "1.0".into()
            }
        );
        assert_eq!(e.list().unwrap().len(), 1);
    }

    #[test]
    fn dry_run_builds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "", &installs("a"));
        write_recipe(&ports, "b", "1.0", "\"a\"", &installs("b"));
        e.reload_ports().unwrap();

        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let report = e.install(&["b".into()], &options).unwrap();
        assert!(report.dry_run);
        assert!(report.outcomes.iter().all(|o| o.status == Status::Planned));
        assert!(e.list().unwrap().is_empty());
    }

    #[test]
    fn failed_build_skips_dependents_and_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "", &installs("a"));
        write_recipe(&ports, "b", "1.0", "\"a\"", "exit 3");
        write_recipe(&ports, "c", "1.0", "\"b\"", &installs("c"));
        write_recipe(&ports, "d", "1.0", "\"a\"", &installs("d"));
        e.reload_ports().unwrap();

        let report = e
            .install(&["c".into(), "d".into()], &RunOptions::default())
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(report.error_kind(), Some(ErrorKind::BuildStepFailed));
        assert!(matches!(status(&report, "b"), Status::Failed { .. }));
        assert_eq!(
            status(&report, "c"),
            &Status::Skipped {
                dependency: "b".into()
            }
        );
        assert_eq!(status(&report, "d"), &Status::Installed);
        assert!(!e.db().is_installed("b"));
        assert!(!e.db().is_installed("c"));

        let history = e.history(Some("b")).unwrap();
        assert!(history.iter().any(|ev| ev.level == EventLevel::Error));
    }

    #[test]
    fn resolution_errors_abort_before_building() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "\"ghost\"", &installs("a"));
        e.reload_ports().unwrap();

        let err = e.install(&["a".into()], &RunOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingDependency);
        assert!(!e.config().paths.packages_dir.join("a-1.0.tar").exists());
    }

    #[test]
    fn build_mode_installs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "", &installs("a"));
        write_recipe(&ports, "b", "1.0", "\"a\"", &installs("b"));
        e.reload_ports().unwrap();

        let report = e.build(&["b".into()], &RunOptions::default()).unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(status(&report, "b"), Status::Built { archive } if archive.is_file()));
        assert!(e.list().unwrap().is_empty());
    }

    #[test]
    fn upgrade_replaces_older_versions_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "a", "1.0", "", &installs("a"));
        write_recipe(&ports, "b", "1.0", "", &installs("b"));
        e.reload_ports().unwrap();
        e.install(&["a".into(), "b".into()], &RunOptions::default())
            .unwrap();

        write_recipe(&ports, "a", "1.1", "", &installs("a"));
        e.reload_ports().unwrap();
        let report = e.upgrade(&[], &RunOptions::default()).unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(
            status(&report, "a"),
            &Status::Upgraded { from: "1.0".into() }
        );
        let a = e.query("a").unwrap();
        assert_eq!(a.version.as_str(), "1.1");
        assert!(a.explicit);
    }

    #[test]
    fn depclean_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_recipe(&ports, "lib", "1.0", "", &installs("lib"));
        write_recipe(&ports, "app", "1.0", "\"lib\"", &installs("app"));
        e.reload_ports().unwrap();
        e.install(&["app".into()], &RunOptions::default()).unwrap();

        assert!(e.depclean(false).unwrap().is_empty());
        e.uninstall("app", false).unwrap();
        assert_eq!(e.depclean(true).unwrap(), vec!["lib"]);
        assert!(e.list().unwrap().is_empty());
        assert!(!e.db().root().join("usr/share/lib/data").exists());
    }

    #[test]
    fn reverse_dependencies_of_unknown_package_fail() {
        let dir = tempfile::tempdir().unwrap();
        let e = engine(dir.path());
        let err = e
            .reverse_dependencies("ghost", ResolveOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    fn write_hooked_recipe(ports: &Path, post_install: &str) {
        let dir = ports.join("certs");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("recipe.toml"),
            format!(
                r#"name = "certs"
version = "1.0"

[hooks]
post_install = ['{post_install}']
post_remove = ['echo gone > "$ROOT/removed"']

[build]
install = ['{}']
"#,
                installs("certs")
            ),
        )
        .unwrap();
    }

    #[test]
    fn system_hooks_run_after_install_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_hooked_recipe(&ports, r#"echo "$ZEROPKG_VERSION" > "$ROOT/hooked""#);
        e.reload_ports().unwrap();

        let report = e.install(&["certs".into()], &RunOptions::default()).unwrap();
        assert!(report.is_success(), "{:?}", report.errors);
        let root = e.db().root().to_path_buf();
        assert_eq!(fs::read_to_string(root.join("hooked")).unwrap(), "1.0\n");
        assert!(!root.join("removed").exists());
        assert_eq!(e.query("certs").unwrap().remove_hooks.len(), 1);

        // The record carries the removal hooks even once the recipe is gone.
        fs::remove_dir_all(ports.join("certs")).unwrap();
        e.reload_ports().unwrap();
        e.uninstall("certs", false).unwrap();
        assert_eq!(fs::read_to_string(root.join("removed")).unwrap(), "gone\n");
    }

    #[test]
    fn failing_post_install_hook_keeps_the_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine(dir.path());
        let ports = e.config().paths.ports_dir.clone();
        write_hooked_recipe(&ports, "exit 3");
        e.reload_ports().unwrap();

        let report = e.install(&["certs".into()], &RunOptions::default()).unwrap();
        assert!(report.is_success(), "{:?}", report.errors);
        assert_eq!(status(&report, "certs"), &Status::Installed);
        assert!(e.db().root().join("usr/share/certs/data").is_file());

        let events = e.db().events().for_package("certs").unwrap();
        assert!(events
            .iter()
            .any(|ev| ev.level == EventLevel::Warn && ev.message.contains("post_install")));
    }
}
