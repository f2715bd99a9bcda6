mod commands;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::{CommandResult, Failure};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use zeropkg_core::{install_signal_handler, CoreError, Engine, ResolveOptions, RunOptions};
use zeropkg_schema::Config;

#[derive(Debug, Parser)]
#[command(
    name = "zeropkg",
    version,
    about = "Source-based package manager for Linux From Scratch systems"
)]
struct Cli {
    /// Configuration file (default: /etc/zeropkg.conf, /usr/lib/zeropkg/config.toml, ./config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct PlanArgs {
    /// Resolve and show the plan without building anything.
    #[arg(short = 'n', long, default_value_t = false)]
    dry_run: bool,
    /// Number of parallel builds (default: general.jobs).
    #[arg(short, long)]
    jobs: Option<usize>,
    /// Follow optional dependencies as well.
    #[arg(long, default_value_t = false)]
    with_optional: bool,
}

impl PlanArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            resolve: ResolveOptions {
                include_optional: self.with_optional,
            },
            dry_run: self.dry_run,
            jobs: self.jobs,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Package names from the ports tree.
    #[arg(required = true)]
    packages: Vec<String>,
    #[command(flatten)]
    plan: PlanArgs,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clone or update the ports tree from the configured repository.
    Sync,
    /// Build packages without installing them.
    Build {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Build and install packages with their missing dependencies.
    Install {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Rebuild installed packages that have a newer ports version (all when none are named).
    Upgrade {
        /// Installed packages to upgrade.
        packages: Vec<String>,
        #[command(flatten)]
        plan: PlanArgs,
    },
    /// Remove installed packages.
    #[command(alias = "remove")]
    Uninstall {
        #[arg(required = true)]
        packages: Vec<String>,
        /// Remove even when installed packages depend on it.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show an installed package.
    #[command(alias = "query")]
    Info {
        package: String,
        /// List the package's files.
        #[arg(long, default_value_t = false)]
        files: bool,
    },
    /// List installed packages.
    List {
        /// Only packages installed on request, not as dependencies.
        #[arg(long, default_value_t = false)]
        explicit: bool,
    },
    /// Show the dependency tree and build order of a ports package.
    Explain {
        package: String,
        #[arg(long, default_value_t = false)]
        with_optional: bool,
    },
    /// List ports packages depending on a package.
    Rdeps {
        package: String,
        #[arg(long, default_value_t = false)]
        with_optional: bool,
    },
    /// List installed packages with missing runtime dependencies.
    Revdep,
    /// List (or remove) dependencies nothing depends on any more.
    Depclean {
        /// Remove the orphans instead of listing them.
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
    /// Verify database records and installed files.
    Verify,
    /// Show the database event log.
    History {
        /// Only events for this package.
        package: Option<String>,
        /// Show only the most recent N events.
        #[arg(short = 'l', long)]
        limit: Option<usize>,
    },
    /// Run diagnostic checks on the host and the database.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Failure> {
    let loaded = match path {
        Some(p) => Config::load(p),
        None => Config::load_default(),
    };
    loaded.map_err(|e| Failure::from(CoreError::from(e)))
}

fn init_logging(cli: &Cli, configured: &str) {
    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        configured
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("ZEROPKG_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: Cli) -> CommandResult {
    if let Commands::Completions { shell } = cli.command {
        return commands::completions::run::<Cli>(shell);
    }

    let config = match load_config(cli.config.as_ref()) {
        Ok(c) => c,
        Err(e) => {
            init_logging(&cli, "info");
            return Err(e);
        }
    };
    init_logging(&cli, &config.general.log_level);
    debug!(
        "root {}, ports {}, database {}",
        config.paths.root.display(),
        config.paths.ports_dir.display(),
        config.paths.db_path.display()
    );
    let json = cli.json;

    if matches!(cli.command, Commands::Doctor) {
        return commands::doctor::run(&config, json);
    }

    let mut engine = Engine::new(config)?;
    install_signal_handler(engine.cancel_flag());

    match cli.command {
        Commands::Sync => commands::sync::run(&mut engine, json),
        Commands::Build { run } => {
            commands::build::run(&engine, &run.packages, &run.plan.options(), json)
        }
        Commands::Install { run } => {
            commands::install::run(&engine, &run.packages, &run.plan.options(), json)
        }
        Commands::Upgrade { packages, plan } => {
            commands::upgrade::run(&engine, &packages, &plan.options(), json)
        }
        Commands::Uninstall { packages, force } => {
            commands::uninstall::run(&engine, &packages, force, json)
        }
        Commands::Info { package, files } => commands::info::run(&engine, &package, files, json),
        Commands::List { explicit } => commands::list::run(&engine, explicit, json),
        Commands::Explain {
            package,
            with_optional,
        } => commands::explain::run(
            &engine,
            &package,
            ResolveOptions {
                include_optional: with_optional,
            },
            json,
        ),
        Commands::Rdeps {
            package,
            with_optional,
        } => commands::explain::dependents(
            &engine,
            &package,
            ResolveOptions {
                include_optional: with_optional,
            },
            json,
        ),
        Commands::Revdep => commands::revdep::run(&engine, json),
        Commands::Depclean { apply } => commands::depclean::run(&engine, apply, json),
        Commands::Verify => commands::verify::run(&engine, json),
        Commands::History { package, limit } => {
            commands::history::run(&engine, package.as_deref(), limit, json)
        }
        Commands::Doctor | Commands::Completions { .. } => Ok(commands::EXIT_SUCCESS),
    }
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    match dispatch(Cli::parse()) {
        Ok(code) => ExitCode::from(code),
        Err(failure) => {
            eprintln!("error: {failure}");
            ExitCode::from(failure.code)
        }
    }
}
