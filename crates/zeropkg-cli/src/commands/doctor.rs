use super::{json_pretty, CommandResult, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use zeropkg_core::Engine;
use zeropkg_schema::Config;
use zeropkg_store::{DbLayout, FileLock, Journal};

pub fn run(config: &Config, json_output: bool) -> CommandResult {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    // Journal and lock are inspected before opening the engine, which
    // recovers interrupted transactions and takes the database lock.
    let db_path = &config.paths.db_path;
    if db_path.exists() {
        check_database_files(&DbLayout::new(db_path), &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "database",
            &format!(
                "Database {} not initialized (created on first install)",
                db_path.display()
            ),
        ));
    }

    match Engine::new(config.clone()) {
        Ok(engine) => check_engine(&engine, &mut checks, &mut all_pass),
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("database", &format!("Cannot open database: {e}")));
        }
    }

    check_disk_space(&config.paths.build_root, &mut checks);

    print_results(&checks, all_pass, json_output)
}

fn check_database_files(layout: &DbLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match Journal::new(layout).list_incomplete() {
        Ok(entries) if entries.is_empty() => {
            checks.push(Check::pass("journal", "Journal is clean"));
        }
        Ok(entries) => {
            let packages: Vec<&str> = entries.iter().map(|e| e.package.as_str()).collect();
            checks.push(Check::warn(
                "journal",
                &format!(
                    "{} interrupted transaction(s) ({}), recovered on next open",
                    entries.len(),
                    packages.join(", ")
                ),
            ));
        }
        Err(e) => checks.push(Check::warn("journal", &format!("Cannot read journal: {e}"))),
    }

    match FileLock::try_acquire(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("db_lock", "Database lock is free")),
        Ok(None) => checks.push(Check::warn(
            "db_lock",
            "Database lock is held by another zeropkg process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "db_lock",
                &format!("Cannot check database lock: {e}"),
            ));
        }
    }
}

fn check_engine(engine: &Engine, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = engine.prerequisites();
    if missing.is_empty() {
        checks.push(Check::pass(
            "build_prereqs",
            "Build prerequisites satisfied",
        ));
    } else {
        *all_pass = false;
        for m in &missing {
            checks.push(Check::fail("build_prereqs", &m.to_string()));
        }
    }

    let ports = engine.ports();
    if ports.is_empty() {
        checks.push(Check::warn(
            "ports",
            &format!(
                "No recipes in {} (run `zeropkg sync`)",
                engine.config().paths.ports_dir.display()
            ),
        ));
    } else {
        checks.push(Check::info("ports", &format!("{} recipes", ports.len())));
    }

    match engine.verify() {
        Ok(report) if report.is_clean() => checks.push(Check::pass(
            "db_integrity",
            &format!(
                "Database integrity OK ({} records, {} files)",
                report.records_checked, report.files_checked
            ),
        )),
        Ok(report) => {
            *all_pass = false;
            checks.push(Check::fail(
                "db_integrity",
                &format!(
                    "{} integrity issue(s), run `zeropkg verify`",
                    report.issues.len()
                ),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "db_integrity",
                &format!("Integrity check failed: {e}"),
            ));
        }
    }

    match engine.foreign() {
        Ok(foreign) if foreign.is_empty() => {}
        Ok(foreign) => checks.push(Check::info(
            "foreign",
            &format!(
                "{} installed package(s) not in the ports tree: {}",
                foreign.len(),
                foreign.into_iter().collect::<Vec<_>>().join(", ")
            ),
        )),
        Err(e) => checks.push(Check::warn(
            "foreign",
            &format!("Cannot list installed packages: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> CommandResult {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("Zeropkg Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

/// Free space on the filesystem holding `path` (or its nearest existing
/// ancestor).
fn check_disk_space(path: &Path, checks: &mut Vec<Check>) {
    let Some(existing) = path.ancestors().find(|p| p.exists()) else {
        return;
    };
    let Ok(c_path) = std::ffi::CString::new(existing.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs with a valid, NUL-terminated path and a zeroed output
    // struct is well-defined; the struct is only read when ret == 0.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);
    let location = existing.display();

    if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Low disk space for builds under {location}: {avail_mb} MB available"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!(
                "Disk space under {location}: {} GB available",
                avail_mb / 1024
            ),
        ));
    }
}
