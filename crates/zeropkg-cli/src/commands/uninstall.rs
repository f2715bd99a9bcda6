use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use zeropkg_core::Engine;

pub fn run(engine: &Engine, names: &[String], force: bool, json: bool) -> CommandResult {
    let mut removed = Vec::new();
    for name in names {
        let report = engine.uninstall(name, force)?;
        if !json {
            println!(
                "removed {name} {} ({} files)",
                report.version, report.removed_files
            );
            if report.removal_failures > 0 {
                eprintln!(
                    "warning: {} file(s) of {name} could not be removed",
                    report.removal_failures
                );
            }
            if !report.broken_dependents.is_empty() {
                eprintln!(
                    "warning: left with a missing dependency: {}",
                    report.broken_dependents.join(", ")
                );
            }
        }
        removed.push(serde_json::json!({
            "name": name,
            "version": report.version,
            "removed_files": report.removed_files,
            "removal_failures": report.removal_failures,
            "broken_dependents": report.broken_dependents,
        }));
    }
    if json {
        println!("{}", json_pretty(&removed)?);
    }
    Ok(EXIT_SUCCESS)
}
