use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use zeropkg_core::Engine;

pub fn run(engine: &Engine, apply: bool, json: bool) -> CommandResult {
    let orphans = engine.depclean(apply)?;
    if json {
        let payload = serde_json::json!({
            "orphans": orphans,
            "removed": apply,
        });
        println!("{}", json_pretty(&payload)?);
    } else if orphans.is_empty() {
        println!("no orphaned packages");
    } else if apply {
        println!("removed {} orphaned package(s):", orphans.len());
        for name in &orphans {
            println!("  {name}");
        }
    } else {
        println!("orphaned packages (run with --apply to remove):");
        for name in &orphans {
            println!("  {name}");
        }
    }
    Ok(EXIT_SUCCESS)
}
