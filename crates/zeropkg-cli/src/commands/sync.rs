use super::{json_pretty, maybe_spinner, spin_fail, spin_ok, CommandResult, EXIT_SUCCESS};
use zeropkg_core::{Engine, GitSync, SyncAction};

pub fn run(engine: &mut Engine, json: bool) -> CommandResult {
    let syncer = GitSync::from_config(&engine.config().repo);
    let pb = maybe_spinner(json, "syncing ports tree...");
    let report = match engine.sync(&syncer) {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "sync failed");
            }
            return Err(e.into());
        }
    };
    let recipes = engine.ports().len();
    if json {
        let payload = serde_json::json!({
            "action": report.action,
            "revision": report.revision,
            "recipes": recipes,
        });
        println!("{}", json_pretty(&payload)?);
    } else if let Some(ref pb) = pb {
        let verb = match report.action {
            SyncAction::Cloned => "cloned",
            SyncAction::Updated => "updated",
        };
        let rev = report
            .revision
            .as_deref()
            .map(|r| format!(" at {}", r.chars().take(12).collect::<String>()))
            .unwrap_or_default();
        spin_ok(pb, &format!("ports tree {verb}{rev}, {recipes} recipes"));
    }
    Ok(EXIT_SUCCESS)
}
