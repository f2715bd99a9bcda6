use super::{drive, CommandResult};
use zeropkg_core::{Engine, RunOptions};

/// Upgrade `packages`, or every installed package when none are named.
pub fn run(engine: &Engine, packages: &[String], options: &RunOptions, json: bool) -> CommandResult {
    let msg = if packages.is_empty() {
        "checking installed packages for upgrades...".to_owned()
    } else {
        format!("upgrading {}...", packages.join(" "))
    };
    drive(json, &msg, "upgraded", || engine.upgrade(packages, options))
}
