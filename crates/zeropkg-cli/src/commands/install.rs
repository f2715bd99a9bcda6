use super::{drive, CommandResult};
use zeropkg_core::{Engine, RunOptions};

pub fn run(engine: &Engine, packages: &[String], options: &RunOptions, json: bool) -> CommandResult {
    let msg = if options.dry_run {
        format!("planning {}...", packages.join(" "))
    } else {
        format!("installing {}...", packages.join(" "))
    };
    drive(json, &msg, "installed", || engine.install(packages, options))
}
