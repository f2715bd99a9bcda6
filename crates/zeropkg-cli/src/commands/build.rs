use super::{drive, CommandResult};
use zeropkg_core::{Engine, RunOptions};

pub fn run(engine: &Engine, packages: &[String], options: &RunOptions, json: bool) -> CommandResult {
    drive(
        json,
        &format!("building {}...", packages.join(" ")),
        "built",
        || engine.build(packages, options),
    )
}
