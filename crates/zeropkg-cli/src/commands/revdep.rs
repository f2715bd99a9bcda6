use super::{json_pretty, CommandResult, EXIT_FAILURE, EXIT_SUCCESS};
use zeropkg_core::Engine;

pub fn run(engine: &Engine, json: bool) -> CommandResult {
    let broken = engine.revdep()?;
    if json {
        println!("{}", json_pretty(&broken)?);
    } else if broken.is_empty() {
        println!("all runtime dependencies are installed");
    } else {
        for b in &broken {
            println!("{}: missing {}", b.name, b.missing.join(", "));
        }
    }
    Ok(if broken.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}
