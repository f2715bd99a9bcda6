use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use zeropkg_core::Engine;

pub fn run(engine: &Engine, package: Option<&str>, limit: Option<usize>, json: bool) -> CommandResult {
    let mut events = engine.history(package)?;
    if let Some(n) = limit {
        let skip = events.len().saturating_sub(n);
        events.drain(..skip);
    }
    if json {
        println!("{}", json_pretty(&events)?);
    } else if events.is_empty() {
        println!("no events recorded");
    } else {
        for e in &events {
            println!(
                "{} {:<5} {:<20} {}: {}",
                e.timestamp,
                e.level.to_string(),
                e.package,
                e.action,
                e.message
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
