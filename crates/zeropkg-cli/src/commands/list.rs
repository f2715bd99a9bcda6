use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use serde::Serialize;
use zeropkg_core::Engine;

#[derive(Serialize)]
struct Row {
    name: String,
    version: String,
    explicit: bool,
    /// Installed but absent from the ports tree.
    foreign: bool,
    files: usize,
    installed_at: String,
}

pub fn run(engine: &Engine, explicit_only: bool, json: bool) -> CommandResult {
    let foreign = engine.foreign()?;
    let rows: Vec<Row> = engine
        .list()?
        .into_iter()
        .filter(|r| !explicit_only || r.explicit)
        .map(|r| Row {
            foreign: foreign.contains(r.name.as_str()),
            name: r.name.to_string(),
            version: r.version.to_string(),
            explicit: r.explicit,
            files: r.files.len(),
            installed_at: r.installed_at,
        })
        .collect();

    if json {
        println!("{}", json_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no packages installed");
    } else {
        println!("{:<24} {:<16} {:<10} FILES", "NAME", "VERSION", "REASON");
        for row in &rows {
            let reason = if row.explicit { "explicit" } else { "dep" };
            let mark = if row.foreign {
                console::Style::new()
                    .yellow()
                    .apply_to(" (foreign)")
                    .to_string()
            } else {
                String::new()
            };
            println!(
                "{:<24} {:<16} {:<10} {}{mark}",
                row.name, row.version, reason, row.files
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
