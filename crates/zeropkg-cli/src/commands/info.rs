use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use zeropkg_core::Engine;

fn joined<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    let parts: Vec<String> = items.into_iter().map(|i| format!("{i}")).collect();
    if parts.is_empty() {
        "-".to_owned()
    } else {
        parts.join(" ")
    }
}

pub fn run(engine: &Engine, name: &str, files: bool, json: bool) -> CommandResult {
    let record = engine.query(name)?;
    if json {
        println!("{}", json_pretty(&record)?);
        return Ok(EXIT_SUCCESS);
    }

    let ports_version = engine.ports().get(name).map(|d| d.version.to_string());
    println!("name:          {}", record.name);
    println!("version:       {}", record.version);
    if let Some(variant) = &record.variant {
        println!("variant:       {variant}");
    }
    match ports_version {
        Some(v) if v != record.version.to_string() => println!("ports version: {v}"),
        Some(_) => {}
        None => println!("ports version: not in ports tree"),
    }
    println!("installed at:  {}", record.installed_at);
    println!(
        "reason:        {}",
        if record.explicit {
            "explicitly installed"
        } else {
            "dependency"
        }
    );
    println!("depends on:    {}", joined(&record.dependencies));
    println!("build deps:    {}", joined(&record.build_dependencies));
    if !record.missing_dependencies.is_empty() {
        println!("missing:       {}", joined(&record.missing_dependencies));
    }
    println!("files:         {}", record.files.len());
    if files {
        for f in &record.files {
            println!("  {f}");
        }
    }
    Ok(EXIT_SUCCESS)
}
