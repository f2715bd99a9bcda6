use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use zeropkg_core::{Engine, ResolveOptions};

/// Print the dependency tree of `name` followed by its build order.
pub fn run(engine: &Engine, name: &str, options: ResolveOptions, json: bool) -> CommandResult {
    let tree = engine.explain(name, options)?;
    let order: Vec<String> = match engine.plan(&[name], options) {
        Ok(plan) => plan.names().into_iter().map(str::to_owned).collect(),
        Err(e) if json => return Err(e.into()),
        Err(e) => {
            print!("{tree}");
            return Err(e.into());
        }
    };
    if json {
        let payload = serde_json::json!({
            "package": name,
            "tree": tree,
            "build_order": order,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        print!("{tree}");
        println!();
        println!("build order: {}", order.join(" "));
    }
    Ok(EXIT_SUCCESS)
}

/// Ports packages that depend on `name`, directly or transitively.
pub fn dependents(engine: &Engine, name: &str, options: ResolveOptions, json: bool) -> CommandResult {
    let rdeps = engine.reverse_dependencies(name, options)?;
    if json {
        println!("{}", json_pretty(&rdeps)?);
    } else if rdeps.is_empty() {
        println!("nothing in the ports tree depends on {name}");
    } else {
        for r in &rdeps {
            println!("{r}");
        }
    }
    Ok(EXIT_SUCCESS)
}
