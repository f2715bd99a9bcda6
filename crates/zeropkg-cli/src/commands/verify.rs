use super::{json_pretty, CommandResult, EXIT_SUCCESS};
use zeropkg_core::{Engine, ErrorKind};

pub fn run(engine: &Engine, json: bool) -> CommandResult {
    let report = engine.verify()?;

    if json {
        let payload = serde_json::json!({
            "records_checked": report.records_checked,
            "records_passed": report.records_passed,
            "files_checked": report.files_checked,
            "issues": report.issues.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "database integrity: {}/{} records passed, {} files checked",
            report.records_passed, report.records_checked, report.files_checked
        );
        for issue in &report.issues {
            println!("  FAIL {issue}");
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(ErrorKind::IntegrityError.exit_code())
    }
}
