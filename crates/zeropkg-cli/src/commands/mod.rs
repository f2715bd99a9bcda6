pub mod build;
pub mod completions;
pub mod depclean;
pub mod doctor;
pub mod explain;
pub mod history;
pub mod info;
pub mod install;
pub mod list;
pub mod revdep;
pub mod sync;
pub mod uninstall;
pub mod upgrade;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::time::Duration;
use zeropkg_build::BuildError;
use zeropkg_core::{CoreError, ErrorKind, RunReport, Status};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

/// A failed command: the message for stderr and the process exit status.
#[derive(Debug)]
pub struct Failure {
    pub message: String,
    pub code: u8,
}

impl Failure {
    pub fn new(message: impl Into<String>, code: u8) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for Failure {
    fn from(e: CoreError) -> Self {
        Self::new(e.to_string(), e.kind().exit_code())
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::new(message, EXIT_FAILURE)
    }
}

pub type CommandResult = Result<u8, Failure>;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, Failure> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Failure::from(format!("JSON serialization failed: {e}")))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Spinner only for human output; JSON output stays clean.
pub fn maybe_spinner(json: bool, msg: &str) -> Option<ProgressBar> {
    (!json).then(|| spinner(msg))
}

pub fn status_label(status: &Status) -> &'static str {
    match status {
        Status::Planned => "planned",
        Status::Built { .. } => "built",
        Status::Installed => "installed",
        Status::Upgraded { .. } => "upgraded",
        Status::Unchanged { .. } => "unchanged",
        Status::Failed { .. } => "failed",
        Status::Skipped { .. } => "skipped",
        Status::NotStarted => "not-started",
    }
}

pub fn colorize_status(label: &str) -> String {
    use console::Style;
    let padded = format!("{label:<11}");
    match label {
        "installed" | "built" | "upgraded" => Style::new().green().apply_to(padded).to_string(),
        "planned" => Style::new().cyan().apply_to(padded).to_string(),
        "unchanged" => Style::new().dim().apply_to(padded).to_string(),
        "failed" => Style::new().red().bold().apply_to(padded).to_string(),
        "skipped" | "not-started" => Style::new().yellow().apply_to(padded).to_string(),
        _ => padded,
    }
}

fn status_detail(status: &Status) -> String {
    match status {
        Status::Built { archive } => format!(" -> {}", archive.display()),
        Status::Upgraded { from } => format!(" (from {from})"),
        Status::Unchanged { installed } => format!(" (installed {installed})"),
        Status::Failed { kind, .. } => format!(" [{kind}]"),
        Status::Skipped { dependency } => format!(" ({dependency} failed)"),
        Status::Planned | Status::Installed | Status::NotStarted => String::new(),
    }
}

/// Print a run report and turn it into an exit status: success, or the
/// status of the first failure's kind.
pub fn finish_report(report: &RunReport, json: bool) -> CommandResult {
    if json {
        println!("{}", json_pretty(report)?);
    } else if report.outcomes.is_empty() {
        println!("nothing to do");
    } else {
        for o in &report.outcomes {
            println!(
                "  {} {} {}{}",
                colorize_status(status_label(&o.status)),
                o.name,
                o.version,
                status_detail(&o.status)
            );
        }
    }
    for e in &report.errors {
        eprintln!("error: {e}");
        if let CoreError::Build(BuildError::BuildStepFailed { output_tail, .. }) = e {
            for line in output_tail.lines() {
                eprintln!("  | {line}");
            }
        }
    }
    Ok(report_exit_code(report))
}

pub fn report_exit_code(report: &RunReport) -> u8 {
    if report.is_success() {
        EXIT_SUCCESS
    } else {
        report
            .error_kind()
            .map_or(EXIT_FAILURE, ErrorKind::exit_code)
    }
}

/// Drive one build, install or upgrade run behind a spinner and report it.
pub fn drive(
    json: bool,
    msg: &str,
    verb: &str,
    op: impl FnOnce() -> Result<RunReport, CoreError>,
) -> CommandResult {
    let pb = maybe_spinner(json, msg);
    let report = match op() {
        Ok(r) => r,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "aborted");
            }
            return Err(e.into());
        }
    };
    if let Some(ref pb) = pb {
        let line = summary(&report, verb);
        if report.is_success() {
            spin_ok(pb, &line);
        } else {
            spin_fail(pb, &line);
        }
    }
    finish_report(&report, json)
}

/// One-line summary for the spinner once a run is over.
pub fn summary(report: &RunReport, verb: &str) -> String {
    let done = report
        .outcomes
        .iter()
        .filter(|o| {
            matches!(
                o.status,
                Status::Built { .. } | Status::Installed | Status::Upgraded { .. }
            )
        })
        .count();
    let failed = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.status, Status::Failed { .. }))
        .count();
    if failed == 0 {
        format!("{done} package(s) {verb}")
    } else {
        format!("{done} package(s) {verb}, {failed} failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeropkg_core::{PackageOutcome, RunMode};

    fn report(statuses: Vec<Status>) -> RunReport {
        RunReport {
            mode: RunMode::Install,
            dry_run: false,
            outcomes: statuses
                .into_iter()
                .enumerate()
                .map(|(i, status)| PackageOutcome {
                    name: format!("p{i}"),
                    version: "1".into(),
                    target: true,
                    status,
                })
                .collect(),
            errors: Vec::new(),
        }
    }

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
    }

    #[test]
    fn colorize_keeps_label() {
        for label in ["installed", "failed", "skipped", "planned", "other"] {
            assert!(colorize_status(label).contains(label));
        }
    }

    #[test]
    fn cancelled_run_exits_130() {
        let r = report(vec![Status::Installed, Status::NotStarted]);
        assert_eq!(report_exit_code(&r), 130);
    }

    #[test]
    fn successful_run_exits_zero() {
        let r = report(vec![
            Status::Installed,
            Status::Unchanged {
                installed: "1".into(),
            },
        ]);
        assert_eq!(report_exit_code(&r), EXIT_SUCCESS);
        assert_eq!(summary(&r, "installed"), "1 package(s) installed");
    }

    #[test]
    fn failure_codes_follow_error_kind() {
        let f = Failure::from(CoreError::Cancelled);
        assert_eq!(f.code, 130);
        let f = Failure::from("plain".to_owned());
        assert_eq!(f.code, EXIT_FAILURE);
    }

    #[test]
    fn spinner_finishes() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
