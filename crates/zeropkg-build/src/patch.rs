//! Recipe patches.
//!
//! Patch files are copied into the sandbox before any step runs and applied
//! as ordinary numbered steps in their stage, so a patch that does not apply
//! fails the build like any other step.

use crate::sandbox::{shell_quote, IsolationMode, SandboxInstance};
use crate::BuildError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use zeropkg_schema::{BuildPhase, BuildStep, PackageDefinition, PatchSpec, PatchTool};

fn resolve(spec: &PatchSpec, origin: Option<&Path>) -> PathBuf {
    let path = Path::new(&spec.path);
    match origin {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Shell command applying the patch at `path` from the source directory.
pub fn patch_command(spec: &PatchSpec, path: &str) -> String {
    let q = shell_quote(path);
    let strip = spec.strip;
    match spec.tool {
        PatchTool::Patch => format!(
            "patch -p{strip} --forward --batch -i {q} || git apply -p{strip} {q}"
        ),
        PatchTool::Git => format!("git apply -p{strip} {q}"),
    }
}

/// Copy every patch of `pkg` into the sandbox and return one step per patch.
pub fn stage_patches(
    pkg: &PackageDefinition,
    sandbox: &SandboxInstance,
    mode: IsolationMode,
) -> Result<Vec<BuildStep>, BuildError> {
    if pkg.patches.is_empty() {
        return Ok(Vec::new());
    }
    let name = pkg.name.as_str();
    let origin = pkg.recipe_path.as_deref().and_then(Path::parent);
    let dir = sandbox.patches_dir();
    fs::create_dir_all(&dir)?;

    let mut steps = Vec::with_capacity(pkg.patches.len());
    for (i, spec) in pkg.patches.iter().enumerate() {
        let from = resolve(spec, origin);
        let staged = dir.join(format!("{:02}-{}", i + 1, spec.file_name()));
        fs::copy(&from, &staged).map_err(|e| BuildError::Fetch {
            package: name.to_owned(),
            url: from.display().to_string(),
            reason: format!("cannot read patch: {e}"),
        })?;
        debug!("{name}: staged patch {} for {}", staged.display(), spec.stage);
        steps.push(BuildStep {
            phase: spec.stage,
            command: patch_command(spec, &sandbox.step_path(&staged, mode)),
        });
    }
    Ok(steps)
}

/// Patches and recipe steps in execution order. Within a stage, patches
/// come before the stage's hooks.
pub fn ordered_steps(pkg: &PackageDefinition, patches: Vec<BuildStep>) -> Vec<BuildStep> {
    let mut steps = Vec::with_capacity(pkg.steps.len() + patches.len());
    for phase in BuildPhase::ALL {
        steps.extend(patches.iter().filter(|s| s.phase == phase).cloned());
        steps.extend(pkg.steps.iter().filter(|s| s.phase == phase).cloned());
    }
    steps
}
