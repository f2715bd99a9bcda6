//! Build sandbox executor for Zeropkg packages.
//!
//! This crate implements the build layer: `SandboxInstance` materializes a
//! uniquely named isolated root per build attempt and runs recipe steps in it
//! (host directory, `chroot`, or an unprivileged user namespace, with an
//! optional `fakeroot` wrapper for install steps), `CacheFetcher` fetches and
//! verifies sources, `patch` stages recipe patches as steps, `snapshot`
//! computes the file-tree delta a build produced, and `executor::build` ties
//! these together into a `BuildManifest` plus a deterministic package archive.
//! `hooks` runs the install and removal hooks on the live system.

pub mod cancel;
pub mod executor;
pub mod fetch;
pub mod hooks;
pub mod manifest;
pub mod patch;
pub mod prereq;
pub mod sandbox;
pub mod snapshot;

pub use cancel::CancelFlag;
pub use executor::{build, BuildOutput, Builder, SandboxConfig};
pub use fetch::{extract_source, verify_checksum, CacheFetcher, SourceFetcher};
pub use hooks::run_system_hooks;
pub use manifest::BuildManifest;
pub use prereq::{check_build_prereqs, find_in_path, format_missing, MissingPrereq};
pub use sandbox::{IsolationMode, SandboxInstance, StepPolicy};
pub use snapshot::{TreeDelta, TreeSnapshot};

use std::path::PathBuf;
use thiserror::Error;
use zeropkg_schema::BuildPhase;

/// Number of trailing log lines carried in `BuildStepFailed`.
pub const OUTPUT_TAIL_LINES: usize = 40;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{package}: checksum mismatch for {file}: expected {expected}, got {actual}")]
    IntegrityError {
        package: String,
        file: String,
        expected: String,
        actual: String,
    },
    #[error("{package}: failed to fetch {url}: {reason}")]
    Fetch {
        package: String,
        url: String,
        reason: String,
    },
    #[error("{package}: sandbox setup failed: {reason}")]
    SandboxSetupFailed { package: String, reason: String },
    /// `index` is 1-based, counted across all phases.
    #[error("{package}: build step {index} ({phase}) `{command}` failed: {status} (log: {})", log.display())]
    BuildStepFailed {
        package: String,
        index: usize,
        phase: BuildPhase,
        command: String,
        status: String,
        output_tail: String,
        log: PathBuf,
    },
    #[error("{package}: {hook} hook `{command}` failed: {status}")]
    HookFailed {
        package: String,
        hook: String,
        command: String,
        status: String,
        output_tail: String,
    },
    #[error("{package}: build cancelled")]
    Cancelled { package: String },
    #[error("{package}: packaging failed: {source}")]
    Packaging {
        package: String,
        source: zeropkg_store::StoreError,
    },
}

impl BuildError {
    /// The package the failure belongs to, when the error carries one.
    pub fn package(&self) -> Option<&str> {
        match self {
            BuildError::Io(_) => None,
            BuildError::IntegrityError { package, .. }
            | BuildError::Fetch { package, .. }
            | BuildError::SandboxSetupFailed { package, .. }
            | BuildError::BuildStepFailed { package, .. }
            | BuildError::HookFailed { package, .. }
            | BuildError::Cancelled { package }
            | BuildError::Packaging { package, .. } => Some(package),
        }
    }
}
