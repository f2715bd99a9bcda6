//! Core orchestration engine for Zeropkg.
//!
//! This crate ties together recipe parsing, dependency resolution, sandboxed
//! builds and the package database into the `Engine`: the central API for
//! syncing the ports tree, planning, building, installing, upgrading and
//! removing packages. It also provides the parallel plan scheduler, the
//! per-package build lock, and Ctrl-C cancellation.

pub mod concurrency;
pub mod engine;
pub mod resolver;
pub mod scheduler;
pub mod sync;

pub use concurrency::{install_signal_handler, BuildLock};
pub use engine::{Engine, PackageOutcome, RunMode, RunOptions, RunReport, Status};
pub use resolver::{
    explain, resolve, reverse_dependencies, BuildPlan, DependencyGraph, PlannedPackage,
    ResolveError, ResolveOptions,
};
pub use scheduler::{run_plan, ScheduleReport};
pub use sync::{GitSync, PortsSync, SyncAction, SyncReport};
pub use zeropkg_build::CancelFlag;

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use zeropkg_build::BuildError;
use zeropkg_schema::{ConfigError, RecipeError};
use zeropkg_store::StoreError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("recipe error: {0}")]
    Recipe(#[from] RecipeError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    #[error("{0}")]
    Build(#[from] BuildError),
    #[error("{0}")]
    Store(#[from] StoreError),
    #[error("sync failed: {0}")]
    Sync(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation cancelled")]
    Cancelled,
}

/// Machine-distinguishable error categories, one exit status each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    CycleDetected,
    MissingDependency,
    VersionConflict,
    IntegrityError,
    BuildStepFailed,
    SandboxSetupFailed,
    FetchFailed,
    DatabaseTransactionFailed,
    DependentsExist,
    NotFound,
    InvalidRecipe,
    Config,
    SyncFailed,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Io => 1,
            ErrorKind::Config => 2,
            ErrorKind::InvalidRecipe => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::CycleDetected => 10,
            ErrorKind::MissingDependency => 11,
            ErrorKind::VersionConflict => 12,
            ErrorKind::IntegrityError => 20,
            ErrorKind::FetchFailed => 21,
            ErrorKind::SandboxSetupFailed => 22,
            ErrorKind::BuildStepFailed => 23,
            ErrorKind::DatabaseTransactionFailed => 30,
            ErrorKind::DependentsExist => 31,
            ErrorKind::SyncFailed => 40,
            ErrorKind::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Recipe(_) => ErrorKind::InvalidRecipe,
            CoreError::Config(_) => ErrorKind::Config,
            CoreError::Resolve(e) => match e {
                ResolveError::CycleDetected { .. } => ErrorKind::CycleDetected,
                ResolveError::MissingDependency { .. } => ErrorKind::MissingDependency,
                ResolveError::VersionConflict { .. } => ErrorKind::VersionConflict,
                ResolveError::UnknownPackage(_) => ErrorKind::NotFound,
            },
            CoreError::Build(e) => match e {
                BuildError::IntegrityError { .. } => ErrorKind::IntegrityError,
                BuildError::Fetch { .. } => ErrorKind::FetchFailed,
                BuildError::SandboxSetupFailed { .. } => ErrorKind::SandboxSetupFailed,
                BuildError::BuildStepFailed { .. } | BuildError::HookFailed { .. } => {
                    ErrorKind::BuildStepFailed
                }
                BuildError::Cancelled { .. } => ErrorKind::Cancelled,
                BuildError::Io(_) | BuildError::Packaging { .. } => ErrorKind::Io,
            },
            CoreError::Store(e) => match e {
                StoreError::NotFound(_) => ErrorKind::NotFound,
                StoreError::DependentsExist { .. } => ErrorKind::DependentsExist,
                StoreError::IntegrityFailure { .. } => ErrorKind::IntegrityError,
                _ => ErrorKind::DatabaseTransactionFailed,
            },
            CoreError::Sync(_) => ErrorKind::SyncFailed,
            CoreError::Io(_) => ErrorKind::Io,
            CoreError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The package the failure belongs to, when there is one.
    pub fn package(&self) -> Option<&str> {
        match self {
            CoreError::Resolve(e) => Some(e.package()),
            CoreError::Build(e) => e.package(),
            CoreError::Store(
                StoreError::NotFound(package)
                | StoreError::DependentsExist { package, .. }
                | StoreError::IntegrityFailure { package, .. }
                | StoreError::DanglingDependency { package, .. }
                | StoreError::FileConflict { package, .. }
                | StoreError::UntrackedFile { package, .. },
            ) => Some(package.as_str()),
            _ => None,
        }
    }
}
