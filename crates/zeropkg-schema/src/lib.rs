//! Recipe parsing, ports tree reading, version constraints and configuration
//! for Zeropkg.
//!
//! This crate defines the schema layer: TOML recipe parsing into validated
//! `PackageDefinition`s, the `PortsTree` reader, comparable `Version`s with
//! dependency `VersionConstraint`s, and the resolved `Config` struct.

pub mod config;
pub mod ports;
pub mod recipe;
pub mod types;
pub mod version;

pub use config::{
    BuildUser, Config, ConfigError, GeneralSection, NetworkSection, PathsSection, RepoSection,
    MAX_RETRIES,
};
pub use ports::{is_recipe_path, PortsTree};
pub use recipe::{
    parse_recipe_file, parse_recipe_str, validate_package_name, BuildPhase, BuildStep, Checksum,
    DependencyKind, DependencyRef, OwnershipOverride, PackageDefinition, PatchSpec, PatchTool,
    RecipeError, SourceDescriptor, SystemHooks,
};
pub use types::{FileDigest, PackageName};
pub use version::{split_dependency_spec, ConstraintOp, Version, VersionConstraint, VersionError};
