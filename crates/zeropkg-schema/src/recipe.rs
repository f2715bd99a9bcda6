use crate::types::PackageName;
use crate::version::{split_dependency_spec, Version, VersionConstraint, VersionError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read recipe {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse recipe: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid package name '{0}': must match [A-Za-z0-9_+.-]")]
    InvalidName(String),
    #[error("package '{package}': {source}")]
    Version {
        package: String,
        source: VersionError,
    },
    #[error("package '{0}' depends on itself")]
    SelfDependency(String),
    #[error("package '{package}' lists dependency '{dependency}' more than once")]
    DuplicateDependency { package: String, dependency: String },
    #[error("package '{package}': source URL must not be empty")]
    EmptySourceUrl { package: String },
    #[error("package '{package}': invalid checksum '{checksum}' (expected sha256:<hex>, blake3:<hex> or 64 hex chars)")]
    InvalidChecksum { package: String, checksum: String },
    #[error("package '{package}': ownership path '{path}' must be absolute")]
    RelativeOwnershipPath { package: String, path: String },
    #[error("package '{package}': build step in '{phase}' must not be empty")]
    EmptyStep { package: String, phase: BuildPhase },
    #[error("package '{package}': unknown hook stage '{stage}'")]
    UnknownHookStage { package: String, stage: String },
    #[error("package '{package}': hook in '{stage}' must not be empty")]
    EmptyHook { package: String, stage: String },
    #[error("package '{package}': patch path must not be empty")]
    EmptyPatchPath { package: String },
    #[error("package '{name}' is defined twice: {first} and {second}")]
    DuplicatePackage {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// On-disk schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct RawRecipe {
    name: String,
    version: String,
    #[serde(default)]
    variant: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
    #[serde(default)]
    sources: Vec<RawSource>,
    #[serde(default)]
    patches: Vec<RawPatch>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    hooks: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    build: BuildSection,
    #[serde(default)]
    package: toml::Table,
    #[serde(default)]
    ownership: Vec<OwnershipOverride>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
enum RawDependency {
    Inline(String),
    Table {
        name: String,
        #[serde(default, rename = "type")]
        kind: DependencyKind,
        #[serde(default)]
        version: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct RawSource {
    url: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    priority: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct RawPatch {
    path: String,
    #[serde(default)]
    apply_as: PatchTool,
    #[serde(default = "default_patch_stage")]
    stage: String,
    #[serde(default = "default_patch_strip")]
    strip: u32,
}

fn default_patch_stage() -> String {
    BuildPhase::PreConfigure.to_string()
}

fn default_patch_strip() -> u32 {
    1
}

/// Phase commands. The `*_cmds` spellings are accepted as aliases.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct BuildSection {
    #[serde(default, alias = "configure_cmds")]
    configure: Vec<String>,
    #[serde(default, alias = "build_cmds")]
    compile: Vec<String>,
    #[serde(default, alias = "install_cmds")]
    install: Vec<String>,
}

// ---------------------------------------------------------------------------
// Validated definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed only while building; never recorded as an installed dependency.
    Build,
    #[default]
    Runtime,
    /// Ignored unless optional dependencies are explicitly requested.
    Optional,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Build => write!(f, "build"),
            DependencyKind::Runtime => write!(f, "runtime"),
            DependencyKind::Optional => write!(f, "optional"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub name: PackageName,
    pub kind: DependencyKind,
    pub constraint: Option<VersionConstraint>,
}

/// Where a step runs in the build. The hook stages around the three
/// command phases carry patches and `[hooks]` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    PreConfigure,
    Configure,
    PreBuild,
    Compile,
    PostBuild,
    PreInstall,
    Install,
    PostInstall,
}

impl BuildPhase {
    /// Every phase, in execution order.
    pub const ALL: [BuildPhase; 8] = [
        BuildPhase::PreConfigure,
        BuildPhase::Configure,
        BuildPhase::PreBuild,
        BuildPhase::Compile,
        BuildPhase::PostBuild,
        BuildPhase::PreInstall,
        BuildPhase::Install,
        BuildPhase::PostInstall,
    ];

    /// The hook stage called `name`, if there is one.
    pub fn hook_stage(name: &str) -> Option<Self> {
        match name {
            "pre_configure" => Some(BuildPhase::PreConfigure),
            "pre_build" => Some(BuildPhase::PreBuild),
            "post_build" => Some(BuildPhase::PostBuild),
            "pre_install" => Some(BuildPhase::PreInstall),
            "post_install" => Some(BuildPhase::PostInstall),
            _ => None,
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::PreConfigure => "pre_configure",
            BuildPhase::Configure => "configure",
            BuildPhase::PreBuild => "pre_build",
            BuildPhase::Compile => "compile",
            BuildPhase::PostBuild => "post_build",
            BuildPhase::PreInstall => "pre_install",
            BuildPhase::Install => "install",
            BuildPhase::PostInstall => "post_install",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    pub phase: BuildPhase,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checksum {
    Sha256(String),
    Blake3(String),
}

impl Checksum {
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim().to_ascii_lowercase();
        let (algo, hex) = match s.split_once(':') {
            Some((algo, hex)) => (algo.to_owned(), hex.to_owned()),
            None => ("sha256".to_owned(), s.clone()),
        };
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        match algo.as_str() {
            "sha256" => Some(Checksum::Sha256(hex)),
            "blake3" => Some(Checksum::Blake3(hex)),
            _ => None,
        }
    }

    pub fn hex(&self) -> &str {
        match self {
            Checksum::Sha256(h) | Checksum::Blake3(h) => h,
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checksum::Sha256(h) => write!(f, "sha256:{h}"),
            Checksum::Blake3(h) => write!(f, "blake3:{h}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    pub checksum: Option<Checksum>,
    /// Free-form source type from the recipe (`tarball`, `git`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Sources are fetched in ascending priority, recipe order breaking ties.
    #[serde(default)]
    pub priority: i64,
}

impl SourceDescriptor {
    /// File name used in the distfiles cache.
    pub fn file_name(&self) -> String {
        let trimmed = self.url.trim_end_matches('/');
        let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let last = last.split(['?', '#']).next().unwrap_or(last);
        if last.is_empty() {
            blake3::hash(self.url.as_bytes()).to_hex()[..16].to_owned()
        } else {
            last.to_owned()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchTool {
    /// `patch -pN`, retried with `git apply` when it fails.
    #[default]
    Patch,
    Git,
}

/// A patch file applied to the unpacked sources during the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSpec {
    /// Relative paths resolve against the recipe's directory.
    pub path: String,
    pub stage: BuildPhase,
    pub strip: u32,
    pub tool: PatchTool,
}

impl PatchSpec {
    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("patch")
    }
}

/// Commands run on the live system, outside any sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHooks {
    /// After the install transaction commits.
    pub post_install: Vec<String>,
    /// After the package's files are removed.
    pub post_remove: Vec<String>,
}

impl SystemHooks {
    pub fn is_empty(&self) -> bool {
        self.post_install.is_empty() && self.post_remove.is_empty()
    }
}

/// Ownership a file claims once installed, independent of who built it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OwnershipOverride {
    pub path: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// A validated package recipe. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageDefinition {
    pub name: PackageName,
    pub version: Version,
    pub variant: Option<String>,
    pub description: Option<String>,
    pub dependencies: Vec<DependencyRef>,
    /// Phase commands and build-stage hooks, in execution order.
    pub steps: Vec<BuildStep>,
    pub sources: Vec<SourceDescriptor>,
    pub patches: Vec<PatchSpec>,
    pub hooks: SystemHooks,
    pub environment: BTreeMap<String, String>,
    pub ownership: Vec<OwnershipOverride>,
    /// The recipe's `[package]` table, kept as written.
    pub metadata: toml::Table,
    #[serde(skip)]
    pub recipe_path: Option<PathBuf>,
}

impl PackageDefinition {
    pub fn dependencies_of_kind(
        &self,
        kind: DependencyKind,
    ) -> impl Iterator<Item = &DependencyRef> + '_ {
        self.dependencies.iter().filter(move |d| d.kind == kind)
    }

    pub fn runtime_dependency_names(&self) -> BTreeSet<PackageName> {
        self.dependencies_of_kind(DependencyKind::Runtime)
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn build_dependency_names(&self) -> BTreeSet<PackageName> {
        self.dependencies_of_kind(DependencyKind::Build)
            .map(|d| d.name.clone())
            .collect()
    }

    /// `name-version`, used for sandbox and archive naming.
    pub fn ident(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

pub fn validate_package_name(name: &str) -> Result<(), RecipeError> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'.' | b'-'))
        || name.starts_with('.')
    {
        return Err(RecipeError::InvalidName(name.to_owned()));
    }
    Ok(())
}

fn validate(raw: RawRecipe) -> Result<PackageDefinition, RecipeError> {
    validate_package_name(&raw.name)?;
    let package = raw.name.clone();
    let version = Version::parse(&raw.version).map_err(|source| RecipeError::Version {
        package: package.clone(),
        source,
    })?;

    let mut seen = BTreeSet::new();
    let mut dependencies = Vec::with_capacity(raw.dependencies.len());
    for dep in raw.dependencies {
        let (name, kind, constraint) = match dep {
            RawDependency::Inline(spec) => {
                let (name, constraint) =
                    split_dependency_spec(&spec).map_err(|source| RecipeError::Version {
                        package: package.clone(),
                        source,
                    })?;
                (name, DependencyKind::Runtime, constraint)
            }
            RawDependency::Table {
                name,
                kind,
                version,
            } => {
                let constraint = version
                    .as_deref()
                    .map(VersionConstraint::parse)
                    .transpose()
                    .map_err(|source| RecipeError::Version {
                        package: package.clone(),
                        source,
                    })?;
                (name.trim().to_owned(), kind, constraint)
            }
        };
        validate_package_name(&name)?;
        if name == package {
            return Err(RecipeError::SelfDependency(package));
        }
        if !seen.insert(name.clone()) {
            return Err(RecipeError::DuplicateDependency {
                package,
                dependency: name,
            });
        }
        dependencies.push(DependencyRef {
            name: PackageName::new(name),
            kind,
            constraint,
        });
    }

    let mut sources = Vec::with_capacity(raw.sources.len());
    for src in raw.sources {
        if src.url.trim().is_empty() {
            return Err(RecipeError::EmptySourceUrl { package });
        }
        let checksum = match src.checksum {
            Some(c) => Some(Checksum::parse(&c).ok_or_else(|| RecipeError::InvalidChecksum {
                package: package.clone(),
                checksum: c.clone(),
            })?),
            None => None,
        };
        sources.push(SourceDescriptor {
            url: src.url.trim().to_owned(),
            checksum,
            kind: src.kind,
            priority: src.priority,
        });
    }
    sources.sort_by_key(|s| s.priority);

    let mut patches = Vec::with_capacity(raw.patches.len());
    for patch in raw.patches {
        if patch.path.trim().is_empty() {
            return Err(RecipeError::EmptyPatchPath { package });
        }
        let stage =
            BuildPhase::hook_stage(&patch.stage).ok_or_else(|| RecipeError::UnknownHookStage {
                package: package.clone(),
                stage: patch.stage.clone(),
            })?;
        patches.push(PatchSpec {
            path: patch.path.trim().to_owned(),
            stage,
            strip: patch.strip,
            tool: patch.apply_as,
        });
    }

    let mut stage_hooks: BTreeMap<BuildPhase, Vec<String>> = BTreeMap::new();
    let mut hooks = SystemHooks::default();
    for (stage, commands) in raw.hooks {
        if commands.iter().any(|c| c.trim().is_empty()) {
            return Err(RecipeError::EmptyHook { package, stage });
        }
        // post_install runs once, on the live system after the install.
        match stage.as_str() {
            "post_install" => hooks.post_install = commands,
            "post_remove" => hooks.post_remove = commands,
            name => match BuildPhase::hook_stage(name) {
                Some(phase) => {
                    stage_hooks.insert(phase, commands);
                }
                None => return Err(RecipeError::UnknownHookStage { package, stage }),
            },
        }
    }

    let mut commands: BTreeMap<BuildPhase, Vec<String>> = BTreeMap::new();
    commands.insert(BuildPhase::Configure, raw.build.configure);
    commands.insert(BuildPhase::Compile, raw.build.compile);
    commands.insert(BuildPhase::Install, raw.build.install);
    for (phase, list) in &commands {
        if list.iter().any(|c| c.trim().is_empty()) {
            return Err(RecipeError::EmptyStep {
                package,
                phase: *phase,
            });
        }
    }

    let mut steps = Vec::new();
    for phase in BuildPhase::ALL {
        let list = commands
            .remove(&phase)
            .or_else(|| stage_hooks.remove(&phase))
            .unwrap_or_default();
        steps.extend(list.into_iter().map(|command| BuildStep { phase, command }));
    }

    for o in &raw.ownership {
        if !o.path.starts_with('/') {
            return Err(RecipeError::RelativeOwnershipPath {
                package,
                path: o.path.clone(),
            });
        }
    }

    let description = raw.description.or_else(|| {
        raw.package
            .get("description")
            .and_then(toml::Value::as_str)
            .map(str::to_owned)
    });

    Ok(PackageDefinition {
        name: PackageName::new(package),
        version,
        variant: raw.variant,
        description,
        dependencies,
        steps,
        sources,
        patches,
        hooks,
        environment: raw.environment,
        ownership: raw.ownership,
        metadata: raw.package,
        recipe_path: None,
    })
}

pub fn parse_recipe_str(input: &str) -> Result<PackageDefinition, RecipeError> {
    let raw: RawRecipe = toml::from_str(input)?;
    validate(raw)
}

pub fn parse_recipe_file(path: impl AsRef<Path>) -> Result<PackageDefinition, RecipeError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| RecipeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut def = parse_recipe_str(&content)?;
    def.recipe_path = Some(path.to_path_buf());
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "9a93b2b7dfdac77ceba5a558a580e74667dd6fede4585b91eefb60f03b72df23";

    #[test]
    fn parses_full_recipe() {
        let input = format!(
            r#"
name = "zlib"
version = "1.3.1"
description = "compression library"

[[dependencies]]
name = "glibc"
type = "runtime"
version = ">=2.38"

[[dependencies]]
name = "make"
type = "build"

[[sources]]
url = "https://zlib.net/zlib-1.3.1.tar.gz"
checksum = "sha256:{SHA}"

[environment]
CFLAGS = "-O2"

[build]
configure = ["./configure --prefix=/usr"]
compile = ["make"]
install = ["make DESTDIR=$DESTDIR install"]

[[ownership]]
path = "/usr/lib/libz.so.1"
uid = 0
gid = 0
mode = 0o755
"#
        );
        let def = parse_recipe_str(&input).expect("should parse");
        assert_eq!(def.name.as_str(), "zlib");
        assert_eq!(def.version.as_str(), "1.3.1");
        assert_eq!(def.dependencies.len(), 2);
        assert_eq!(def.dependencies[1].kind, DependencyKind::Build);
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[2].phase, BuildPhase::Install);
        assert_eq!(def.sources[0].file_name(), "zlib-1.3.1.tar.gz");
        assert!(matches!(def.sources[0].checksum, Some(Checksum::Sha256(_))));
        assert_eq!(def.ownership[0].mode, Some(0o755));
        assert_eq!(def.runtime_dependency_names().len(), 1);
        assert_eq!(def.build_dependency_names().len(), 1);
        assert_eq!(def.ident(), "zlib-1.3.1");
    }

    #[test]
    fn parses_inline_dependency_list() {
        let input = r#"
name = "bash"
version = "5.2"
dependencies = ["readline>=8", "ncurses"]
"#;
        let def = parse_recipe_str(input).unwrap();
        assert_eq!(def.dependencies.len(), 2);
        assert_eq!(def.dependencies[0].name.as_str(), "readline");
        assert!(def.dependencies[0].constraint.is_some());
        assert_eq!(def.dependencies[1].kind, DependencyKind::Runtime);
    }

    #[test]
    fn minimal_recipe_has_no_steps() {
        let def = parse_recipe_str("name = \"a\"\nversion = \"1\"\n").unwrap();
        assert!(def.steps.is_empty());
        assert!(def.sources.is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = "name = \"a\"\nversion = \"1\"\nbogus = true\n";
        assert!(parse_recipe_str(input).is_err());
    }

    #[test]
    fn parses_ports_format_recipe() {
        let input = format!(
            r#"
name = "bash"
version = "5.2.21"
variant = "static"

[[sources]]
url = "https://mirror-b.example.org/bash-5.2.21.tar.gz"
checksum = "sha256:{SHA}"
type = "tarball"
priority = 10

[[sources]]
url = "https://ftp.gnu.org/gnu/bash/bash-5.2.21.tar.gz"
type = "tarball"
priority = 1

[[patches]]
path = "patches/bash-5.2-upstream_fixes-1.patch"
strip = 1

[[patches]]
path = "fix-install.patch"
stage = "pre_install"
apply_as = "git"

[hooks]
pre_configure = ["sed -i 's/-O2/-O3/' configure"]
post_build = ["make check"]
post_install = ["ldconfig"]
post_remove = ["rm -f /etc/shells.bash"]

[build]
configure_cmds = ["./configure --prefix=/usr --without-bash-malloc"]
build_cmds = ["make"]
install_cmds = ["make DESTDIR=$DESTDIR install"]

[package]
description = "GNU Bourne-Again SHell"
license = "GPL-3.0"
"#
        );
        let def = parse_recipe_str(&input).unwrap();
        assert_eq!(def.variant.as_deref(), Some("static"));
        assert_eq!(def.description.as_deref(), Some("GNU Bourne-Again SHell"));
        assert_eq!(
            def.metadata.get("license").and_then(toml::Value::as_str),
            Some("GPL-3.0")
        );

        assert_eq!(def.sources[0].url, "https://ftp.gnu.org/gnu/bash/bash-5.2.21.tar.gz");
        assert_eq!(def.sources[1].priority, 10);
        assert_eq!(def.sources[1].kind.as_deref(), Some("tarball"));

        assert_eq!(def.patches.len(), 2);
        assert_eq!(def.patches[0].stage, BuildPhase::PreConfigure);
        assert_eq!(def.patches[0].tool, PatchTool::Patch);
        assert_eq!(def.patches[0].file_name(), "bash-5.2-upstream_fixes-1.patch");
        assert_eq!(def.patches[1].stage, BuildPhase::PreInstall);
        assert_eq!(def.patches[1].tool, PatchTool::Git);

        let phases: Vec<BuildPhase> = def.steps.iter().map(|s| s.phase).collect();
        assert_eq!(
            phases,
            vec![
                BuildPhase::PreConfigure,
                BuildPhase::Configure,
                BuildPhase::Compile,
                BuildPhase::PostBuild,
                BuildPhase::Install,
            ]
        );
        assert_eq!(def.steps[3].command, "make check");
        assert_eq!(def.hooks.post_install, vec!["ldconfig".to_owned()]);
        assert_eq!(def.hooks.post_remove.len(), 1);
    }

    #[test]
    fn rejects_unknown_hook_stage() {
        let input = "name = \"a\"\nversion = \"1\"\n[hooks]\npre_deploy = [\"true\"]\n";
        assert!(matches!(
            parse_recipe_str(input),
            Err(RecipeError::UnknownHookStage { .. })
        ));
        let input = "name = \"a\"\nversion = \"1\"\n[[patches]]\npath = \"x.patch\"\nstage = \"compile\"\n";
        assert!(matches!(
            parse_recipe_str(input),
            Err(RecipeError::UnknownHookStage { .. })
        ));
    }

    #[test]
    fn rejects_missing_version() {
        assert!(parse_recipe_str("name = \"a\"\n").is_err());
    }

    #[test]
    fn rejects_self_dependency() {
        let input = "name = \"a\"\nversion = \"1\"\ndependencies = [\"a\"]\n";
        assert!(matches!(
            parse_recipe_str(input),
            Err(RecipeError::SelfDependency(_))
        ));
    }

    #[test]
    fn rejects_duplicate_dependency() {
        let input = "name = \"a\"\nversion = \"1\"\ndependencies = [\"b\", \"b>=2\"]\n";
        assert!(matches!(
            parse_recipe_str(input),
            Err(RecipeError::DuplicateDependency { .. })
        ));
    }

    #[test]
    fn rejects_bad_checksum() {
        let input = r#"
name = "a"
version = "1"
[[sources]]
url = "https://example.com/a.tar.gz"
checksum = "md5:abc"
"#;
        assert!(matches!(
            parse_recipe_str(input),
            Err(RecipeError::InvalidChecksum { .. })
        ));
    }

    #[test]
    fn rejects_invalid_name() {
        assert!(parse_recipe_str("name = \"has space\"\nversion = \"1\"\n").is_err());
        assert!(validate_package_name("gcc-13.2").is_ok());
        assert!(validate_package_name("libstdc++").is_ok());
        assert!(validate_package_name("../etc").is_err());
    }

    #[test]
    fn rejects_relative_ownership_path() {
        let input = r#"
name = "a"
version = "1"
[[ownership]]
path = "usr/bin/a"
"#;
        assert!(matches!(
            parse_recipe_str(input),
            Err(RecipeError::RelativeOwnershipPath { .. })
        ));
    }

    #[test]
    fn checksum_forms() {
        assert!(matches!(Checksum::parse(SHA), Some(Checksum::Sha256(_))));
        let b3 = format!("blake3:{SHA}");
        assert!(matches!(Checksum::parse(&b3), Some(Checksum::Blake3(_))));
        assert!(Checksum::parse("sha256:short").is_none());
        assert_eq!(
            Checksum::parse(&format!("SHA256:{}", SHA.to_uppercase()))
                .unwrap()
                .to_string(),
            format!("sha256:{SHA}")
        );
    }

    #[test]
    fn source_file_name_strips_query() {
        let src = SourceDescriptor {
            url: "https://example.com/dl/pkg-1.0.tar.xz?raw=1".to_owned(),
            checksum: None,
            kind: None,
            priority: 0,
        };
        assert_eq!(src.file_name(), "pkg-1.0.tar.xz");
    }

    #[test]
    fn recipe_file_records_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.toml");
        fs::write(&path, "name = \"a\"\nversion = \"1\"\n").unwrap();
        let def = parse_recipe_file(&path).unwrap();
        assert_eq!(def.recipe_path.as_deref(), Some(path.as_path()));
    }
}
