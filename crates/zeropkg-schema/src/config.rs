//! Resolved runtime configuration.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! usable configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Locations searched by [`Config::load_default`], first match wins.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "/etc/zeropkg.conf",
    "/usr/lib/zeropkg/config.toml",
    "./config.toml",
];

/// Upper bound for `network.retries`.
pub const MAX_RETRIES: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("general.jobs must be at least 1")]
    ZeroJobs,
    #[error("network.retries must be at most {max}, got {0}", max = MAX_RETRIES)]
    TooManyRetries(u32),
    #[error("paths.{field} must be absolute, got '{value}'")]
    RelativePath { field: &'static str, value: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub general: GeneralSection,
    pub paths: PathsSection,
    pub network: NetworkSection,
    pub repo: RepoSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GeneralSection {
    pub jobs: usize,
    pub fakeroot: bool,
    pub chroot_enabled: bool,
    pub auto_clean: bool,
    pub preserve_on_failure: bool,
    pub log_level: String,
    pub build_user: Option<BuildUser>,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            jobs: 4,
            fakeroot: true,
            chroot_enabled: false,
            auto_clean: true,
            preserve_on_failure: true,
            log_level: "info".to_owned(),
            build_user: None,
        }
    }
}

/// Unprivileged identity build steps drop to when running as root.
/// Root builds without a configured user run as [`BuildUser::NOBODY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildUser {
    pub uid: u32,
    pub gid: u32,
}

impl BuildUser {
    pub const NOBODY: BuildUser = BuildUser {
        uid: 65534,
        gid: 65534,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathsSection {
    /// Live filesystem root packages are installed into.
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub ports_dir: PathBuf,
    pub build_root: PathBuf,
    pub cache_dir: PathBuf,
    pub packages_dir: PathBuf,
    /// Minimal base filesystem copied into each sandbox, if any.
    pub base_root: Option<PathBuf>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            db_path: PathBuf::from("/var/lib/zeropkg/db"),
            ports_dir: PathBuf::from("/usr/ports"),
            build_root: PathBuf::from("/var/zeropkg/build"),
            cache_dir: PathBuf::from("/usr/ports/distfiles"),
            packages_dir: PathBuf::from("/var/zeropkg/packages"),
            base_root: None,
        }
    }
}

impl PathsSection {
    /// Place every path under `prefix`. Used by tests and staged installs.
    pub fn rooted_at(prefix: &Path) -> Self {
        Self {
            root: prefix.join("root"),
            db_path: prefix.join("db"),
            ports_dir: prefix.join("ports"),
            build_root: prefix.join("build"),
            cache_dir: prefix.join("distfiles"),
            packages_dir: prefix.join("packages"),
            base_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkSection {
    pub retries: u32,
    /// Per-transfer timeout in seconds.
    pub timeout: u64,
    pub verify_ssl: bool,
    pub proxy: Option<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: 60,
            verify_ssl: true,
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RepoSection {
    pub remote: Option<String>,
    pub branch: String,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            remote: None,
            branch: "main".to_owned(),
        }
    }
}

impl Config {
    pub fn parse(input: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(input).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Load the first config file found in [`DEFAULT_CONFIG_PATHS`].
    pub fn load_default() -> Result<Self, ConfigError> {
        for candidate in DEFAULT_CONFIG_PATHS {
            let path = Path::new(candidate);
            if path.is_file() {
                debug!("using config {}", path.display());
                return Self::load(path);
            }
        }
        debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.jobs == 0 {
            return Err(ConfigError::ZeroJobs);
        }
        if self.network.retries > MAX_RETRIES {
            return Err(ConfigError::TooManyRetries(self.network.retries));
        }
        let p = &self.paths;
        let mut fields: Vec<(&'static str, &PathBuf)> = vec![
            ("root", &p.root),
            ("db_path", &p.db_path),
            ("ports_dir", &p.ports_dir),
            ("build_root", &p.build_root),
            ("cache_dir", &p.cache_dir),
            ("packages_dir", &p.packages_dir),
        ];
        if let Some(base) = &p.base_root {
            fields.push(("base_root", base));
        }
        for (field, value) in fields {
            if !value.is_absolute() {
                return Err(ConfigError::RelativePath {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}
