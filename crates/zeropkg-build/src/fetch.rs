//! Source fetching and verification.
//!
//! Sources land in the distfiles cache under their URL's file name. A
//! cached remote source whose checksum still matches is reused; everything
//! else is fetched into a temporary file, verified, and only then moved into
//! the cache, so a failed or tampered download never becomes visible there.

use crate::BuildError;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeropkg_schema::{Checksum, NetworkSection, SourceDescriptor};

const ARCHIVE_SUFFIXES: [&str; 10] = [
    ".tar", ".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.bz2", ".tbz2", ".tar.zst", ".tar.lz",
    ".tar.lzma",
];

/// Produces a local, verified copy of a package source.
pub trait SourceFetcher: Send + Sync {
    /// `origin` is the directory of the recipe, used to resolve relative
    /// source paths.
    fn fetch(
        &self,
        package: &str,
        source: &SourceDescriptor,
        origin: Option<&Path>,
    ) -> Result<PathBuf, BuildError>;
}

enum Location {
    Local(PathBuf),
    Remote(String),
}

fn locate(url: &str, origin: Option<&Path>) -> Location {
    if let Some(path) = url.strip_prefix("file://") {
        return Location::Local(PathBuf::from(path));
    }
    if url.contains("://") {
        return Location::Remote(url.to_owned());
    }
    let path = Path::new(url);
    match origin {
        Some(dir) if path.is_relative() => Location::Local(dir.join(path)),
        _ => Location::Local(path.to_path_buf()),
    }
}

/// Hex digest of `path` in the algorithm `expected` uses.
pub fn digest_file(path: &Path, expected: &Checksum) -> Result<String, std::io::Error> {
    let mut reader = BufReader::with_capacity(1024 * 1024, File::open(path)?);
    let mut buffer = vec![0u8; 1024 * 1024];
    match expected {
        Checksum::Sha256(_) => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        Checksum::Blake3(_) => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hasher.finalize().to_hex().to_string())
        }
    }
}

/// Fail with `IntegrityError` unless `path` matches `expected`. `file` names
/// the source in the error.
pub fn verify_checksum(
    package: &str,
    file: &str,
    path: &Path,
    expected: &Checksum,
) -> Result<(), BuildError> {
    let actual = digest_file(path, expected)?;
    if actual.eq_ignore_ascii_case(expected.hex()) {
        return Ok(());
    }
    Err(BuildError::IntegrityError {
        package: package.to_owned(),
        file: file.to_owned(),
        expected: expected.to_string(),
        actual: match expected {
            Checksum::Sha256(_) => format!("sha256:{actual}"),
            Checksum::Blake3(_) => format!("blake3:{actual}"),
        },
    })
}

/// Fetcher backed by the distfiles cache, downloading with `curl`.
#[derive(Debug, Clone)]
pub struct CacheFetcher {
    cache_dir: PathBuf,
    network: NetworkSection,
}

impl CacheFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>, network: NetworkSection) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            network,
        }
    }

    pub fn cache_path(&self, source: &SourceDescriptor) -> PathBuf {
        self.cache_dir.join(source.file_name())
    }

    fn curl_command(&self, url: &str, dest: &Path) -> Command {
        let timeout = self.network.timeout.to_string();
        let mut cmd = Command::new("curl");
        cmd.args(["--fail", "--location", "--silent", "--show-error"])
            .args(["--connect-timeout", &timeout])
            .args(["--speed-limit", "1", "--speed-time", &timeout]);
        if !self.network.verify_ssl {
            cmd.arg("--insecure");
        }
        if let Some(proxy) = &self.network.proxy {
            cmd.args(["--proxy", proxy]);
        }
        cmd.arg("--output").arg(dest).arg(url);
        cmd
    }

    /// Transfers tried per remote source: the first one plus the retries.
    fn attempts(&self) -> u32 {
        self.network.retries.saturating_add(1)
    }

    fn download(&self, package: &str, url: &str, dest: &Path) -> Result<(), BuildError> {
        let attempts = self.attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = Duration::from_secs(1 << (attempt - 2).min(4));
                warn!("{package}: retrying {url} in {delay:?} (attempt {attempt}/{attempts})");
                std::thread::sleep(delay);
            }
            match self.curl_command(url, dest).output() {
                Ok(out) if out.status.success() => return Ok(()),
                Ok(out) => {
                    last_error = String::from_utf8_lossy(&out.stderr).trim().to_owned();
                    if last_error.is_empty() {
                        last_error = out.status.to_string();
                    }
                }
                Err(e) => {
                    return Err(BuildError::Fetch {
                        package: package.to_owned(),
                        url: url.to_owned(),
                        reason: format!("cannot run curl: {e}"),
                    })
                }
            }
        }
        Err(BuildError::Fetch {
            package: package.to_owned(),
            url: url.to_owned(),
            reason: last_error,
        })
    }
}

impl SourceFetcher for CacheFetcher {
    fn fetch(
        &self,
        package: &str,
        source: &SourceDescriptor,
        origin: Option<&Path>,
    ) -> Result<PathBuf, BuildError> {
        let file_name = source.file_name();
        let dest = self.cache_path(source);
        let location = locate(&source.url, origin);

        if let (Location::Remote(_), true) = (&location, dest.is_file()) {
            match &source.checksum {
                Some(expected) => {
                    if verify_checksum(package, &file_name, &dest, expected).is_ok() {
                        debug!("{package}: using cached {}", dest.display());
                        return Ok(dest);
                    }
                    warn!("{package}: cached {file_name} does not match its checksum, refetching");
                }
                None => return Ok(dest),
            }
        }

        fs::create_dir_all(&self.cache_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        match &location {
            Location::Local(path) => {
                fs::copy(path, tmp.path()).map_err(|e| BuildError::Fetch {
                    package: package.to_owned(),
                    url: source.url.clone(),
                    reason: format!("{}: {e}", path.display()),
                })?;
            }
            Location::Remote(url) => {
                info!("{package}: downloading {url}");
                self.download(package, url, tmp.path())?;
            }
        }

        match &source.checksum {
            Some(expected) => verify_checksum(package, &file_name, tmp.path(), expected)?,
            None => warn!("{package}: {} has no checksum, not verified", source.url),
        }
        tmp.persist(&dest).map_err(|e| BuildError::Io(e.error))?;
        Ok(dest)
    }
}

pub fn is_archive(name: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Unpack an archive into `dest` with the host `tar`, or copy a plain file.
pub fn extract_source(package: &str, file: &Path, dest: &Path) -> Result<(), BuildError> {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::create_dir_all(dest)?;

    if !is_archive(&name) {
        fs::copy(file, dest.join(&name))?;
        return Ok(());
    }

    debug!("{package}: extracting {name}");
    let out = Command::new("tar")
        .arg("-xf")
        .arg(file)
        .arg("-C")
        .arg(dest)
        .arg("--no-same-owner")
        .output()
        .map_err(|e| BuildError::SandboxSetupFailed {
            package: package.to_owned(),
            reason: format!("cannot run tar: {e}"),
        })?;
    if !out.status.success() {
        return Err(BuildError::SandboxSetupFailed {
            package: package.to_owned(),
            reason: format!(
                "extracting {name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        });
    }
    Ok(())
}
