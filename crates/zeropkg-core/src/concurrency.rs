use crate::CoreError;
use tracing::info;
use zeropkg_build::CancelFlag;
use zeropkg_store::{DbLayout, FileLock};

/// Holds the per-package build lock; at most one build of a package name
/// runs at a time, across threads and across invocations of the tool.
pub struct BuildLock {
    _lock: FileLock,
}

impl BuildLock {
    pub fn acquire(layout: &DbLayout, package: &str) -> Result<Self, CoreError> {
        let path = layout.build_lock_path(package);
        if let Some(lock) = FileLock::try_acquire(&path)? {
            return Ok(Self { _lock: lock });
        }
        info!("{package}: waiting for another build of this package to finish");
        Ok(Self {
            _lock: FileLock::acquire(&path)?,
        })
    }

    pub fn try_acquire(layout: &DbLayout, package: &str) -> Result<Option<Self>, CoreError> {
        Ok(FileLock::try_acquire(&layout.build_lock_path(package))?.map(|lock| Self { _lock: lock }))
    }
}

/// Route Ctrl-C into `cancel`: the first press stops new builds from being
/// dispatched, a second press exits immediately.
pub fn install_signal_handler(cancel: CancelFlag) {
    let _ = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        cancel.cancel();
        eprintln!("\ncancel requested, waiting for running builds...");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DbLayout::new(dir.path());
        {
            let _lock = BuildLock::acquire(&layout, "zlib").unwrap();
            assert!(layout.build_lock_path("zlib").exists());
        }
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DbLayout::new(dir.path());

        let _lock = BuildLock::acquire(&layout, "zlib").unwrap();
        assert!(BuildLock::try_acquire(&layout, "zlib").unwrap().is_none());
        assert!(BuildLock::try_acquire(&layout, "bash").unwrap().is_some());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DbLayout::new(dir.path());
        {
            let _lock = BuildLock::acquire(&layout, "zlib").unwrap();
        }
        assert!(BuildLock::try_acquire(&layout, "zlib").unwrap().is_some());
    }
}
