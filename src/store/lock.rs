//! Cross-process mutual exclusion for the session registry.
//!
//! Two strategies, selected by host capability:
//!
//! 1. Native advisory file lock (`fs2`) on a dedicated lock file. The kernel
//!    enforces exclusion and releases the lock when the holder dies.
//! 2. Directory mutex for hosts without a working advisory lock: creating a
//!    directory is atomic and fails if it already exists. The holder records
//!    its pid inside; a contender that finds the directory checks whether
//!    that owner is still alive and force-removes a stale lock.
//!
//! Acquisition is always bounded by the configured timeout, so a crashed
//! holder can never wedge the registry indefinitely.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{DroverError, Result};
use crate::process::ProcessInspector;

/// Poll interval while waiting for a contended lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// File inside the fallback lock directory recording the owner pid.
const OWNER_FILE: &str = "owner.pid";

/// How long an ownerless lock directory is left alone before it may be
/// reclaimed. A healthy holder writes its pid right after `create_dir`, so
/// the gap between the two is far smaller than this; only a holder that
/// crashed in that gap ever ages past it.
const MISSING_OWNER_GRACE: Duration = Duration::from_millis(250);

/// Lock factory bound to one lock path and timeout.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    timeout: Duration,
    /// Set once the native advisory lock proves unusable on this host.
    dir_fallback: AtomicBool,
}

/// Held lock. Released on drop on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    File(File),
    Dir(PathBuf),
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.inner {
            GuardInner::File(file) => {
                if let Err(e) = FileExt::unlock(file) {
                    warn!("Failed to release store lock: {e}");
                }
            }
            GuardInner::Dir(dir) => {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!("Failed to remove lock directory {}: {e}", dir.display());
                }
            }
        }
    }
}

impl StoreLock {
    /// Creates a lock factory for the given lock-file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            dir_fallback: AtomicBool::new(false),
        }
    }

    /// Path of the fallback lock directory.
    fn dir_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".d");
        PathBuf::from(name)
    }

    /// Acquires the exclusive lock, waiting up to the configured timeout.
    ///
    /// The inspector is used by the directory strategy to reclaim a lock
    /// whose recorded owner has died.
    pub fn acquire(&self, inspector: &dyn ProcessInspector) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            if self.dir_fallback.load(Ordering::Relaxed) {
                if let Some(guard) = self.try_dir_lock(inspector)? {
                    return Ok(guard);
                }
            } else {
                match self.try_file_lock() {
                    Ok(Some(guard)) => return Ok(guard),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Advisory lock unusable ({e}); switching to directory mutex");
                        self.dir_fallback.store(true, Ordering::Relaxed);
                        continue;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(DroverError::LockTimeout {
                    path: self.path.clone(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            std::thread::sleep(RETRY_INTERVAL);
        }
    }

    /// One native-lock attempt. `Ok(None)` means contended, `Err` means the
    /// primitive itself is unusable here.
    fn try_file_lock(&self) -> std::io::Result<Option<LockGuard>> {
        let file = File::create(&self.path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(LockGuard {
                inner: GuardInner::File(file),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// One directory-mutex attempt. `Ok(None)` means contended by a live
    /// owner.
    fn try_dir_lock(&self, inspector: &dyn ProcessInspector) -> Result<Option<LockGuard>> {
        let dir = self.dir_path();
        match fs::create_dir(&dir) {
            Ok(()) => {
                fs::write(dir.join(OWNER_FILE), std::process::id().to_string())?;
                Ok(Some(LockGuard {
                    inner: GuardInner::Dir(dir),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if self.reclaim_if_stale(&dir, inspector) {
                    debug!("Reclaimed stale lock directory {}", dir.display());
                    // Retry on the next poll tick.
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the lock directory if its recorded owner is dead. A missing
    /// or unreadable owner file counts as stale only after the directory has
    /// aged past [`MISSING_OWNER_GRACE`]: a fresh ownerless directory is a
    /// holder between `create_dir` and its pid write, and stealing it would
    /// admit a second holder.
    fn reclaim_if_stale(&self, dir: &Path, inspector: &dyn ProcessInspector) -> bool {
        let owner = fs::read_to_string(dir.join(OWNER_FILE))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        let stale = match owner {
            Some(pid) => !inspector.is_alive(pid),
            None => dir_age(dir).is_some_and(|age| age >= MISSING_OWNER_GRACE),
        };
        if stale {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!("Failed to reclaim stale lock {}: {e}", dir.display());
                return false;
            }
            return true;
        }
        false
    }
}

/// Age of a directory since its last modification. None if it vanished or
/// the filesystem reports no usable timestamp.
fn dir_age(dir: &Path) -> Option<Duration> {
    let modified = fs::metadata(dir).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
