//! Store configuration resolved once at process startup.
//!
//! All environment variables are optional; defaults place the registry under
//! the per-user configuration directory. The resolved struct is passed by
//! value into [`StateStore::new`](crate::store::StateStore::new) so the store
//! itself never reads process-global state.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DroverError, Result};

/// Environment variable for the base state directory.
pub const ENV_STATE_DIR: &str = "DROVER_STATE_DIR";
/// Environment variable for an explicit state-file path.
pub const ENV_STATE_FILE: &str = "DROVER_STATE_FILE";
/// Environment variable for an explicit lock-file path.
pub const ENV_LOCK_FILE: &str = "DROVER_LOCK_FILE";
/// Environment variable for the lock timeout in seconds.
pub const ENV_LOCK_TIMEOUT: &str = "DROVER_LOCK_TIMEOUT";

/// Default lock acquisition timeout in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 10;

/// State file name inside the state directory.
const STATE_FILE: &str = "sessions.json";

/// Lock file name inside the state directory.
const LOCK_FILE: &str = "sessions.lock";

/// Resolved paths and limits for the session registry.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory for state, logs, and the lock.
    pub state_dir: PathBuf,
    /// Path to the sessions document.
    pub state_file: PathBuf,
    /// Path to the lock file (or lock directory for the fallback strategy).
    pub lock_file: PathBuf,
    /// Bound on lock acquisition.
    pub lock_timeout: Duration,
}

impl StoreConfig {
    /// Resolves configuration from the environment, falling back to the
    /// per-user config directory.
    pub fn from_env() -> Result<Self> {
        let state_dir = match std::env::var_os(ENV_STATE_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| DroverError::config("could not determine user config directory"))?
                .join("drover"),
        };

        let state_file = std::env::var_os(ENV_STATE_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join(STATE_FILE));

        let lock_file = std::env::var_os(ENV_LOCK_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join(LOCK_FILE));

        let lock_timeout = match std::env::var(ENV_LOCK_TIMEOUT) {
            Ok(raw) => {
                let secs: u64 = raw.parse().map_err(|_| DroverError::InvalidConfig {
                    field: ENV_LOCK_TIMEOUT.to_string(),
                    reason: format!("'{raw}' is not a valid number of seconds"),
                })?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        };

        Ok(Self {
            state_dir,
            state_file,
            lock_file,
            lock_timeout,
        })
    }

    /// Builds a config rooted at an explicit directory, using defaults for
    /// everything else. Used by tests and the HTTP surface.
    #[must_use]
    pub fn at_dir(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            state_file: state_dir.join(STATE_FILE),
            lock_file: state_dir.join(LOCK_FILE),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            state_dir,
        }
    }

    /// Overrides the lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Directory that holds per-session log files.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Log file path for a named session.
    #[must_use]
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{name}.log"))
    }
}
