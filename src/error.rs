//! Custom error types for Drover.
//!
//! This module provides structured error types that map the failure classes
//! seen across the session registry and the orchestration loop: loop
//! preconditions, lock contention, backend failures, budget exhaustion,
//! and external-reality drift.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Drover operations
#[derive(Error, Debug)]
pub enum DroverError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to resolve configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    /// Missing required file
    #[error("Missing required file: {path}")]
    MissingFile { path: PathBuf },

    /// Missing working directory
    #[error("Missing working directory: {path}")]
    MissingDir { path: PathBuf },

    /// Iteration budget must be positive
    #[error("Invalid iteration budget: {value} (must be > 0)")]
    InvalidIterations { value: u32 },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// A live loop already owns this session name
    #[error("Session '{name}' is already running (pid {pid})")]
    AlreadyRunning { name: String, pid: u32 },

    /// Named session does not exist in the registry
    #[error("Session not found: {name}")]
    SessionNotFound { name: String },

    /// Timed out waiting for the cross-process store lock
    #[error("Store lock unavailable after {timeout_secs}s: {path}")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    /// Store read/write failed
    #[error("State store error: {message}")]
    Store { message: String },

    // =========================================================================
    // Loop Execution Errors
    // =========================================================================
    /// Backend iteration exited non-zero
    #[error("Backend '{backend}' failed with exit code {exit_code}")]
    Backend { backend: String, exit_code: i32 },

    /// Backend CLI is not installed on this host
    #[error("Backend '{backend}' is not installed. {hint}")]
    BackendNotInstalled { backend: String, hint: String },

    /// Unknown backend name
    #[error("Unknown backend: {name}")]
    UnknownBackend { name: String },

    /// Maximum iterations exceeded without completion
    #[error("Maximum iterations ({max}) reached without completion")]
    MaxIterations { max: u32 },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DroverError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable by retrying the single operation
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Store { .. })
    }

    /// Check if this is a loop-entry precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MissingFile { .. } | Self::MissingDir { .. } | Self::InvalidIterations { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingFile { .. } | Self::MissingDir { .. } | Self::InvalidIterations { .. } => {
                2
            }
            Self::LockTimeout { .. } => 3,
            Self::AlreadyRunning { .. } => 4,
            Self::SessionNotFound { .. } => 5,
            Self::BackendNotInstalled { .. } | Self::UnknownBackend { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for Drover results
pub type Result<T> = std::result::Result<T, DroverError>;
