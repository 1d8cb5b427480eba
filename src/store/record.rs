//! Session records and the merge-update patch.
//!
//! A [`SessionRecord`] is the persisted description of one named loop. The
//! registry mutates records exclusively through [`SessionUpdate`] patches:
//! only fields the patch supplies change, everything else is preserved, so
//! independent writers touching unrelated fields never clobber each other.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default task file name, relative to the session's working directory.
pub const DEFAULT_TASK_FILE: &str = "PRD.md";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// A loop process owns this session and is iterating.
    Running,
    /// Recorded as running, but the owning process is verifiably dead.
    Stale,
    /// Explicitly stopped.
    Stopped,
    /// The agent emitted the completion signal with zero tasks remaining.
    Complete,
    /// A backend iteration exited non-zero.
    Failed,
    /// The iteration budget ran out without completion.
    MaxIterationsReached,
}

impl SessionStatus {
    /// True for statuses a loop will never advance past on its own.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stale => "stale",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::MaxIterationsReached => "max_iterations_reached",
        };
        write!(f, "{s}")
    }
}

/// One named loop session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// Unique name, immutable once created.
    pub name: String,
    /// Absolute path to the working directory the loop operates in.
    pub dir: PathBuf,
    /// Task file path, relative to `dir`.
    pub task_file: String,
    /// Pid of the owning loop process, absent when none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Opaque handle to a detached execution context (e.g. a tmux session
    /// name). Absent when the loop runs as a plain child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_handle: Option<String>,
    /// When this session was started.
    pub started_at: DateTime<Utc>,
    /// Current iteration, 1-based. Monotonically non-decreasing while
    /// status is Running.
    pub iteration: u32,
    /// Iteration budget.
    pub max_iterations: u32,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Last known remaining-task count, absent if unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_count: Option<u32>,
    /// Token the agent must echo inside a promise tag to signal completion.
    pub completion_marker: String,
    /// Log file capturing all backend output.
    pub log_file: PathBuf,
    /// Backend adapter name (opaque to the registry).
    pub backend: String,
    /// Model override passed through to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Backend variant, opaque passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Webhook URL, opaque passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
}

impl SessionRecord {
    /// Creates a fresh Running record at iteration 1.
    #[must_use]
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            task_file: DEFAULT_TASK_FILE.to_string(),
            pid: None,
            background_handle: None,
            started_at: Utc::now(),
            iteration: 1,
            max_iterations: 1,
            status: SessionStatus::Running,
            last_task_count: None,
            completion_marker: String::new(),
            log_file: PathBuf::new(),
            backend: String::new(),
            model: None,
            variant: None,
            webhook: None,
        }
    }

    /// Absolute path to the session's task file.
    #[must_use]
    pub fn task_file_path(&self) -> PathBuf {
        self.dir.join(&self.task_file)
    }
}

/// A field-level merge patch over a [`SessionRecord`].
///
/// `Some(value)` sets a field, `None` leaves it alone. The two clearable
/// fields (`pid`, `background_handle`) are doubly wrapped so a patch can
/// distinguish "leave as is" from "clear".
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub dir: Option<PathBuf>,
    pub task_file: Option<String>,
    pub pid: Option<Option<u32>>,
    pub background_handle: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub iteration: Option<u32>,
    pub max_iterations: Option<u32>,
    pub status: Option<SessionStatus>,
    pub last_task_count: Option<Option<u32>>,
    pub completion_marker: Option<String>,
    pub log_file: Option<PathBuf>,
    pub backend: Option<String>,
    pub model: Option<Option<String>>,
    pub variant: Option<Option<String>>,
    pub webhook: Option<Option<String>>,
}

impl SessionUpdate {
    /// Applies this patch to a record in place.
    pub fn apply(self, record: &mut SessionRecord) {
        if let Some(dir) = self.dir {
            record.dir = dir;
        }
        if let Some(task_file) = self.task_file {
            record.task_file = task_file;
        }
        if let Some(pid) = self.pid {
            record.pid = pid;
        }
        if let Some(handle) = self.background_handle {
            record.background_handle = handle;
        }
        if let Some(started_at) = self.started_at {
            record.started_at = started_at;
        }
        if let Some(iteration) = self.iteration {
            record.iteration = iteration;
        }
        if let Some(max_iterations) = self.max_iterations {
            record.max_iterations = max_iterations;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(count) = self.last_task_count {
            record.last_task_count = count;
        }
        if let Some(marker) = self.completion_marker {
            record.completion_marker = marker;
        }
        if let Some(log_file) = self.log_file {
            record.log_file = log_file;
        }
        if let Some(backend) = self.backend {
            record.backend = backend;
        }
        if let Some(model) = self.model {
            record.model = model;
        }
        if let Some(variant) = self.variant {
            record.variant = variant;
        }
        if let Some(webhook) = self.webhook {
            record.webhook = webhook;
        }
    }

    /// Patch that sets only the status.
    #[must_use]
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch written by the loop after each iteration.
    #[must_use]
    pub fn progress(iteration: u32, status: SessionStatus, remaining: Option<u32>) -> Self {
        Self {
            iteration: Some(iteration),
            status: Some(status),
            last_task_count: Some(remaining),
            ..Self::default()
        }
    }

    /// Patch written by Stop: terminal status with ownership cleared.
    #[must_use]
    pub fn stopped() -> Self {
        Self {
            status: Some(SessionStatus::Stopped),
            pid: Some(None),
            background_handle: Some(None),
            ..Self::default()
        }
    }
}
