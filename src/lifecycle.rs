//! Session lifecycle operations: start, resume, stop, status.
//!
//! These operations are the only writers of lifecycle edges in the registry.
//! A loop may run in the foreground of the invoking CLI or as a detached
//! worker process (the same binary re-executed with the hidden `run-loop`
//! subcommand); both paths share [`run_recorded_loop`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend;
use crate::error::{DroverError, Result};
use crate::prd::{FilePrd, PrdService};
use crate::process::{self, ProcessInspector};
use crate::runner::{LoopRunner, LoopSettings};
use crate::store::{
    CleanupMode, SessionRecord, SessionStatus, SessionUpdate, StateStore, DEFAULT_TASK_FILE,
};

/// How long Stop waits for a signalled process to exit.
const STOP_WAIT: Duration = Duration::from_secs(3);

/// Parameters for starting a named session.
#[derive(Debug, Clone)]
pub struct StartSettings {
    pub name: String,
    pub dir: PathBuf,
    pub task_file: String,
    pub max_iterations: u32,
    pub completion_marker: String,
    pub backend: String,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub webhook: Option<String>,
    /// Run the loop in this process instead of a detached worker.
    pub foreground: bool,
}

impl StartSettings {
    /// Settings with defaults for a named session in a directory.
    #[must_use]
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            task_file: DEFAULT_TASK_FILE.to_string(),
            max_iterations: 50,
            completion_marker: "COMPLETE".to_string(),
            backend: "claude".to_string(),
            model: None,
            variant: None,
            webhook: None,
            foreground: false,
        }
    }
}

/// A record enriched for display: remaining-task count recomputed from the
/// live task file where possible.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub record: SessionRecord,
    /// Fresh count when the task file is readable, else the stored value.
    pub remaining: Option<u32>,
}

/// Starts a named session.
///
/// Rejects only when an existing record is Running with a live pid. A
/// Running record whose process is dead is overwritten with a warning.
pub async fn start(
    store: &StateStore,
    inspector: &dyn ProcessInspector,
    settings: StartSettings,
) -> Result<SessionStatus> {
    if let Some(existing) = store.get(&settings.name)? {
        if existing.status == SessionStatus::Running {
            match existing.pid {
                Some(pid) if inspector.is_alive(pid) => {
                    return Err(DroverError::AlreadyRunning {
                        name: settings.name,
                        pid,
                    });
                }
                _ => warn!(
                    "Session '{}' was recorded as running but its process is gone; restarting",
                    settings.name
                ),
            }
        }
    }

    let dir = settings.dir.canonicalize().unwrap_or(settings.dir.clone());
    if !dir.is_dir() {
        return Err(DroverError::MissingDir { path: dir });
    }
    let task_path = dir.join(&settings.task_file);
    if !task_path.is_file() {
        return Err(DroverError::MissingFile { path: task_path });
    }
    if settings.max_iterations == 0 {
        return Err(DroverError::InvalidIterations { value: 0 });
    }

    let adapter = backend::for_name(&settings.backend, &dir)?;
    backend::ensure_installed(adapter.as_ref())?;

    let remaining = FilePrd.count_remaining_tasks(&task_path).ok();
    let log_file = store.config().log_file(&settings.name);

    store.upsert(
        &settings.name,
        SessionUpdate {
            dir: Some(dir),
            task_file: Some(settings.task_file.clone()),
            pid: Some(None),
            background_handle: Some(None),
            started_at: Some(Utc::now()),
            iteration: Some(1),
            max_iterations: Some(settings.max_iterations),
            status: Some(SessionStatus::Running),
            last_task_count: Some(remaining),
            completion_marker: Some(settings.completion_marker.clone()),
            log_file: Some(log_file.clone()),
            backend: Some(settings.backend.clone()),
            model: Some(settings.model.clone()),
            variant: Some(settings.variant.clone()),
            webhook: Some(settings.webhook.clone()),
        },
    )?;

    launch(store, &settings.name, settings.foreground, &log_file).await
}

/// Launches the loop for an already-written Running record.
async fn launch(
    store: &StateStore,
    name: &str,
    foreground: bool,
    log_file: &Path,
) -> Result<SessionStatus> {
    if foreground {
        store.upsert(
            name,
            SessionUpdate {
                pid: Some(Some(std::process::id())),
                ..Default::default()
            },
        )?;
        return run_recorded_loop(store, name).await;
    }

    let pid = spawn_worker(name, log_file)?;
    store.upsert(
        name,
        SessionUpdate {
            pid: Some(Some(pid)),
            ..Default::default()
        },
    )?;
    info!("Session '{name}' started in background (pid {pid})");
    Ok(SessionStatus::Running)
}

/// Spawns a detached worker: this same binary, re-executed with the hidden
/// loop subcommand, stdio redirected to the session log.
fn spawn_worker(name: &str, log_file: &Path) -> Result<u32> {
    let exe = std::env::current_exe()?;
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let err_log = log.try_clone()?;

    let mut command = std::process::Command::new(exe);
    command
        .args(["run-loop", "--name", name])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(err_log));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Detach from the CLI's terminal process group so Ctrl-C in the
        // invoking shell does not kill the worker.
        command.process_group(0);
    }
    let child = command.spawn()?;
    Ok(child.id())
}

/// Runs the loop for a recorded session in the current process, persisting
/// every iteration report back into the store. Worker processes call this
/// after re-exec; foreground starts call it directly.
pub async fn run_recorded_loop(store: &StateStore, name: &str) -> Result<SessionStatus> {
    let record = store.get(name)?.ok_or_else(|| DroverError::SessionNotFound {
        name: name.to_string(),
    })?;

    // The worker is the authoritative owner from here on.
    store.upsert(
        name,
        SessionUpdate {
            pid: Some(Some(std::process::id())),
            ..Default::default()
        },
    )?;

    let adapter = backend::for_name(&record.backend, &record.dir)?;
    let settings = LoopSettings {
        name: record.name.clone(),
        dir: record.dir.clone(),
        task_file: record.task_file.clone(),
        max_iterations: record.max_iterations,
        completion_marker: record.completion_marker.clone(),
        model: record.model.clone(),
        log_file: record.log_file.clone(),
        start_iteration: record.iteration.max(1),
    };

    let runner = LoopRunner::new(adapter.as_ref(), &FilePrd, settings)
        .with_shutdown(watch_for_sigterm());
    let result = runner
        .run(|report| {
            // Merge-update: a concurrent stop clearing pid is not clobbered.
            if let Err(e) = store.upsert(
                name,
                SessionUpdate::progress(report.iteration, report.status, report.remaining),
            ) {
                warn!("Failed to persist iteration report for '{name}': {e}");
            }
        })
        .await;

    match &result {
        Ok(status) => info!("Session '{name}' finished: {status}"),
        Err(e) => warn!("Session '{name}' aborted: {e}"),
    }
    result
}

/// Flag set when this process receives SIGTERM. Handling the signal keeps
/// the loop (and its in-flight backend child) alive until the current
/// iteration finishes; the runner then exits before starting another.
fn watch_for_sigterm() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let flag = Arc::clone(&flag);
                tokio::spawn(async move {
                    sigterm.recv().await;
                    info!("SIGTERM received; finishing the current iteration");
                    flag.store(true, Ordering::Relaxed);
                });
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {e}"),
        }
    }
    flag
}

/// True if this record can be picked up by `resume`.
fn is_resumable(record: &SessionRecord, inspector: &dyn ProcessInspector) -> bool {
    match record.status {
        SessionStatus::Running => match record.pid {
            Some(pid) => !inspector.is_alive(pid),
            None => true,
        },
        SessionStatus::Stale | SessionStatus::Stopped => true,
        _ => false,
    }
}

/// Resumes one named session, or every resumable session when `name` is
/// None. Returns the names actually resumed.
///
/// Sessions whose working directory or task file vanished are skipped with
/// a warning; one bad session never fails the batch.
pub async fn resume(
    store: &StateStore,
    inspector: &dyn ProcessInspector,
    name: Option<&str>,
) -> Result<Vec<String>> {
    let candidates: Vec<SessionRecord> = match name {
        Some(name) => {
            let record = store.get(name)?.ok_or_else(|| DroverError::SessionNotFound {
                name: name.to_string(),
            })?;
            vec![record]
        }
        None => store.list()?,
    };

    let mut resumed = Vec::new();
    for record in candidates {
        if !is_resumable(&record, inspector) {
            debug!("Session '{}' not resumable ({})", record.name, record.status);
            continue;
        }
        if !record.dir.is_dir() {
            warn!(
                "Skipping '{}': working directory missing: {}",
                record.name,
                record.dir.display()
            );
            continue;
        }
        let task_path = record.task_file_path();
        if !task_path.is_file() {
            warn!(
                "Skipping '{}': task file missing: {}",
                record.name,
                task_path.display()
            );
            continue;
        }

        // The stored count may be stale; recompute from disk.
        let remaining = FilePrd.count_remaining_tasks(&task_path).ok();
        store.upsert(
            &record.name,
            SessionUpdate {
                status: Some(SessionStatus::Running),
                started_at: Some(Utc::now()),
                iteration: Some(record.iteration.max(1)),
                last_task_count: Some(remaining),
                pid: Some(None),
                background_handle: Some(None),
                ..Default::default()
            },
        )?;

        match launch(store, &record.name, false, &record.log_file).await {
            Ok(_) => resumed.push(record.name),
            Err(e) => warn!("Failed to resume '{}': {e}", record.name),
        }
    }
    Ok(resumed)
}

/// Stops one named session, or all Running sessions when `name` is None.
/// Returns the names transitioned to Stopped.
///
/// Termination is best effort; the record always ends up Stopped with its
/// pid and handle cleared, so the registry never wedges on an unreachable
/// process. Stopping an already-stopped session is a no-op that succeeds.
pub fn stop(
    store: &StateStore,
    inspector: &dyn ProcessInspector,
    name: Option<&str>,
) -> Result<Vec<String>> {
    let targets: Vec<SessionRecord> = match name {
        Some(name) => {
            let record = store.get(name)?.ok_or_else(|| DroverError::SessionNotFound {
                name: name.to_string(),
            })?;
            vec![record]
        }
        None => store
            .list()?
            .into_iter()
            .filter(|r| r.status == SessionStatus::Running)
            .collect(),
    };

    let mut stopped = Vec::new();
    for record in targets {
        if let Some(handle) = &record.background_handle {
            kill_background_handle(handle);
        } else if let Some(pid) = record.pid {
            if inspector.is_alive(pid) && !process::terminate(inspector, pid, STOP_WAIT) {
                warn!(
                    "Process {pid} for session '{}' did not exit; marking stopped anyway",
                    record.name
                );
            }
        }

        store.upsert(&record.name, SessionUpdate::stopped())?;
        stopped.push(record.name);
    }
    Ok(stopped)
}

/// Terminates a detached execution context. The handle is treated as a
/// tmux session name; other frontends that share the store use tmux for
/// their workers.
fn kill_background_handle(handle: &str) {
    let result = std::process::Command::new("tmux")
        .args(["kill-session", "-t", handle])
        .output();
    match result {
        Ok(output) if output.status.success() => {
            debug!("Killed background session '{handle}'");
        }
        Ok(output) => warn!(
            "tmux kill-session '{handle}' failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("tmux not available to kill '{handle}': {e}"),
    }
}

/// Reports all sessions, liveness-corrected and with remaining-task counts
/// recomputed from the live task files.
///
/// Dead-but-recorded-as-Running sessions are marked Stale before display.
pub fn status(store: &StateStore, prd: &dyn PrdService) -> Result<Vec<SessionView>> {
    let marked = store.cleanup_stale(CleanupMode::Mark)?;
    if !marked.is_empty() {
        warn!("Marked stale sessions: {}", marked.join(", "));
    }

    let views = store
        .list()?
        .into_iter()
        .map(|record| {
            let task_path = record.task_file_path();
            let remaining = if task_path.is_file() {
                prd.count_remaining_tasks(&task_path)
                    .ok()
                    .or(record.last_task_count)
            } else {
                record.last_task_count
            };
            SessionView { record, remaining }
        })
        .collect();
    Ok(views)
}

/// Removes stale sessions from the registry entirely.
pub fn prune(store: &StateStore) -> Result<Vec<String>> {
    store.cleanup_stale(CleanupMode::Remove)
}
