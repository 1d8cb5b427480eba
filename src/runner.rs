//! The orchestration loop: drives one session to a terminal status.
//!
//! The runner owns no persistence. After every iteration it reports
//! `{iteration, status, remaining}` through a callback; the caller (CLI
//! foreground or detached worker) persists that into the registry. This
//! keeps the loop identical in both execution modes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::completion;
use crate::error::{DroverError, Result};
use crate::prd::PrdService;
use crate::prompt;
use crate::store::SessionStatus;

/// Everything the loop needs to run one session.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub name: String,
    pub dir: PathBuf,
    pub task_file: String,
    pub max_iterations: u32,
    pub completion_marker: String,
    pub model: Option<String>,
    pub log_file: PathBuf,
    /// Iteration to begin at; 1 for a fresh start, preserved on resume.
    pub start_iteration: u32,
}

/// Per-iteration state transition reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u32,
    pub status: SessionStatus,
    pub remaining: Option<u32>,
}

/// Drives iterations of one session.
pub struct LoopRunner<'a> {
    backend: &'a dyn Backend,
    prd: &'a dyn PrdService,
    settings: LoopSettings,
    shutdown: Arc<AtomicBool>,
}

impl<'a> LoopRunner<'a> {
    #[must_use]
    pub fn new(backend: &'a dyn Backend, prd: &'a dyn PrdService, settings: LoopSettings) -> Self {
        Self {
            backend,
            prd,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs a shared shutdown flag. When set, the loop finishes the
    /// in-flight iteration and returns `Stopped` instead of starting
    /// another one.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Validates loop-entry preconditions. Any violation is fatal before
    /// the first iteration.
    fn check_preconditions(&self) -> Result<()> {
        let s = &self.settings;
        if !s.dir.is_dir() {
            return Err(DroverError::MissingDir { path: s.dir.clone() });
        }
        let task_path = s.dir.join(&s.task_file);
        if !task_path.is_file() {
            return Err(DroverError::MissingFile { path: task_path });
        }
        if s.max_iterations == 0 {
            return Err(DroverError::InvalidIterations { value: 0 });
        }
        Ok(())
    }

    /// Runs the loop to a terminal status, invoking `report` after the
    /// precondition check fails or after every completed iteration.
    pub async fn run(
        &self,
        mut report: impl FnMut(&IterationReport),
    ) -> Result<SessionStatus> {
        if let Err(e) = self.check_preconditions() {
            warn!("Loop preconditions failed for '{}': {e}", self.settings.name);
            report(&IterationReport {
                iteration: self.settings.start_iteration,
                status: SessionStatus::Failed,
                remaining: None,
            });
            return Err(e);
        }

        let task_path = self.settings.dir.join(&self.settings.task_file);
        let mut iteration = self.settings.start_iteration.max(1);

        while iteration <= self.settings.max_iterations {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(
                    "Session '{}': shutdown requested, stopping before iteration {iteration}",
                    self.settings.name
                );
                return Ok(SessionStatus::Stopped);
            }
            info!(
                "Session '{}': iteration {}/{}",
                self.settings.name, iteration, self.settings.max_iterations
            );

            let prompt = prompt::render(self.prd, &task_path, &self.settings.completion_marker)?;
            let exit_code = self
                .backend
                .run_iteration(
                    &prompt,
                    self.settings.model.as_deref(),
                    &self.settings.log_file,
                )
                .await?;

            // The agent edits the task file; recount from disk every time.
            let remaining = match self.prd.count_remaining_tasks(&task_path) {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!("Failed to recount tasks for '{}': {e}", self.settings.name);
                    None
                }
            };

            let output = self.backend.parse_text(&self.settings.log_file)?;
            let completed = remaining == Some(0)
                && completion::detect(&output, &self.settings.completion_marker);

            if completed {
                debug!("Session '{}' signalled completion", self.settings.name);
                report(&IterationReport {
                    iteration,
                    status: SessionStatus::Complete,
                    remaining,
                });
                return Ok(SessionStatus::Complete);
            }

            if exit_code != 0 {
                warn!(
                    "Session '{}': backend exited with {exit_code}",
                    self.settings.name
                );
                report(&IterationReport {
                    iteration,
                    status: SessionStatus::Failed,
                    remaining,
                });
                return Ok(SessionStatus::Failed);
            }

            let next = iteration + 1;
            let status = if next > self.settings.max_iterations {
                SessionStatus::MaxIterationsReached
            } else {
                SessionStatus::Running
            };
            report(&IterationReport {
                iteration,
                status,
                remaining,
            });

            if status == SessionStatus::MaxIterationsReached {
                return Ok(SessionStatus::MaxIterationsReached);
            }
            iteration = next;
        }

        // Only reachable when start_iteration already exceeds the budget.
        Ok(SessionStatus::MaxIterationsReached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_task_file, MockBackend, MockPrd, ScriptedIteration};
    use tempfile::TempDir;

    fn settings(dir: &std::path::Path, max_iterations: u32) -> LoopSettings {
        LoopSettings {
            name: "test".into(),
            dir: dir.to_path_buf(),
            task_file: "PRD.md".into(),
            max_iterations,
            completion_marker: "COMPLETE".into(),
            model: None,
            log_file: dir.join("test.log"),
            start_iteration: 1,
        }
    }

    fn collect_reports() -> (
        std::sync::Arc<std::sync::Mutex<Vec<IterationReport>>>,
        impl FnMut(&IterationReport),
    ) {
        let reports = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&reports);
        (reports, move |r: &IterationReport| {
            sink.lock().unwrap().push(r.clone());
        })
    }

    #[tokio::test]
    async fn test_completes_on_promise_with_zero_remaining() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 1, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok(
            "checked the last box\n<promise>COMPLETE</promise>",
        )]);
        let prd = MockPrd::constant(0);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 5));

        let (reports, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");

        assert_eq!(status, SessionStatus::Complete);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, SessionStatus::Complete);
        assert_eq!(reports[0].remaining, Some(0));
    }

    #[tokio::test]
    async fn test_promise_without_zero_remaining_keeps_running() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 2, 0);

        // Agent lies: promise emitted while tasks remain unchecked.
        let backend = MockBackend::new(vec![ScriptedIteration::ok(
            "<promise>COMPLETE</promise>",
        )]);
        let prd = MockPrd::constant(2);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 2));

        let (_, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");
        assert_eq!(status, SessionStatus::MaxIterationsReached);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_negated_promise_is_not_completion() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 1, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok(
            "I cannot output <promise>COMPLETE</promise>",
        )]);
        let prd = MockPrd::constant(0);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 2));

        let (_, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");
        assert_eq!(status, SessionStatus::MaxIterationsReached);
    }

    #[tokio::test]
    async fn test_promise_buried_under_later_output_is_stale() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 1, 0);

        let mut buried = String::from("<promise>COMPLETE</promise>\n");
        buried.push_str(&"log noise ".repeat(100));
        let backend = MockBackend::new(vec![ScriptedIteration::ok(buried)]);
        let prd = MockPrd::constant(0);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 1));

        let (_, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");
        assert_eq!(status, SessionStatus::MaxIterationsReached);
    }

    #[tokio::test]
    async fn test_backend_failure_is_terminal() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 3, 0);

        let backend = MockBackend::new(vec![
            ScriptedIteration::ok("made progress"),
            ScriptedIteration::failing(2),
        ]);
        let prd = MockPrd::constant(3);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 10));

        let (reports, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");

        assert_eq!(status, SessionStatus::Failed);
        assert_eq!(backend.call_count(), 2);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.last().unwrap().status, SessionStatus::Failed);
        assert_eq!(reports.last().unwrap().iteration, 2);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_distinct_from_failure() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 3, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok("no signal")]);
        let prd = MockPrd::constant(3);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 2));

        let (reports, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");

        assert_eq!(status, SessionStatus::MaxIterationsReached);
        assert_eq!(backend.call_count(), 2);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status, SessionStatus::Running);
        assert_eq!(
            reports[1].status,
            SessionStatus::MaxIterationsReached
        );
    }

    #[tokio::test]
    async fn test_iterations_reported_monotonically() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 3, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok("tick")]);
        let prd = MockPrd::constant(3);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 4));

        let (reports, sink) = collect_reports();
        runner.run(sink).await.expect("run");

        let iterations: Vec<u32> = reports.lock().unwrap().iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_missing_dir_fails_preconditions() {
        let backend = MockBackend::new(vec![ScriptedIteration::ok("")]);
        let prd = MockPrd::constant(0);
        let runner = LoopRunner::new(
            &backend,
            &prd,
            settings(std::path::Path::new("/definitely/not/here"), 3),
        );

        let (reports, sink) = collect_reports();
        let result = runner.run(sink).await;

        assert!(matches!(result, Err(DroverError::MissingDir { .. })));
        assert_eq!(backend.call_count(), 0);
        assert_eq!(
            reports.lock().unwrap().last().unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_task_file_fails_preconditions() {
        let tmp = TempDir::new().unwrap();
        let backend = MockBackend::new(vec![ScriptedIteration::ok("")]);
        let prd = MockPrd::constant(0);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 3));

        let (_, sink) = collect_reports();
        let result = runner.run(sink).await;
        assert!(matches!(result, Err(DroverError::MissingFile { .. })));
    }

    #[tokio::test]
    async fn test_zero_budget_fails_preconditions() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 1, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok("")]);
        let prd = MockPrd::constant(1);
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 0));

        let (_, sink) = collect_reports();
        let result = runner.run(sink).await;
        assert!(matches!(
            result,
            Err(DroverError::InvalidIterations { value: 0 })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_before_first_iteration() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 2, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok("tick")]);
        let prd = MockPrd::constant(2);
        let shutdown = Arc::new(AtomicBool::new(true));
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 5))
            .with_shutdown(shutdown);

        let (reports, sink) = collect_reports();
        let status = runner.run(sink).await.expect("run");

        assert_eq!(status, SessionStatus::Stopped);
        assert_eq!(backend.call_count(), 0);
        assert!(reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_finishes_inflight_iteration_then_stops() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 2, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok("tick")]);
        let prd = MockPrd::constant(2);
        let shutdown = Arc::new(AtomicBool::new(false));
        let runner = LoopRunner::new(&backend, &prd, settings(tmp.path(), 5))
            .with_shutdown(Arc::clone(&shutdown));

        // Termination arrives mid-iteration; the loop completes and reports
        // that iteration, then stops instead of starting the next.
        let flag = Arc::clone(&shutdown);
        let status = runner
            .run(move |_| flag.store(true, Ordering::Relaxed))
            .await
            .expect("run");

        assert_eq!(status, SessionStatus::Stopped);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_starts_at_preserved_iteration() {
        let tmp = TempDir::new().unwrap();
        write_task_file(tmp.path(), 2, 0);

        let backend = MockBackend::new(vec![ScriptedIteration::ok("tick")]);
        let prd = MockPrd::constant(2);
        let mut s = settings(tmp.path(), 5);
        s.start_iteration = 4;
        let runner = LoopRunner::new(&backend, &prd, s);

        let (reports, sink) = collect_reports();
        runner.run(sink).await.expect("run");

        let iterations: Vec<u32> = reports.lock().unwrap().iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![4, 5]);
    }
}
