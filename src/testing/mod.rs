//! Testing infrastructure: scripted fakes behind the production traits.
//!
//! These let loop and lifecycle logic run in unit tests without spawning
//! subprocesses or reading real task files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::{DroverError, Result};
use crate::prd::PrdService;
use crate::process::ProcessInspector;

/// One scripted backend iteration.
#[derive(Debug, Clone)]
pub struct ScriptedIteration {
    /// Exit code the fake process reports.
    pub exit_code: i32,
    /// Text appended to the output log for this iteration.
    pub output: String,
}

impl ScriptedIteration {
    /// A successful iteration emitting the given output.
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }

    /// A failed iteration.
    #[must_use]
    pub fn failing(exit_code: i32) -> Self {
        Self {
            exit_code,
            output: String::new(),
        }
    }
}

/// Backend fake driven by a fixed script of iterations.
///
/// Iterations past the end of the script repeat the last entry, so "never
/// completes" scenarios don't need padding.
pub struct MockBackend {
    script: Vec<ScriptedIteration>,
    calls: Mutex<u32>,
    log: Mutex<String>,
}

impl MockBackend {
    #[must_use]
    pub fn new(script: Vec<ScriptedIteration>) -> Self {
        Self {
            script,
            calls: Mutex::new(0),
            log: Mutex::new(String::new()),
        }
    }

    /// Number of iterations the loop actually ran.
    pub fn call_count(&self) -> u32 {
        *self.calls.lock().expect("calls lock")
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn is_installed(&self) -> bool {
        true
    }

    fn install_hint(&self) -> String {
        "mock backend is always installed".to_string()
    }

    async fn run_iteration(
        &self,
        _prompt: &str,
        _model: Option<&str>,
        _output_file: &Path,
    ) -> Result<i32> {
        let mut calls = self.calls.lock().expect("calls lock");
        let idx = (*calls as usize).min(self.script.len().saturating_sub(1));
        *calls += 1;
        let step = self
            .script
            .get(idx)
            .ok_or_else(|| DroverError::store("mock backend script is empty"))?;
        self.log.lock().expect("log lock").push_str(&step.output);
        Ok(step.exit_code)
    }

    fn parse_text(&self, _output_file: &Path) -> Result<String> {
        Ok(self.log.lock().expect("log lock").clone())
    }
}

/// PrdService fake with per-call remaining counts.
///
/// Counts past the end of the script repeat the last entry.
pub struct MockPrd {
    counts: Mutex<Vec<u32>>,
    calls: Mutex<usize>,
}

impl MockPrd {
    #[must_use]
    pub fn new(counts: Vec<u32>) -> Self {
        Self {
            counts: Mutex::new(counts),
            calls: Mutex::new(0),
        }
    }

    /// A service that always reports the same count.
    #[must_use]
    pub fn constant(count: u32) -> Self {
        Self::new(vec![count])
    }
}

impl PrdService for MockPrd {
    fn count_remaining_tasks(&self, _task_file: &Path) -> Result<u32> {
        let counts = self.counts.lock().expect("counts lock");
        let mut calls = self.calls.lock().expect("calls lock");
        let idx = (*calls).min(counts.len().saturating_sub(1));
        *calls += 1;
        counts
            .get(idx)
            .copied()
            .ok_or_else(|| DroverError::store("mock prd script is empty"))
    }

    fn task_blocks(&self, _task_file: &Path) -> Result<Vec<String>> {
        Ok(vec!["## Tasks\n- [ ] scripted task\n".to_string()])
    }
}

/// Inspector fake with a fixed set of live pids.
#[derive(Debug, Default)]
pub struct FakeInspector {
    live: HashMap<u32, bool>,
    default_alive: bool,
}

impl FakeInspector {
    /// Inspector that reports every pid dead except those added.
    #[must_use]
    pub fn none_alive() -> Self {
        Self::default()
    }

    /// Inspector that reports every pid alive.
    #[must_use]
    pub fn all_alive() -> Self {
        Self {
            live: HashMap::new(),
            default_alive: true,
        }
    }

    /// Marks one pid alive.
    #[must_use]
    pub fn with_live(mut self, pid: u32) -> Self {
        self.live.insert(pid, true);
        self
    }

    /// Marks one pid dead.
    #[must_use]
    pub fn with_dead(mut self, pid: u32) -> Self {
        self.live.insert(pid, false);
        self
    }
}

impl ProcessInspector for FakeInspector {
    fn is_alive(&self, pid: u32) -> bool {
        self.live.get(&pid).copied().unwrap_or(self.default_alive)
    }
}

/// Writes a minimal project fixture (working dir + task file) and returns
/// the task file path.
pub fn write_task_file(dir: &Path, unchecked: u32, checked: u32) -> PathBuf {
    let mut content = String::from("# Fixture PRD\n\n## Tasks\n");
    for i in 0..checked {
        content.push_str(&format!("- [x] done task {i}\n"));
    }
    for i in 0..unchecked {
        content.push_str(&format!("- [ ] open task {i}\n"));
    }
    let path = dir.join("PRD.md");
    std::fs::create_dir_all(dir).expect("fixture dir");
    std::fs::write(&path, content).expect("fixture task file");
    path
}
