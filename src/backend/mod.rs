//! Agent backend adapters.
//!
//! The loop depends only on the [`Backend`] trait; concrete adapters shell
//! out to a specific agent CLI. Adding a backend means implementing the four
//! methods and registering the name in [`for_name`].

pub mod claude;

use std::path::Path;

use async_trait::async_trait;

use crate::error::{DroverError, Result};
pub use claude::ClaudeBackend;

/// One agent CLI, abstracted to a single-iteration contract.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Adapter name as used in session records and the CLI.
    fn name(&self) -> &str;

    /// Whether the underlying CLI is present on this host.
    fn is_installed(&self) -> bool;

    /// Human-readable installation instructions.
    fn install_hint(&self) -> String;

    /// Runs one iteration with the given prompt, appending all output to
    /// `output_file`. Returns the process exit code.
    async fn run_iteration(
        &self,
        prompt: &str,
        model: Option<&str>,
        output_file: &Path,
    ) -> Result<i32>;

    /// Extracts the agent's textual output from the iteration's output file.
    fn parse_text(&self, output_file: &Path) -> Result<String>;
}

/// Looks up a backend adapter by name.
pub fn for_name(name: &str, dir: &Path) -> Result<Box<dyn Backend>> {
    match name {
        "claude" => Ok(Box::new(ClaudeBackend::new(dir))),
        other => Err(DroverError::UnknownBackend {
            name: other.to_string(),
        }),
    }
}

/// Fails with an installation hint when the backend CLI is missing.
pub fn ensure_installed(backend: &dyn Backend) -> Result<()> {
    if backend.is_installed() {
        return Ok(());
    }
    Err(DroverError::BackendNotInstalled {
        backend: backend.name().to_string(),
        hint: backend.install_hint(),
    })
}
