//! Claude Code backend adapter.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::Backend;
use crate::error::Result;

/// Adapter spawning the `claude` CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeBackend {
    dir: PathBuf,
}

impl ClaudeBackend {
    /// Creates an adapter running in the given working directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    fn is_installed(&self) -> bool {
        which::which("claude").is_ok()
    }

    fn install_hint(&self) -> String {
        "Install with: npm install -g @anthropic-ai/claude-code".to_string()
    }

    async fn run_iteration(
        &self,
        prompt: &str,
        model: Option<&str>,
        output_file: &Path,
    ) -> Result<i32> {
        let mut args = vec!["-p", "--dangerously-skip-permissions"];
        if let Some(model) = model {
            args.push("--model");
            args.push(model);
        }

        debug!("Running claude iteration in {}", self.dir.display());

        let mut child = tokio::process::Command::new("claude")
            .args(&args)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn claude")?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let mut stdout = child.stdout.take().context("claude stdout missing")?;
        let mut stderr = child.stderr.take().context("claude stderr missing")?;

        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let (out_read, err_read, status) = tokio::join!(
            stdout.read_to_end(&mut out_buf),
            stderr.read_to_end(&mut err_buf),
            child.wait(),
        );
        out_read?;
        err_read?;
        let status = status?;

        if let Some(parent) = output_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_file)
            .await?;
        log.write_all(&out_buf).await?;
        if !err_buf.is_empty() {
            log.write_all(&err_buf).await?;
        }
        log.flush().await?;

        Ok(status.code().unwrap_or(1))
    }

    fn parse_text(&self, output_file: &Path) -> Result<String> {
        let text = std::fs::read_to_string(output_file)
            .with_context(|| format!("Failed to read output log: {}", output_file.display()))?;
        Ok(text)
    }
}
