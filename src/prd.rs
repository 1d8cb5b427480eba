//! Remaining-task counting and task-block extraction from PRD files.
//!
//! The loop only depends on the narrow [`PrdService`] contract; parsing
//! details (checkbox syntax, heading structure) stay behind it.

use std::path::Path;

use anyhow::Context;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::Result;

/// Contract consumed by the loop and the status surfaces.
pub trait PrdService: Send + Sync {
    /// Number of unchecked task items remaining in the file.
    fn count_remaining_tasks(&self, task_file: &Path) -> Result<u32>;

    /// Task blocks (heading plus body) that still contain unchecked items,
    /// used for prompt construction.
    fn task_blocks(&self, task_file: &Path) -> Result<Vec<String>>;
}

/// File-reading implementation over markdown checkboxes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePrd;

fn unchecked_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[-*]\s*\[ \]").expect("valid regex"))
}

impl PrdService for FilePrd {
    fn count_remaining_tasks(&self, task_file: &Path) -> Result<u32> {
        let content = std::fs::read_to_string(task_file)
            .with_context(|| format!("Failed to read task file: {}", task_file.display()))?;
        Ok(count_unchecked(&content))
    }

    fn task_blocks(&self, task_file: &Path) -> Result<Vec<String>> {
        let content = std::fs::read_to_string(task_file)
            .with_context(|| format!("Failed to read task file: {}", task_file.display()))?;
        Ok(split_blocks(&content)
            .into_iter()
            .filter(|block| count_unchecked(block) > 0)
            .collect())
    }
}

/// Counts unchecked `- [ ]` / `* [ ]` items.
#[must_use]
pub fn count_unchecked(content: &str) -> u32 {
    unchecked_re().find_iter(content).count() as u32
}

/// Splits markdown into blocks at `##`-level headings. The preamble before
/// the first heading forms its own block.
fn split_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        blocks.push(current);
    }
    blocks
}
