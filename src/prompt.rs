//! Iteration prompt rendering.

use std::path::Path;

use crate::prd::PrdService;
use crate::error::Result;

/// Template for one loop iteration. The completion contract is spelled out
/// verbatim so the detector and the agent agree on the exact signal.
const ITERATION_TEMPLATE: &str = "\
You are one iteration of an unattended engineering loop working in this \
repository.

Read the task file at {task_file}. Pick the highest-priority unchecked task, \
implement it completely, and mark its checkbox done in the task file.

Open task sections:

{task_blocks}

Rules:
- Work on one task per iteration; leave the rest untouched.
- Keep the build green; run the tests you affect.
- Never delete tasks; check them off only when genuinely done.

When, and only when, every checkbox in the task file is checked and all work \
is verified, output exactly this token on its own line and nothing after it:

<promise>{marker}</promise>

If tasks remain, do not output the token in any form.
";

/// Renders the prompt for one iteration.
pub fn render(prd: &dyn PrdService, task_file: &Path, marker: &str) -> Result<String> {
    let blocks = prd.task_blocks(task_file)?;
    let task_blocks = if blocks.is_empty() {
        "(no unchecked tasks found)".to_string()
    } else {
        blocks.join("\n")
    };
    Ok(ITERATION_TEMPLATE
        .replace("{task_file}", &task_file.display().to_string())
        .replace("{task_blocks}", &task_blocks)
        .replace("{marker}", marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::FilePrd;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_render_includes_marker_and_blocks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("PRD.md");
        fs::write(&path, "## Tasks\n- [ ] build the thing\n").unwrap();

        let prompt = render(&FilePrd, &path, "SHIPIT").expect("render");
        assert!(prompt.contains("<promise>SHIPIT</promise>"));
        assert!(prompt.contains("- [ ] build the thing"));
        assert!(prompt.contains(&path.display().to_string()));
    }

    #[test]
    fn test_render_with_no_open_tasks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("PRD.md");
        fs::write(&path, "## Tasks\n- [x] all done\n").unwrap();

        let prompt = render(&FilePrd, &path, "COMPLETE").expect("render");
        assert!(prompt.contains("(no unchecked tasks found)"));
    }
}
