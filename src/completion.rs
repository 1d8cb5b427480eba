//! Completion-signal detection over backend output.
//!
//! An agent signals completion by echoing the session's marker wrapped in a
//! promise tag, e.g. `<promise>COMPLETE</promise>`. Agents also *talk about*
//! the marker without meaning it: they quote it mid-transcript, or say they
//! cannot emit it. The detector therefore requires the tag to appear in the
//! trailing window of the output and rejects it when a negation phrase
//! precedes it within that same window. The zero-tasks-remaining condition
//! is checked by the loop, not here.

/// Size of the trailing window, in characters, inspected for the promise tag.
pub const TAIL_WINDOW: usize = 500;

/// Phrases that invalidate a promise tag they precede (compared
/// case-insensitively).
const NEGATION_PHRASES: &[&str] = &[
    "cannot",
    "can't",
    "won't",
    "will not",
    "do not",
    "don't",
    "should not",
    "shouldn't",
    "must not",
    "mustn't",
];

/// Returns true if `output` ends with a genuine completion signal for
/// `marker`.
#[must_use]
pub fn detect(output: &str, marker: &str) -> bool {
    let tag = format!("<promise>{marker}</promise>");
    let tail = tail_chars(output, TAIL_WINDOW);

    // Judge the last occurrence: earlier ones may be quoted discussion.
    let Some(tag_idx) = tail.rfind(&tag) else {
        return false;
    };

    let before = tail[..tag_idx].to_lowercase();
    !NEGATION_PHRASES
        .iter()
        .any(|phrase| before.contains(phrase))
}

/// Last `n` characters of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= n {
        return s;
    }
    let skip = char_count - n;
    let (idx, _) = s.char_indices().nth(skip).unwrap_or((0, ' '));
    &s[idx..]
}
