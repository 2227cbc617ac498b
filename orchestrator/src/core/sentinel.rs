//! Completion sentinel protocol.
//!
//! The agent signals "no more work" by emitting a literal token anywhere in
//! its combined output. There is no structured completion signal; the raw
//! output is scanned as-is.

/// The exact token the agent must emit when the task set is exhausted.
pub const COMPLETION_SENTINEL: &str = "<promise>COMPLETE</promise>";

pub fn contains_completion_sentinel(output: &str) -> bool {
    output.contains(COMPLETION_SENTINEL)
}
