//! Pure function mapping a free-text output window to an optional
//! [`Stage`]. Declaration order is the tie-break, so the table is a `Vec`
//! rather than a `HashMap` to make that order explicit and unambiguous.

use crate::types::Stage;

fn keyword_table() -> &'static [(Stage, &'static [&'static str])] {
    &[
        (Stage::Analyzing, &["analyz", "investigat", "examin"]),
        (Stage::Planning, &["plan", "design", "approach"]),
        (
            Stage::Implementing,
            &["implement", "writing code", "coding", "creating"],
        ),
        (Stage::Testing, &["test", "running test", "verify"]),
        (Stage::Reviewing, &["review", "pull request", "pr "]),
    ]
}

/// Scans the keyword table in fixed declaration order and returns the
/// first stage with a case-insensitive substring match, or `None`.
pub fn detect_stage(text: &str) -> Option<Stage> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    for (stage, keywords) in keyword_table() {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return Some(*stage);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_stage() {
        assert_eq!(detect_stage(""), None);
    }

    #[test]
    fn no_match_has_no_stage() {
        assert_eq!(detect_stage("just some ordinary chatter"), None);
    }

    #[test]
    fn case_insensitive_match() {
        assert_eq!(detect_stage("IMPLEMENTING the fix now"), Some(Stage::Implementing));
    }

    #[test]
    fn declaration_order_is_the_tie_break() {
        // Contains both an "analyzing" and a "testing" keyword; analyzing
        // is declared first and must win.
        let text = "analyzing the test suite";
        assert_eq!(detect_stage(text), Some(Stage::Analyzing));
    }

    #[test]
    fn each_table_entry_is_reachable() {
        assert_eq!(detect_stage("analyzing the codebase"), Some(Stage::Analyzing));
        assert_eq!(detect_stage("planning the approach"), Some(Stage::Planning));
        assert_eq!(detect_stage("implementing the fix"), Some(Stage::Implementing));
        assert_eq!(detect_stage("running the test suite"), Some(Stage::Testing));
        assert_eq!(detect_stage("opening a pull request"), Some(Stage::Reviewing));
    }
}
