//! Per-run identity voting.
//!
//! Every detection's display label is recorded; at the end of the run the
//! most frequent normalized label is the answer.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("no identities were recorded in this session")]
    Empty,
}

fn confidence_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*-?\d+(?:[.,]\d+)?\s*%\s*$").expect("static regex"))
}

fn percent_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".%").expect("static regex"))
}

/// Reduce a display label to its identity key.
///
/// Strips a trailing percentage, then every ASCII digit and any character
/// directly followed by `%`, then surrounding whitespace. Identity labels
/// containing digits lose them too.
pub fn normalize_label(raw: &str) -> String {
    let without_suffix = confidence_suffix().replace(raw, "");
    let without_digits: String = without_suffix.chars().filter(|c| !c.is_ascii_digit()).collect();
    percent_pair()
        .replace_all(&without_digits, "")
        .trim()
        .to_string()
}

/// Label counts for one run or request.
#[derive(Debug, Default)]
pub struct SessionTally {
    counts: HashMap<String, usize>,
    /// First label to reach the current maximum count.
    leader: Option<(String, usize)>,
    recorded: usize,
}

impl SessionTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one detection's label under its normalized key. A label with
    /// no text left after normalization counts under the empty key.
    pub fn record(&mut self, label: &str) {
        let key = normalize_label(label);
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        self.recorded += 1;

        if self.leader.as_ref().map_or(true, |(_, best)| count > *best) {
            self.leader = Some((key, count));
        }
    }

    /// Number of labels counted so far.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    /// Votes for `label` after normalization.
    pub fn count(&self, label: &str) -> usize {
        self.counts.get(&normalize_label(label)).copied().unwrap_or(0)
    }

    /// Majority label. Ties go to the label that reached the top count first.
    pub fn finalize(self) -> Result<String, SessionError> {
        self.leader.map(|(label, _)| label).ok_or(SessionError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_confidence_suffixes() {
        assert_eq!(normalize_label("Alice 92.00%"), "Alice");
        assert_eq!(normalize_label("Alice 87.00%"), "Alice");
        assert_eq!(normalize_label("Bob 99.50%"), "Bob");
        assert_eq!(normalize_label("Bob   12.00 %"), "Bob");
        assert_eq!(normalize_label("Unknown"), "Unknown");
        assert_eq!(normalize_label("  Carol  "), "Carol");
    }

    #[test]
    fn test_normalize_negative_confidence() {
        // Distances above 1.0 render as negative percentages.
        assert_eq!(normalize_label("Dave -12.50%"), "Dave");
    }

    #[test]
    fn test_normalize_strips_digits_from_labels() {
        assert_eq!(normalize_label("R2D2 91.00%"), "RD");
    }

    #[test]
    fn test_equivalent_labels_count_together() {
        let mut tally = SessionTally::new();
        tally.record("Bob 99.50%");
        tally.record("Bob   12.00 %");
        assert_eq!(tally.count("Bob"), 2);
        assert_eq!(tally.recorded(), 2);
    }

    #[test]
    fn test_majority() {
        let mut tally = SessionTally::new();
        for label in ["Alice", "Alice", "Bob"] {
            tally.record(label);
        }
        assert_eq!(tally.finalize().unwrap(), "Alice");
    }

    #[test]
    fn test_majority_late_overtake() {
        let mut tally = SessionTally::new();
        for label in ["Bob 90.00%", "Alice 80.00%", "Alice 81.00%", "Bob 70.00%", "Alice 85.00%"] {
            tally.record(label);
        }
        assert_eq!(tally.finalize().unwrap(), "Alice");
    }

    #[test]
    fn test_tie_goes_to_first_to_reach_max() {
        let mut tally = SessionTally::new();
        for label in ["Bob", "Alice", "Alice", "Bob"] {
            tally.record(label);
        }
        assert_eq!(tally.finalize().unwrap(), "Alice");

        let mut tally = SessionTally::new();
        for label in ["Bob", "Alice"] {
            tally.record(label);
        }
        assert_eq!(tally.finalize().unwrap(), "Bob");
    }

    #[test]
    fn test_empty_session() {
        assert_eq!(SessionTally::new().finalize(), Err(SessionError::Empty));
    }

    #[test]
    fn test_all_digit_label_counts_as_empty_key() {
        let mut tally = SessionTally::new();
        tally.record("007 100.00%");
        assert!(!tally.is_empty());
        assert_eq!(tally.count(""), 1);
        assert_eq!(tally.finalize().unwrap(), "");
    }

    #[test]
    fn test_blank_labels_still_vote() {
        let mut tally = SessionTally::new();
        tally.record("42.00%");
        tally.record("   ");
        tally.record("Alice 90.00%");
        assert_eq!(tally.recorded(), 3);
        assert_eq!(tally.finalize().unwrap(), "");
    }
}
