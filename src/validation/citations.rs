//! Citation marker repair.
//!
//! Source answers may carry `[cite: N]` markers. A variant that lost all of
//! them gets the first source marker appended; a variant with more than twice
//! the source's markers keeps only as many as the source had.

use regex::Regex;

use crate::errors::{AugmentError, Result};

const CITATION_PATTERN: &str = r"\[cite[^\]]*\]";

/// What [`CitationRepair::repair`] did to an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationFix {
    /// Marker count was acceptable.
    Unchanged,
    /// One source marker was appended.
    Reinserted,
    /// Excess markers were removed.
    Trimmed,
}

/// Restores or trims citation markers in generated answers.
#[derive(Debug, Clone)]
pub struct CitationRepair {
    pattern: Regex,
}

impl CitationRepair {
    /// Compiles the marker pattern.
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(CITATION_PATTERN)
            .map_err(|err| AugmentError::Configuration(format!("citation pattern: {err}")))?;
        Ok(Self { pattern })
    }

    /// Markers found in `text`, in order.
    pub fn markers<'t>(&self, text: &'t str) -> Vec<&'t str> {
        self.pattern.find_iter(text).map(|m| m.as_str()).collect()
    }

    /// Repairs `answer` in place against the source answer's markers.
    pub fn repair(&self, source_answer: &str, answer: &mut String) -> CitationFix {
        let source_markers = self.markers(source_answer);
        let found: Vec<(usize, usize)> = self
            .pattern
            .find_iter(answer)
            .map(|m| (m.start(), m.end()))
            .collect();

        if let Some(first) = source_markers.first() {
            if found.is_empty() {
                answer.push(' ');
                answer.push_str(first);
                return CitationFix::Reinserted;
            }
        }
        if found.len() <= source_markers.len() * 2 {
            return CitationFix::Unchanged;
        }

        let mut trimmed = String::with_capacity(answer.len());
        let mut cursor = 0;
        for &(start, end) in &found[source_markers.len()..] {
            let kept = &answer[cursor..start];
            trimmed.push_str(kept.strip_suffix(' ').unwrap_or(kept));
            cursor = end;
        }
        trimmed.push_str(&answer[cursor..]);
        *answer = trimmed.trim().to_string();
        CitationFix::Trimmed
    }
}
