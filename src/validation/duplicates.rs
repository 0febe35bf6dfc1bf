//! Fingerprints and the run-wide duplicate index.

use std::collections::HashSet;
use std::fmt;

use crate::records::AcceptedRecord;

/// Unit separator between question and answer bytes in content digests.
const CONTENT_SEPARATOR: u8 = 0x1f;

/// MD5 digest of normalized question text.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Fingerprint of a question after case folding, punctuation removal and
    /// whitespace collapsing.
    pub fn of_question(question: &str) -> Self {
        Self(md5::compute(normalize(question).as_bytes()).0)
    }

    /// Fingerprint of an accepted record.
    pub fn of_record(record: &AcceptedRecord) -> Self {
        Self::of_question(&record.question)
    }

    /// Exact-content digest of a question/answer pair, used when merging backups.
    pub fn of_content(question: &str, answer: &str) -> Self {
        let mut ctx = md5::Context::new();
        ctx.consume(question.as_bytes());
        ctx.consume([CONTENT_SEPARATOR]);
        ctx.consume(answer.as_bytes());
        Self(ctx.compute().0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn normalize(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Set of fingerprints accepted so far in the run.
#[derive(Debug, Default)]
pub struct DuplicateIndex {
    seen: HashSet<Fingerprint>,
}

impl DuplicateIndex {
    /// Whether the fingerprint is already known.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Inserts a fingerprint; `false` when it was already present.
    pub fn insert(&mut self, fingerprint: Fingerprint) -> bool {
        self.seen.insert(fingerprint)
    }

    /// Number of distinct fingerprints.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_punctuation_and_spacing() {
        let a = Fingerprint::of_question("Baş ağrısı neden olur?");
        let b = Fingerprint::of_question("  BAŞ   ağrısı, neden olur ");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::of_question("Baş ağrısı ne zaman geçer?"));
    }

    #[test]
    fn display_is_lowercase_hex() {
        let fp = Fingerprint::of_question("");
        assert_eq!(fp.to_string(), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn content_digest_distinguishes_answers() {
        assert_ne!(
            Fingerprint::of_content("Soru?", "Cevap bir."),
            Fingerprint::of_content("Soru?", "Cevap iki.")
        );
        assert_ne!(
            Fingerprint::of_content("ab", "c"),
            Fingerprint::of_content("a", "bc")
        );
    }

    #[test]
    fn index_insert_is_idempotent() {
        let mut index = DuplicateIndex::default();
        let fp = Fingerprint::of_question("Ne?");
        assert!(index.insert(fp));
        assert!(!index.insert(fp));
        assert_eq!(index.len(), 1);
    }
}
