//! Reject gates applied to every generated variant.

use regex::Regex;

use super::GateKind;
use crate::errors::{AugmentError, Result};
use crate::records::{GeneratedVariant, SourceRecord};

/// Shortest accepted question, in characters.
pub const MIN_QUESTION_CHARS: usize = 3;
/// Shortest accepted answer, in characters.
pub const MIN_ANSWER_CHARS: usize = 10;

const DANGEROUS_PHRASES: &[&str] = &[
    "kesinlikle yapın",
    "hiçbir zaman doktora gitmeyin",
    "ilaç gereksiz",
    "doktor tavsiyesi gereksiz",
    "kesinlikle iyileşir",
    "%100 etkili",
    "hiçbir yan etkisi yok",
    "her hastada kesin çalışır",
    "doktor yerine",
    "hastaneye gitmeyin",
];

const ABSOLUTE_CLAIMS: &[&str] = &[
    r"(?i)kesinlikle\s+.*?(yarar|iyileşir|çalışır)",
    r"(?i)hiçbir zaman\s+.*?(zarar|yan etki)",
    r"(?i)%100\s+.*?(etkili|başarılı|kesin)",
];

const DISALLOWED_TERMS: &[&str] = &["aptallık", "saçmalık", "gerizekalı"];

/// A pure accept/reject predicate over one variant.
pub trait Gate: Send + Sync {
    /// Which rejection counter this gate feeds.
    fn kind(&self) -> GateKind;

    /// Whether `variant` passes.
    fn check(&self, variant: &GeneratedVariant, source: &SourceRecord) -> bool;
}

fn combined_lowercase(variant: &GeneratedVariant) -> String {
    format!("{} {}", variant.question, variant.answer).to_lowercase()
}

/// Rejects unsafe advice and absolute efficacy claims.
#[derive(Debug)]
pub struct DomainSafetyGate {
    absolute_claims: Vec<Regex>,
}

impl DomainSafetyGate {
    /// Compiles the absolute-claim patterns.
    pub fn new() -> Result<Self> {
        let absolute_claims = ABSOLUTE_CLAIMS
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    AugmentError::Configuration(format!("invalid safety pattern {pattern}: {err}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { absolute_claims })
    }
}

impl Gate for DomainSafetyGate {
    fn kind(&self) -> GateKind {
        GateKind::DomainSafety
    }

    fn check(&self, variant: &GeneratedVariant, _source: &SourceRecord) -> bool {
        let content = combined_lowercase(variant);
        !DANGEROUS_PHRASES.iter().any(|phrase| content.contains(phrase))
            && !self.absolute_claims.iter().any(|re| re.is_match(&content))
    }
}

/// Rejects empty, too short or too long text.
#[derive(Debug)]
pub struct LanguageGate {
    max_answer_chars: usize,
}

impl LanguageGate {
    /// Gate with the given answer ceiling.
    pub fn new(max_answer_chars: usize) -> Self {
        Self { max_answer_chars }
    }
}

impl Gate for LanguageGate {
    fn kind(&self) -> GateKind {
        GateKind::Language
    }

    fn check(&self, variant: &GeneratedVariant, _source: &SourceRecord) -> bool {
        let question = variant.question.trim();
        let answer = variant.answer.trim();
        if question.is_empty() || answer.is_empty() {
            return false;
        }
        let answer_chars = answer.chars().count();
        question.chars().count() >= MIN_QUESTION_CHARS
            && answer_chars >= MIN_ANSWER_CHARS
            && answer_chars <= self.max_answer_chars
    }
}

/// Rejects variants carrying disallowed terms.
#[derive(Debug, Default)]
pub struct ContentFilterGate;

impl Gate for ContentFilterGate {
    fn kind(&self) -> GateKind {
        GateKind::ContentFilter
    }

    fn check(&self, variant: &GeneratedVariant, _source: &SourceRecord) -> bool {
        let content = combined_lowercase(variant);
        !DISALLOWED_TERMS.iter().any(|term| content.contains(term))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(question: &str, answer: &str) -> GeneratedVariant {
        GeneratedVariant {
            question: question.to_string(),
            answer: answer.to_string(),
            source_id: 0,
            batch: 0,
            fallback: false,
        }
    }

    fn source() -> SourceRecord {
        SourceRecord::new("Soru?", "Cevap metni.")
    }

    #[test]
    fn safety_rejects_phrases_and_absolute_claims() {
        let gate = DomainSafetyGate::new().expect("patterns compile");
        let src = source();
        assert!(gate.check(&variant("Grip nasıl geçer?", "Dinlenmek ve sıvı almak yardımcı olur."), &src));
        assert!(!gate.check(&variant("Ne yapmalı?", "Hastaneye gitmeyin, evde kalın."), &src));
        assert!(!gate.check(&variant("Bu ilaç?", "Kesinlikle herkese yarar sağlar."), &src));
        assert!(!gate.check(&variant("Tedavi?", "%100 oranında etkili bir yöntemdir."), &src));
        assert!(!gate.check(&variant("Yan etki?", "Hiçbir zaman ciddi yan etki görülmez."), &src));
    }

    #[test]
    fn language_enforces_length_bounds() {
        let gate = LanguageGate::new(20);
        let src = source();
        assert!(gate.check(&variant("Ne?", "on karakter"), &src));
        assert!(!gate.check(&variant("Ne", "on karakter"), &src));
        assert!(!gate.check(&variant("Neden?", "kısa"), &src));
        assert!(!gate.check(&variant("Neden?", "bu cevap yirmi karakterden uzun"), &src));
        assert!(!gate.check(&variant("   ", "geçerli bir cevap"), &src));
    }

    #[test]
    fn content_filter_matches_lowercased_text() {
        let gate = ContentFilterGate;
        assert!(!gate.check(&variant("Bu Saçmalık mı?", "Hayır, değildir."), &source()));
        assert!(gate.check(&variant("Bu doğru mu?", "Evet, doğrudur."), &source()));
    }
}
