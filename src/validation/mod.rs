//! Accept/reject pipeline for generated variants.
//!
//! Gates run in a fixed order: domain safety, language validity, content
//! filter, citation repair, duplicate detection. The first failing gate
//! discards the variant and bumps its counter; nothing is retried.

use serde::Serialize;
use tracing::debug;

pub mod citations;
pub mod duplicates;
pub mod gates;

pub use citations::{CitationFix, CitationRepair};
pub use duplicates::{DuplicateIndex, Fingerprint};
pub use gates::{ContentFilterGate, DomainSafetyGate, Gate, LanguageGate};

use crate::errors::Result;
use crate::records::{AcceptedRecord, GeneratedVariant, SourceRecord};

/// Gate responsible for a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    /// Unsafe advice or absolute efficacy claims.
    DomainSafety,
    /// Empty, too short or too long text.
    Language,
    /// Disallowed terms.
    ContentFilter,
    /// Fingerprint already accepted this run.
    Duplicate,
}

impl GateKind {
    /// Stable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::DomainSafety => "domain_safety",
            GateKind::Language => "language",
            GateKind::ContentFilter => "content_filter",
            GateKind::Duplicate => "duplicate",
        }
    }
}

/// Result of running one variant through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Passed every gate, possibly after citation repair.
    Accepted(AcceptedRecord),
    /// Discarded by the named gate.
    Rejected(GateKind),
}

/// Aggregate rejection and repair counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectionCounts {
    /// Rejected by the domain-safety gate.
    pub domain_safety: usize,
    /// Rejected by the language gate.
    pub language: usize,
    /// Rejected by the content filter.
    pub content_filter: usize,
    /// Rejected as duplicates.
    pub duplicate: usize,
    /// Answers that had a lost citation marker restored.
    pub citations_reinserted: usize,
    /// Answers that had excess citation markers removed.
    pub citations_trimmed: usize,
}

impl RejectionCounts {
    fn record(&mut self, kind: GateKind) {
        match kind {
            GateKind::DomainSafety => self.domain_safety += 1,
            GateKind::Language => self.language += 1,
            GateKind::ContentFilter => self.content_filter += 1,
            GateKind::Duplicate => self.duplicate += 1,
        }
    }

    /// Rejections across every gate.
    pub fn total(&self) -> usize {
        self.domain_safety + self.language + self.content_filter + self.duplicate
    }
}

/// Ordered gates plus the run-wide fingerprint set.
pub struct ValidationPipeline {
    gates: Vec<Box<dyn Gate>>,
    citations: CitationRepair,
    duplicates: DuplicateIndex,
    counts: RejectionCounts,
}

impl ValidationPipeline {
    /// Standard gate sequence with the given answer ceiling.
    pub fn new(max_answer_length: usize) -> Result<Self> {
        let gates: Vec<Box<dyn Gate>> = vec![
            Box::new(DomainSafetyGate::new()?),
            Box::new(LanguageGate::new(max_answer_length)),
            Box::new(ContentFilterGate),
        ];
        Ok(Self {
            gates,
            citations: CitationRepair::new()?,
            duplicates: DuplicateIndex::default(),
            counts: RejectionCounts::default(),
        })
    }

    /// Rebuilds the fingerprint set from recovered output; returns how many
    /// records were already known.
    pub fn seed(&mut self, records: &[AcceptedRecord]) -> usize {
        records
            .iter()
            .filter(|record| !self.duplicates.insert(Fingerprint::of_record(record)))
            .count()
    }

    /// Runs one variant through every gate.
    pub fn validate(&mut self, mut variant: GeneratedVariant, source: &SourceRecord) -> Verdict {
        variant.question = variant.question.trim().to_string();
        variant.answer = variant.answer.trim().to_string();

        if let Some(gate) = self.gates.iter().find(|gate| !gate.check(&variant, source)) {
            return self.reject(gate.kind(), &variant);
        }

        match self.citations.repair(&source.answer, &mut variant.answer) {
            CitationFix::Reinserted => self.counts.citations_reinserted += 1,
            CitationFix::Trimmed => self.counts.citations_trimmed += 1,
            CitationFix::Unchanged => {}
        }

        let fingerprint = Fingerprint::of_question(&variant.question);
        if !self.duplicates.insert(fingerprint) {
            return self.reject(GateKind::Duplicate, &variant);
        }
        Verdict::Accepted(variant.into())
    }

    fn reject(&mut self, kind: GateKind, variant: &GeneratedVariant) -> Verdict {
        self.counts.record(kind);
        debug!(
            gate = kind.as_str(),
            source = variant.source_id,
            batch = variant.batch,
            "variant rejected"
        );
        Verdict::Rejected(kind)
    }

    /// Counters so far.
    pub fn counts(&self) -> &RejectionCounts {
        &self.counts
    }

    /// Number of distinct fingerprints held.
    pub fn fingerprint_count(&self) -> usize {
        self.duplicates.len()
    }
}
