//! Record types flowing through the augmentation pipeline.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{AugmentError, Result};

/// One input question/answer pair. Read-only for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Question text.
    #[serde(rename = "soru", alias = "question")]
    pub question: String,
    /// Answer text, possibly carrying `[cite: N]` markers.
    #[serde(rename = "cevap", alias = "answer")]
    pub answer: String,
}

impl SourceRecord {
    /// Builds a record from the two text fields.
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// Identifier of a batch or of a half produced by size-based splitting.
///
/// The top-level index is what checkpoints and backups record; the suffix
/// path (`a`/`b` per split level) only labels sub-calls in logs and reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchId {
    index: usize,
    path: String,
}

impl BatchId {
    /// Identifier for a top-level batch.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            path: String::new(),
        }
    }

    /// Top-level batch index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifiers of the two halves produced by a split.
    pub fn halves(&self) -> (BatchId, BatchId) {
        let mut left = self.clone();
        left.path.push('a');
        let mut right = self.clone();
        right.path.push('b');
        (left, right)
    }

    /// Split depth (zero for a top-level batch).
    pub fn depth(&self) -> usize {
        self.path.len()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.index, self.path)
    }
}

/// Contiguous slice of the input collection processed by one service call.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    /// Position of the first record within the input collection.
    pub offset: usize,
    /// Records covered by this batch, in input order.
    pub records: &'a [SourceRecord],
}

impl<'a> Batch<'a> {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Splits the batch at its midpoint; the right half gets the extra record.
    pub fn split(&self) -> (Batch<'a>, Batch<'a>) {
        let mid = self.records.len() / 2;
        let (left, right) = self.records.split_at(mid);
        (
            Batch {
                offset: self.offset,
                records: left,
            },
            Batch {
                offset: self.offset + mid,
                records: right,
            },
        )
    }

    /// Range of input positions covered, for reports.
    pub fn span(&self) -> (usize, usize) {
        (self.offset, self.offset + self.records.len())
    }
}

/// Partitions the input into ordered fixed-size batches; the last may be shorter.
pub fn partition(records: &[SourceRecord], batch_size: usize) -> Vec<Batch<'_>> {
    let size = batch_size.max(1);
    records
        .chunks(size)
        .enumerate()
        .map(|(i, chunk)| Batch {
            offset: i * size,
            records: chunk,
        })
        .collect()
}

/// Reads the input collection, a JSON array of `{soru, cevap}` objects.
pub fn load_records(path: &Path) -> Result<Vec<SourceRecord>> {
    let raw = fs::read(path)?;
    let records: Vec<SourceRecord> = serde_json::from_slice(&raw)?;
    if records.is_empty() {
        return Err(AugmentError::InvalidInput(format!(
            "{} contains no records",
            path.display()
        )));
    }
    Ok(records)
}

/// Candidate produced for a source record, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedVariant {
    /// Generated question text.
    pub question: String,
    /// Generated answer text.
    pub answer: String,
    /// Input position of the source record this variant derives from.
    pub source_id: usize,
    /// Top-level batch index that produced the variant.
    pub batch: usize,
    /// Whether the variant was synthesized locally instead of returned by the service.
    pub fallback: bool,
}

/// A variant that passed every validation gate; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedRecord {
    /// Accepted question text.
    #[serde(rename = "soru", alias = "question")]
    pub question: String,
    /// Accepted answer text.
    #[serde(rename = "cevap", alias = "answer")]
    pub answer: String,
    /// Input position of the originating source record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<usize>,
    /// Top-level batch index that produced the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
}

impl From<GeneratedVariant> for AcceptedRecord {
    fn from(variant: GeneratedVariant) -> Self {
        Self {
            question: variant.question,
            answer: variant.answer,
            source_id: Some(variant.source_id),
            batch: Some(variant.batch),
        }
    }
}

impl AcceptedRecord {
    /// Projects the record back onto the input `{soru, cevap}` shape.
    pub fn to_source(&self) -> SourceRecord {
        SourceRecord::new(self.question.clone(), self.answer.clone())
    }
}
