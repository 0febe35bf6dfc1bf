//! Run statistics, the final JSON report and the crash dump.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::credentials::CredentialHealth;
use crate::service::FailureKind;
use crate::validation::RejectionCounts;

/// Share of the expected record count below which a snapshot is flagged.
pub const LOSS_THRESHOLD: f64 = 0.8;
/// Active credentials below which progress reports warn.
pub const LOW_CREDENTIAL_WARNING: usize = 3;

/// Counters accumulated by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Batches that reached `Accepted`.
    pub batches_accepted: usize,
    /// Batches that exhausted their attempts.
    pub batches_failed: usize,
    /// Size-guard splits performed.
    pub batches_split: usize,
    /// Service calls that returned text.
    pub calls_succeeded: usize,
    /// Quota failures.
    pub quota_failures: usize,
    /// Unauthorized failures.
    pub unauthorized_failures: usize,
    /// Timeouts.
    pub timeouts: usize,
    /// Empty or malformed responses.
    pub malformed_responses: usize,
    /// Other transport or server failures.
    pub other_failures: usize,
    /// Responses that needed syntactic repair before parsing.
    pub repaired_responses: usize,
    /// Responses replaced by locally synthesized variants.
    pub fallback_responses: usize,
    /// Variants submitted to validation.
    pub variants_generated: usize,
    /// Variants accepted.
    pub variants_accepted: usize,
    /// Estimated prompt tokens sent.
    pub prompt_tokens: usize,
    /// Estimated response tokens received.
    pub response_tokens: usize,
}

impl RunStats {
    /// Records a call that returned text.
    pub fn record_call_success(&mut self, prompt_tokens: usize, response_tokens: usize) {
        self.calls_succeeded += 1;
        self.prompt_tokens += prompt_tokens;
        self.response_tokens += response_tokens;
    }

    /// Records a failed call.
    pub fn record_call_failure(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Quota => self.quota_failures += 1,
            FailureKind::Unauthorized => self.unauthorized_failures += 1,
            FailureKind::Timeout => self.timeouts += 1,
            FailureKind::Malformed => self.malformed_responses += 1,
            FailureKind::Other => self.other_failures += 1,
        }
    }

    /// Records a response that parsed only after repair.
    pub fn record_repaired(&mut self) {
        self.repaired_responses += 1;
    }

    /// Records a response replaced by fallback variants.
    pub fn record_fallback(&mut self) {
        self.fallback_responses += 1;
    }

    /// Records a size-guard split.
    pub fn record_split(&mut self) {
        self.batches_split += 1;
    }

    /// Records validation results for one response.
    pub fn record_variants(&mut self, generated: usize, accepted: usize) {
        self.variants_generated += generated;
        self.variants_accepted += accepted;
    }

    /// Records a batch reaching `Accepted`.
    pub fn record_batch_accepted(&mut self) {
        self.batches_accepted += 1;
    }

    /// Records a batch ending `PermanentlyFailed`.
    pub fn record_batch_failed(&mut self) {
        self.batches_failed += 1;
    }

    /// Failed calls of every kind.
    pub fn calls_failed(&self) -> usize {
        self.quota_failures
            + self.unauthorized_failures
            + self.timeouts
            + self.malformed_responses
            + self.other_failures
    }

    /// Share of calls that returned text, in percent.
    pub fn success_rate(&self) -> f64 {
        let total = self.calls_succeeded + self.calls_failed();
        if total == 0 {
            return 0.0;
        }
        self.calls_succeeded as f64 / total as f64 * 100.0
    }

    /// Logs a progress line.
    pub fn report(
        &self,
        batch: usize,
        total_batches: usize,
        elapsed: Duration,
        rejections: &RejectionCounts,
        active_credentials: usize,
    ) {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let done = self.batches_accepted + self.batches_failed;
        info!(
            batch,
            total_batches,
            accepted = self.variants_accepted,
            success_rate = %format!("{:.1}%", self.success_rate()),
            batches_per_min = %format!("{:.2}", done as f64 / secs * 60.0),
            duplicates = rejections.duplicate,
            invalid_responses = self.fallback_responses,
            failed_batches = self.batches_failed,
            active_credentials,
            "progress"
        );
        if active_credentials < LOW_CREDENTIAL_WARNING {
            warn!(active_credentials, "credential pool running low");
        }
    }
}

/// A batch that ended `PermanentlyFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedBatch {
    /// Top-level batch index.
    pub batch: usize,
    /// Label of the call that failed, including split suffixes.
    pub label: String,
    /// First input position left unprocessed.
    pub first_record: usize,
    /// One past the last input position left unprocessed.
    pub end_record: usize,
    /// Attempts spent.
    pub attempts: usize,
    /// Last failure seen.
    pub last_error: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every batch reached a terminal state.
    Completed,
    /// The operator requested a stop.
    Interrupted,
    /// A safety threshold tripped.
    EmergencyStop {
        /// Threshold description.
        reason: String,
    },
    /// Every credential was retired.
    CredentialsExhausted,
}

/// Expected-versus-found record count for one snapshot.
///
/// Assumes every batch yields `batch_size * variants_per_record` records,
/// which rejection rates make untrue; informational only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossEstimate {
    /// Batch index the count refers to.
    pub batch: usize,
    /// Records the fixed multiplier predicts.
    pub expected: usize,
    /// Records actually present.
    pub found: usize,
    /// Whether `found` is under [`LOSS_THRESHOLD`] of `expected`.
    pub flagged: bool,
}

impl LossEstimate {
    /// Compares `found` against `(batch + 1) * batch_size * variants_per_record`.
    pub fn new(batch: usize, batch_size: usize, variants_per_record: usize, found: usize) -> Self {
        let expected = (batch + 1) * batch_size * variants_per_record;
        let flagged = (found as f64) < expected as f64 * LOSS_THRESHOLD;
        Self {
            batch,
            expected,
            found,
            flagged,
        }
    }
}

/// JSON summary written to `output/final_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
    /// Terminal status.
    #[serde(flatten)]
    pub status: RunStatus,
    /// Wall-clock run time.
    pub duration_secs: f64,
    /// Input records.
    pub source_records: usize,
    /// Batches in the input partition.
    pub total_batches: usize,
    /// Batch index the run resumed from.
    pub resumed_from: usize,
    /// Records restored from checkpoint and backups.
    pub recovered_records: usize,
    /// Accepted records at the end of the run, recovered ones included.
    pub accepted_records: usize,
    /// Call and batch counters.
    pub stats: RunStats,
    /// Rejections per gate.
    pub rejections: RejectionCounts,
    /// Batches skipped after exhausting their attempts.
    pub failed_batches: Vec<FailedBatch>,
    /// Credential counters at the end of the run.
    pub credentials: Vec<CredentialHealth>,
    /// Fixed-multiplier yield check for the last batch reached.
    pub loss_estimate: Option<LossEstimate>,
}

/// State persisted to `emergency_shutdown.json` before an abnormal exit.
#[derive(Debug, Clone, Serialize)]
pub struct CrashDump {
    /// Why the run stopped.
    pub reason: String,
    /// When it stopped.
    pub timestamp: DateTime<Utc>,
    /// Batch index a restart resumes from.
    pub resume_point: usize,
    /// Accepted records persisted with the forced flush.
    pub accepted_records: usize,
    /// Call and batch counters.
    pub stats: RunStats,
    /// Permanently failed batches, recovered ones included.
    pub failed_batches: Vec<FailedBatch>,
    /// Credential counters.
    pub credentials: Vec<CredentialHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn success_rate_counts_every_failure_kind() {
        let mut stats = RunStats::default();
        assert_eq!(stats.success_rate(), 0.0);
        stats.record_call_success(100, 50);
        stats.record_call_success(100, 50);
        stats.record_call_success(100, 50);
        stats.record_call_failure(FailureKind::Quota);
        assert_eq!(stats.calls_failed(), 1);
        assert_eq!(stats.success_rate(), 75.0);
        assert_eq!(stats.prompt_tokens, 300);
    }

    #[test]
    fn loss_estimate_flags_below_eighty_percent() {
        let ok = LossEstimate::new(9, 5, 2, 80);
        assert_eq!(ok.expected, 100);
        assert!(!ok.flagged);
        assert!(LossEstimate::new(9, 5, 2, 79).flagged);
    }

    #[test]
    fn status_serializes_with_tag() {
        let value = serde_json::to_value(RunStatus::EmergencyStop {
            reason: "memory".to_string(),
        })
        .expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"status": "emergency_stop", "reason": "memory"})
        );
    }
}
