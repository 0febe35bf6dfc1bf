//! Run tunables and the command-line surface that produces them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::errors::{AugmentError, Result};

/// Largest batch the prompt format is allowed to carry.
pub const MAX_BATCH_SIZE: usize = 20;
/// Upper bound on per-batch attempts.
pub const MAX_ATTEMPTS: usize = 10;

/// Tunable knobs that bound an augmentation run.
#[derive(Clone, Debug, PartialEq)]
pub struct AugmentControls {
    batch_size: usize,
    variants_per_record: usize,
    max_attempts: usize,
    max_request_tokens: usize,
    retry_backoff_base: Duration,
    base_delay: Duration,
    min_delay: Duration,
    max_delay: Duration,
    checkpoint_every: usize,
    backup_every: usize,
    reload_every: usize,
    report_every: usize,
    max_answer_length: usize,
    max_fails_per_hour: usize,
    failed_batch_ceiling: usize,
    memory_ceiling_percent: f32,
}

impl AugmentControls {
    /// Records per service call.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Variants requested per source record.
    pub fn variants_per_record(&self) -> usize {
        self.variants_per_record
    }

    /// Attempts per batch before it is marked permanently failed.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Estimated request size above which a batch is split.
    pub fn max_request_tokens(&self) -> usize {
        self.max_request_tokens
    }

    /// Unit of the `2^attempt × base` retry wait.
    pub fn retry_backoff_base(&self) -> Duration {
        self.retry_backoff_base
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn retry_backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(16) as u32;
        self.retry_backoff_base.saturating_mul(1 << capped)
    }

    /// Starting delay between outbound calls.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Lower bound of the adaptive delay.
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Upper bound of the adaptive delay.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Checkpoint cadence, in batches.
    pub fn checkpoint_every(&self) -> usize {
        self.checkpoint_every
    }

    /// Backup snapshot cadence, in batches.
    pub fn backup_every(&self) -> usize {
        self.backup_every
    }

    /// How often (in batches) the key file is checked for changes.
    pub fn reload_every(&self) -> usize {
        self.reload_every
    }

    /// How often (in batches) a progress line is logged.
    pub fn report_every(&self) -> usize {
        self.report_every
    }

    /// Longest accepted answer, in characters.
    pub fn max_answer_length(&self) -> usize {
        self.max_answer_length
    }

    /// Failed calls within an hour that trigger an emergency stop.
    pub fn max_fails_per_hour(&self) -> usize {
        self.max_fails_per_hour
    }

    /// Permanently failed batches that trigger an emergency stop.
    pub fn failed_batch_ceiling(&self) -> usize {
        self.failed_batch_ceiling
    }

    /// Memory usage percentage that triggers an emergency stop.
    pub fn memory_ceiling_percent(&self) -> f32 {
        self.memory_ceiling_percent
    }

    /// Returns a builder seeded with the defaults.
    pub fn builder() -> AugmentControlsBuilder {
        AugmentControlsBuilder {
            inner: Self::default(),
        }
    }

    fn validate(self) -> Result<Self> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(AugmentError::Configuration(format!(
                "batch size must be within 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS {
            return Err(AugmentError::Configuration(format!(
                "max attempts must be within 1..={MAX_ATTEMPTS}, got {}",
                self.max_attempts
            )));
        }
        if self.variants_per_record == 0 {
            return Err(AugmentError::Configuration(
                "variants per record must be positive".to_string(),
            ));
        }
        if self.min_delay > self.max_delay {
            return Err(AugmentError::Configuration(format!(
                "min delay {:?} exceeds max delay {:?}",
                self.min_delay, self.max_delay
            )));
        }
        if self.checkpoint_every == 0 || self.backup_every < self.checkpoint_every {
            return Err(AugmentError::Configuration(format!(
                "backup cadence ({}) must be at least the checkpoint cadence ({}) and both positive",
                self.backup_every, self.checkpoint_every
            )));
        }
        Ok(self)
    }
}

impl Default for AugmentControls {
    fn default() -> Self {
        Self {
            batch_size: 5,
            variants_per_record: 2,
            max_attempts: 3,
            max_request_tokens: 30_000,
            retry_backoff_base: Duration::from_secs(2),
            base_delay: Duration::from_secs(2),
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            checkpoint_every: 10,
            backup_every: 25,
            reload_every: 5,
            report_every: 20,
            max_answer_length: 2000,
            max_fails_per_hour: 50,
            failed_batch_ceiling: 100,
            memory_ceiling_percent: 90.0,
        }
    }
}

/// Incremental constructor for [`AugmentControls`], used by the CLI and tests.
#[derive(Clone, Debug)]
pub struct AugmentControlsBuilder {
    inner: AugmentControls,
}

impl AugmentControlsBuilder {
    /// Records per service call.
    pub fn batch_size(mut self, value: usize) -> Self {
        self.inner.batch_size = value;
        self
    }

    /// Variants requested per record.
    pub fn variants_per_record(mut self, value: usize) -> Self {
        self.inner.variants_per_record = value;
        self
    }

    /// Attempts per batch.
    pub fn max_attempts(mut self, value: usize) -> Self {
        self.inner.max_attempts = value;
        self
    }

    /// Split threshold for request size.
    pub fn max_request_tokens(mut self, value: usize) -> Self {
        self.inner.max_request_tokens = value;
        self
    }

    /// Retry backoff unit.
    pub fn retry_backoff_base(mut self, value: Duration) -> Self {
        self.inner.retry_backoff_base = value;
        self
    }

    /// Base, minimum and maximum call delays.
    pub fn delays(mut self, base: Duration, min: Duration, max: Duration) -> Self {
        self.inner.base_delay = base;
        self.inner.min_delay = min;
        self.inner.max_delay = max;
        self
    }

    /// Checkpoint and backup cadences.
    pub fn cadence(mut self, checkpoint_every: usize, backup_every: usize) -> Self {
        self.inner.checkpoint_every = checkpoint_every;
        self.inner.backup_every = backup_every;
        self
    }

    /// Key reload cadence.
    pub fn reload_every(mut self, value: usize) -> Self {
        self.inner.reload_every = value.max(1);
        self
    }

    /// Progress report cadence.
    pub fn report_every(mut self, value: usize) -> Self {
        self.inner.report_every = value.max(1);
        self
    }

    /// Longest accepted answer.
    pub fn max_answer_length(mut self, value: usize) -> Self {
        self.inner.max_answer_length = value;
        self
    }

    /// Safety monitor thresholds.
    pub fn safety(mut self, fails_per_hour: usize, failed_batches: usize, memory: f32) -> Self {
        self.inner.max_fails_per_hour = fails_per_hour;
        self.inner.failed_batch_ceiling = failed_batches;
        self.inner.memory_ceiling_percent = memory;
        self
    }

    /// Validates ranges and returns the controls.
    pub fn build(self) -> Result<AugmentControls> {
        self.inner.validate()
    }
}

/// Command-line interface for the augmentation binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fastaugment",
    about = "Resumable question/answer augmentation through a generative API"
)]
pub struct AugmentCli {
    /// JSON array of {soru, cevap} records to augment
    #[arg(long, env = "FASTAUGMENT_INPUT", default_value = "data/input.json")]
    pub input: PathBuf,

    /// Directory holding checkpoints, backups and output
    #[arg(long, env = "FASTAUGMENT_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,

    /// JSON key file ({"api_keys": [...]}), re-read when modified
    #[arg(long, env = "FASTAUGMENT_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Inline API keys, comma separated
    #[arg(long, env = "GEMINI_API_KEYS", hide_env_values = true)]
    pub api_keys: Option<String>,

    /// Generative model identifier
    #[arg(long, env = "FASTAUGMENT_MODEL", default_value = "gemini-1.5-flash")]
    pub model: String,

    /// Base URL of the generative API
    #[arg(
        long,
        env = "FASTAUGMENT_API_BASE",
        default_value = "https://generativelanguage.googleapis.com/v1beta"
    )]
    pub api_base_url: String,

    /// Seconds to wait for a single generation call
    #[arg(long, env = "FASTAUGMENT_TIMEOUT_SECS", default_value_t = 120)]
    pub timeout_secs: u64,

    /// Records per request
    #[arg(long, env = "FASTAUGMENT_BATCH_SIZE", default_value_t = 5)]
    pub batch_size: usize,

    /// Variants requested per record
    #[arg(long, env = "FASTAUGMENT_VARIANTS", default_value_t = 2)]
    pub variants_per_record: usize,

    /// Attempts per batch before it is skipped
    #[arg(long, env = "FASTAUGMENT_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: usize,

    /// Estimated prompt tokens above which a batch is split in half
    #[arg(long, env = "FASTAUGMENT_MAX_TOKENS", default_value_t = 30_000)]
    pub max_request_tokens: usize,

    /// Starting delay between calls, in seconds
    #[arg(long, env = "FASTAUGMENT_DELAY_SECS", default_value_t = 2.0)]
    pub delay_secs: f64,

    /// Lower bound of the adaptive delay, in seconds
    #[arg(long, env = "FASTAUGMENT_MIN_DELAY_SECS", default_value_t = 1.0)]
    pub min_delay_secs: f64,

    /// Upper bound of the adaptive delay, in seconds
    #[arg(long, env = "FASTAUGMENT_MAX_DELAY_SECS", default_value_t = 60.0)]
    pub max_delay_secs: f64,

    /// Write a checkpoint every N batches
    #[arg(long, env = "FASTAUGMENT_CHECKPOINT_EVERY", default_value_t = 10)]
    pub checkpoint_every: usize,

    /// Write a backup snapshot every M batches (M >= N)
    #[arg(long, env = "FASTAUGMENT_BACKUP_EVERY", default_value_t = 25)]
    pub backup_every: usize,

    /// Check the key file for changes every N batches
    #[arg(long, env = "FASTAUGMENT_RELOAD_EVERY", default_value_t = 5)]
    pub reload_every: usize,

    /// Log a progress report every N batches
    #[arg(long, env = "FASTAUGMENT_REPORT_EVERY", default_value_t = 20)]
    pub report_every: usize,

    /// Longest accepted answer, in characters
    #[arg(long, env = "FASTAUGMENT_MAX_ANSWER", default_value_t = 2000)]
    pub max_answer_length: usize,

    /// Failed calls per hour that trigger an emergency stop
    #[arg(long, env = "FASTAUGMENT_MAX_FAILS_PER_HOUR", default_value_t = 50)]
    pub max_fails_per_hour: usize,

    /// Permanently failed batches that trigger an emergency stop
    #[arg(long, env = "FASTAUGMENT_FAILED_BATCH_CEILING", default_value_t = 100)]
    pub failed_batch_ceiling: usize,

    /// Memory usage percentage that triggers an emergency stop
    #[arg(long, env = "FASTAUGMENT_MEMORY_CEILING", default_value_t = 90.0)]
    pub memory_ceiling_percent: f32,
}

impl AugmentCli {
    /// Converts the parsed CLI into validated `AugmentControls`.
    pub fn build_controls(&self) -> Result<AugmentControls> {
        AugmentControls::builder()
            .batch_size(self.batch_size)
            .variants_per_record(self.variants_per_record)
            .max_attempts(self.max_retries)
            .max_request_tokens(self.max_request_tokens)
            .delays(
                seconds(self.delay_secs, "delay")?,
                seconds(self.min_delay_secs, "min delay")?,
                seconds(self.max_delay_secs, "max delay")?,
            )
            .cadence(self.checkpoint_every, self.backup_every)
            .reload_every(self.reload_every)
            .report_every(self.report_every)
            .max_answer_length(self.max_answer_length)
            .safety(
                self.max_fails_per_hour,
                self.failed_batch_ceiling,
                self.memory_ceiling_percent,
            )
            .build()
    }

    /// Per-call timeout for the service client.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Keys passed inline on the command line or environment.
    pub fn inline_keys(&self) -> Vec<String> {
        self.api_keys
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| AugmentError::Configuration(format!("{name} must be a non-negative number")))
}

/// On-disk shape of the credential key file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFile {
    /// Tokens for the generative service.
    pub api_keys: Vec<String>,
}

/// Key file handle that remembers the modification time it was last read at.
#[derive(Debug, Clone)]
pub struct KeySource {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl KeySource {
    /// Wraps a key file path; nothing is read until [`KeySource::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    /// Path of the key file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the key file and records its modification time.
    pub fn load(&mut self) -> Result<Vec<String>> {
        let raw = fs::read_to_string(&self.path)?;
        let parsed: KeyFile = serde_json::from_str(&raw)?;
        self.last_modified = modified(&self.path);
        Ok(parsed
            .api_keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect())
    }

    /// Whether the file changed since the last successful load.
    pub fn changed(&self) -> bool {
        match (modified(&self.path), self.last_modified) {
            (Some(now), Some(seen)) => now > seen,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let controls = AugmentControls::builder().build().expect("defaults valid");
        assert_eq!(controls.batch_size(), 5);
        assert_eq!(controls.retry_backoff(0), Duration::from_secs(2));
        assert_eq!(controls.retry_backoff(2), Duration::from_secs(8));
    }

    #[test]
    fn backup_cadence_must_not_be_finer_than_checkpoint() {
        let err = AugmentControls::builder()
            .cadence(10, 5)
            .build()
            .expect_err("backup finer than checkpoint");
        assert!(matches!(err, AugmentError::Configuration(_)));
    }

    #[test]
    fn oversized_batches_rejected() {
        assert!(AugmentControls::builder().batch_size(21).build().is_err());
        assert!(AugmentControls::builder().batch_size(0).build().is_err());
    }

    #[test]
    fn cli_splits_inline_keys() {
        let cli = AugmentCli::parse_from(["fastaugment", "--api-keys", " k1, ,k2 "]);
        assert_eq!(cli.inline_keys(), vec!["k1".to_string(), "k2".to_string()]);
        let controls = cli.build_controls().expect("cli defaults valid");
        assert_eq!(controls.checkpoint_every(), 10);
        assert_eq!(controls.backup_every(), 25);
    }

    #[test]
    fn key_source_detects_first_load_and_reads_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys.json");
        fs::write(&path, r#"{"api_keys": ["a", " b ", ""]}"#).expect("write keys");
        let mut source = KeySource::new(&path);
        assert!(source.changed());
        assert_eq!(source.load().expect("load"), vec!["a", "b"]);
        assert!(!source.changed());
    }
}
