//! Batch orchestrator and the blocking entry point used by the CLI.
//!
//! One batch is in flight at a time. Each batch is driven to `Accepted`
//! (possibly with zero variants) or `PermanentlyFailed`; a size-guard split
//! processes the halves sequentially under suffixed labels. The stop flag and
//! the safety monitor are consulted once per batch, before the next one starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::runtime::Builder;
use tokio::task::{spawn_local, LocalSet};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, FinalOutputs};
use crate::controls::{AugmentCli, AugmentControls, KeySource};
use crate::credentials::{CallOutcome, CredentialHealth, CredentialPool};
use crate::errors::{AugmentError, Result};
use crate::extract::{augmented_items, extract, Extraction};
use crate::prompt::{build_prompt, estimate_tokens, fallback_variants};
use crate::rate_limit::RateLimiter;
use crate::records::{load_records, partition, AcceptedRecord, Batch, BatchId, GeneratedVariant, SourceRecord};
use crate::report::{CrashDump, FailedBatch, FinalReport, LossEstimate, RunStats, RunStatus};
use crate::safety::{ResourceProbe, SafetyMonitor};
use crate::service::{FailureKind, GeminiService, GenerativeService, ServiceRequest};
use crate::validation::{ValidationPipeline, Verdict};

const RESPONSE_PREVIEW_CHARS: usize = 200;

/// Report and output paths of a run that ended normally or on operator stop.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final JSON report, as written to disk.
    pub report: FinalReport,
    /// Files produced.
    pub outputs: FinalOutputs,
}

/// Facts fixed at the start of a run, carried into every report it writes.
struct RunContext {
    started: Instant,
    source_records: usize,
    total_batches: usize,
    resumed_from: usize,
    recovered_records: usize,
}

/// Owns every component of a run and drives the batch loop.
pub struct Augmenter<S> {
    controls: AugmentControls,
    service: S,
    pool: CredentialPool,
    limiter: RateLimiter,
    pipeline: ValidationPipeline,
    store: CheckpointStore,
    monitor: SafetyMonitor,
    stats: RunStats,
    key_source: Option<KeySource>,
    stop_requested: Arc<AtomicBool>,
    accepted: Vec<AcceptedRecord>,
    failed: Vec<FailedBatch>,
}

impl<S: GenerativeService> Augmenter<S> {
    /// Wires the components together; the safety monitor reads host memory.
    pub fn new(
        controls: AugmentControls,
        service: S,
        pool: CredentialPool,
        store: CheckpointStore,
    ) -> Result<Self> {
        let limiter = RateLimiter::new(
            controls.base_delay(),
            controls.min_delay(),
            controls.max_delay(),
        );
        let pipeline = ValidationPipeline::new(controls.max_answer_length())?;
        let monitor = SafetyMonitor::new(&controls);
        Ok(Self {
            controls,
            service,
            pool,
            limiter,
            pipeline,
            store,
            monitor,
            stats: RunStats::default(),
            key_source: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            accepted: Vec::new(),
            failed: Vec::new(),
        })
    }

    /// Re-reads this key file on the reload cadence.
    pub fn with_key_source(mut self, source: KeySource) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Replaces the memory probe used by the safety monitor.
    pub fn with_resource_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.monitor = SafetyMonitor::with_probe(&self.controls, probe);
        self
    }

    /// Flag that stops the loop before the next batch when set.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    /// Accepted output, recovered records included.
    pub fn accepted(&self) -> &[AcceptedRecord] {
        &self.accepted
    }

    /// Counters so far.
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Credential counters.
    pub fn credential_health(&self) -> Vec<CredentialHealth> {
        self.pool.health()
    }

    /// Recovers prior progress and processes every remaining batch.
    ///
    /// Returns `Ok` when every batch reached a terminal state or the stop flag
    /// was observed. Pool exhaustion and safety trips persist state, write a
    /// crash dump, the final report and the emergency sentinel, and return an
    /// error.
    pub async fn run(&mut self, records: &[SourceRecord]) -> Result<RunSummary> {
        let started = Instant::now();
        if self.store.clear_emergency_marker()? {
            warn!("previous run ended in an emergency stop; resuming from persisted state");
        }
        let recovery = self.store.recover()?;
        let recovered_records = recovery.records.len();
        self.accepted = recovery.records;
        self.failed = recovery.failed_batches;
        self.pipeline.seed(&self.accepted);
        if !self.failed.is_empty() {
            warn!(
                failed = self.failed.len(),
                "permanently failed batches carried over from the previous run"
            );
        }

        let batches = partition(records, self.controls.batch_size());
        let total_batches = batches.len();
        let resumed_from = recovery.resume_batch.min(total_batches);
        info!(
            records = records.len(),
            total_batches,
            resumed_from,
            recovered = recovered_records,
            credentials = self.pool.active_count(),
            "augmentation started"
        );
        let ctx = RunContext {
            started,
            source_records: records.len(),
            total_batches,
            resumed_from,
            recovered_records,
        };

        let mut next = resumed_from;
        let mut status = RunStatus::Completed;
        for (index, batch) in batches.iter().enumerate().skip(resumed_from) {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!(batch = index, "stop requested, flushing");
                status = RunStatus::Interrupted;
                break;
            }
            if let Some(trip) = self.monitor.check() {
                let reason = trip.to_string();
                let status = RunStatus::EmergencyStop {
                    reason: reason.clone(),
                };
                self.persist_emergency(&ctx, &reason, status, next)?;
                return Err(AugmentError::EmergencyStop { reason });
            }
            let since_start = index - resumed_from;
            if since_start > 0 && since_start % self.controls.reload_every() == 0 {
                self.reload_credentials().await;
            }

            match self.process_batch(index, *batch).await {
                Ok(failures) if failures.is_empty() => self.stats.record_batch_accepted(),
                Ok(failures) => {
                    self.stats.record_batch_failed();
                    self.monitor.record_failed_batch();
                    self.failed.extend(failures);
                }
                Err(AugmentError::CredentialsExhausted) => {
                    self.persist_emergency(
                        &ctx,
                        "credential pool exhausted",
                        RunStatus::CredentialsExhausted,
                        next,
                    )?;
                    return Err(AugmentError::CredentialsExhausted);
                }
                Err(err) => {
                    self.store.force_flush(next, &self.accepted, &self.failed)?;
                    return Err(err);
                }
            }
            next = index + 1;
            self.store.flush(index, &self.accepted, &self.failed)?;
            if next % self.controls.report_every() == 0 {
                self.stats.report(
                    next,
                    total_batches,
                    started.elapsed(),
                    self.pipeline.counts(),
                    self.pool.active_count(),
                );
            }
        }

        self.store.force_flush(next, &self.accepted, &self.failed)?;
        let report = self.build_report(&ctx, status, next);
        let outputs = self
            .store
            .write_final_outputs(records, &self.accepted, &report)?;
        info!(
            accepted = self.accepted.len(),
            failed_batches = self.failed.len(),
            rejected = self.pipeline.counts().total(),
            report = %outputs.report.display(),
            "augmentation finished"
        );
        Ok(RunSummary { report, outputs })
    }

    fn build_report(&self, ctx: &RunContext, status: RunStatus, next: usize) -> FinalReport {
        FinalReport {
            generated_at: Utc::now(),
            status,
            duration_secs: ctx.started.elapsed().as_secs_f64(),
            source_records: ctx.source_records,
            total_batches: ctx.total_batches,
            resumed_from: ctx.resumed_from,
            recovered_records: ctx.recovered_records,
            accepted_records: self.accepted.len(),
            stats: self.stats.clone(),
            rejections: self.pipeline.counts().clone(),
            failed_batches: self.failed.clone(),
            credentials: self.pool.health(),
            loss_estimate: next.checked_sub(1).map(|last| {
                LossEstimate::new(
                    last,
                    self.controls.batch_size(),
                    self.controls.variants_per_record(),
                    self.accepted.len(),
                )
            }),
        }
    }

    async fn process_batch(&mut self, index: usize, batch: Batch<'_>) -> Result<Vec<FailedBatch>> {
        let mut pending = vec![(BatchId::new(index), batch)];
        let mut failures = Vec::new();
        while let Some((id, part)) = pending.pop() {
            let prompt = build_prompt(&part, self.controls.variants_per_record());
            let tokens = estimate_tokens(&prompt);
            if tokens > self.controls.max_request_tokens() {
                if part.len() > 1 {
                    let (left, right) = part.split();
                    let (left_id, right_id) = id.halves();
                    info!(batch = %id, tokens, "request over size ceiling, splitting");
                    self.stats.record_split();
                    pending.push((right_id, right));
                    pending.push((left_id, left));
                    continue;
                }
                warn!(batch = %id, tokens, "single record exceeds request size ceiling, sending as is");
            }
            if let Some(failed) = self.call_with_retries(&id, part, prompt, tokens).await? {
                failures.push(failed);
            }
        }
        Ok(failures)
    }

    async fn call_with_retries(
        &mut self,
        id: &BatchId,
        part: Batch<'_>,
        prompt: String,
        prompt_tokens: usize,
    ) -> Result<Option<FailedBatch>> {
        let request = ServiceRequest { prompt };
        let max_attempts = self.controls.max_attempts();
        let mut attempts = 0;
        let mut last_error = String::new();
        while attempts < max_attempts {
            self.limiter.wait().await;
            let Some(lease) = self.pool.select() else {
                return Err(AugmentError::CredentialsExhausted);
            };
            info!(
                batch = %id,
                attempt = attempts + 1,
                records = part.len(),
                credential = %lease.label,
                "sending batch"
            );
            match self.service.generate(&lease.token, &request).await {
                Ok(response) => {
                    self.pool.report(lease.id, CallOutcome::Success);
                    self.limiter.record_success();
                    self.stats
                        .record_call_success(prompt_tokens, estimate_tokens(&response.text));
                    let variants = self.interpret(id, &part, &response.text);
                    self.accept(id, &part, variants);
                    return Ok(None);
                }
                Err(err) => {
                    let kind = err.kind();
                    self.pool.report(lease.id, CallOutcome::Failure(kind));
                    self.limiter.record_failure();
                    self.stats.record_call_failure(kind);
                    self.monitor.record_call_failure();
                    warn!(
                        batch = %id,
                        attempt = attempts + 1,
                        credential = %lease.label,
                        kind = kind.as_str(),
                        error = %err,
                        "service call failed"
                    );
                    last_error = err.to_string();
                    let backoff = self.controls.retry_backoff(attempts);
                    // A quota failure retires the credential instead of spending an attempt.
                    if kind != FailureKind::Quota {
                        attempts += 1;
                    }
                    if self.pool.active_count() == 0 {
                        return Err(AugmentError::CredentialsExhausted);
                    }
                    if attempts < max_attempts {
                        debug!(batch = %id, backoff_ms = backoff.as_millis() as u64, "retry backoff");
                        sleep(backoff).await;
                    }
                }
            }
        }

        let (first_record, end_record) = part.span();
        error!(
            batch = %id,
            attempts,
            first_record,
            end_record,
            error = %last_error,
            "batch permanently failed, records left unprocessed"
        );
        Ok(Some(FailedBatch {
            batch: id.index(),
            label: id.to_string(),
            first_record,
            end_record,
            attempts,
            last_error,
        }))
    }

    fn interpret(&mut self, id: &BatchId, part: &Batch<'_>, text: &str) -> Vec<GeneratedVariant> {
        let extraction = extract(text);
        if matches!(extraction, Extraction::Repaired(_)) {
            self.stats.record_repaired();
        }
        let Some(items) = extraction.value().and_then(augmented_items) else {
            warn!(
                batch = %id,
                preview = %preview(text),
                "unparseable response, synthesizing fallback variants"
            );
            self.stats.record_fallback();
            return fallback_variants(part, id.index());
        };

        let per_record = self.controls.variants_per_record();
        let mut variants = Vec::new();
        for (position, item) in items.into_iter().enumerate() {
            let slot = item
                .original_id
                .and_then(|original| original.checked_sub(1))
                .filter(|slot| *slot < part.len())
                .or_else(|| (position < part.len()).then_some(position));
            let Some(slot) = slot else {
                debug!(batch = %id, original_id = ?item.original_id, "response item matches no record");
                continue;
            };
            for payload in item.variants.into_iter().take(per_record) {
                variants.push(GeneratedVariant {
                    question: payload.soru,
                    answer: payload.cevap,
                    source_id: part.offset + slot,
                    batch: id.index(),
                    fallback: false,
                });
            }
        }
        variants
    }

    fn accept(&mut self, id: &BatchId, part: &Batch<'_>, variants: Vec<GeneratedVariant>) {
        let generated = variants.len();
        let mut accepted = 0;
        for variant in variants {
            let source = variant
                .source_id
                .checked_sub(part.offset)
                .and_then(|slot| part.records.get(slot));
            let Some(source) = source else {
                continue;
            };
            if let Verdict::Accepted(record) = self.pipeline.validate(variant, source) {
                self.accepted.push(record);
                accepted += 1;
            }
        }
        self.stats.record_variants(generated, accepted);
        info!(batch = %id, generated, accepted, total = self.accepted.len(), "batch accepted");
    }

    async fn reload_credentials(&mut self) {
        let Some(source) = self.key_source.as_mut() else {
            return;
        };
        if !source.changed() {
            return;
        }
        let path = source.path().display().to_string();
        let tokens = match source.load() {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(path = %path, error = %err, "key file reload failed");
                return;
            }
        };
        let added = self.pool.admit_probed(&self.service, &tokens).await;
        info!(path = %path, added, active = self.pool.active_count(), "key file reloaded");
    }

    fn persist_emergency(
        &mut self,
        ctx: &RunContext,
        reason: &str,
        status: RunStatus,
        resume_point: usize,
    ) -> Result<()> {
        error!(
            reason,
            resume_point,
            accepted = self.accepted.len(),
            failed_batches = self.failed.len(),
            "emergency shutdown"
        );
        self.store
            .force_flush(resume_point, &self.accepted, &self.failed)?;
        let dump = CrashDump {
            reason: reason.to_string(),
            timestamp: Utc::now(),
            resume_point,
            accepted_records: self.accepted.len(),
            stats: self.stats.clone(),
            failed_batches: self.failed.clone(),
            credentials: self.pool.health(),
        };
        let path = self.store.write_crash_dump(&dump)?;
        let report = self.build_report(ctx, status, resume_point);
        let report_path = self.store.write_report(&report)?;
        self.store.write_emergency_marker(reason)?;
        info!(
            crash_dump = %path.display(),
            report = %report_path.display(),
            "emergency state written"
        );
        Ok(())
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(RESPONSE_PREVIEW_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Runs an augmentation described by `cli` on a current-thread runtime.
pub fn run(cli: AugmentCli) -> Result<RunSummary> {
    let rt = Builder::new_current_thread().enable_all().build()?;
    let local = LocalSet::new();
    rt.block_on(local.run_until(run_single_thread(cli)))
}

async fn run_single_thread(cli: AugmentCli) -> Result<RunSummary> {
    let controls = cli.build_controls()?;
    let records = load_records(&cli.input)?;
    let service = GeminiService::new(&cli.api_base_url, &cli.model, cli.request_timeout())?;

    let mut tokens = cli.inline_keys();
    let key_source = match &cli.key_file {
        Some(path) => {
            let mut source = KeySource::new(path);
            tokens.extend(source.load()?);
            Some(source)
        }
        None => None,
    };
    if tokens.is_empty() {
        return Err(AugmentError::Configuration(
            "no API keys configured; pass --api-keys, GEMINI_API_KEYS or --key-file".to_string(),
        ));
    }
    let pool = CredentialPool::probed(&service, &tokens).await;
    info!(offered = tokens.len(), admitted = pool.len(), "credential pool ready");
    if pool.is_empty() {
        return Err(AugmentError::CredentialsExhausted);
    }

    let store = CheckpointStore::open(
        &cli.state_dir,
        controls.checkpoint_every(),
        controls.backup_every(),
    )?;
    let mut augmenter = Augmenter::new(controls, service, pool, store)?;
    if let Some(source) = key_source {
        augmenter = augmenter.with_key_source(source);
    }

    let stop = augmenter.stop_handle();
    spawn_local(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current batch");
            stop.store(true, Ordering::SeqCst);
        }
    });
    augmenter.run(&records).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::checkpoint::read_json_optional;
    use crate::service::{ServiceError, ServiceResponse};

    type Responder = Box<dyn Fn(&str, &str) -> std::result::Result<String, ServiceError> + Send + Sync>;

    struct ScriptState {
        responder: Responder,
        tokens: Mutex<Vec<String>>,
        stop_after: Mutex<Option<(usize, Arc<AtomicBool>)>>,
    }

    #[derive(Clone)]
    struct ScriptedService {
        state: Arc<ScriptState>,
    }

    impl ScriptedService {
        fn new(
            responder: impl Fn(&str, &str) -> std::result::Result<String, ServiceError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                state: Arc::new(ScriptState {
                    responder: Box::new(responder),
                    tokens: Mutex::new(Vec::new()),
                    stop_after: Mutex::new(None),
                }),
            }
        }

        fn echo() -> Self {
            Self::new(|_, prompt| Ok(echo_variants(prompt)))
        }

        fn calls(&self) -> Vec<String> {
            self.state.tokens.lock().expect("lock").clone()
        }

        fn stop_after(&self, calls: usize, flag: Arc<AtomicBool>) {
            *self.state.stop_after.lock().expect("lock") = Some((calls, flag));
        }
    }

    #[async_trait]
    impl GenerativeService for ScriptedService {
        async fn generate(
            &self,
            token: &str,
            request: &ServiceRequest,
        ) -> std::result::Result<ServiceResponse, ServiceError> {
            let count = {
                let mut tokens = self.state.tokens.lock().expect("lock");
                tokens.push(token.to_string());
                tokens.len()
            };
            if let Some((after, flag)) = self.state.stop_after.lock().expect("lock").as_ref() {
                if count >= *after {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            (self.state.responder)(token, &request.prompt).map(|text| ServiceResponse { text })
        }
    }

    struct FixedProbe(Option<f32>);

    impl ResourceProbe for FixedProbe {
        fn memory_percent(&mut self) -> Option<f32> {
            self.0
        }
    }

    /// Two well-formed variants for every record listed in the prompt.
    fn echo_variants(prompt: &str) -> String {
        let items: Vec<_> = prompt
            .lines()
            .filter_map(|line| line.strip_prefix("Soru: "))
            .enumerate()
            .map(|(i, question)| {
                json!({
                    "original_id": i + 1,
                    "variants": [
                        {"soru": format!("{question} (varyant 1)"), "cevap": "Belirtiler sürerse hekiminize danışmanız önerilir."},
                        {"soru": format!("{question} (varyant 2)"), "cevap": "Dinlenmek ve bol sıvı almak genellikle rahatlatır."}
                    ]
                })
            })
            .collect();
        format!("```json\n{}\n```", json!({ "augmented_data": items }))
    }

    fn sources(count: usize) -> Vec<SourceRecord> {
        (1..=count)
            .map(|i| {
                SourceRecord::new(
                    format!("Baş ağrısı türü {i} nedir?"),
                    format!("Baş ağrısı türü {i} çoğunlukla dinlenmeyle geçer, sürerse hekime danışılmalıdır."),
                )
            })
            .collect()
    }

    fn builder() -> crate::controls::AugmentControlsBuilder {
        AugmentControls::builder()
            .batch_size(2)
            .variants_per_record(2)
            .max_attempts(2)
            .retry_backoff_base(Duration::from_millis(10))
            .delays(
                Duration::from_millis(1),
                Duration::from_millis(1),
                Duration::from_millis(10),
            )
            .cadence(1, 2)
    }

    fn augmenter(
        controls: AugmentControls,
        service: ScriptedService,
        tokens: &[&str],
        dir: &TempDir,
    ) -> Augmenter<ScriptedService> {
        let store = CheckpointStore::open(
            dir.path(),
            controls.checkpoint_every(),
            controls.backup_every(),
        )
        .expect("store");
        let pool = CredentialPool::new(tokens.iter().copied());
        Augmenter::new(controls, service, pool, store)
            .expect("augmenter")
            .with_resource_probe(Box::new(FixedProbe(Some(10.0))))
    }

    fn resume_point(dir: &TempDir) -> usize {
        CheckpointStore::open(dir.path(), 1, 1)
            .expect("store")
            .load_checkpoint()
            .expect("read")
            .expect("checkpoint present")
            .resume_point
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn every_batch_is_accepted_and_outputs_written() {
        let dir = TempDir::new().expect("tempdir");
        let input = sources(3);
        let service = ScriptedService::echo();
        let mut augmenter = augmenter(builder().build().expect("controls"), service.clone(), &["key-alpha-0001"], &dir);

        let summary = augmenter.run(&input).await.expect("run");
        let report = &summary.report;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.total_batches, 2);
        assert_eq!(report.stats.batches_accepted, 2);
        assert_eq!(report.stats.batches_failed, 0);
        assert_eq!(report.accepted_records, 6);
        assert!(report.failed_batches.is_empty());
        assert_eq!(service.calls().len(), 2);

        let dataset: Vec<SourceRecord> = read_json_optional(&summary.outputs.dataset)
            .expect("read")
            .expect("dataset");
        assert_eq!(dataset.len(), 9);
        assert_eq!(dataset[..3], input[..]);
        assert!(summary.outputs.report.exists());
        assert_eq!(resume_point(&dir), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_batch_is_reported_and_run_continues() {
        let dir = TempDir::new().expect("tempdir");
        let service = ScriptedService::new(|_, prompt| {
            if prompt.contains("türü 3 nedir") {
                Err(ServiceError::Other("503 service unavailable".to_string()))
            } else {
                Ok(echo_variants(prompt))
            }
        });
        let mut augmenter = augmenter(builder().build().expect("controls"), service, &["key-alpha-0001"], &dir);

        let summary = augmenter.run(&sources(6)).await.expect("run");
        let report = &summary.report;
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stats.batches_accepted, 2);
        assert_eq!(report.stats.batches_failed, 1);
        assert_eq!(report.accepted_records, 8);
        assert_eq!(report.failed_batches.len(), 1);
        let failed = &report.failed_batches[0];
        assert_eq!(failed.batch, 1);
        assert_eq!(failed.label, "1");
        assert_eq!((failed.first_record, failed.end_record), (2, 4));
        assert_eq!(failed.attempts, 2);
        assert!(failed.last_error.contains("503"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn quota_failure_rotates_to_the_next_credential() {
        let dir = TempDir::new().expect("tempdir");
        let service = ScriptedService::new(|token, prompt| {
            if token.starts_with("key-alpha") {
                Err(ServiceError::Quota("429".to_string()))
            } else {
                Ok(echo_variants(prompt))
            }
        });
        let mut augmenter = augmenter(
            builder().build().expect("controls"),
            service.clone(),
            &["key-alpha-0001", "key-bravo-0002"],
            &dir,
        );

        let summary = augmenter.run(&sources(2)).await.expect("run");
        assert_eq!(summary.report.status, RunStatus::Completed);
        assert_eq!(summary.report.accepted_records, 4);
        assert_eq!(summary.report.stats.quota_failures, 1);
        assert_eq!(service.calls(), vec!["key-alpha-0001", "key-bravo-0002"]);

        let health = augmenter.credential_health();
        assert!(health[0].quota_exceeded);
        assert!(!health[0].active);
        assert_eq!(health[1].success_count, 1);
        assert!(health[1].active);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn pool_exhaustion_persists_state_and_next_run_resumes() {
        let dir = TempDir::new().expect("tempdir");
        let input = sources(4);
        let service = ScriptedService::new(|_, prompt| {
            if prompt.contains("türü 3 nedir") {
                Err(ServiceError::Quota("429".to_string()))
            } else {
                Ok(echo_variants(prompt))
            }
        });
        let mut first = augmenter(builder().build().expect("controls"), service, &["key-alpha-0001"], &dir);

        let err = first.run(&input).await.expect_err("pool exhausted");
        assert!(matches!(err, AugmentError::CredentialsExhausted));
        let before = first.accepted().to_vec();
        assert_eq!(before.len(), 4);
        let store = CheckpointStore::open(dir.path(), 1, 2).expect("store");
        assert!(store.emergency_marker_present());
        assert!(dir.path().join("emergency_shutdown.json").exists());
        assert!(dir.path().join("output").join("final_report.json").exists());
        assert_eq!(resume_point(&dir), 1);

        let mut second = augmenter(
            builder().build().expect("controls"),
            ScriptedService::echo(),
            &["key-fresh-0003"],
            &dir,
        );
        let summary = second.run(&input).await.expect("resumed run");
        assert_eq!(summary.report.resumed_from, 1);
        assert_eq!(summary.report.recovered_records, 4);
        assert_eq!(summary.report.accepted_records, 8);
        assert_eq!(second.accepted()[..4], before[..]);
        assert!(!store.emergency_marker_present());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn failed_batches_stay_reported_across_an_emergency_restart() {
        let dir = TempDir::new().expect("tempdir");
        let input = sources(3);
        let service = ScriptedService::new(|_, prompt| {
            if prompt.contains("türü 2 nedir") {
                Err(ServiceError::Other("503 service unavailable".to_string()))
            } else if prompt.contains("türü 3 nedir") {
                Err(ServiceError::Quota("429".to_string()))
            } else {
                Ok(echo_variants(prompt))
            }
        });
        let controls = builder().batch_size(1).build().expect("controls");
        let mut first = augmenter(controls, service, &["key-alpha-0001"], &dir);

        let err = first.run(&input).await.expect_err("pool exhausted");
        assert!(matches!(err, AugmentError::CredentialsExhausted));
        assert_eq!(resume_point(&dir), 2);

        let dump: serde_json::Value = read_json_optional(&dir.path().join("emergency_shutdown.json"))
            .expect("read")
            .expect("crash dump");
        assert_eq!(dump["failed_batches"][0]["batch"], 1);
        let report: serde_json::Value =
            read_json_optional(&dir.path().join("output").join("final_report.json"))
                .expect("read")
                .expect("emergency report");
        assert_eq!(report["status"], "credentials_exhausted");
        assert_eq!(report["failed_batches"].as_array().map(Vec::len), Some(1));

        let service = ScriptedService::echo();
        let controls = builder().batch_size(1).build().expect("controls");
        let mut second = augmenter(controls, service.clone(), &["key-fresh-0003"], &dir);
        let summary = second.run(&input).await.expect("resumed run");
        assert_eq!(summary.report.status, RunStatus::Completed);
        assert_eq!(summary.report.resumed_from, 2);
        assert_eq!(service.calls().len(), 1);
        assert_eq!(summary.report.failed_batches.len(), 1);
        let failed = &summary.report.failed_batches[0];
        assert_eq!((failed.batch, failed.first_record, failed.end_record), (1, 1, 2));
        assert_eq!(summary.report.accepted_records, 4);
    }

    fn write_key_file(path: &std::path::Path, keys: &[&str], modified: std::time::SystemTime) {
        std::fs::write(path, json!({ "api_keys": keys }).to_string()).expect("write key file");
        std::fs::File::options()
            .write(true)
            .open(path)
            .expect("open key file")
            .set_modified(modified)
            .expect("set mtime");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn key_file_reload_admits_new_keys_and_keeps_retired_ones_out() {
        let dir = TempDir::new().expect("tempdir");
        let key_path = dir.path().join("keys.json");
        let loaded_at = std::time::SystemTime::now();
        write_key_file(&key_path, &["key-alpha-0001", "key-bravo-0002"], loaded_at);
        let mut source = KeySource::new(&key_path);
        let tokens = source.load().expect("initial keys");
        assert_eq!(tokens, vec!["key-alpha-0001", "key-bravo-0002"]);

        let rewrite_path = key_path.clone();
        let service = ScriptedService::new(move |token, prompt| {
            if token.starts_with("key-alpha") {
                return Err(ServiceError::Quota("429".to_string()));
            }
            if prompt.contains("türü 3 nedir") {
                write_key_file(
                    &rewrite_path,
                    &["key-alpha-0001", "key-charlie-0003"],
                    loaded_at + Duration::from_secs(60),
                );
            }
            Ok(echo_variants(prompt))
        });
        let controls = builder().reload_every(2).build().expect("controls");
        let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let mut augmenter =
            augmenter(controls, service.clone(), &token_refs, &dir).with_key_source(source);

        let summary = augmenter.run(&sources(6)).await.expect("run");
        assert_eq!(summary.report.status, RunStatus::Completed);
        assert_eq!(summary.report.accepted_records, 12);

        let health = augmenter.credential_health();
        assert_eq!(health.len(), 3);
        assert!(health[0].quota_exceeded);
        assert!(!health[0].active);
        assert_eq!(health[2].label, "key-charli...");
        assert!(health[2].active);
        let calls = service.calls();
        assert_eq!(calls.iter().filter(|t| t.starts_with("key-alpha")).count(), 1);
        assert!(calls.iter().any(|t| t == "key-charlie-0003"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn oversized_batch_is_split_in_halves() {
        let dir = TempDir::new().expect("tempdir");
        let input: Vec<SourceRecord> = sources(2)
            .into_iter()
            .map(|record| SourceRecord::new(record.question, format!("{} {}", record.answer, "ayrıntı ".repeat(60))))
            .collect();
        let single = partition(&input, 1)
            .iter()
            .map(|batch| estimate_tokens(&build_prompt(batch, 2)))
            .max()
            .expect("batches");
        let whole = estimate_tokens(&build_prompt(&partition(&input, 2)[0], 2));
        assert!(whole > single);

        let service = ScriptedService::echo();
        let controls = builder().max_request_tokens(single).build().expect("controls");
        let mut augmenter = augmenter(controls, service.clone(), &["key-alpha-0001"], &dir);

        let summary = augmenter.run(&input).await.expect("run");
        assert_eq!(summary.report.stats.batches_split, 1);
        assert_eq!(summary.report.stats.batches_accepted, 1);
        assert_eq!(service.calls().len(), 2);
        assert_eq!(summary.report.accepted_records, 4);
        let sources: Vec<Option<usize>> = augmenter.accepted().iter().map(|r| r.source_id).collect();
        assert_eq!(sources, vec![Some(0), Some(0), Some(1), Some(1)]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_flag_interrupts_and_restart_produces_a_superset() {
        let dir = TempDir::new().expect("tempdir");
        let input = sources(6);
        let service = ScriptedService::echo();
        let mut first = augmenter(builder().build().expect("controls"), service.clone(), &["key-alpha-0001"], &dir);
        service.stop_after(1, first.stop_handle());

        let summary = first.run(&input).await.expect("interrupted run");
        assert_eq!(summary.report.status, RunStatus::Interrupted);
        assert_eq!(summary.report.stats.batches_accepted, 1);
        assert_eq!(service.calls().len(), 1);
        assert_eq!(resume_point(&dir), 1);
        let before = first.accepted().to_vec();
        assert_eq!(before.len(), 4);

        let mut second = augmenter(
            builder().build().expect("controls"),
            ScriptedService::echo(),
            &["key-alpha-0001"],
            &dir,
        );
        let summary = second.run(&input).await.expect("resumed run");
        assert_eq!(summary.report.status, RunStatus::Completed);
        assert_eq!(summary.report.resumed_from, 1);
        assert_eq!(summary.report.accepted_records, 12);
        assert_eq!(second.accepted()[..4], before[..]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unparseable_response_falls_back_to_local_variants() {
        let dir = TempDir::new().expect("tempdir");
        let service = ScriptedService::new(|_, _| Ok("Üzgünüm, bu isteği yerine getiremiyorum.".to_string()));
        let mut augmenter = augmenter(builder().build().expect("controls"), service, &["key-alpha-0001"], &dir);

        let summary = augmenter.run(&sources(2)).await.expect("run");
        assert_eq!(summary.report.stats.fallback_responses, 1);
        assert_eq!(summary.report.stats.batches_accepted, 1);
        let questions: Vec<&str> = augmenter.accepted().iter().map(|r| r.question.as_str()).collect();
        assert_eq!(
            questions,
            vec![
                "Doktor, baş ağrısı türü 1 nedir?",
                "Baş ağrısı türü 1 nedir hakkında bilgi verir misiniz?",
                "Doktor, baş ağrısı türü 2 nedir?",
                "Baş ağrısı türü 2 nedir hakkında bilgi verir misiniz?",
            ]
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn memory_pressure_stops_before_any_call() {
        let dir = TempDir::new().expect("tempdir");
        let service = ScriptedService::echo();
        let mut augmenter = augmenter(builder().build().expect("controls"), service.clone(), &["key-alpha-0001"], &dir)
            .with_resource_probe(Box::new(FixedProbe(Some(97.0))));

        let err = augmenter.run(&sources(2)).await.expect_err("safety stop");
        let AugmentError::EmergencyStop { reason } = err else {
            panic!("expected an emergency stop");
        };
        assert!(reason.contains("memory"));
        assert!(service.calls().is_empty());
        assert!(dir.path().join("EMERGENCY_STOP").exists());
        assert_eq!(resume_point(&dir), 0);
    }
}
