//! Durable progress: checkpoint marker, append-only backups and recovery.
//!
//! Layout under the state directory:
//!
//! ```text
//! checkpoints/latest.json      {last_batch, processed_count, resume_point, timestamp}
//! checkpoints/accepted.json    accepted output as of the latest checkpoint
//! checkpoints/failed_batches.json  permanently failed batches as of the latest checkpoint
//! backups/backup_batch_<index>_<timestamp>.json
//! output/augmented_<ts>.json, output/final_dataset_<ts>.json, output/final_report.json
//! EMERGENCY_STOP, emergency_shutdown.json
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place. When a
//! backup is due the checkpoint is written first, so any backup on disk has an
//! index below the recorded resume point.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::records::{AcceptedRecord, SourceRecord};
use crate::report::FailedBatch;
use crate::validation::Fingerprint;

const CHECKPOINT_DIR: &str = "checkpoints";
const BACKUP_DIR: &str = "backups";
const OUTPUT_DIR: &str = "output";
const CHECKPOINT_FILE: &str = "latest.json";
const WORKING_SET_FILE: &str = "accepted.json";
const FAILED_LEDGER_FILE: &str = "failed_batches.json";
const BACKUP_PREFIX: &str = "backup_batch_";
const EMERGENCY_MARKER: &str = "EMERGENCY_STOP";
const CRASH_DUMP: &str = "emergency_shutdown.json";
const FINAL_REPORT: &str = "final_report.json";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// On-disk progress marker, overwritten on every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Index of the last batch that reached a terminal state.
    pub last_batch: Option<usize>,
    /// Accepted records held when the checkpoint was written.
    pub processed_count: usize,
    /// First batch index to process on restart.
    pub resume_point: usize,
    /// Write time.
    pub timestamp: DateTime<Utc>,
}

/// A backup snapshot located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    /// Batch index embedded in the file name.
    pub index: usize,
    /// Full path to the snapshot.
    pub path: PathBuf,
}

/// State reconstructed by [`CheckpointStore::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// First batch index still to process.
    pub resume_batch: usize,
    /// Accepted output known before the restart, first occurrence kept.
    pub records: Vec<AcceptedRecord>,
    /// Backup snapshots that contributed.
    pub backups_read: usize,
    /// Repeated records dropped while concatenating snapshots.
    pub duplicates_dropped: usize,
    /// Batches below the resume point that ended permanently failed.
    pub failed_batches: Vec<FailedBatch>,
}

/// What one flush wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Whether the checkpoint marker and working set were rewritten.
    pub checkpoint: bool,
    /// Path of the backup written, if one was due.
    pub backup: Option<PathBuf>,
}

/// Paths of the files produced at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalOutputs {
    /// Accepted records only.
    pub augmented: PathBuf,
    /// Source records followed by accepted records.
    pub dataset: PathBuf,
    /// JSON run report.
    pub report: PathBuf,
}

/// Owns every file under the state directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    checkpoint_every: usize,
    backup_every: usize,
}

impl CheckpointStore {
    /// Opens (and creates) the state directory.
    pub fn open(root: impl Into<PathBuf>, checkpoint_every: usize, backup_every: usize) -> Result<Self> {
        let root = root.into();
        for dir in [CHECKPOINT_DIR, BACKUP_DIR, OUTPUT_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            checkpoint_every: checkpoint_every.max(1),
            backup_every: backup_every.max(1),
        })
    }

    /// State directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding backup snapshots.
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR).join(CHECKPOINT_FILE)
    }

    fn working_set_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR).join(WORKING_SET_FILE)
    }

    fn failed_ledger_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_DIR).join(FAILED_LEDGER_FILE)
    }

    /// Cadence-driven flush after batch `batch_index` reached a terminal state.
    pub fn flush(
        &self,
        batch_index: usize,
        accepted: &[AcceptedRecord],
        failed: &[FailedBatch],
    ) -> Result<FlushOutcome> {
        let backup_due = batch_index % self.backup_every == 0;
        let checkpoint_due = backup_due || batch_index % self.checkpoint_every == 0;
        let mut outcome = FlushOutcome::default();
        if checkpoint_due {
            self.write_checkpoint(Some(batch_index), batch_index + 1, accepted, failed)?;
            outcome.checkpoint = true;
        }
        if backup_due {
            outcome.backup = Some(self.write_backup(batch_index, accepted)?);
        }
        Ok(outcome)
    }

    /// Unconditional flush used on stop and emergency paths.
    pub fn force_flush(
        &self,
        resume_point: usize,
        accepted: &[AcceptedRecord],
        failed: &[FailedBatch],
    ) -> Result<FlushOutcome> {
        let last_batch = resume_point.checked_sub(1);
        self.write_checkpoint(last_batch, resume_point, accepted, failed)?;
        let backup = match last_batch {
            Some(index) => Some(self.write_backup(index, accepted)?),
            None => None,
        };
        Ok(FlushOutcome {
            checkpoint: true,
            backup,
        })
    }

    fn write_checkpoint(
        &self,
        last_batch: Option<usize>,
        resume_point: usize,
        accepted: &[AcceptedRecord],
        failed: &[FailedBatch],
    ) -> Result<()> {
        write_json_atomic(&self.working_set_path(), &accepted)?;
        write_json_atomic(&self.failed_ledger_path(), &failed)?;
        let record = CheckpointRecord {
            last_batch,
            processed_count: accepted.len(),
            resume_point,
            timestamp: Utc::now(),
        };
        write_json_atomic(&self.checkpoint_path(), &record)?;
        debug!(resume_point, accepted = accepted.len(), "checkpoint written");
        Ok(())
    }

    fn write_backup(&self, batch_index: usize, accepted: &[AcceptedRecord]) -> Result<PathBuf> {
        let stamp = Utc::now().format(TIMESTAMP_FORMAT);
        let dir = self.backup_dir();
        let mut path = dir.join(format!("{BACKUP_PREFIX}{batch_index:06}_{stamp}.json"));
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("{BACKUP_PREFIX}{batch_index:06}_{stamp}_{suffix}.json"));
            suffix += 1;
        }
        write_json_atomic(&path, &accepted)?;
        info!(
            batch = batch_index,
            records = accepted.len(),
            path = %path.display(),
            "backup snapshot written"
        );
        Ok(path)
    }

    /// Reads the checkpoint marker; `Ok(None)` when absent.
    pub fn load_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        read_json_optional(&self.checkpoint_path())
    }

    /// Reconstructs resume point and accepted output.
    ///
    /// Concatenates every backup with index below the resume point in
    /// ascending order, then the checkpoint working set, keeping the first
    /// occurrence of each fingerprint. A missing or unreadable checkpoint falls
    /// back to the newest backup. Failed-batch entries below the resume point
    /// are restored from the ledger.
    pub fn recover(&self) -> Result<Recovery> {
        let backups = list_backups(&self.backup_dir())?;
        let checkpoint = match self.load_checkpoint() {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(error = %err, "checkpoint unreadable, recovering from backups");
                None
            }
        };
        let resume_batch = match &checkpoint {
            Some(record) => record.resume_point,
            None => backups.last().map_or(0, |b| b.index + 1),
        };

        let mut recovery = Recovery {
            resume_batch,
            ..Recovery::default()
        };
        let mut seen = HashSet::new();
        for backup in backups.iter().filter(|b| b.index < resume_batch) {
            match read_json_optional::<Vec<AcceptedRecord>>(&backup.path) {
                Ok(Some(records)) => {
                    recovery.backups_read += 1;
                    absorb(&mut recovery, &mut seen, records);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %backup.path.display(), error = %err, "skipping unreadable backup");
                }
            }
        }
        if checkpoint.is_some() {
            match read_json_optional::<Vec<AcceptedRecord>>(&self.working_set_path()) {
                Ok(Some(records)) => absorb(&mut recovery, &mut seen, records),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "checkpoint working set unreadable"),
            }
        }
        match read_json_optional::<Vec<FailedBatch>>(&self.failed_ledger_path()) {
            Ok(Some(failed)) => {
                recovery.failed_batches = failed
                    .into_iter()
                    .filter(|entry| entry.batch < resume_batch)
                    .collect();
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed-batch ledger unreadable"),
        }
        if resume_batch > 0 || !recovery.records.is_empty() {
            info!(
                resume_batch,
                records = recovery.records.len(),
                failed_batches = recovery.failed_batches.len(),
                backups = recovery.backups_read,
                duplicates = recovery.duplicates_dropped,
                "recovered previous progress"
            );
        }
        Ok(recovery)
    }

    /// Whether a previous run left the emergency-stop sentinel behind.
    pub fn emergency_marker_present(&self) -> bool {
        self.root.join(EMERGENCY_MARKER).exists()
    }

    /// Removes the sentinel; returns whether one existed.
    pub fn clear_emergency_marker(&self) -> Result<bool> {
        let path = self.root.join(EMERGENCY_MARKER);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    /// Writes the emergency-stop sentinel.
    pub fn write_emergency_marker(&self, reason: &str) -> Result<()> {
        let body = format!("{}\n{reason}\n", Utc::now().to_rfc3339());
        let path = self.root.join(EMERGENCY_MARKER);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Persists a crash dump next to the sentinel.
    pub fn write_crash_dump<T: Serialize>(&self, dump: &T) -> Result<PathBuf> {
        let path = self.root.join(CRASH_DUMP);
        write_json_atomic(&path, dump)?;
        Ok(path)
    }

    /// Writes the run report to `output/final_report.json`.
    pub fn write_report<R: Serialize>(&self, report: &R) -> Result<PathBuf> {
        let path = self.root.join(OUTPUT_DIR).join(FINAL_REPORT);
        write_json_atomic(&path, report)?;
        Ok(path)
    }

    /// Writes the augmented set, the merged dataset and the report.
    pub fn write_final_outputs<R: Serialize>(
        &self,
        sources: &[SourceRecord],
        accepted: &[AcceptedRecord],
        report: &R,
    ) -> Result<FinalOutputs> {
        let stamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let dir = self.root.join(OUTPUT_DIR);
        let augmented = dir.join(format!("augmented_{stamp}.json"));
        let dataset = dir.join(format!("final_dataset_{stamp}.json"));

        write_json_atomic(&augmented, &accepted)?;
        let merged: Vec<SourceRecord> = sources
            .iter()
            .cloned()
            .chain(accepted.iter().map(AcceptedRecord::to_source))
            .collect();
        write_json_atomic(&dataset, &merged)?;
        let report_path = self.write_report(report)?;
        Ok(FinalOutputs {
            augmented,
            dataset,
            report: report_path,
        })
    }
}

fn absorb(recovery: &mut Recovery, seen: &mut HashSet<Fingerprint>, records: Vec<AcceptedRecord>) {
    for record in records {
        if seen.insert(Fingerprint::of_record(&record)) {
            recovery.records.push(record);
        } else {
            recovery.duplicates_dropped += 1;
        }
    }
}

/// Lists backup snapshots in `dir`, ascending by batch index then name.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".json") {
            continue;
        }
        if let Some(index) = backup_index(name) {
            backups.push(BackupFile { index, path });
        }
    }
    backups.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.path.cmp(&b.path)));
    Ok(backups)
}

fn backup_index(file_name: &str) -> Option<usize> {
    let rest = file_name.strip_prefix(BACKUP_PREFIX)?;
    let digits: &str = rest.split(['_', '.']).next()?;
    digits.parse().ok()
}

/// Serializes `value` to a temporary sibling, then renames it over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a JSON file; `Ok(None)` when it does not exist.
pub fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
