use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use fastaugment::checkpoint::{list_backups, read_json_optional, write_json_atomic};
use fastaugment::records::load_records;
use fastaugment::report::LossEstimate;
use fastaugment::{AcceptedRecord, Fingerprint};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Questions listed per report before the sample is cut off.
const ORIGINAL_SAMPLE: usize = 20;

#[derive(Parser, Debug)]
#[command(
    name = "fastaugment-merge",
    about = "Merge backup snapshots into one deduplicated dataset and flag suspected loss"
)]
struct Cli {
    /// Directory holding backup_batch_*.json snapshots.
    #[arg(long, env = "FASTAUGMENT_BACKUP_DIR", default_value = "state/backups")]
    backup_dir: PathBuf,

    /// Merged dataset destination.
    #[arg(long, env = "FASTAUGMENT_MERGE_OUTPUT", default_value = "state/output/merged_backups.json")]
    output: PathBuf,

    /// Merge report destination.
    #[arg(long, env = "FASTAUGMENT_MERGE_REPORT", default_value = "state/output/merge_report.json")]
    report: PathBuf,

    /// Source dataset; merged records repeating one of its questions are dropped.
    #[arg(long, env = "FASTAUGMENT_ORIGINAL")]
    original: Option<PathBuf>,

    /// Batch size the run used, for the expected-count heuristic.
    #[arg(long, env = "FASTAUGMENT_BATCH_SIZE", default_value_t = 5)]
    batch_size: usize,

    /// Variants per record the run requested.
    #[arg(long, env = "FASTAUGMENT_VARIANTS", default_value_t = 2)]
    variants_per_record: usize,
}

#[derive(Debug, Serialize)]
struct SnapshotSummary {
    file: String,
    records: usize,
    new_records: usize,
    loss: LossEstimate,
}

#[derive(Debug, Serialize)]
struct MergeReport {
    generated_at: DateTime<Utc>,
    backup_dir: PathBuf,
    snapshots: Vec<SnapshotSummary>,
    unreadable: Vec<String>,
    records_read: usize,
    merged_records: usize,
    duplicates_dropped: usize,
    flagged_snapshots: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    original: Option<PathBuf>,
    original_duplicates: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    original_duplicate_sample: Vec<String>,
}

struct Merge {
    records: Vec<AcceptedRecord>,
    report: MergeReport,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    let cli = Cli::parse();

    let merge = merge_backups(&cli)?;

    for path in [&cli.output, &cli.report] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
    }
    write_json_atomic(&cli.output, &merge.records)
        .with_context(|| format!("failed to write {:?}", cli.output))?;
    write_json_atomic(&cli.report, &merge.report)
        .with_context(|| format!("failed to write {:?}", cli.report))?;

    let report = &merge.report;
    info!(
        snapshots = report.snapshots.len(),
        merged = report.merged_records,
        duplicates = report.duplicates_dropped,
        original_duplicates = report.original_duplicates,
        flagged = report.flagged_snapshots,
        output = %cli.output.display(),
        "backups merged"
    );
    Ok(())
}

fn original_questions(path: &Path) -> Result<HashSet<Fingerprint>> {
    let records = load_records(path).with_context(|| format!("failed to load {:?}", path))?;
    Ok(records
        .iter()
        .map(|record| Fingerprint::of_question(&record.question))
        .collect())
}

fn merge_backups(cli: &Cli) -> Result<Merge> {
    let backups = list_backups(&cli.backup_dir)
        .with_context(|| format!("failed to list backups in {:?}", cli.backup_dir))?;
    if backups.is_empty() {
        anyhow::bail!("no backup snapshots found in {:?}", cli.backup_dir);
    }
    let originals = match &cli.original {
        Some(path) => original_questions(path)?,
        None => HashSet::new(),
    };

    let mut seen = HashSet::new();
    let mut merged: Vec<AcceptedRecord> = Vec::new();
    let mut snapshots = Vec::new();
    let mut unreadable = Vec::new();
    let mut records_read = 0;
    let mut original_duplicates = 0;
    let mut original_duplicate_sample = Vec::new();

    for backup in &backups {
        let file = backup.path.display().to_string();
        let records = match read_json_optional::<Vec<AcceptedRecord>>(&backup.path) {
            Ok(Some(records)) => records,
            Ok(None) => continue,
            Err(err) => {
                warn!(file = %file, error = %err, "skipping unreadable snapshot");
                unreadable.push(file);
                continue;
            }
        };
        records_read += records.len();
        let found = records.len();
        let mut new_records = 0;
        for record in records {
            if !seen.insert(Fingerprint::of_content(&record.question, &record.answer)) {
                continue;
            }
            if originals.contains(&Fingerprint::of_question(&record.question)) {
                original_duplicates += 1;
                if original_duplicate_sample.len() < ORIGINAL_SAMPLE {
                    original_duplicate_sample.push(record.question);
                }
                continue;
            }
            merged.push(record);
            new_records += 1;
        }
        let loss = LossEstimate::new(backup.index, cli.batch_size, cli.variants_per_record, found);
        if loss.flagged {
            warn!(
                file = %file,
                expected = loss.expected,
                found = loss.found,
                "snapshot holds fewer records than expected"
            );
        }
        snapshots.push(SnapshotSummary {
            file,
            records: found,
            new_records,
            loss,
        });
    }

    if original_duplicates > 0 {
        warn!(
            dropped = original_duplicates,
            "merged records repeating a source question were dropped"
        );
    }
    let report = MergeReport {
        generated_at: Utc::now(),
        backup_dir: cli.backup_dir.clone(),
        flagged_snapshots: snapshots.iter().filter(|s| s.loss.flagged).count(),
        snapshots,
        unreadable,
        records_read,
        merged_records: merged.len(),
        duplicates_dropped: records_read - merged.len() - original_duplicates,
        original: cli.original.clone(),
        original_duplicates,
        original_duplicate_sample,
    };
    Ok(Merge {
        records: merged,
        report,
    })
}
