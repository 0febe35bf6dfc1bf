use anyhow::{Context, Result};
use clap::Parser;
use fastaugment::{run_augmenter, AugmentCli, AugmentError, RunStatus};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = AugmentCli::parse();
    let input = cli.input.clone();
    let state_dir = cli.state_dir.clone();

    let summary = match run_augmenter(cli) {
        Ok(summary) => summary,
        Err(err @ (AugmentError::CredentialsExhausted | AugmentError::EmergencyStop { .. })) => {
            return Err(err).with_context(|| {
                format!(
                    "run halted; state persisted under {} and will resume on the next start",
                    state_dir.display()
                )
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("augmentation of {:?} failed", input));
        }
    };

    let report = &summary.report;
    println!("--- augmentation report ---");
    match &report.status {
        RunStatus::Completed => println!("status: completed"),
        RunStatus::Interrupted => println!("status: interrupted (resume by running again)"),
        other => println!("status: {other:?}"),
    }
    println!("source records: {}", report.source_records);
    println!(
        "batches: {} accepted, {} failed of {}",
        report.stats.batches_accepted, report.stats.batches_failed, report.total_batches
    );
    println!(
        "accepted records: {} ({} recovered)",
        report.accepted_records, report.recovered_records
    );
    println!("rejected variants: {}", report.rejections.total());
    println!("call success rate: {:.1}%", report.stats.success_rate());
    println!("augmented output: {}", summary.outputs.augmented.display());
    println!("final dataset: {}", summary.outputs.dataset.display());
    println!("report: {}", summary.outputs.report.display());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
