use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mps_core::ScanResult;
use mps_scan::{list_sources, ScanConfig, ScanPipeline, SourceRegistry};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mps-cli")]
#[command(about = "Milestone proximity scanner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan one source's roster and write the candidate report.
    Scan(ScanArgs),
    /// List known sources and their registry status.
    Sources,
}

/// Flags win over the matching environment variables.
#[derive(Debug, Default, Args)]
struct ScanArgs {
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// JSON roster file used instead of the remote roster listing.
    #[arg(long)]
    roster: Option<PathBuf>,
    #[arg(long)]
    stat: Option<String>,
    #[arg(long)]
    step: Option<u64>,
    #[arg(long)]
    within: Option<u64>,
    #[arg(long)]
    min_value: Option<u64>,
}

impl ScanArgs {
    fn apply(self, mut config: ScanConfig) -> ScanConfig {
        if let Some(source) = self.source {
            config.source_id = source;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.output_file = self.output.or(config.output_file);
        config.roster_file = self.roster.or(config.roster_file);
        config.stat_type = self.stat.or(config.stat_type);
        config.milestone_step = self.step.or(config.milestone_step);
        config.milestone_threshold = self.within.or(config.milestone_threshold);
        config.milestone_min_value = self.min_value.or(config.milestone_min_value);
        config
    }
}

fn print_summary(result: &ScanResult) {
    println!(
        "scan complete: run_id={} source={} stat={} roster={} processed={} candidates={} suppressed={} failures={} skipped={}",
        result.run_id,
        result.source_id,
        result.stat_type,
        result.roster_size,
        result.processed_count,
        result.candidate_count(),
        result.suppressed_count,
        result.failure_count,
        result.skipped_count,
    );
    for candidate in &result.candidates {
        println!(
            "  {:<28} {:>7} -> {:>7} (needs {})",
            candidate.display_name,
            candidate.cumulative_value,
            candidate.target_milestone,
            candidate.amount_needed
        );
    }
}

async fn scan(args: ScanArgs) -> Result<()> {
    let config = args.apply(ScanConfig::from_env());
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let pipeline = ScanPipeline::new(config, registry.as_ref())?;

    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight entities");
            cancel.cancel();
        }
    });

    let summary = pipeline.run_once().await?;
    print_summary(&summary.result);
    println!(
        "report: {} ({} bytes, sha256 {})",
        summary.report_path.display(),
        summary.report_bytes,
        summary.report_sha256
    );
    Ok(())
}

async fn sources() -> Result<()> {
    let config = ScanConfig::from_env();
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    for listing in list_sources(&config, registry.as_ref())? {
        let rule = listing.settings.rule;
        println!(
            "{}\t{}\tenabled={}\tstat={} (of {})\tstep={} within={} min={}\toutput={}",
            listing.source_id,
            listing.display_name,
            listing.enabled,
            listing.settings.stat_type,
            listing.supported_stats.join(","),
            rule.step,
            rule.threshold,
            rule.min_value,
            listing.settings.output_file.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Scan(ScanArgs::default())) {
        Commands::Scan(args) => scan(args).await,
        Commands::Sources => sources().await,
    }
}
