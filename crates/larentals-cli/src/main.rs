use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use larentals_core::Segment;
use larentals_storage::SqliteSnapshotStore;
use larentals_sync::{maybe_build_scheduler, run_sync_from_env, PipelineConfig, SyncOptions, SyncPipeline};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "larentals-cli")]
#[command(about = "LA County listing pipeline: sync snapshots, serve the API, run the scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SegmentArg {
    Lease,
    Buy,
    All,
}

impl SegmentArg {
    fn segments(self) -> Vec<Segment> {
        match self {
            SegmentArg::Lease => vec![Segment::Lease],
            SegmentArg::Buy => vec![Segment::Buy],
            SegmentArg::All => Segment::ALL.to_vec(),
        }
    }
}

/// A batch file holds one segment, so `--input` needs an explicit segment.
fn sync_segments(segment: SegmentArg, input: Option<&PathBuf>) -> Result<Vec<Segment>> {
    if let (SegmentArg::All, Some(path)) = (segment, input) {
        bail!(
            "--input {} holds a single segment; pass --segment lease or --segment buy",
            path.display()
        );
    }
    Ok(segment.segments())
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the inbox batch into the stored snapshot.
    Sync {
        #[arg(long, value_enum, default_value = "all")]
        segment: SegmentArg,
        /// Batch file to use instead of inbox/<segment>/batch.json.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Only process the first N rows and write to the sample table.
        #[arg(long)]
        sample: Option<usize>,
        #[arg(long)]
        no_expiry_check: bool,
    },
    /// Serve the JSON API.
    Serve,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    /// Re-canonicalize lease terms on the stored snapshot.
    BackfillTerms {
        #[arg(long, value_enum, default_value = "lease")]
        segment: SegmentArg,
    },
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LARENTALS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "command failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = PipelineConfig::from_env();
    match command {
        Commands::Sync {
            segment,
            input,
            sample,
            no_expiry_check,
        } => {
            let segments = sync_segments(segment, input.as_ref())?;
            let options = SyncOptions {
                input,
                sample,
                check_expiry: config.check_expiry && !no_expiry_check,
            };
            for summary in run_sync_from_env(&segments, &options).await? {
                println!(
                    "sync complete: run_id={} segment={} written={} expired={} rejected={} reports={}",
                    summary.run_id,
                    summary.segment,
                    summary.written_rows,
                    summary.merge.expired_removed,
                    summary.gate_rejections,
                    summary.reports_dir
                );
            }
        }
        Commands::Serve => larentals_web::serve_from_env().await?,
        Commands::Schedule => {
            let config = PipelineConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let sched = maybe_build_scheduler(pipeline)
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::BackfillTerms { segment } => {
            let store = SqliteSnapshotStore::connect(&config.database_path)
                .await
                .with_context(|| format!("opening {}", config.database_path.display()))?;
            for segment in segment.segments() {
                let changed = larentals_sync::backfill_terms(&store, segment).await?;
                println!("terms backfill: segment={segment} changed={changed}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from([
            "larentals-cli",
            "sync",
            "--segment",
            "lease",
            "--sample",
            "25",
            "--no-expiry-check",
        ])
        .unwrap();
        match cli.command {
            Commands::Sync {
                segment,
                sample,
                no_expiry_check,
                input,
            } => {
                assert_eq!(segment.segments(), vec![Segment::Lease]);
                assert_eq!(sample, Some(25));
                assert!(no_expiry_check);
                assert!(input.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn segment_defaults() {
        let cli = Cli::try_parse_from(["larentals-cli", "sync"]).unwrap();
        assert!(matches!(cli.command, Commands::Sync { segment: SegmentArg::All, .. }));
        let cli = Cli::try_parse_from(["larentals-cli", "backfill-terms"]).unwrap();
        assert!(matches!(cli.command, Commands::BackfillTerms { segment: SegmentArg::Lease }));
        assert!(Cli::try_parse_from(["larentals-cli", "sync", "--segment", "rent"]).is_err());
    }

    #[test]
    fn input_file_requires_a_single_segment() {
        let input = PathBuf::from("inbox/lease/batch.json");
        let err = sync_segments(SegmentArg::All, Some(&input)).unwrap_err();
        assert!(err.to_string().contains("--segment lease"));
        assert_eq!(sync_segments(SegmentArg::Lease, Some(&input)).unwrap(), vec![Segment::Lease]);
        assert_eq!(sync_segments(SegmentArg::All, None).unwrap(), Segment::ALL.to_vec());
    }
}
