//! Scholar Harvester - Entry Point
//!
//! Runs the harvesting pipeline or the metrics revalidator for one or more
//! profiles. Configuration comes from the environment (and `.env`).

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use scholar_harvester::{Config, HarvestContext, Pipeline, RevalidateOptions, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "scholar-harvester")]
#[command(about = "Harvest Google Scholar profiles with DOIs and attention metrics")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Harvest profiles, resuming from stored progress
    Run {
        /// Profile ids (12 characters each)
        #[arg(required = true)]
        profile_ids: Vec<String>,

        /// Ignore freshness and start every stage from the beginning
        #[arg(long)]
        force: bool,
    },
    /// Refresh attention metrics for already-harvested profiles
    Revalidate {
        /// Profile ids (12 characters each)
        #[arg(required = true)]
        profile_ids: Vec<String>,

        /// Skip the pass over missing and blocked entries
        #[arg(long)]
        skip_missing: bool,

        /// Skip the pass over stale entries
        #[arg(long)]
        skip_stale: bool,
    },
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    let config = Config::from_env()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        proxies = config.proxy_chain.len(),
        data_dir = %config.data_dir.display(),
        "Starting scholar harvester"
    );

    let ctx = HarvestContext::new(config)?;
    let cancel = ctx.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping at the next boundary");
            cancel.cancel();
        }
    });

    let pipeline = Pipeline::new(ctx);
    let mut failed = 0usize;

    match cli.command {
        Command::Run { profile_ids, force } => {
            for (profile_id, outcome) in pipeline.run_many(&profile_ids, RunOptions { force }).await {
                match outcome {
                    Ok(report) => println!("{}", serde_json::to_string(&report)?),
                    Err(e) => {
                        tracing::error!(profile_id, error = %e, "run failed");
                        failed += 1;
                    }
                }
            }
        }
        Command::Revalidate { profile_ids, skip_missing, skip_stale } => {
            let options = RevalidateOptions { phase1: !skip_missing, phase2: !skip_stale };
            for profile_id in profile_ids {
                match pipeline.revalidate_metrics(&profile_id, options).await {
                    Ok(report) => tracing::info!(
                        profile_id,
                        phase1 = report.phase1_refetched,
                        phase2 = report.phase2_refetched,
                        failed = report.failed,
                        "revalidation finished"
                    ),
                    Err(e) => {
                        tracing::error!(profile_id, error = %e, "revalidation failed");
                        failed += 1;
                    }
                }
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} profile(s) failed");
    }
    Ok(())
}
