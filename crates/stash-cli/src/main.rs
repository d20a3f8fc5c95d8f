use anyhow::Result;
use clap::{Parser, Subcommand};
use stash_storage::ResetScope;
use stash_sync::{cancel_on_ctrl_c, Collector, PlatformRunStatus};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stash")]
#[command(about = "Collects saved items from configured platforms")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection cycle.
    Sync,
    /// Run cycles on the configured cron schedule until interrupted.
    Serve,
    /// Print per-platform health.
    Status,
    /// Re-enable a platform and clear its failure counters.
    Reset {
        platform: String,
        /// Also forget every item seen for the platform.
        #[arg(long)]
        clear_seen: bool,
    },
    /// Print seen-item totals and platform state.
    Stats,
    /// Delete seen records older than the given age.
    Prune {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let collector = Collector::from_env().await?;
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let cancel = cancel_on_ctrl_c();
            let report = collector.sync_once(&cancel).await?;
            println!(
                "sync complete: cycle_id={} new_items={} succeeded={} failed={} cooling_down={} disabled={} reports={}",
                report.cycle_id,
                report.new_items(),
                report.count(PlatformRunStatus::Succeeded),
                report.count(PlatformRunStatus::Failed),
                report.count(PlatformRunStatus::CoolingDown),
                report.count(PlatformRunStatus::Disabled),
                collector.reports.root().join(report.cycle_id.to_string()).display()
            );
            for platform in report.platforms.iter().filter(|p| p.needs_operator()) {
                eprintln!(
                    "platform {} is disabled ({}); run `stash reset {}` once fixed",
                    platform.platform, platform.last_failure_reason, platform.platform
                );
            }
        }
        Commands::Serve => {
            collector.daemon().run_until_shutdown().await?;
        }
        Commands::Status => {
            let status = collector.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Reset {
            platform,
            clear_seen,
        } => {
            let scope = if clear_seen {
                ResetScope::Everything
            } else {
                ResetScope::StateOnly
            };
            collector.reset(&platform, scope).await?;
            println!("reset {platform} ({scope:?})");
        }
        Commands::Stats => {
            let stats = collector.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Prune { days } => {
            let removed = collector.prune(days).await?;
            println!("pruned {removed} seen records older than {days} days");
        }
    }

    Ok(())
}
