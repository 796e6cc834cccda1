use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use trendpulse_sync::{ProviderSettings, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "trendpulse")]
#[command(about = "Keyword trend ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every unit once and print the run summary.
    Sync {
        /// Exit non-zero when any unit errored.
        #[arg(long)]
        strict: bool,
    },
    /// Print the enumerated fetch units.
    Units,
    /// Load and validate configuration without touching the provider or the store.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync { strict: false }) {
        Commands::Sync { strict } => {
            let report = trendpulse_sync::run_sync_once(&config).await?;
            let t = &report.totals;
            println!(
                "sync complete: run_id={} units={} completed={} empty={} errored={} inserted={} skipped={} dropped={}",
                report.run_id, t.units, t.completed, t.empty, t.errored, t.inserted, t.skipped, t.dropped
            );
            for unit in report.failed_units() {
                println!("  failed: {}", unit.unit);
            }
            if strict && report.has_failures() {
                bail!("{} of {} units errored", t.errored, t.units);
            }
        }
        Commands::Units => {
            let (_, dimensions) = config.load_dimensions().await?;
            for unit in dimensions.units() {
                println!(
                    "{:>4}  {}  mode={} geo={} timeframe={}",
                    unit.index,
                    unit.id(),
                    unit.category.mode.as_str(),
                    unit.country.gt_geo,
                    unit.window.provider_timeframe()
                );
            }
        }
        Commands::CheckConfig => {
            let (source, dimensions) = config.load_dimensions().await?;
            let provider = match &config.provider {
                ProviderSettings::Http { endpoint } => format!("http {endpoint}"),
                ProviderSettings::Fixtures { dir } => format!("fixtures {}", dir.display()),
            };
            println!(
                "config ok: source={} countries={} windows={} categories={} units={} provider={} concurrency={} bucket={:?}",
                source.source_id,
                dimensions.countries().len(),
                dimensions.windows().len(),
                dimensions.categories().len(),
                dimensions.units().len(),
                provider,
                config.concurrency,
                config.collection_bucket,
            );
        }
    }

    Ok(())
}
