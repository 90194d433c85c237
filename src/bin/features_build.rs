//! `features-build`: one-shot/cron-driven Feature Builder run.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use txn_ml_pipeline::config::Config;
use txn_ml_pipeline::db::Db;
use txn_ml_pipeline::features::FeatureBuilder;

#[derive(Parser)]
#[command(name = "features-build")]
struct Args {
    /// Overrides FEATURE_WINDOW_DAYS for this run.
    #[arg(long)]
    days: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let window_days = args.days.unwrap_or(config.feature_window_days);

    let db = Db::open(&config.database_path)?;
    let builder = FeatureBuilder::new(db);
    let report = builder.build(window_days)?;

    tracing::info!(
        processed = report.processed,
        upserted = report.upserted,
        skipped = report.skipped,
        "features-build finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
