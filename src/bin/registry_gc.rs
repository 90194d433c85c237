//! `registry-gc`: prunes stale run directories from the model registry,
//! always keeping whichever run is currently published.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use txn_ml_pipeline::config::Config;
use txn_ml_pipeline::registry::Registry;

#[derive(Parser)]
#[command(name = "registry-gc")]
struct Args {
    /// Number of most-recent runs to retain in addition to the published one.
    #[arg(long, default_value_t = 5)]
    keep: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;
    let registry = Registry::open(&config.registry_root)?;
    let removed = registry.gc(args.keep)?;
    tracing::info!(removed, keep = args.keep, "registry-gc finished");
    println!("removed {removed} stale run(s)");
    Ok(())
}
