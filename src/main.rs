//! `txn-ml-server`: the online serving binary. Loads configuration, opens the
//! database and model registry, and serves the HTTP API described in
//! `SPEC_FULL.md`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use txn_ml_pipeline::api::{self, AppState};
use txn_ml_pipeline::config::Config;
use txn_ml_pipeline::db::Db;
use txn_ml_pipeline::registry::Registry;
use txn_ml_pipeline::serving::rules::KeywordRuleEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    tracing::info!(port = config.port, "starting txn-ml-server");

    let db = Db::open(&config.database_path)?;
    let registry = Arc::new(Registry::open(&config.registry_root)?);
    let rule_engine = Arc::new(KeywordRuleEngine::default_rules());

    let state = Arc::new(AppState::new(&config, db, Arc::clone(&registry), rule_engine));

    spawn_registry_refresh(Arc::clone(&registry));

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Periodically reloads the registry's `current` pointer from disk, so a
/// model published by a separately-running `train` process becomes visible
/// to this server without a restart.
fn spawn_registry_refresh(registry: Arc<Registry>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Err(e) = registry.refresh() {
                tracing::warn!(error = %e, "registry refresh failed");
            }
        }
    });
}
