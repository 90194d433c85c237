//! HTTP surface (spec §6 "API"): wires `/ml/predict`, `/ml/model/status`,
//! `/ml/train`, `/metrics`, and `/health` onto a shared `AppState`.

pub mod predict;
pub mod status;
pub mod train;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Db;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::serving::rules::RuleEngine;
use crate::serving::ServingEngine;
use arc_swap::ArcSwap;

pub struct AppState {
    pub db: Db,
    pub registry: Arc<Registry>,
    pub serving: ServingEngine,
    pub metrics: Arc<Metrics>,
    pub serving_config: ArcSwap<crate::config::ServingConfig>,
    pub trainer_config: crate::config::TrainerConfig,
    pub num_hash_buckets: usize,
    pub hash_seed: u64,
}

impl AppState {
    pub fn new(config: &Config, db: Db, registry: Arc<Registry>, rule_engine: Arc<dyn RuleEngine>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let serving = ServingEngine::new(db.clone(), Arc::clone(&registry), rule_engine, Arc::clone(&metrics));
        Self {
            db,
            registry,
            serving,
            metrics,
            serving_config: ArcSwap::from_pointee(config.serving.clone()),
            trainer_config: config.trainer.clone(),
            num_hash_buckets: config.num_hash_buckets,
            hash_seed: config.hash_seed,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ml/predict", post(predict::predict))
        .route("/ml/model/status", get(status::model_status))
        .route("/ml/train", post(train::trigger_training))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> String {
    state.metrics.render()
}
