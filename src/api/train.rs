//! `POST /ml/train` — runs one training cycle synchronously (on a blocking
//! thread) and publishes the result if it passes the acceptance gate.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::encoder::Encoder;
use crate::trainer::Trainer;

#[derive(Debug, Serialize)]
pub struct TrainResponse {
    pub run_id: String,
    pub passed_gate: bool,
    pub deployed: bool,
    pub f1_macro: f64,
    pub rows_train: usize,
    pub rows_val: usize,
    pub dropped_classes: Vec<String>,
    pub error: Option<String>,
}

pub async fn trigger_training(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TrainResponse>, (StatusCode, String)> {
    let db = state.db.clone();
    let registry = Arc::clone(&state.registry);
    let metrics = Arc::clone(&state.metrics);
    let trainer_config = state.trainer_config.clone();
    let encoder_config = Encoder::default_config(state.num_hash_buckets, state.hash_seed);

    let outcome = tokio::task::spawn_blocking(move || {
        let trainer = Trainer::new(db);
        trainer.run(encoder_config, &trainer_config)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    metrics.record_train_run(&outcome.run);
    metrics.set_train_val_f1_macro(outcome.run.metrics.f1_macro);

    let mut deployed = false;
    if outcome.run.passed_gate {
        if let (Some(model), Some(calibrators)) = (&outcome.model, &outcome.calibrators) {
            registry
                .publish(
                    &outcome.run.run_id,
                    &outcome.classes,
                    &outcome.encoder_config,
                    model,
                    calibrators,
                    &outcome.run.metrics,
                )
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            state
                .db
                .mark_training_run_deployed(&outcome.run.run_id)
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            deployed = true;
        }
    }

    Ok(Json(TrainResponse {
        run_id: outcome.run.run_id,
        passed_gate: outcome.run.passed_gate,
        deployed,
        f1_macro: outcome.run.metrics.f1_macro,
        rows_train: outcome.run.rows_train,
        rows_val: outcome.run.rows_val,
        dropped_classes: outcome.run.dropped_classes,
        error: outcome.run.error,
    }))
}
