//! `GET /ml/model/status` (spec §6) — reports what's currently published
//! plus the runtime-reloadable serving knobs in effect, for dashboards and
//! the canary rollout runbook.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ModelStatusResponse {
    pub available: bool,
    pub run_id: Option<String>,
    pub classes: Option<Vec<String>>,
    pub calibration_enabled: bool,
    pub thresholds: HashMap<String, f64>,
    pub canary_policy: String,
    pub shadow_enabled: bool,
}

pub async fn model_status(State(state): State<Arc<AppState>>) -> Json<ModelStatusResponse> {
    let config = state.serving_config.load();

    let mut thresholds = config.thresholds.by_class.clone();
    thresholds.insert("_default".to_string(), config.thresholds.default_threshold);

    match state.registry.current() {
        Some(entry) => Json(ModelStatusResponse {
            available: true,
            run_id: Some(entry.run_id),
            classes: Some(entry.classes),
            calibration_enabled: config.calibration_enabled,
            thresholds,
            canary_policy: config.canary_policy.as_str(),
            shadow_enabled: config.shadow_enabled,
        }),
        None => Json(ModelStatusResponse {
            available: false,
            run_id: None,
            classes: None,
            calibration_enabled: config.calibration_enabled,
            thresholds,
            canary_policy: config.canary_policy.as_str(),
            shadow_enabled: config.shadow_enabled,
        }),
    }
}
