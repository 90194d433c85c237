//! `POST /ml/predict` — returns a category suggestion for one transaction.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::model::SuggestionSource;
use crate::serving::InlineFeatures;

/// Spec §6: the body is either `{"txn_id": int}` or `{"features": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PredictRequest {
    Txn { txn_id: i64 },
    Inline { features: InlineFeaturesDto },
}

#[derive(Debug, Deserialize)]
pub struct InlineFeaturesDto {
    pub merchant: String,
    pub description: String,
    pub amount: f64,
    pub date: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PredictQuery {
    #[serde(default)]
    pub strict: Option<String>,
}

impl PredictQuery {
    fn is_strict(&self) -> bool {
        matches!(self.strict.as_deref(), Some("1") | Some("true"))
    }
}

#[derive(Debug, Serialize)]
pub struct UnavailableResponse {
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub txn_id: Option<i64>,
    pub label: String,
    pub confidence: f64,
    pub source: String,
    pub fallback_reason: Option<String>,
    pub shadow: Option<ShadowComparisonDto>,
    pub run_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ShadowComparisonDto {
    pub model_label: Option<String>,
    pub model_confidence: Option<f64>,
    pub rule_label: Option<String>,
    pub agree: Option<bool>,
}

pub async fn predict(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PredictQuery>,
    Json(req): Json<PredictRequest>,
) -> Result<axum::response::Response, (StatusCode, String)> {
    use axum::response::IntoResponse;

    let serving_config = state.serving_config.load();
    let suggestion = match req {
        PredictRequest::Txn { txn_id } => state.serving.predict(txn_id, &serving_config).await,
        PredictRequest::Inline { features } => {
            let row = InlineFeatures {
                merchant: features.merchant,
                description: features.description,
                amount: features.amount,
                date: features.date,
            }
            .into_row();
            state.serving.predict_inline(row, &serving_config).await
        }
    }
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    // Strict mode: a client that asked for ?strict=1 gets a 503 instead of a
    // 200 fallback when neither the model nor the rule engine produced a
    // label (i.e. this suggestion has no real answer to offer).
    if query.is_strict() && suggestion.source == SuggestionSource::Fallback {
        return Ok(
            (StatusCode::SERVICE_UNAVAILABLE, Json(UnavailableResponse { available: false })).into_response(),
        );
    }

    Ok(Json(PredictResponse {
        txn_id: suggestion.txn_id,
        label: suggestion.label,
        confidence: suggestion.confidence,
        source: suggestion.source.as_str().to_string(),
        fallback_reason: suggestion.fallback_reason,
        shadow: suggestion.shadow.map(|s| ShadowComparisonDto {
            model_label: s.model_label,
            model_confidence: s.model_confidence,
            rule_label: s.rule_label,
            agree: s.agree,
        }),
        run_id: suggestion.run_id,
    })
    .into_response())
}
