//! End-to-end HTTP surface tests against the real `axum` router, exercising
//! request/response shapes the serving-level tests don't reach directly.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use txn_ml_pipeline::api::{router, AppState};
use txn_ml_pipeline::config::{CanaryPolicy, ServingConfig, ThresholdMap, TrainerConfig};
use txn_ml_pipeline::db::Db;
use txn_ml_pipeline::metrics::Metrics;
use txn_ml_pipeline::registry::Registry;
use txn_ml_pipeline::serving::rules::KeywordRuleEngine;
use txn_ml_pipeline::serving::ServingEngine;

fn test_state(canary: CanaryPolicy) -> Arc<AppState> {
    let db = Db::in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let registry_root = dir.path().to_path_buf();
    // None of these tests publish a model, so the registry directory only
    // needs to exist for the lifetime of the process; forget the guard
    // instead of threading a `TempDir` through `AppState`'s fixed field set.
    std::mem::forget(dir);
    let registry = Arc::new(Registry::open(&registry_root).unwrap());
    let rule_engine = Arc::new(KeywordRuleEngine::default_rules());
    let metrics = Arc::new(Metrics::new());
    let serving = ServingEngine::new(db.clone(), Arc::clone(&registry), rule_engine, Arc::clone(&metrics));

    let serving_config = ServingConfig {
        shadow_enabled: true,
        canary_policy: canary,
        thresholds: Arc::new(ThresholdMap {
            by_class: HashMap::new(),
            default_threshold: 0.60,
        }),
        calibration_enabled: true,
        predict_timeout_ms: 2000,
    };

    Arc::new(AppState {
        db,
        registry,
        serving,
        metrics,
        serving_config: arc_swap::ArcSwap::from_pointee(serving_config),
        trainer_config: TrainerConfig::default(),
        num_hash_buckets: 256,
        hash_seed: 7,
    })
}

async fn post_json(state: Arc<AppState>, uri: &str, body: Value) -> (StatusCode, Value) {
    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&bytes).unwrap();
    (status, parsed)
}

#[tokio::test]
async fn health_check_returns_ok() {
    let state = test_state(CanaryPolicy::Full);
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn predict_accepts_inline_features_without_a_stored_transaction() {
    let state = test_state(CanaryPolicy::Full);
    let (status, body) = post_json(
        state,
        "/ml/predict",
        json!({
            "features": {
                "merchant": "WHOLE FOODS #1928",
                "description": "POS PURCHASE",
                "amount": -54.12,
                "date": "2026-06-01T00:00:00Z",
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["label"], "Groceries");
    assert_eq!(body["txn_id"], Value::Null);
}

#[tokio::test]
async fn strict_predict_returns_503_when_nothing_can_categorize_the_row() {
    let state = test_state(CanaryPolicy::Full);
    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ml/predict?strict=1")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "features": {
                            "merchant": "ZZZZZ UNKNOWN VENDOR",
                            "description": "MISC PAYMENT",
                            "amount": -1.23,
                            "date": "2026-06-01T00:00:00Z",
                        }
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["available"], false);
}

#[tokio::test]
async fn model_status_reports_serving_config_when_no_model_is_published() {
    let state = test_state(CanaryPolicy::Percent(10));
    let app = router(state);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/ml/model/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["available"], false);
    assert_eq!(body["run_id"], Value::Null);
    assert_eq!(body["canary_policy"], "percent:10");
    assert_eq!(body["shadow_enabled"], true);
    assert_eq!(body["thresholds"]["_default"], 0.60);
}

#[tokio::test]
async fn non_strict_predict_returns_200_fallback_for_the_same_row() {
    let state = test_state(CanaryPolicy::Full);
    let (status, body) = post_json(
        state,
        "/ml/predict",
        json!({
            "features": {
                "merchant": "ZZZZZ UNKNOWN VENDOR",
                "description": "MISC PAYMENT",
                "amount": -1.23,
                "date": "2026-06-01T00:00:00Z",
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["label"], "unknown");
    assert_eq!(body["fallback_reason"], "rule_missing");
}
