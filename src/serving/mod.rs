//! Online serving (spec §4.4): the request pipeline that turns a transaction
//! into a category `Suggestion`.
//!
//! State machine: RESOLVE_FEATURES -> RESOLVE_MODEL -> ENCODE -> PREDICT ->
//! CALIBRATE -> THRESHOLD -> ROUTE -> SHADOW_COMPARE -> EMIT. Every exit that
//! isn't a routed, confident model answer carries a `FallbackReason` so the
//! caller and `/metrics` both know why.

pub mod rules;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use tracing::warn;

use crate::config::ServingConfig;
use crate::db::Db;
use crate::encoder::{self, Encoder};
use crate::errors::FallbackReason;
use crate::features::normalize;
use crate::model::{FeatureRow, ShadowComparison, Suggestion, SuggestionSource};
use crate::registry::Registry;
use rules::RuleEngine;

/// Inline feature fields a caller may submit instead of a `txn_id` (spec §6:
/// `POST /ml/predict` accepts `{"features": {...}}`), used by the HTTP API
/// and directly by tests that want to bypass the database.
pub struct InlineFeatures {
    pub merchant: String,
    pub description: String,
    pub amount: f64,
    pub date: DateTime<Utc>,
}

impl InlineFeatures {
    /// Builds a `FeatureRow` the same way the Feature Builder would, minus
    /// the monthly-cadence subscription heuristic — an inline request has no
    /// per-user transaction history to compute it from.
    pub fn into_row(self) -> FeatureRow {
        let merchant_tokens = normalize::tokenize(&self.merchant);
        let desc_tokens = normalize::tokenize(&self.description);
        let mut tokens = merchant_tokens.clone();
        tokens.extend(desc_tokens);
        let merchant_canonical = normalize::merchant_canonical(&merchant_tokens);
        let norm_desc = normalize::norm_desc(&tokens);
        let dow = self.date.weekday().num_days_from_monday() as u8;

        FeatureRow {
            txn_id: 0,
            ts_month: format!("{:04}-{:02}", self.date.year(), self.date.month()),
            merchant_canonical,
            tokens,
            abs_amount: self.amount.abs(),
            channel: crate::features::infer_channel(&self.description),
            dow,
            is_weekend: dow >= 5,
            is_subscription: false,
            norm_desc,
        }
    }
}

pub struct ServingEngine {
    db: Db,
    registry: Arc<Registry>,
    rule_engine: Arc<dyn RuleEngine>,
    metrics: Arc<crate::metrics::Metrics>,
}

impl ServingEngine {
    pub fn new(
        db: Db,
        registry: Arc<Registry>,
        rule_engine: Arc<dyn RuleEngine>,
        metrics: Arc<crate::metrics::Metrics>,
    ) -> Self {
        Self {
            db,
            registry,
            rule_engine,
            metrics,
        }
    }

    /// Resolves features for `txn_id` from the database, then runs the
    /// shared pipeline.
    pub async fn predict(&self, txn_id: i64, config: &ServingConfig) -> Result<Suggestion> {
        let start = Instant::now();
        let row = self.db.feature_row_for_txn(txn_id)?;
        let result = match row {
            Some(row) => self.predict_row(Some(txn_id), row, config).await,
            None => Ok(self.fallback_no_row(txn_id)?),
        };
        self.metrics
            .observe_predict_latency_ms(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Runs the shared pipeline against a caller-supplied feature row instead
    /// of a database lookup (spec §4.5: "accepts inline features").
    pub async fn predict_inline(&self, row: FeatureRow, config: &ServingConfig) -> Result<Suggestion> {
        let start = Instant::now();
        let result = self.predict_row(None, row, config).await;
        self.metrics
            .observe_predict_latency_ms(start.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn predict_row(
        &self,
        txn_id: Option<i64>,
        row: FeatureRow,
        config: &ServingConfig,
    ) -> Result<Suggestion> {
        // RESOLVE_MODEL
        let entry = match self.registry.current() {
            Some(e) => e,
            None => {
                return Ok(self.fallback_with_row(txn_id, &row, FallbackReason::ModelUnavailable));
            }
        };

        // ENCODE
        let enc = Encoder::new(entry.encoder_config.clone());
        let vec = enc.transform(&row);
        if encoder::check_dims(&entry.encoder_config, vec.len()).is_err() {
            return Ok(self.fallback_with_row(txn_id, &row, FallbackReason::EncoderMismatch));
        }

        // PREDICT (soft timeout: a model load/predict that runs long degrades
        // to a fallback rather than blocking the caller indefinitely)
        let run_id = entry.run_id.clone();
        let registry = Arc::clone(&self.registry);
        let predict_fut = tokio::task::spawn_blocking(move || {
            let model = registry.load_model(&run_id)?;
            Ok::<_, anyhow::Error>(model.predict_proba(&vec))
        });

        let raw_proba = match tokio::time::timeout(
            Duration::from_millis(config.predict_timeout_ms),
            predict_fut,
        )
        .await
        {
            Ok(Ok(Ok(proba))) => proba,
            Ok(Ok(Err(e))) => {
                warn!(?txn_id, error = %e, "model predict failed");
                return Ok(self.fallback_with_row(txn_id, &row, FallbackReason::ModelUnavailable));
            }
            Ok(Err(e)) => {
                warn!(?txn_id, error = %e, "predict task panicked");
                return Ok(self.fallback_with_row(txn_id, &row, FallbackReason::ModelUnavailable));
            }
            Err(_) => {
                return Ok(self.fallback_with_row(txn_id, &row, FallbackReason::PredictTimeout));
            }
        };

        // CALIBRATE
        let proba = if config.calibration_enabled {
            if let Some(calibrators) = &entry.calibrator {
                crate::trainer::calibration::calibrate_row(&entry.classes, &raw_proba, calibrators)
            } else {
                raw_proba
            }
        } else {
            raw_proba
        };

        let (best_label, best_conf) = argmax_with_tiebreak(&entry.classes, &proba);
        let threshold = config.thresholds.get(&best_label);

        // The rule engine is consulted unconditionally at this point: shadow
        // comparison needs it whether or not the model turns out confident,
        // and the decide step below needs it whenever the model doesn't end
        // up winning the request.
        let rule_label = self.rule_engine.classify(&row);

        // SHADOW_COMPARE (spec §4.5 step 9: runs whenever the model produced
        // a prediction, confident or not).
        let shadow = if config.shadow_enabled {
            let agree = rule_label.as_ref().map(|r| r == &best_label);
            self.metrics.record_shadow_compare(agree);
            Some(ShadowComparison {
                model_label: Some(best_label.clone()),
                model_confidence: Some(best_conf),
                rule_label: rule_label.clone(),
                agree,
            })
        } else {
            None
        };

        // THRESHOLD
        if best_conf < threshold {
            self.metrics.record_predict_request(false);
            return Ok(self.route_low_confidence(txn_id, rule_label, shadow));
        }

        // ROUTE
        let slot = stable_slot(txn_id, &row);
        let routed_to_model = config.canary_policy.admits(slot);

        // The model was available and produced a confident prediction — that
        // much is true regardless of how canary routing decides below.
        self.metrics.record_predict_request(true);

        if !routed_to_model {
            // Canary policy withholds this slot from the model even though it
            // was confident; fall through to the rule engine (spec §4.5 step
            // 8's "else" branch). This is not a model failure, so no
            // `model_unavailable`/other fallback reason is recorded unless the
            // rule engine also has nothing to offer.
            return Ok(self.route_away_from_model(txn_id, rule_label, shadow));
        }

        self.metrics.record_prediction(true);
        self.metrics.record_suggest_source("model");

        Ok(Suggestion {
            txn_id,
            label: best_label,
            confidence: best_conf,
            source: SuggestionSource::Model,
            fallback_reason: None,
            shadow,
            run_id: Some(entry.run_id),
        })
    }

    fn route_away_from_model(
        &self,
        txn_id: Option<i64>,
        rule_label: Option<String>,
        shadow: Option<ShadowComparison>,
    ) -> Suggestion {
        match rule_label {
            Some(label) => {
                self.metrics.record_suggest_source("rule");
                Suggestion {
                    txn_id,
                    label,
                    confidence: 1.0,
                    source: SuggestionSource::Rule,
                    fallback_reason: None,
                    shadow,
                    run_id: None,
                }
            }
            None => {
                self.metrics.record_fallback(FallbackReason::RuleMissing.as_str());
                self.metrics.record_suggest_source("fallback");
                Suggestion {
                    txn_id,
                    label: "unknown".to_string(),
                    confidence: 0.0,
                    source: SuggestionSource::Fallback,
                    fallback_reason: Some(FallbackReason::RuleMissing.as_str().to_string()),
                    shadow,
                    run_id: None,
                }
            }
        }
    }

    /// Called when the model produced a prediction but confidence fell below
    /// threshold (spec §4.5 step 8/scenario 4). A rule hit here is treated as
    /// a normal rule-sourced suggestion, not a fallback: `fallback_reason` is
    /// absent, since the caller got a real answer, just not from the model.
    fn route_low_confidence(
        &self,
        txn_id: Option<i64>,
        rule_label: Option<String>,
        shadow: Option<ShadowComparison>,
    ) -> Suggestion {
        self.metrics.record_fallback(FallbackReason::LowConfidence.as_str());
        match rule_label {
            Some(label) => {
                self.metrics.record_suggest_source("rule");
                Suggestion {
                    txn_id,
                    label,
                    confidence: 1.0,
                    source: SuggestionSource::Rule,
                    fallback_reason: None,
                    shadow,
                    run_id: None,
                }
            }
            None => {
                self.metrics.record_suggest_source("fallback");
                Suggestion {
                    txn_id,
                    label: "unknown".to_string(),
                    confidence: 0.0,
                    source: SuggestionSource::Fallback,
                    fallback_reason: Some(FallbackReason::RuleMissing.as_str().to_string()),
                    shadow,
                    run_id: None,
                }
            }
        }
    }

    fn fallback_with_row(
        &self,
        txn_id: Option<i64>,
        row: &FeatureRow,
        reason: FallbackReason,
    ) -> Suggestion {
        self.metrics.record_predict_request(false);
        self.metrics.record_fallback(reason.as_str());
        let rule_label = self.rule_engine.classify(row);
        match rule_label {
            Some(label) => {
                self.metrics.record_suggest_source("rule");
                Suggestion {
                    txn_id,
                    label,
                    confidence: 1.0,
                    source: SuggestionSource::Rule,
                    fallback_reason: Some(reason.as_str().to_string()),
                    shadow: None,
                    run_id: None,
                }
            }
            None => {
                self.metrics.record_suggest_source("fallback");
                Suggestion {
                    txn_id,
                    label: "unknown".to_string(),
                    confidence: 0.0,
                    source: SuggestionSource::Fallback,
                    fallback_reason: Some(FallbackReason::RuleMissing.as_str().to_string()),
                    shadow: None,
                    run_id: None,
                }
            }
        }
    }

    /// Called when no feature row exists for `txn_id` (spec §4.5 step 1). The
    /// rule engine still gets a chance: if the raw transaction is on record,
    /// build an ad-hoc row (same normalization `InlineFeatures` uses, minus
    /// the subscription heuristic) purely to hand to `rules`, without
    /// persisting it as a FeatureRow. Only if the transaction itself is
    /// unknown, or the rule engine also has nothing, do we give up with
    /// `no_features_no_rule`.
    fn fallback_no_row(&self, txn_id: i64) -> Result<Suggestion> {
        self.metrics.record_predict_request(false);
        let txn = self.db.transaction_by_id(txn_id)?;
        let rule_label = txn.as_ref().and_then(|t| {
            let row = InlineFeatures {
                merchant: t.merchant.clone(),
                description: t.description.clone(),
                amount: t.amount,
                date: t.date,
            }
            .into_row();
            self.rule_engine.classify(&row)
        });

        self.metrics.record_fallback(FallbackReason::FeaturesMissing.as_str());
        let suggestion = match rule_label {
            Some(label) => {
                self.metrics.record_suggest_source("rule");
                Suggestion {
                    txn_id: Some(txn_id),
                    label,
                    confidence: 1.0,
                    source: SuggestionSource::Rule,
                    fallback_reason: Some(FallbackReason::FeaturesMissing.as_str().to_string()),
                    shadow: None,
                    run_id: None,
                }
            }
            None => {
                self.metrics
                    .record_fallback(FallbackReason::NoFeaturesNoRule.as_str());
                self.metrics.record_suggest_source("fallback");
                Suggestion {
                    txn_id: Some(txn_id),
                    label: "unknown".to_string(),
                    confidence: 0.0,
                    source: SuggestionSource::Fallback,
                    fallback_reason: Some(FallbackReason::NoFeaturesNoRule.as_str().to_string()),
                    shadow: None,
                    run_id: None,
                }
            }
        };
        Ok(suggestion)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Stable hash bucketed into 0..100, used for canary routing. Uses `txn_id`
/// when available so repeated requests for the same transaction always land
/// in the same bucket; otherwise falls back to a hash of the row's own
/// content so an inline request without an id is still deterministic across
/// retries of that identical row.
fn stable_slot(txn_id: Option<i64>, row: &FeatureRow) -> u64 {
    let hash = match txn_id {
        Some(id) => fnv1a(&id.to_le_bytes()),
        None => fnv1a(format!("{}|{}", row.merchant_canonical, row.norm_desc).as_bytes()),
    };
    hash % 100
}

/// Picks the highest-probability class, breaking near-ties (within 1e-12) by
/// preferring the lexicographically smaller label so the decision is
/// reproducible regardless of class iteration order.
fn argmax_with_tiebreak(classes: &[String], proba: &[f64]) -> (String, f64) {
    let mut best_idx = 0;
    for i in 1..classes.len() {
        let diff = proba[i] - proba[best_idx];
        if diff > 1e-12 || (diff.abs() <= 1e-12 && classes[i] < classes[best_idx]) {
            best_idx = i;
        }
    }
    (classes[best_idx].clone(), proba[best_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_breaks_near_ties_lexicographically() {
        let classes = vec!["zebra".to_string(), "apple".to_string()];
        let proba = vec![0.500000000001, 0.5];
        let (label, _) = argmax_with_tiebreak(&classes, &proba);
        assert_eq!(label, "apple");
    }

    #[test]
    fn argmax_picks_clear_winner() {
        let classes = vec!["a".to_string(), "b".to_string()];
        let proba = vec![0.1, 0.9];
        let (label, conf) = argmax_with_tiebreak(&classes, &proba);
        assert_eq!(label, "b");
        assert_eq!(conf, 0.9);
    }

    fn sample_row() -> FeatureRow {
        FeatureRow {
            txn_id: 0,
            ts_month: "2026-01".into(),
            merchant_canonical: "m".into(),
            tokens: vec![],
            abs_amount: 1.0,
            channel: crate::model::Channel::Unknown,
            dow: 1,
            is_weekend: false,
            is_subscription: false,
            norm_desc: "m".into(),
        }
    }

    #[test]
    fn stable_slot_is_deterministic_by_txn_id() {
        let row = sample_row();
        assert_eq!(stable_slot(Some(42), &row), stable_slot(Some(42), &row));
        assert!(stable_slot(Some(42), &row) < 100);
    }

    #[test]
    fn stable_slot_is_deterministic_by_row_when_no_txn_id() {
        let row = sample_row();
        assert_eq!(stable_slot(None, &row), stable_slot(None, &row));
    }

    #[test]
    fn inline_features_build_a_row_without_subscription_history() {
        let row = InlineFeatures {
            merchant: "WHOLE FOODS #123".into(),
            description: "POS PURCHASE".into(),
            amount: -12.5,
            date: Utc::now(),
        }
        .into_row();
        assert_eq!(row.merchant_canonical, "whole_foods");
        assert!(!row.is_subscription);
        assert_eq!(row.abs_amount, 12.5);
    }
}
