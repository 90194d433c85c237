//! Trainer orchestration (spec §4.3): point-in-time train/validation split,
//! class filtering, gradient boosting, isotonic calibration, evaluation, and
//! the accept/reject gate that decides whether a run is eligible to publish.

pub mod calibration;
pub mod gbm;
pub mod metrics_eval;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TrainerConfig;
use crate::db::Db;
use crate::encoder::Encoder;
use crate::errors::PipelineError;
use crate::model::{EncoderConfig, EvalMetrics, IsotonicCalibrator, TrainingRun};

pub struct TrainOutcome {
    pub run: TrainingRun,
    pub classes: Vec<String>,
    pub encoder_config: EncoderConfig,
    pub model: Option<gbm::GbmModel>,
    pub calibrators: Option<HashMap<String, IsotonicCalibrator>>,
}

pub struct Trainer {
    db: Db,
}

impl Trainer {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Runs one full training cycle: load labeled rows, split temporally,
    /// filter sparse classes, fit the model and calibrators, evaluate on the
    /// held-out validation rows, and decide whether the run passes the
    /// acceptance gate. Always records the run (pass or fail) in the
    /// `training_runs` audit table.
    pub fn run(
        &self,
        encoder_config: EncoderConfig,
        trainer_config: &TrainerConfig,
    ) -> Result<TrainOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let labeled = self
            .db
            .labeled_feature_rows()
            .map_err(|e| PipelineError::DataUnavailable(e.to_string()))?;

        if labeled.is_empty() {
            return self.fail_run(
                run_id,
                started_at,
                encoder_config,
                "no labeled feature rows available".to_string(),
            );
        }

        let (train_rows, val_rows) = temporal_split(&labeled, trainer_config.min_val_rows);
        if val_rows.len() < trainer_config.min_val_rows {
            return self.fail_run(
                run_id,
                started_at,
                encoder_config,
                format!(
                    "validation set too small: {} < {}",
                    val_rows.len(),
                    trainer_config.min_val_rows
                ),
            );
        }

        let (kept_classes, dropped_classes) =
            filter_classes(&train_rows, trainer_config.min_per_class);
        if kept_classes.is_empty() {
            return self.fail_run(
                run_id,
                started_at,
                encoder_config,
                "no class met the minimum per-class row count".to_string(),
            );
        }

        let train_rows: Vec<_> = train_rows
            .into_iter()
            .filter(|(_, label)| kept_classes.contains(&label.label))
            .collect();
        let val_rows: Vec<_> = val_rows
            .into_iter()
            .filter(|(_, label)| kept_classes.contains(&label.label))
            .collect();

        let encoder = Encoder::new(encoder_config.clone());
        let classes: Vec<String> = {
            let mut v: Vec<String> = kept_classes.into_iter().collect();
            v.sort();
            v
        };

        // A row whose encoded vector isn't finite (e.g. a corrupt abs_amount
        // that slipped past feature-build) is dropped rather than fed to the
        // booster. Too many such drops means the labeled set isn't trustworthy.
        let total_before_encoding = train_rows.len();
        let mut train_vecs = Vec::with_capacity(total_before_encoding);
        let mut train_class_idx = Vec::with_capacity(total_before_encoding);
        let mut train_rows_kept = Vec::with_capacity(total_before_encoding);
        let mut dropped_rows = 0usize;
        for (row, label) in &train_rows {
            let vec = encoder.transform(row);
            if vec.iter().any(|v| !v.is_finite()) {
                dropped_rows += 1;
                continue;
            }
            train_class_idx.push(classes.iter().position(|c| c == &label.label).unwrap());
            train_vecs.push(vec);
            train_rows_kept.push((row.clone(), label.clone()));
        }
        let drop_rate = dropped_rows as f64 / total_before_encoding.max(1) as f64;
        if drop_rate > trainer_config.max_row_drop_rate {
            return self.fail_run(
                run_id,
                started_at,
                encoder_config,
                format!(
                    "encoding drop rate {:.1}% exceeds cap of {:.1}%",
                    drop_rate * 100.0,
                    trainer_config.max_row_drop_rate * 100.0
                ),
            );
        }
        let train_rows = train_rows_kept;
        // Class-balanced weights: inverse class frequency, multiplied by the
        // label-source sample weight (human > rule > import).
        let mut class_counts: HashMap<usize, usize> = HashMap::new();
        for &k in &train_class_idx {
            *class_counts.entry(k).or_insert(0) += 1;
        }
        let n_train = train_class_idx.len() as f64;
        let n_classes = classes.len() as f64;
        let sample_weights: Vec<f64> = train_rows
            .iter()
            .zip(train_class_idx.iter())
            .map(|((_, label), &k)| {
                let count = class_counts[&k] as f64;
                let balance = n_train / (n_classes * count);
                balance * label.source.sample_weight()
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(trainer_config.wall_clock_cap_secs);
        let (model, timed_out) = gbm::train(
            &train_vecs,
            &train_class_idx,
            &sample_weights,
            &classes,
            trainer_config.boosting_rounds,
            trainer_config.max_depth,
            trainer_config.seed,
            Some(deadline),
        );
        if timed_out {
            return self.fail_run(
                run_id,
                started_at,
                encoder_config,
                format!(
                    "training exceeded wall-clock cap of {}s",
                    trainer_config.wall_clock_cap_secs
                ),
            );
        }

        // Build calibration samples and compute raw (uncalibrated) validation
        // predictions.
        let mut cal_samples: HashMap<String, Vec<(f64, f64)>> =
            classes.iter().map(|c| (c.clone(), Vec::new())).collect();
        let mut val_preds = Vec::with_capacity(val_rows.len());
        let mut val_truths = Vec::with_capacity(val_rows.len());

        for (row, label) in &val_rows {
            let vec = encoder.transform(row);
            let proba = model.predict_proba(&vec);
            for (k, class) in classes.iter().enumerate() {
                let is_class = if &label.label == class { 1.0 } else { 0.0 };
                cal_samples.get_mut(class).unwrap().push((proba[k], is_class));
            }
            let (best_idx, _) = proba
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .unwrap();
            val_preds.push(classes[best_idx].clone());
            val_truths.push(label.label.clone());
        }

        let calibrators = calibration::fit_calibrators(&cal_samples);

        // The acceptance gate is computed on the uncalibrated validation
        // predictions (spec §4.3): calibration can shift the argmax, and the
        // gate must judge the model's own discriminative power, not the
        // calibrator's.
        let metrics = metrics_eval::evaluate(&val_preds, &val_truths, &classes);
        let passed_gate = metrics.f1_macro >= trainer_config.f1_macro_min
            && metrics
                .per_class_f1
                .values()
                .all(|f1| *f1 >= trainer_config.f1_class_min);

        if !passed_gate {
            warn!(
                run_id = %run_id,
                f1_macro = metrics.f1_macro,
                "training run failed acceptance gate"
            );
        } else {
            info!(run_id = %run_id, f1_macro = metrics.f1_macro, "training run passed acceptance gate");
        }

        let finished_at = Utc::now();
        let config_snapshot = serde_json::json!({
            "boosting_rounds": trainer_config.boosting_rounds,
            "max_depth": trainer_config.max_depth,
            "seed": trainer_config.seed,
            "f1_macro_min": trainer_config.f1_macro_min,
            "f1_class_min": trainer_config.f1_class_min,
            "num_hash_buckets": encoder_config.num_hash_buckets,
        });

        self.db.insert_training_run(
            &run_id,
            started_at,
            Some(finished_at),
            train_rows.len(),
            val_rows.len(),
            &classes,
            &metrics,
            passed_gate,
            false,
            &config_snapshot,
            None,
        )?;

        let run = TrainingRun {
            run_id,
            started_at,
            finished_at: Some(finished_at),
            rows_train: train_rows.len(),
            rows_val: val_rows.len(),
            classes: classes.clone(),
            dropped_classes,
            metrics,
            passed_gate,
            deployed: false,
            config_snapshot,
            error: None,
        };

        Ok(TrainOutcome {
            run,
            classes,
            encoder_config,
            model: if passed_gate { Some(model) } else { None },
            calibrators: if passed_gate { Some(calibrators) } else { None },
        })
    }

    fn fail_run(
        &self,
        run_id: String,
        started_at: chrono::DateTime<Utc>,
        encoder_config: EncoderConfig,
        error: String,
    ) -> Result<TrainOutcome> {
        let finished_at = Utc::now();
        let metrics = EvalMetrics::default();
        let config_snapshot = serde_json::json!({});
        self.db.insert_training_run(
            &run_id,
            started_at,
            Some(finished_at),
            0,
            0,
            &[],
            &metrics,
            false,
            false,
            &config_snapshot,
            Some(&error),
        )?;
        warn!(run_id = %run_id, error = %error, "training run aborted");
        Ok(TrainOutcome {
            run: TrainingRun {
                run_id,
                started_at,
                finished_at: Some(finished_at),
                rows_train: 0,
                rows_val: 0,
                classes: vec![],
                dropped_classes: vec![],
                metrics,
                passed_gate: false,
                deployed: false,
                config_snapshot,
                error: Some(error),
            },
            classes: vec![],
            encoder_config,
            model: None,
            calibrators: None,
        })
    }
}

type LabeledRow = (crate::model::FeatureRow, crate::model::Label);

/// `T_split` is the latest month whose own row count is at least
/// `min_val_rows`; rows dated that month form validation, everything
/// strictly earlier forms train. If no month meets the bar, both returned
/// sets come back empty so the caller's `InsufficientData` check fires.
fn temporal_split(rows: &[LabeledRow], min_val_rows: usize) -> (Vec<LabeledRow>, Vec<LabeledRow>) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (f, _) in rows {
        *counts.entry(f.ts_month.clone()).or_insert(0) += 1;
    }

    let mut months: Vec<&String> = counts.keys().collect();
    months.sort();
    months.reverse();

    let t_split = months
        .into_iter()
        .find(|m| counts[m.as_str()] >= min_val_rows)
        .cloned();

    let t_split = match t_split {
        Some(m) => m,
        None => return (Vec::new(), Vec::new()),
    };

    let mut train = Vec::new();
    let mut val = Vec::new();
    for row in rows {
        if row.0.ts_month == t_split {
            val.push(row.clone());
        } else if row.0.ts_month < t_split {
            train.push(row.clone());
        }
    }
    (train, val)
}

/// Drops classes with fewer than `min_per_class` rows in the training split
/// (evaluated against the eventual training set, not the whole dataset).
fn filter_classes(train_rows: &[LabeledRow], min_per_class: usize) -> (HashSet<String>, Vec<String>) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (_, label) in train_rows {
        *counts.entry(label.label.clone()).or_insert(0) += 1;
    }
    let mut kept = HashSet::new();
    let mut dropped = Vec::new();
    for (class, count) in counts {
        if count >= min_per_class {
            kept.insert(class);
        } else {
            dropped.push(class);
        }
    }
    dropped.sort();
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, FeatureRow, Label, LabelSource};
    use chrono::TimeZone;

    fn row(txn_id: i64, ts_month: &str, label: &str) -> LabeledRow {
        (
            FeatureRow {
                txn_id,
                ts_month: ts_month.to_string(),
                merchant_canonical: "m".into(),
                tokens: vec!["m".into()],
                abs_amount: 10.0,
                channel: Channel::Pos,
                dow: 1,
                is_weekend: false,
                is_subscription: false,
                norm_desc: "m".into(),
            },
            Label {
                txn_id,
                label: label.to_string(),
                source: LabelSource::Human,
                created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            },
        )
    }

    #[test]
    fn temporal_split_keeps_latest_months_for_validation() {
        let rows: Vec<LabeledRow> = (0..10)
            .map(|i| row(i, "2026-05", "a"))
            .chain((10..15).map(|i| row(i, "2026-06", "a")))
            .collect();
        let (train, val) = temporal_split(&rows, 5);
        assert!(val.iter().all(|(f, _)| f.ts_month == "2026-06"));
        assert!(train.iter().all(|(f, _)| f.ts_month == "2026-05"));
        assert_eq!(val.len(), 5);
    }

    #[test]
    fn filter_classes_drops_sparse_ones() {
        let rows: Vec<LabeledRow> = (0..30)
            .map(|i| row(i, "2026-05", "common"))
            .chain((30..32).map(|i| row(i, "2026-05", "rare")))
            .collect();
        let (kept, dropped) = filter_classes(&rows, 10);
        assert!(kept.contains("common"));
        assert!(dropped.contains(&"rare".to_string()));
    }
}
