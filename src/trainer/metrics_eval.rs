//! Evaluation metrics (spec §4.3 "Acceptance gate"): per-class precision,
//! recall, F1, and the macro-F1 used for the deploy/no-deploy decision.

use std::collections::HashMap;

use crate::model::EvalMetrics;

/// `predictions[i]`/`truths[i]` are class names; `classes` fixes the set
/// scored (and the order `per_class_f1` is reported in, via the map keys).
pub fn evaluate(predictions: &[String], truths: &[String], classes: &[String]) -> EvalMetrics {
    let mut per_class_f1 = HashMap::new();
    let mut correct = 0usize;
    for (p, t) in predictions.iter().zip(truths.iter()) {
        if p == t {
            correct += 1;
        }
    }
    let accuracy = if predictions.is_empty() {
        0.0
    } else {
        correct as f64 / predictions.len() as f64
    };

    for class in classes {
        let tp = predictions
            .iter()
            .zip(truths.iter())
            .filter(|(p, t)| *p == class && *t == class)
            .count() as f64;
        let fp = predictions
            .iter()
            .zip(truths.iter())
            .filter(|(p, t)| *p == class && *t != class)
            .count() as f64;
        let fn_ = predictions
            .iter()
            .zip(truths.iter())
            .filter(|(p, t)| *p != class && *t == class)
            .count() as f64;

        let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
        let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        per_class_f1.insert(class.clone(), f1);
    }

    let f1_macro = if classes.is_empty() {
        0.0
    } else {
        per_class_f1.values().sum::<f64>() / classes.len() as f64
    };

    EvalMetrics {
        f1_macro,
        accuracy,
        per_class_f1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_score_one() {
        let classes = vec!["a".to_string(), "b".to_string()];
        let truths = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let metrics = evaluate(&truths, &truths, &classes);
        assert_eq!(metrics.accuracy, 1.0);
        assert_eq!(metrics.f1_macro, 1.0);
    }

    #[test]
    fn all_wrong_predictions_score_zero_f1() {
        let classes = vec!["a".to_string(), "b".to_string()];
        let preds = vec!["b".to_string(), "a".to_string()];
        let truths = vec!["a".to_string(), "b".to_string()];
        let metrics = evaluate(&preds, &truths, &classes);
        assert_eq!(metrics.f1_macro, 0.0);
    }
}
