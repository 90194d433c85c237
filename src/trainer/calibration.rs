//! Per-class isotonic probability calibration (spec §4.3, §9): fits one
//! monotone calibration curve per class via the Pool Adjacent Violators
//! Algorithm against held-out validation predictions, then renormalizes so a
//! row's calibrated probabilities still sum to 1.

use std::collections::HashMap;

use crate::model::IsotonicCalibrator;

/// One pooled block during PAVA: running mean, weight, and the x-range it
/// covers.
struct Block {
    x_min: f64,
    x_max: f64,
    weight: f64,
    mean: f64,
}

/// Fits an isotonic (non-decreasing) regression of `ys` on `xs` via PAVA.
/// `xs` must be paired with `ys`; need not be pre-sorted.
fn pava(xs: &[f64], ys: &[f64]) -> IsotonicCalibrator {
    if xs.is_empty() {
        return IsotonicCalibrator {
            xs: vec![0.0, 1.0],
            ys: vec![0.0, 1.0],
        };
    }
    let mut pairs: Vec<(f64, f64)> = xs.iter().copied().zip(ys.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

    let mut blocks: Vec<Block> = Vec::with_capacity(pairs.len());
    for (x, y) in pairs {
        blocks.push(Block {
            x_min: x,
            x_max: x,
            weight: 1.0,
            mean: y,
        });
        // Pool back while monotonicity is violated.
        while blocks.len() >= 2 {
            let n = blocks.len();
            if blocks[n - 2].mean > blocks[n - 1].mean {
                let b = blocks.pop().unwrap();
                let a = blocks.pop().unwrap();
                let weight = a.weight + b.weight;
                let mean = (a.mean * a.weight + b.mean * b.weight) / weight;
                blocks.push(Block {
                    x_min: a.x_min,
                    x_max: b.x_max,
                    weight,
                    mean,
                });
            } else {
                break;
            }
        }
    }

    let xs_out: Vec<f64> = blocks.iter().map(|b| (b.x_min + b.x_max) / 2.0).collect();
    let ys_out: Vec<f64> = blocks.iter().map(|b| b.mean).collect();
    IsotonicCalibrator {
        xs: xs_out,
        ys: ys_out,
    }
}

/// Fits one calibrator per class from validation-set `(predicted_proba,
/// is_class)` pairs. `samples` maps class name to its `(x, y)` pairs, where
/// `y` is 1.0 if the row's true label is that class and 0.0 otherwise.
pub fn fit_calibrators(samples: &HashMap<String, Vec<(f64, f64)>>) -> HashMap<String, IsotonicCalibrator> {
    samples
        .iter()
        .map(|(class, pairs)| {
            let xs: Vec<f64> = pairs.iter().map(|(x, _)| *x).collect();
            let ys: Vec<f64> = pairs.iter().map(|(_, y)| *y).collect();
            (class.clone(), pava(&xs, &ys))
        })
        .collect()
}

/// Applies each class's calibrator to the raw softmax output and
/// renormalizes the result to sum to 1, so calibration never produces an
/// invalid probability distribution.
pub fn calibrate_row(
    classes: &[String],
    raw: &[f64],
    calibrators: &HashMap<String, IsotonicCalibrator>,
) -> Vec<f64> {
    let mut calibrated: Vec<f64> = classes
        .iter()
        .zip(raw.iter())
        .map(|(class, &p)| {
            calibrators
                .get(class)
                .map(|c| c.apply(p).clamp(0.0, 1.0))
                .unwrap_or(p)
        })
        .collect();
    let sum: f64 = calibrated.iter().sum();
    if sum > 1e-9 {
        for v in calibrated.iter_mut() {
            *v /= sum;
        }
    }
    calibrated
}
