//! Multiclass gradient-boosted classifier (spec §4.3 "Model").
//!
//! One-vs-rest boosting: each round fits one shallow regression tree per
//! class against that class's pseudo-residual (multinomial deviance
//! gradient), in parallel across classes via `rayon`. Scores accumulate as
//! log-odds; `predict_proba` applies softmax.

use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const LEARNING_RATE: f64 = 0.08;
/// How many candidate features a split considers at each node — full search
/// over a ~2000-wide hashed row would dominate wall clock for little gain.
const FEATURE_SUBSAMPLE: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn predict(&self, row: &[f64]) -> f64 {
        match self {
            TreeNode::Leaf(v) => *v,
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionTree {
    root: TreeNode,
}

impl RegressionTree {
    fn fit(
        rows: &[&[f64]],
        targets: &[f64],
        indices: &[usize],
        max_depth: usize,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        Self {
            root: build_node(rows, targets, indices, 0, max_depth, rng),
        }
    }

    fn predict(&self, row: &[f64]) -> f64 {
        self.root.predict(row)
    }
}

fn build_node(
    rows: &[&[f64]],
    targets: &[f64],
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> TreeNode {
    let mean = indices.iter().map(|&i| targets[i]).sum::<f64>() / indices.len().max(1) as f64;
    if depth >= max_depth || indices.len() < 10 {
        return TreeNode::Leaf(mean);
    }

    let n_features = rows.first().map(|r| r.len()).unwrap_or(0);
    if n_features == 0 {
        return TreeNode::Leaf(mean);
    }

    let candidate_features: Vec<usize> = if n_features <= FEATURE_SUBSAMPLE {
        (0..n_features).collect()
    } else {
        (0..FEATURE_SUBSAMPLE)
            .map(|_| rng.gen_range(0..n_features))
            .collect()
    };

    let parent_sse = sse(indices, targets, mean);
    let mut best: Option<(usize, f64, f64)> = None; // (feature, threshold, gain)

    for &feature in &candidate_features {
        let mut values: Vec<f64> = indices.iter().map(|&i| rows[i][feature]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        values.dedup_by(|a, b| (*a - *b).abs() < f64::EPSILON);
        if values.len() < 2 {
            continue;
        }
        // Evaluate a handful of quantile thresholds rather than every value.
        let n_thresholds = values.len().min(8);
        for t in 1..=n_thresholds {
            let pos = (t * values.len()) / (n_thresholds + 1);
            let threshold = values[pos.min(values.len() - 1)];
            let (left, right): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .partition(|&&i| rows[i][feature] <= threshold);
            if left.len() < 5 || right.len() < 5 {
                continue;
            }
            let left_mean = left.iter().map(|&i| targets[i]).sum::<f64>() / left.len() as f64;
            let right_mean = right.iter().map(|&i| targets[i]).sum::<f64>() / right.len() as f64;
            let child_sse = sse(&left, targets, left_mean) + sse(&right, targets, right_mean);
            let gain = parent_sse - child_sse;
            if best.map(|(_, _, g)| gain > g).unwrap_or(true) {
                best = Some((feature, threshold, gain));
            }
        }
    }

    match best {
        Some((feature, threshold, gain)) if gain > 1e-9 => {
            let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
                .iter()
                .partition(|&&i| rows[i][feature] <= threshold);
            TreeNode::Split {
                feature,
                threshold,
                left: Box::new(build_node(
                    rows,
                    targets,
                    &left_idx,
                    depth + 1,
                    max_depth,
                    rng,
                )),
                right: Box::new(build_node(
                    rows,
                    targets,
                    &right_idx,
                    depth + 1,
                    max_depth,
                    rng,
                )),
            }
        }
        _ => TreeNode::Leaf(mean),
    }
}

fn sse(indices: &[usize], targets: &[f64], mean: f64) -> f64 {
    indices
        .iter()
        .map(|&i| (targets[i] - mean).powi(2))
        .sum()
}

/// A fitted one-vs-rest multiclass gradient boosting model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbmModel {
    pub classes: Vec<String>,
    /// `rounds[r][k]` is the round-`r` tree for class `k`.
    rounds: Vec<Vec<RegressionTree>>,
    pub learning_rate: f64,
}

impl GbmModel {
    /// Raw per-class log-odds scores (pre-softmax) for one row.
    pub fn raw_scores(&self, row: &[f64]) -> Vec<f64> {
        let mut scores = vec![0.0; self.classes.len()];
        for round in &self.rounds {
            for (k, tree) in round.iter().enumerate() {
                scores[k] += self.learning_rate * tree.predict(row);
            }
        }
        scores
    }

    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        softmax(&self.raw_scores(row))
    }
}

pub fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 {
        vec![1.0 / scores.len() as f64; scores.len()]
    } else {
        exps.into_iter().map(|e| e / sum).collect()
    }
}

/// Trains a `GbmModel` against `rows`/`class_indices` (index into `classes`)
/// with per-row `sample_weights`, using multinomial-deviance gradient
/// boosting. `rounds` trees are built per class; each round's tree targets
/// that class's pseudo-residual `weight * (1{y=k} - p_k)`.
///
/// `deadline`, if set, is checked between rounds; boosting stops early
/// (returning the model as trained so far) once it passes. The caller
/// decides whether a partial model is acceptable.
pub fn train(
    rows: &[Vec<f64>],
    class_indices: &[usize],
    sample_weights: &[f64],
    classes: &[String],
    rounds: usize,
    max_depth: usize,
    seed: u64,
    deadline: Option<Instant>,
) -> (GbmModel, bool) {
    let n = rows.len();
    let k = classes.len();
    let row_refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
    let mut scores = vec![vec![0.0f64; k]; n];
    let mut trees: Vec<Vec<RegressionTree>> = Vec::with_capacity(rounds);
    let mut timed_out = false;

    for round in 0..rounds {
        if let Some(dl) = deadline {
            if Instant::now() >= dl {
                timed_out = true;
                break;
            }
        }
        let probas: Vec<Vec<f64>> = scores.iter().map(|s| softmax(s)).collect();

        let round_trees: Vec<RegressionTree> = (0..k)
            .into_par_iter()
            .map(|class_k| {
                let mut rng = ChaCha8Rng::seed_from_u64(seed ^ ((round as u64) << 8) ^ class_k as u64);
                let residuals: Vec<f64> = (0..n)
                    .map(|i| {
                        let y = if class_indices[i] == class_k { 1.0 } else { 0.0 };
                        sample_weights[i] * (y - probas[i][class_k])
                    })
                    .collect();
                let all_indices: Vec<usize> = (0..n).collect();
                RegressionTree::fit(&row_refs, &residuals, &all_indices, max_depth, &mut rng)
            })
            .collect();

        for i in 0..n {
            for (class_k, tree) in round_trees.iter().enumerate() {
                scores[i][class_k] += LEARNING_RATE * tree.predict(&rows[i]);
            }
        }
        trees.push(round_trees);
    }

    (
        GbmModel {
            classes: classes.to_vec(),
            rounds: trees,
            learning_rate: LEARNING_RATE,
        },
        timed_out,
    )
}
