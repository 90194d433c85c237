//! Domain types shared by every component: transactions, labels, feature rows,
//! training runs, registry entries, and suggestions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single financial transaction, owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub date: DateTime<Utc>,
    pub merchant: String,
    pub description: String,
    pub amount: f64,
    pub category: Option<String>,
    pub deleted: bool,
}

/// Where a label came from. Ordering here doubles as the sample-weight lookup
/// in the Trainer (`human` > `rule` > `import`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    Human,
    Rule,
    Import,
}

impl LabelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelSource::Human => "human",
            LabelSource::Rule => "rule",
            LabelSource::Import => "import",
        }
    }

    /// Sample weight used by the Trainer when fitting the classifier.
    pub fn sample_weight(&self) -> f64 {
        match self {
            LabelSource::Human => 3.0,
            LabelSource::Rule => 1.0,
            LabelSource::Import => 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub txn_id: i64,
    pub label: String,
    pub source: LabelSource,
    pub created_at: DateTime<Utc>,
}

/// Inbound transaction channel, inferred from the description during feature
/// building. Fixed vocabulary for the encoder's one-hot block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Pos,
    Online,
    Transfer,
    Unknown,
}

impl Channel {
    pub const VOCAB: [Channel; 4] = [
        Channel::Pos,
        Channel::Online,
        Channel::Transfer,
        Channel::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Pos => "pos",
            Channel::Online => "online",
            Channel::Transfer => "transfer",
            Channel::Unknown => "unknown",
        }
    }

    pub fn index(&self) -> usize {
        Self::VOCAB.iter().position(|c| c == self).unwrap()
    }
}

/// Point-in-time feature row. Depends only on the owning transaction's own
/// fields and constants fixed at build time — never on data from other,
/// later-dated transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRow {
    pub txn_id: i64,
    /// `YYYY-MM`, used as the temporal split key by the Trainer.
    pub ts_month: String,
    pub merchant_canonical: String,
    pub tokens: Vec<String>,
    pub abs_amount: f64,
    pub channel: Channel,
    pub dow: u8,
    pub is_weekend: bool,
    pub is_subscription: bool,
    pub norm_desc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvalMetrics {
    pub f1_macro: f64,
    pub accuracy: f64,
    pub per_class_f1: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_train: usize,
    pub rows_val: usize,
    pub classes: Vec<String>,
    pub dropped_classes: Vec<String>,
    pub metrics: EvalMetrics,
    pub passed_gate: bool,
    pub deployed: bool,
    pub config_snapshot: serde_json::Value,
    pub error: Option<String>,
}

/// A single class's per-class isotonic calibrator: sorted `(x, y)`
/// breakpoints with linear interpolation between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsotonicCalibrator {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

impl IsotonicCalibrator {
    pub fn apply(&self, x: f64) -> f64 {
        if self.xs.is_empty() {
            return x;
        }
        if x <= self.xs[0] {
            return self.ys[0];
        }
        let last = self.xs.len() - 1;
        if x >= self.xs[last] {
            return self.ys[last];
        }
        let idx = match self
            .xs
            .binary_search_by(|probe| probe.partial_cmp(&x).unwrap())
        {
            Ok(i) => return self.ys[i],
            Err(i) => i,
        };
        let (x0, x1) = (self.xs[idx - 1], self.xs[idx]);
        let (y0, y1) = (self.ys[idx - 1], self.ys[idx]);
        if (x1 - x0).abs() < f64::EPSILON {
            return y0;
        }
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub num_hash_buckets: usize,
    pub hash_seed: u64,
    pub channel_vocab: Vec<String>,
}

impl EncoderConfig {
    /// Total output vector width: hashed buckets + numeric (abs_amount, dow) +
    /// one-hot (is_weekend, is_subscription, channel vocab).
    pub fn dims(&self) -> usize {
        self.num_hash_buckets + 2 + 2 + self.channel_vocab.len()
    }
}

/// A fully-loaded, immutable registry entry. Once constructed by
/// `Registry::load`/`load_current`, every field is internally consistent
/// (dims, classes length, and calibrator class set all agree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub run_id: String,
    pub classes: Vec<String>,
    pub encoder_config: EncoderConfig,
    pub calibrator: Option<HashMap<String, IsotonicCalibrator>>,
    pub created_at: DateTime<Utc>,
    pub metrics: EvalMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    Model,
    Rule,
    Fallback,
}

impl SuggestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionSource::Model => "model",
            SuggestionSource::Rule => "rule",
            SuggestionSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowComparison {
    pub model_label: Option<String>,
    pub model_confidence: Option<f64>,
    pub rule_label: Option<String>,
    pub agree: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub txn_id: Option<i64>,
    pub label: String,
    pub confidence: f64,
    pub source: SuggestionSource,
    pub fallback_reason: Option<String>,
    pub shadow: Option<ShadowComparison>,
    pub run_id: Option<String>,
}
