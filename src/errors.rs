//! Typed error taxonomy (spec §7). Serving never surfaces these as 5xx — it
//! degrades to rules-or-fallback and records a `FallbackReason` instead.
//! Training surfaces them to its caller via `anyhow::Error`.

use std::fmt;

/// Errors that abort a batch or training operation outright.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// The transactions/features source is unreachable.
    DataUnavailable(String),
    /// Training has no eligible train or validation set.
    InsufficientData(String),
    /// A training run's artifact failed to publish after the run completed.
    RegistryIoError(String),
    /// Malformed client input.
    BadRequest(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::DataUnavailable(msg) => write!(f, "data unavailable: {msg}"),
            PipelineError::InsufficientData(msg) => write!(f, "insufficient data: {msg}"),
            PipelineError::RegistryIoError(msg) => write!(f, "registry io error: {msg}"),
            PipelineError::BadRequest(msg) => write!(f, "bad request: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Structured routing reason attached to a fallback `Suggestion`. Mirrors the
/// `ml_fallback_total{reason}` metric label set exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    FeaturesMissing,
    ModelUnavailable,
    EncoderMismatch,
    LowConfidence,
    RuleMissing,
    PredictTimeout,
    NoFeaturesNoRule,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::FeaturesMissing => "features_missing",
            FallbackReason::ModelUnavailable => "model_unavailable",
            FallbackReason::EncoderMismatch => "encoder_mismatch",
            FallbackReason::LowConfidence => "low_confidence",
            FallbackReason::RuleMissing => "rule_missing",
            FallbackReason::PredictTimeout => "predict_timeout",
            FallbackReason::NoFeaturesNoRule => "no_features_no_rule",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
