//! Environment-driven configuration (spec §6 "Environment/configuration").
//!
//! Every knob parses into a typed value, falls back to a documented default on
//! missing/invalid input, and out-of-range numeric knobs are clamped rather
//! than panicking — the same idiom as `vault::ReactiveFast15mConfig::from_env`
//! in the system this pipeline grew out of.

use std::collections::HashMap;
use std::env;

/// Fractional rollout policy for routing confident model predictions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CanaryPolicy {
    Off,
    Percent(u8),
    Full,
}

impl CanaryPolicy {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("off") {
            return CanaryPolicy::Off;
        }
        if raw.eq_ignore_ascii_case("full") {
            return CanaryPolicy::Full;
        }
        if let Some(pct) = raw.strip_prefix("percent:") {
            if let Ok(n) = pct.trim().parse::<u8>() {
                if n > 0 && n < 100 {
                    return CanaryPolicy::Percent(n);
                }
            }
        }
        CanaryPolicy::Off
    }

    pub fn as_str(&self) -> String {
        match self {
            CanaryPolicy::Off => "off".to_string(),
            CanaryPolicy::Full => "full".to_string(),
            CanaryPolicy::Percent(n) => format!("percent:{n}"),
        }
    }

    /// Whether a routing key falling in bucket `slot` (0..100) should be
    /// served from the model.
    pub fn admits(&self, slot: u64) -> bool {
        match self {
            CanaryPolicy::Off => false,
            CanaryPolicy::Full => true,
            CanaryPolicy::Percent(n) => slot < *n as u64,
        }
    }
}

/// Per-class confidence thresholds, with a `_default` fallback for classes
/// not present in the map.
#[derive(Debug, Clone)]
pub struct ThresholdMap {
    pub by_class: HashMap<String, f64>,
    pub default_threshold: f64,
}

impl ThresholdMap {
    pub fn parse(raw: &str) -> Self {
        let mut default_threshold = 0.60;
        let mut by_class = HashMap::new();
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw) {
            for (k, v) in map {
                if let Some(f) = v.as_f64() {
                    if k == "_default" {
                        default_threshold = f;
                    } else {
                        by_class.insert(k, f);
                    }
                }
            }
        }
        Self {
            by_class,
            default_threshold,
        }
    }

    pub fn get(&self, class: &str) -> f64 {
        *self.by_class.get(class).unwrap_or(&self.default_threshold)
    }
}

/// Runtime-reloadable knobs consumed once per serving request (spec §9
/// "Dynamic configuration"). Bundled as a single immutable snapshot so a
/// request's decision stays internally consistent even if config changes
/// mid-flight.
#[derive(Debug, Clone)]
pub struct ServingConfig {
    pub shadow_enabled: bool,
    pub canary_policy: CanaryPolicy,
    pub thresholds: ThresholdMapShared,
    pub calibration_enabled: bool,
    pub predict_timeout_ms: u64,
}

/// `ThresholdMap` wrapped for cheap `Clone` inside `ServingConfig`.
pub type ThresholdMapShared = std::sync::Arc<ThresholdMap>;

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub min_val_rows: usize,
    pub min_per_class: usize,
    pub f1_macro_min: f64,
    pub f1_class_min: f64,
    pub boosting_rounds: usize,
    pub max_depth: usize,
    pub seed: u64,
    pub wall_clock_cap_secs: u64,
    pub max_row_drop_rate: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            min_val_rows: 200,
            min_per_class: 25,
            f1_macro_min: 0.72,
            f1_class_min: 0.60,
            boosting_rounds: 400,
            max_depth: 3,
            seed: 1337,
            wall_clock_cap_secs: 30 * 60,
            max_row_drop_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub feature_window_days: u32,
    pub registry_root: String,
    pub num_hash_buckets: usize,
    pub hash_seed: u64,
    pub serving: ServingConfig,
    pub trainer: TrainerConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./txn_ml.db".to_string());
        let port = env_parse("PORT", 8080u16);
        let feature_window_days = env_parse("FEATURE_WINDOW_DAYS", 90u32);
        let registry_root =
            env::var("REGISTRY_ROOT").unwrap_or_else(|_| "./registry".to_string());
        let num_hash_buckets = env_parse("NUM_HASH_BUCKETS", 2048usize).max(16);
        let hash_seed = env_parse("ENCODER_HASH_SEED", 12345u64);

        let shadow_enabled = env_bool("SHADOW_ENABLED", true);
        let canary_policy = env::var("CANARY_POLICY")
            .map(|v| CanaryPolicy::parse(&v))
            .unwrap_or(CanaryPolicy::Off);
        let thresholds = env::var("THRESHOLDS_JSON")
            .map(|v| ThresholdMap::parse(&v))
            .unwrap_or(ThresholdMap {
                by_class: HashMap::new(),
                default_threshold: 0.60,
            });
        let calibration_enabled = env_bool("CALIBRATION_ENABLED", true);
        let predict_timeout_ms = env_parse("PREDICT_TIMEOUT_MS", 150u64);

        let mut trainer = TrainerConfig::default();
        trainer.f1_macro_min = env_parse("F1_MACRO_MIN", trainer.f1_macro_min).clamp(0.0, 1.0);
        trainer.f1_class_min = env_parse("F1_CLASS_MIN", trainer.f1_class_min).clamp(0.0, 1.0);

        Ok(Self {
            database_path,
            port,
            feature_window_days,
            registry_root,
            num_hash_buckets,
            hash_seed,
            serving: ServingConfig {
                shadow_enabled,
                canary_policy,
                thresholds: std::sync::Arc::new(thresholds),
                calibration_enabled,
                predict_timeout_ms,
            },
            trainer,
        })
    }
}
