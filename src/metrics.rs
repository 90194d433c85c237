//! Hand-rolled Prometheus text-exposition metrics (spec §6). The pipeline
//! carries no third-party metrics crate — matching the wider system's own
//! convention of building counters/histograms directly over atomics and a
//! lock, rather than bringing in `metrics`/`metrics-exporter-prometheus`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

const LATENCY_BUCKETS_MS: [f64; 8] = [5.0, 10.0, 25.0, 50.0, 100.0, 150.0, 250.0, 500.0];

#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn incr(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, millis: f64) {
        for (bucket, threshold) in self.buckets.iter().zip(LATENCY_BUCKETS_MS.iter()) {
            if millis <= *threshold {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_millis.fetch_add(millis as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide metrics registry. One instance lives in `AppState` and is
/// shared behind an `Arc`.
pub struct Metrics {
    predict_requests_total: RwLock<HashMap<&'static str, Counter>>, // label: available
    predictions_total: RwLock<HashMap<&'static str, Counter>>,      // label: accepted
    fallback_total: RwLock<HashMap<String, Counter>>,               // label: reason
    predict_latency: Histogram,
    suggest_compare_total: RwLock<HashMap<&'static str, Counter>>, // label: agree
    suggest_source_total: RwLock<HashMap<&'static str, Counter>>, // label: source
    train_runs_total: RwLock<HashMap<&'static str, Counter>>,     // label: status
    train_val_f1_macro: RwLock<f64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            predict_requests_total: RwLock::new(HashMap::new()),
            predictions_total: RwLock::new(HashMap::new()),
            fallback_total: RwLock::new(HashMap::new()),
            predict_latency: Histogram::new(),
            suggest_compare_total: RwLock::new(HashMap::new()),
            suggest_source_total: RwLock::new(HashMap::new()),
            train_runs_total: RwLock::new(HashMap::new()),
            train_val_f1_macro: RwLock::new(0.0),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_predict_request(&self, model_available: bool) {
        let label = if model_available { "true" } else { "false" };
        self.predict_requests_total
            .write()
            .entry(label)
            .or_default()
            .incr();
    }

    pub fn record_prediction(&self, accepted: bool) {
        let label = if accepted { "true" } else { "false" };
        self.predictions_total.write().entry(label).or_default().incr();
    }

    pub fn record_fallback(&self, reason: &str) {
        self.fallback_total
            .write()
            .entry(reason.to_string())
            .or_default()
            .incr();
    }

    pub fn observe_predict_latency_ms(&self, millis: f64) {
        self.predict_latency.observe(millis);
    }

    pub fn record_shadow_compare(&self, agree: Option<bool>) {
        let label = match agree {
            Some(true) => "true",
            Some(false) => "false",
            None => "rule_null",
        };
        self.suggest_compare_total
            .write()
            .entry(label)
            .or_default()
            .incr();
    }

    pub fn record_suggest_source(&self, source: &str) {
        let label = match source {
            "model" => "model",
            "rule" => "rule",
            _ => "fallback",
        };
        self.suggest_source_total
            .write()
            .entry(label)
            .or_default()
            .incr();
    }

    /// `status` is one of the spec's `ml_train_runs_total{status}` values:
    /// `success`, `gate_failed`, or `error` (the run aborted before a gate
    /// decision could even be made, e.g. `InsufficientData`).
    pub fn record_train_run(&self, run: &crate::model::TrainingRun) {
        let label = if run.error.is_some() {
            "error"
        } else if run.passed_gate {
            "success"
        } else {
            "gate_failed"
        };
        self.train_runs_total.write().entry(label).or_default().incr();
    }

    pub fn set_train_val_f1_macro(&self, value: f64) {
        *self.train_val_f1_macro.write() = value;
    }

    /// Renders every metric family as Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        render_counter_family(
            &mut out,
            "ml_predict_requests_total",
            "available",
            &self.predict_requests_total.read(),
        );
        render_counter_family(
            &mut out,
            "ml_predictions_total",
            "accepted",
            &self.predictions_total.read(),
        );
        render_string_counter_family(
            &mut out,
            "ml_fallback_total",
            "reason",
            &self.fallback_total.read(),
        );
        render_counter_family(
            &mut out,
            "ml_suggest_compare_total",
            "agree",
            &self.suggest_compare_total.read(),
        );
        render_counter_family(
            &mut out,
            "ml_suggest_source_total",
            "source",
            &self.suggest_source_total.read(),
        );
        render_counter_family(
            &mut out,
            "ml_train_runs_total",
            "status",
            &self.train_runs_total.read(),
        );

        out.push_str("# TYPE ml_predict_latency_seconds histogram\n");
        let mut cumulative = 0u64;
        for (bucket, threshold) in self
            .predict_latency
            .buckets
            .iter()
            .zip(LATENCY_BUCKETS_MS.iter())
        {
            cumulative = cumulative.max(bucket.load(Ordering::Relaxed));
            out.push_str(&format!(
                "ml_predict_latency_seconds_bucket{{le=\"{}\"}} {}\n",
                threshold / 1000.0,
                cumulative
            ));
        }
        out.push_str(&format!(
            "ml_predict_latency_seconds_sum {}\n",
            self.predict_latency.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        out.push_str(&format!(
            "ml_predict_latency_seconds_count {}\n",
            self.predict_latency.count.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE ml_train_val_f1_macro gauge\n");
        out.push_str(&format!(
            "ml_train_val_f1_macro {}\n",
            *self.train_val_f1_macro.read()
        ));

        out
    }
}

fn render_counter_family(
    out: &mut String,
    name: &str,
    label_name: &str,
    counters: &HashMap<&'static str, Counter>,
) {
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (label, counter) in counters {
        out.push_str(&format!(
            "{name}{{{label_name}=\"{label}\"}} {}\n",
            counter.get()
        ));
    }
}

fn render_string_counter_family(
    out: &mut String,
    name: &str,
    label_name: &str,
    counters: &HashMap<String, Counter>,
) {
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (label, counter) in counters {
        out.push_str(&format!(
            "{name}{{{label_name}=\"{label}\"}} {}\n",
            counter.get()
        ));
    }
}
