//! Feature encoding (spec §4.2): turns a `FeatureRow` into a fixed-width
//! numeric vector whose layout is pinned by the `EncoderConfig` stored
//! alongside the model that consumes it.
//!
//! Vector layout: `[hashed token bag (num_hash_buckets)] + [log1p(abs_amount),
//! dow/6] + [is_weekend, is_subscription, one-hot channel (channel_vocab)]`.

use crate::errors::FallbackReason;
use crate::model::{Channel, EncoderConfig, FeatureRow};

/// Clip a hashed token's bucket count so a single repeated token can't
/// dominate the row's norm.
const MAX_TOKEN_COUNT: f64 = 8.0;

pub struct Encoder {
    config: EncoderConfig,
}

impl Encoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Stable, non-cryptographic FNV-1a hash seeded by `hash_seed`, so the
    /// same token always lands in the same bucket for a given encoder
    /// generation regardless of process or platform.
    fn hash_token(&self, token: &str) -> usize {
        let mut hash: u64 = 0xcbf29ce484222325 ^ self.config.hash_seed;
        for byte in token.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash as usize) % self.config.num_hash_buckets
    }

    pub fn transform(&self, row: &FeatureRow) -> Vec<f64> {
        let mut buckets = vec![0.0f64; self.config.num_hash_buckets];
        for tok in row.tokens.iter().chain(std::iter::once(&row.merchant_canonical)) {
            let idx = self.hash_token(tok);
            buckets[idx] = (buckets[idx] + 1.0).min(MAX_TOKEN_COUNT);
        }

        let mut out = Vec::with_capacity(self.config.dims());
        out.extend(buckets);
        out.push(row.abs_amount.ln_1p());
        out.push(row.dow as f64 / 6.0);
        out.push(if row.is_weekend { 1.0 } else { 0.0 });
        out.push(if row.is_subscription { 1.0 } else { 0.0 });

        for name in &self.config.channel_vocab {
            let hit = Channel::VOCAB
                .iter()
                .find(|c| c.as_str() == name)
                .map(|c| *c == row.channel)
                .unwrap_or(false);
            out.push(if hit { 1.0 } else { 0.0 });
        }
        out
    }

    /// Default vocabulary/bucket-count config for a fresh training run.
    pub fn default_config(num_hash_buckets: usize, hash_seed: u64) -> EncoderConfig {
        EncoderConfig {
            num_hash_buckets,
            hash_seed,
            channel_vocab: Channel::VOCAB.iter().map(|c| c.as_str().to_string()).collect(),
        }
    }
}

/// Returns `Err(EncoderMismatch)` if `vec_len` doesn't match what `config`
/// would have produced — used by serving before trusting a loaded model.
pub fn check_dims(config: &EncoderConfig, vec_len: usize) -> Result<(), FallbackReason> {
    if vec_len != config.dims() {
        Err(FallbackReason::EncoderMismatch)
    } else {
        Ok(())
    }
}
