//! Filesystem-backed model registry (spec §5): each run is written to its own
//! directory, and a `current` pointer is swapped atomically so readers never
//! observe a partially-written entry.
//!
//! Layout:
//! ```text
//! <root>/runs/<run_id>/{model.bin, encoder.json, classes.json, calibrator.json, meta.json}
//! <root>/current               (text file containing a run_id)
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tracing::info;

use crate::errors::PipelineError;
use crate::model::{EncoderConfig, EvalMetrics, IsotonicCalibrator, RegistryEntry};
use crate::trainer::gbm::GbmModel;
use std::collections::HashMap;

pub struct Registry {
    root: PathBuf,
    /// Lock-free cached handle to the currently published entry, so serving
    /// never touches the filesystem on the hot path after the first load.
    current: ArcSwap<Option<RegistryEntry>>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    run_id: String,
    classes: Vec<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    metrics: EvalMetrics,
}

impl Registry {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("runs")).context("creating registry runs directory")?;
        let registry = Self {
            root,
            current: ArcSwap::from_pointee(None),
        };
        let loaded = registry.load_current_from_disk().unwrap_or(None);
        registry.current.store(Arc::new(loaded));
        Ok(registry)
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    fn current_pointer_path(&self) -> PathBuf {
        self.root.join("current")
    }

    /// Writes a completed, gate-passed training run's artifacts to its own
    /// directory and atomically advances the `current` pointer to it.
    pub fn publish(
        &self,
        run_id: &str,
        classes: &[String],
        encoder_config: &EncoderConfig,
        model: &GbmModel,
        calibrators: &HashMap<String, IsotonicCalibrator>,
        metrics: &EvalMetrics,
    ) -> Result<()> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).context("creating run directory")?;

        let model_bytes = bincode_like_serialize(model)?;
        fs::write(dir.join("model.bin"), model_bytes).context("writing model.bin")?;
        fs::write(
            dir.join("encoder.json"),
            serde_json::to_vec_pretty(encoder_config)?,
        )
        .context("writing encoder.json")?;
        fs::write(dir.join("classes.json"), serde_json::to_vec_pretty(classes)?)
            .context("writing classes.json")?;
        fs::write(
            dir.join("calibrator.json"),
            serde_json::to_vec_pretty(calibrators)?,
        )
        .context("writing calibrator.json")?;

        let meta = Meta {
            run_id: run_id.to_string(),
            classes: classes.to_vec(),
            created_at: chrono::Utc::now(),
            metrics: metrics.clone(),
        };
        fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?)
            .context("writing meta.json")?;

        // Atomic pointer swap: write to a tmp file in the same directory,
        // then rename over `current`. `rename` is atomic on the same
        // filesystem, so a reader either sees the old or the new pointer,
        // never a half-written one.
        let tmp_path = self.root.join("current.tmp");
        fs::write(&tmp_path, run_id.as_bytes()).context("writing current.tmp")?;
        fs::rename(&tmp_path, self.current_pointer_path())
            .context("renaming current.tmp to current")?;

        let entry = self
            .load(run_id)?
            .ok_or_else(|| PipelineError::RegistryIoError("just-published run not found".into()))?;
        self.current.store(Arc::new(Some(entry)));

        info!(run_id = %run_id, "published model to registry");
        Ok(())
    }

    /// Returns the currently published entry, if any, from the cached
    /// snapshot — never touches disk on the hot path.
    pub fn current(&self) -> Option<RegistryEntry> {
        (**self.current.load()).clone()
    }

    fn load_current_from_disk(&self) -> Result<Option<RegistryEntry>> {
        let pointer_path = self.current_pointer_path();
        if !pointer_path.exists() {
            return Ok(None);
        }
        let run_id = fs::read_to_string(&pointer_path)
            .context("reading current pointer")?
            .trim()
            .to_string();
        self.load(&run_id)
    }

    /// Re-reads the `current` pointer from disk and refreshes the cached
    /// snapshot — used by a periodic reload task so a separately-running
    /// trainer process's published run becomes visible without a restart.
    pub fn refresh(&self) -> Result<()> {
        let loaded = self.load_current_from_disk()?;
        self.current.store(Arc::new(loaded));
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Option<RegistryEntry>> {
        let dir = self.run_dir(run_id);
        if !dir.exists() {
            return Ok(None);
        }
        let classes: Vec<String> =
            serde_json::from_slice(&fs::read(dir.join("classes.json"))?)?;
        let encoder_config: EncoderConfig =
            serde_json::from_slice(&fs::read(dir.join("encoder.json"))?)?;
        let calibrator: Option<HashMap<String, IsotonicCalibrator>> =
            match fs::read(dir.join("calibrator.json")) {
                Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
                Err(_) => None,
            };
        let meta: Meta = serde_json::from_slice(&fs::read(dir.join("meta.json"))?)?;

        Ok(Some(RegistryEntry {
            run_id: run_id.to_string(),
            classes,
            encoder_config,
            calibrator,
            created_at: meta.created_at,
            metrics: meta.metrics,
        }))
    }

    pub fn load_model(&self, run_id: &str) -> Result<GbmModel> {
        let bytes = fs::read(self.run_dir(run_id).join("model.bin"))
            .context("reading model.bin")?;
        bincode_like_deserialize(&bytes)
    }

    /// Deletes every run directory not referenced by `current`, keeping only
    /// the `keep_last` most recently created runs (by directory mtime) plus
    /// whichever run is currently published.
    pub fn gc(&self, keep_last: usize) -> Result<usize> {
        let current_run_id = self.current().map(|e| e.run_id);
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = fs::read_dir(self.runs_dir())
            .context("reading runs directory")?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                e.metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .map(|mtime| (e.path(), mtime))
            })
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = 0;
        for (idx, (path, _)) in entries.iter().enumerate() {
            let run_id = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let is_current = current_run_id.as_deref() == Some(run_id);
            if idx >= keep_last && !is_current {
                fs::remove_dir_all(path).context("removing stale run directory")?;
                removed += 1;
            }
        }
        info!(removed, "registry garbage collection complete");
        Ok(removed)
    }
}

/// The model artifact format is JSON rather than a binary serialization
/// crate — the pipeline has no existing bincode dependency, and the model's
/// tree structures are small enough that JSON's overhead doesn't matter.
fn bincode_like_serialize(model: &GbmModel) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(model)?)
}

fn bincode_like_deserialize(bytes: &[u8]) -> Result<GbmModel> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::gbm;

    #[test]
    fn publish_then_load_current_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        assert!(registry.current().is_none());

        let classes = vec!["a".to_string(), "b".to_string()];
        let encoder_config = EncoderConfig {
            num_hash_buckets: 16,
            hash_seed: 1,
            channel_vocab: vec!["pos".into()],
        };
        let rows = vec![vec![0.0; 19], vec![1.0; 19]];
        let (model, _) = gbm::train(&rows, &[0, 1], &[1.0, 1.0], &classes, 2, 2, 1, None);
        let calibrators = HashMap::new();
        let metrics = EvalMetrics::default();

        registry
            .publish("run-1", &classes, &encoder_config, &model, &calibrators, &metrics)
            .unwrap();

        let current = registry.current().unwrap();
        assert_eq!(current.run_id, "run-1");
        assert_eq!(current.classes, classes);
    }

    #[test]
    fn gc_keeps_current_run_even_if_old() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();
        let classes = vec!["a".to_string()];
        let encoder_config = EncoderConfig {
            num_hash_buckets: 8,
            hash_seed: 1,
            channel_vocab: vec![],
        };
        let rows = vec![vec![0.0; 10]];
        let (model, _) = gbm::train(&rows, &[0], &[1.0], &classes, 1, 1, 1, None);
        let metrics = EvalMetrics::default();
        registry
            .publish("keepme", &classes, &encoder_config, &model, &HashMap::new(), &metrics)
            .unwrap();

        let removed = registry.gc(0).unwrap();
        assert_eq!(removed, 0);
        assert!(registry.current().is_some());
    }
}
