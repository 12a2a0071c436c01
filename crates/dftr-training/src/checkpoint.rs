//! Versioned training snapshots with atomic writes and a digest manifest.

use crate::config::{ObjectClass, RunConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::metrics::EpochMetrics;
use crate::precision::{PrecisionManager, PrecisionState};
use crate::scheduler::{OptimizationScheduler, OptimizationState};
use chrono::{DateTime, Utc};
use dftr_abstraction::{BatchNormLayer, ParameterSet, PoseNetwork};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CHECKPOINT_FORMAT_VERSION: u32 = 2;

const MANIFEST_FILE: &str = "checkpoint_manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub cls: ObjectClass,
    pub network: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    /// Completed epochs.
    pub epoch: usize,
    /// Batches of epoch `epoch` already applied; zero at epoch boundaries.
    #[serde(default)]
    pub batches_done: usize,
    pub global_step: u64,
    pub parameters: ParameterSet,
    pub batch_norm: Vec<BatchNormLayer>,
    pub optimization: OptimizationState,
    pub precision: PrecisionState,
    /// Lowest validation loss seen so far.
    pub best_metric: Option<f64>,
    #[serde(default)]
    pub metrics: EpochMetrics,
}

/// Where training picks up after a restore.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumePoint {
    pub epoch: usize,
    /// Batches of `epoch` to skip before training continues.
    pub batches_done: usize,
    pub global_step: u64,
    pub best_metric: Option<f64>,
}

impl Checkpoint {
    /// Snapshots the full training state.
    #[must_use]
    pub fn capture(
        config: &RunConfig,
        network: &dyn PoseNetwork,
        scheduler: &OptimizationScheduler,
        precision: &PrecisionManager,
        epoch: usize,
        best_metric: Option<f64>,
        metrics: EpochMetrics,
    ) -> Self {
        Self {
            format_version: CHECKPOINT_FORMAT_VERSION,
            cls: config.cls,
            network: network.name().to_string(),
            run_id: config.run_id.clone(),
            created_at: Utc::now(),
            epoch,
            batches_done: 0,
            global_step: scheduler.step(),
            parameters: network.parameters().clone(),
            batch_norm: network.batch_norm_layers().to_vec(),
            optimization: scheduler.state(),
            precision: precision.state().clone(),
            best_metric,
            metrics,
        }
    }

    /// Checks every component against the live objects before touching any of them.
    fn check_compatible(&self, network: &dyn PoseNetwork) -> TrainingResult<()> {
        let mismatch = |msg: String| -> TrainingResult<()> { Err(TrainingError::CheckpointLoad(msg)) };
        if self.network != network.name() {
            return mismatch(format!("checkpoint holds network '{}', run uses '{}'", self.network, network.name()));
        }
        let params = network.parameters();
        if let Some(diff) = params.layout_mismatch(&self.parameters) {
            return mismatch(format!("model parameters: {diff}"));
        }
        for (name, buffer) in
            [("exp_avg", &self.optimization.optimizer.exp_avg), ("exp_avg_sq", &self.optimization.optimizer.exp_avg_sq)]
        {
            if let Some(diff) = params.layout_mismatch(buffer) {
                return mismatch(format!("optimizer {name}: {diff}"));
            }
        }
        let live = network.batch_norm_layers();
        if live.len() != self.batch_norm.len() {
            return mismatch(format!("{} batch-norm layers stored, network has {}", self.batch_norm.len(), live.len()));
        }
        for (stored, layer) in self.batch_norm.iter().zip(live) {
            if stored.name != layer.name || stored.features() != layer.features() {
                return mismatch(format!(
                    "batch-norm layer '{}' ({} features) does not match '{}' ({} features)",
                    stored.name,
                    stored.features(),
                    layer.name,
                    layer.features()
                ));
            }
        }
        if !self.precision.loss_scale.is_finite() || self.precision.loss_scale <= 0.0 {
            return mismatch(format!("invalid loss scale {}", self.precision.loss_scale));
        }
        Ok(())
    }

    /// Restores network, optimizer, schedule and precision state; all or nothing.
    pub fn restore_into(
        self,
        network: &mut dyn PoseNetwork,
        scheduler: &mut OptimizationScheduler,
        precision: &mut PrecisionManager,
    ) -> TrainingResult<ResumePoint> {
        self.check_compatible(&*network)?;

        let resume = ResumePoint {
            epoch: self.epoch,
            batches_done: self.batches_done,
            global_step: self.global_step,
            best_metric: self.best_metric,
        };
        *network.parameters_mut() = self.parameters;
        for (layer, stored) in network.batch_norm_layers_mut().iter_mut().zip(self.batch_norm) {
            *layer = stored;
        }
        scheduler.restore(self.optimization, network)?;
        precision.restore(self.precision);
        Ok(resume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    Epoch(usize),
    Best,
    Interrupted,
}

impl CheckpointTag {
    #[must_use]
    pub fn suffix(self) -> String {
        match self {
            Self::Epoch(e) => format!("epoch_{e:04}"),
            Self::Best => "best".to_string(),
            Self::Interrupted => "interrupted".to_string(),
        }
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub sha256: String,
    pub tag: String,
    pub epoch: usize,
    pub global_step: u64,
    pub created_at: DateTime<Utc>,
}

/// File name to digest, kept beside the checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl CheckpointManifest {
    fn read(path: &Path) -> TrainingResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes to a sibling temporary file, syncs, then renames over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_err(path: &Path, msg: impl fmt::Display) -> TrainingError {
    TrainingError::CheckpointLoad(format!("{}: {}", path.display(), msg))
}

/// Saves and loads checkpoints for one class; only the primary rank writes.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    layout: TrainingLayout,
    cls: ObjectClass,
    writer: bool,
    best: Option<f64>,
}

impl CheckpointManager {
    /// Builds a manager whose best metric starts from the stored "best" checkpoint, if any.
    #[must_use]
    pub fn new(layout: TrainingLayout, cls: ObjectClass, writer: bool) -> Self {
        let mut manager = Self { layout, cls, writer, best: None };
        manager.best = manager.stored_best_metric();
        manager
    }

    fn stored_best_metric(&self) -> Option<f64> {
        let path = self.path_for(CheckpointTag::Best);
        if !path.is_file() {
            return None;
        }
        match self.load(&path) {
            Ok(best) => {
                debug!(path = %path.display(), best_metric = ?best.best_metric, "found stored best checkpoint");
                best.best_metric.filter(|m| m.is_finite())
            }
            Err(e) => {
                warn!(error = %e, "ignoring unreadable best checkpoint");
                None
            }
        }
    }

    #[must_use]
    pub fn best_metric(&self) -> Option<f64> {
        self.best
    }

    /// Lowers the tracked best to `metric` when it improves on it.
    pub fn observe_best_metric(&mut self, metric: Option<f64>) {
        if let Some(m) = metric.filter(|m| m.is_finite()) {
            if self.best.is_none_or(|best| m < best) {
                self.best = Some(m);
            }
        }
    }

    #[must_use]
    pub fn path_for(&self, tag: CheckpointTag) -> PathBuf {
        self.layout.checkpoint_path(&tag.suffix())
    }

    /// Writes `checkpoint` under `tag`. Returns the path, or `None` on non-writing ranks.
    pub fn save(&mut self, checkpoint: &Checkpoint, tag: CheckpointTag) -> TrainingResult<Option<PathBuf>> {
        if !self.writer {
            return Ok(None);
        }
        let path = self.path_for(tag);
        let bytes = serde_json::to_vec(checkpoint)?;
        write_atomic(&path, &bytes)?;

        let manifest_path = self.layout.checkpoint_manifest_path();
        let mut manifest = CheckpointManifest::read(&manifest_path)?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        manifest.entries.insert(
            file_name,
            ManifestEntry {
                sha256: sha256_bytes(&bytes),
                tag: tag.suffix(),
                epoch: checkpoint.epoch,
                global_step: checkpoint.global_step,
                created_at: checkpoint.created_at,
            },
        );
        write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)?;

        info!(path = %path.display(), epoch = checkpoint.epoch, step = checkpoint.global_step, %tag, "checkpoint saved");
        Ok(Some(path))
    }

    /// Saves as "best" only when `metric` strictly improves on the best seen (lower is better).
    pub fn save_if_best(&mut self, checkpoint: &mut Checkpoint, metric: f64) -> TrainingResult<bool> {
        if !metric.is_finite() || self.best.is_some_and(|best| metric >= best) {
            return Ok(false);
        }
        self.best = Some(metric);
        checkpoint.best_metric = Some(metric);
        self.save(checkpoint, CheckpointTag::Best)?;
        Ok(true)
    }

    /// Reads and validates a checkpoint for this manager's class.
    ///
    /// Nothing is applied here; use [`Checkpoint::restore_into`] for that.
    pub fn load(&self, path: &Path) -> TrainingResult<Checkpoint> {
        if !path.is_file() {
            return Err(load_err(path, "no such checkpoint file"));
        }
        let bytes = std::fs::read(path).map_err(|e| load_err(path, e))?;

        if let Some(dir) = path.parent() {
            let manifest = CheckpointManifest::read(&dir.join(MANIFEST_FILE)).map_err(|e| load_err(path, e))?;
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if let Some(entry) = manifest.entries.get(&name) {
                let digest = sha256_bytes(&bytes);
                if digest != entry.sha256 {
                    return Err(load_err(path, format!("digest {} does not match manifest {}", digest, entry.sha256)));
                }
            }
        }

        let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| load_err(path, e))?;
        let version = value.get("format_version").and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(CHECKPOINT_FORMAT_VERSION)) {
            return Err(load_err(
                path,
                format!("format version {:?} is not supported (expected {})", version, CHECKPOINT_FORMAT_VERSION),
            ));
        }
        let checkpoint: Checkpoint = serde_json::from_value(value).map_err(|e| load_err(path, e))?;
        if checkpoint.cls != self.cls {
            return Err(load_err(
                path,
                format!("checkpoint was trained for '{}', this run is '{}'", checkpoint.cls, self.cls),
            ));
        }
        debug!(path = %path.display(), epoch = checkpoint.epoch, step = checkpoint.global_step, "checkpoint loaded");
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrecisionConfig, ScheduleConfig};
    use crate::reference::LinearOffsetNet;
    use crate::scheduler::Schedule;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        layout: TrainingLayout,
        net: LinearOffsetNet,
        scheduler: OptimizationScheduler,
        precision: PrecisionManager,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path().to_path_buf(), "ape");
        layout.ensure_dirs().unwrap();
        let net = LinearOffsetNet::new(0);
        let scheduler =
            OptimizationScheduler::new(Schedule::new(ScheduleConfig::default(), 1, 1, 1), net.parameters(), Vec::new());
        Fixture { _temp: temp, layout, net, scheduler, precision: PrecisionManager::new(PrecisionConfig::default()) }
    }

    fn snapshot(f: &Fixture, cls: ObjectClass) -> Checkpoint {
        Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            cls,
            network: f.net.name().to_string(),
            run_id: "run".into(),
            created_at: Utc::now(),
            epoch: 1,
            batches_done: 0,
            global_step: f.scheduler.step(),
            parameters: f.net.parameters().clone(),
            batch_norm: f.net.batch_norm_layers().to_vec(),
            optimization: f.scheduler.state(),
            precision: f.precision.state().clone(),
            best_metric: None,
            metrics: EpochMetrics::new(),
        }
    }

    #[test]
    fn test_save_writes_manifest_and_no_tmp() {
        let f = fixture();
        let mut manager = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, true);
        let path = manager.save(&snapshot(&f, ObjectClass::Ape), CheckpointTag::Epoch(1)).unwrap().unwrap();

        assert!(path.ends_with("DFTr_ape_epoch_0001.ckpt.json"));
        let manifest = CheckpointManifest::read(&f.layout.checkpoint_manifest_path()).unwrap();
        assert!(manifest.entries.contains_key("DFTr_ape_epoch_0001.ckpt.json"));
        let leftovers: Vec<_> = std::fs::read_dir(f.layout.checkpoints_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_best_only_on_strict_improvement() {
        let f = fixture();
        let mut manager = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, true);
        let mut ckpt = snapshot(&f, ObjectClass::Ape);

        assert!(manager.save_if_best(&mut ckpt, 1.0).unwrap());
        assert!(!manager.save_if_best(&mut ckpt, 1.0).unwrap());
        assert!(!manager.save_if_best(&mut ckpt, 2.0).unwrap());
        assert!(manager.save_if_best(&mut ckpt, 0.5).unwrap());

        let best = manager.load(&manager.path_for(CheckpointTag::Best)).unwrap();
        assert_eq!(best.best_metric, Some(0.5));
    }

    #[test]
    fn test_new_manager_keeps_better_stored_best() {
        let f = fixture();
        let mut first = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, true);
        assert!(first.save_if_best(&mut snapshot(&f, ObjectClass::Ape), 0.5).unwrap());

        let mut second = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, true);
        assert_eq!(second.best_metric(), Some(0.5));
        assert!(!second.save_if_best(&mut snapshot(&f, ObjectClass::Ape), 1.0).unwrap());
        let stored = second.load(&second.path_for(CheckpointTag::Best)).unwrap();
        assert_eq!(stored.best_metric, Some(0.5));

        assert!(second.save_if_best(&mut snapshot(&f, ObjectClass::Ape), 0.25).unwrap());
        assert_eq!(CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, false).best_metric(), Some(0.25));
    }

    #[test]
    fn test_observe_best_metric_only_lowers() {
        let f = fixture();
        let mut manager = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, true);
        manager.observe_best_metric(None);
        assert_eq!(manager.best_metric(), None);
        manager.observe_best_metric(Some(0.8));
        manager.observe_best_metric(Some(0.9));
        manager.observe_best_metric(Some(f64::NAN));
        assert_eq!(manager.best_metric(), Some(0.8));
    }

    #[test]
    fn test_non_writer_rank_writes_nothing() {
        let f = fixture();
        let mut manager = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, false);
        assert!(manager.save(&snapshot(&f, ObjectClass::Ape), CheckpointTag::Epoch(1)).unwrap().is_none());
        assert!(!manager.path_for(CheckpointTag::Epoch(1)).exists());
    }

    #[test]
    fn test_load_rejects_other_class_version_and_tampering() {
        let f = fixture();
        let mut cat_manager = CheckpointManager::new(f.layout.clone(), ObjectClass::Cat, true);
        let path = cat_manager.save(&snapshot(&f, ObjectClass::Cat), CheckpointTag::Best).unwrap().unwrap();

        let ape_manager = CheckpointManager::new(f.layout.clone(), ObjectClass::Ape, true);
        assert!(matches!(ape_manager.load(&path), Err(TrainingError::CheckpointLoad(_))));
        assert!(matches!(
            ape_manager.load(&f.layout.checkpoints_dir().join("missing.ckpt.json")),
            Err(TrainingError::CheckpointLoad(_))
        ));

        let mut old = snapshot(&f, ObjectClass::Cat);
        old.format_version = 0;
        let old_path = f.layout.checkpoints_dir().join("old.ckpt.json");
        std::fs::write(&old_path, serde_json::to_vec(&old).unwrap()).unwrap();
        let err = cat_manager.load(&old_path).unwrap_err();
        assert!(err.to_string().contains("format version"));

        std::fs::write(&path, b"{}").unwrap();
        let err = cat_manager.load(&path).unwrap_err();
        assert!(err.to_string().contains("digest"));
    }

    #[test]
    fn test_restore_is_all_or_nothing() {
        let mut f = fixture();
        let mut ckpt = snapshot(&f, ObjectClass::Ape);
        ckpt.parameters.get_mut("head.bias").unwrap().data_mut()[0] = 42.0;
        ckpt.optimization.optimizer.exp_avg = ParameterSet::new();
        let before = f.net.parameters().clone();

        let err = ckpt.restore_into(&mut f.net, &mut f.scheduler, &mut f.precision).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointLoad(_)));
        assert_eq!(f.net.parameters(), &before);
    }
}
