use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Filesystem layout for one object class's training run.
///
/// Default layout is under `<root>/train_log/linemod/<cls>/...`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingLayout {
    root: PathBuf,
    cls: String,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: PathBuf, cls: impl Into<String>) -> Self {
        Self { root, cls: cls.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-class log directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("train_log").join("linemod").join(&self.cls)
    }

    #[must_use]
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.log_dir().join("checkpoints")
    }

    #[must_use]
    pub fn eval_dir(&self) -> PathBuf {
        self.log_dir().join("eval_results")
    }

    /// Directory consumed by the monitoring backend.
    #[must_use]
    pub fn train_info_dir(&self) -> PathBuf {
        self.log_dir().join("train_info")
    }

    #[must_use]
    pub fn view_depth_dir(&self) -> PathBuf {
        self.eval_dir().join("view_dpt")
    }

    #[must_use]
    pub fn checkpoint_path(&self, suffix: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("DFTr_{}_{}.ckpt.json", self.cls, suffix))
    }

    #[must_use]
    pub fn checkpoint_manifest_path(&self) -> PathBuf {
        self.checkpoints_dir().join("checkpoint_manifest.json")
    }

    #[must_use]
    pub fn run_config_path(&self) -> PathBuf {
        self.log_dir().join("run_config.json")
    }

    #[must_use]
    pub fn pose_metrics_path(&self) -> PathBuf {
        self.eval_dir().join("pose_metrics.json")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(self.checkpoints_dir())?;
        std::fs::create_dir_all(self.eval_dir())?;
        std::fs::create_dir_all(self.train_info_dir())?;
        Ok(())
    }
}
