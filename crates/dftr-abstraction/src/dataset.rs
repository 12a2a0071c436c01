//! Dataset provider contract.

use crate::tensor::Tensor;
use crate::{CollaboratorError, CollaboratorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known batch field names.
pub mod fields {
    /// Per-point input features (xyz + rgb + normals).
    pub const POINTS: &str = "cld_rgb_nrm";
    /// Per-pixel object-id labels (segmentation ground truth).
    pub const LABELS: &str = "labels";
    /// Depth map in meters.
    pub const DEPTH: &str = "dpt_map_m";
    /// Per-point keypoint offset targets.
    pub const KEYPOINT_TARGETS: &str = "kp_targ_ofst";
    /// Per-point object-center offset targets.
    pub const CENTER_TARGETS: &str = "ctr_targ_ofst";
}

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Test,
}

/// Which slice of a split this process iterates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
}

impl Shard {
    /// The whole split.
    #[must_use]
    pub const fn single() -> Self {
        Self { rank: 0, world_size: 1 }
    }

    /// True when the item at `index` belongs to this shard (strided assignment).
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.world_size <= 1 || index % self.world_size == self.rank
    }
}

/// A rigid transform from model to camera coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl Pose {
    #[must_use]
    pub const fn identity() -> Self {
        Self { rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]], translation: [0.0; 3] }
    }

    /// Applies the transform to a point.
    #[must_use]
    pub fn transform(&self, p: [f32; 3]) -> [f32; 3] {
        let r = &self.rotation;
        let t = &self.translation;
        [
            r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + t[0],
            r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + t[1],
            r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + t[2],
        ]
    }
}

/// Ground-truth pose of one object instance in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthPose {
    pub obj_id: u32,
    pub pose: Pose,
}

/// One collated mini-batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Position of the batch within its epoch (before sharding).
    pub index: usize,
    /// Number of frames in the batch.
    pub size: usize,
    pub inputs: BTreeMap<String, Tensor>,
    pub targets: BTreeMap<String, Tensor>,
    /// Ground-truth poses, one per instance, when the split is annotated.
    #[serde(default)]
    pub ground_truth: Vec<GroundTruthPose>,
}

impl Batch {
    /// Looks up a required input field.
    ///
    /// # Errors
    /// Returns `CollaboratorError::MissingField` when the field is absent.
    pub fn input(&self, name: &str) -> CollaboratorResult<&Tensor> {
        self.inputs.get(name).ok_or_else(|| CollaboratorError::MissingField(name.to_string()))
    }

    /// Looks up a required target field.
    ///
    /// # Errors
    /// Returns `CollaboratorError::MissingField` when the field is absent.
    pub fn target(&self, name: &str) -> CollaboratorResult<&Tensor> {
        self.targets.get(name).ok_or_else(|| CollaboratorError::MissingField(name.to_string()))
    }

    /// Per-pixel object labels, `[batch, height, width]`, if the provider supplies them.
    #[must_use]
    pub fn segmentation_labels(&self) -> Option<&Tensor> {
        self.targets.get(fields::LABELS)
    }
}

/// A lazy sequence of batches for one pass over a split.
pub type BatchIter<'a> = Box<dyn Iterator<Item = CollaboratorResult<Batch>> + 'a>;

/// Produces restartable batch sequences.
///
/// Prefetching, worker threads and blocking are the provider's concern; the driver
/// only pulls from the iterator in order.
pub trait DatasetProvider: Send {
    /// Human-readable provider name used in logs.
    fn name(&self) -> &str;

    /// Number of batches one epoch of `split` yields for `shard`.
    fn batches_per_epoch(&self, split: Split, shard: Shard) -> usize;

    /// Starts a pass over `split`. Calling again restarts from the beginning.
    ///
    /// # Errors
    /// Returns a `CollaboratorError` if the split cannot be opened.
    fn batches(&mut self, split: Split, shard: Shard, epoch: usize) -> CollaboratorResult<BatchIter<'_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_assignment_is_strided() {
        let shard = Shard { rank: 1, world_size: 2 };
        let owned: Vec<usize> = (0..6).filter(|i| shard.contains(*i)).collect();
        assert_eq!(owned, vec![1, 3, 5]);
        assert!((0..6).all(|i| Shard::single().contains(i)));
    }

    #[test]
    fn test_batch_missing_field_is_reported() {
        let batch = Batch::default();
        assert_eq!(batch.input(fields::POINTS), Err(CollaboratorError::MissingField(fields::POINTS.to_string())));
        assert!(batch.segmentation_labels().is_none());
    }

    #[test]
    fn test_pose_transform() {
        let mut pose = Pose::identity();
        pose.translation = [1.0, 2.0, 3.0];
        assert_eq!(pose.transform([1.0, 1.0, 1.0]), [2.0, 3.0, 4.0]);
    }
}
