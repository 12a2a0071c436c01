//! Pose network contract.

use crate::dataset::Batch;
use crate::tensor::{BatchNormLayer, BatchStatistics, ParameterSet, Tensor};
use crate::CollaboratorResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Names of the auxiliary loss terms a network reports.
pub mod loss_terms {
    /// Focal loss of the RGB-D semantic segmentation head.
    pub const SEGMENTATION: &str = "loss_rgbd_seg";
    /// Keypoint offset regression loss.
    pub const KEYPOINT_OFFSET: &str = "loss_kp_of";
    /// Object-center offset regression loss.
    pub const CENTER_OFFSET: &str = "loss_ctr_of";
    /// Orientation consistency (cosine) loss.
    pub const ORIENTATION: &str = "loss_cos";
}

/// Names of raw network outputs handed to the evaluator.
pub mod outputs {
    pub const SEGMENTATION: &str = "pred_rgbd_segs";
    pub const KEYPOINT_OFFSETS: &str = "pred_kp_ofs";
    pub const CENTER_OFFSETS: &str = "pred_ctr_ofs";
}

/// Scalar loss plus its named components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// The loss that is scaled and back-propagated.
    pub total: f32,
    pub terms: BTreeMap<String, f32>,
}

/// Result of one forward/backward pass.
#[derive(Debug, Clone)]
pub struct TrainingPass {
    /// Unscaled losses.
    pub losses: LossBreakdown,
    /// Gradients of `losses.total * loss_scale` with respect to every parameter.
    pub gradients: ParameterSet,
    /// Batch statistics observed by each batch-norm layer during the forward pass.
    pub batch_statistics: Vec<BatchStatistics>,
}

/// Raw inference outputs, keyed by the names in [`outputs`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkOutput {
    pub tensors: BTreeMap<String, Tensor>,
}

impl NetworkOutput {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}

/// The fusion backbone and its loss heads, seen from the driver.
///
/// Implementations own their parameters and batch-norm layers; the driver mutates them
/// only through the accessors below (optimizer updates, schedule changes, checkpoint
/// restore). Batch-norm running statistics are never updated by the network itself:
/// the driver folds in the reported `BatchStatistics` (synchronized across devices when
/// distributed).
pub trait PoseNetwork: Send {
    /// Architecture name, recorded in checkpoints.
    fn name(&self) -> &str;

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;

    fn batch_norm_layers(&self) -> &[BatchNormLayer];

    fn batch_norm_layers_mut(&mut self) -> &mut [BatchNormLayer];

    /// Runs forward and backward on a training batch.
    ///
    /// The returned gradients are those of `total * loss_scale`.
    ///
    /// # Errors
    /// Returns a `CollaboratorError` if the batch is malformed or the pass fails.
    fn forward_backward(&mut self, batch: &Batch, loss_scale: f32) -> CollaboratorResult<TrainingPass>;

    /// Computes losses without gradient tracking.
    ///
    /// # Errors
    /// Returns a `CollaboratorError` if the batch is malformed.
    fn evaluate_loss(&self, batch: &Batch) -> CollaboratorResult<LossBreakdown>;

    /// Runs inference without gradient tracking.
    ///
    /// # Errors
    /// Returns a `CollaboratorError` if the batch is malformed.
    fn infer(&self, batch: &Batch) -> CollaboratorResult<NetworkOutput>;
}
