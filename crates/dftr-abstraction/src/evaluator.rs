//! Keypoint-voting evaluator contract.

use crate::dataset::{Batch, Pose};
use crate::network::NetworkOutput;
use crate::CollaboratorResult;
use serde::{Deserialize, Serialize};

/// Where the per-point offsets fed to voting come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    /// The network's predicted offsets.
    Network,
    /// The batch's ground-truth offsets (upper bound of the voting stage).
    GroundTruth,
}

/// Everything the evaluator sees for one batch.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    pub batch: &'a Batch,
    pub output: &'a NetworkOutput,
    pub source: PredictionSource,
}

/// Decoded pose of one object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEstimate {
    pub obj_id: u32,
    pub pose: Pose,
    /// ADD (or ADD-S for symmetric objects) distance to ground truth, in meters.
    pub add_error: Option<f32>,
    /// Whether ADD-S was used.
    pub symmetric: bool,
    /// Whether the estimate is within the accuracy threshold.
    pub correct: Option<bool>,
}

/// Converts raw network outputs into poses and scores them.
pub trait PoseEvaluator: Send {
    fn name(&self) -> &str;

    /// Decodes and scores every instance in the batch.
    ///
    /// # Errors
    /// Returns a `CollaboratorError` if decoding fails; callers must not treat this as
    /// a passing result.
    fn evaluate(&mut self, input: EvaluationInput<'_>) -> CollaboratorResult<Vec<InstanceEstimate>>;
}
