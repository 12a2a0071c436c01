//! Collaborator contracts for the DFTr training driver.
//!
//! This crate defines the boundary between the orchestration core and the pieces it
//! drives but does not implement:
//! - the pose network and its loss heads (`PoseNetwork`)
//! - the per-object dataset provider (`DatasetProvider`)
//! - the keypoint-voting evaluator (`PoseEvaluator`)
//!
//! Tensors crossing the boundary are plain host-side containers (`Tensor`,
//! `ParameterSet`) so that checkpoints, all-reduce and loss scaling can be expressed
//! without committing to a specific tensor backend.

pub mod dataset;
pub mod evaluator;
pub mod network;
pub mod tensor;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dataset::{fields, Batch, BatchIter, DatasetProvider, GroundTruthPose, Pose, Shard, Split};
pub use evaluator::{EvaluationInput, InstanceEstimate, PoseEvaluator, PredictionSource};
pub use network::{loss_terms, outputs, LossBreakdown, NetworkOutput, PoseNetwork, TrainingPass};
pub use tensor::{BatchNormLayer, BatchStatistics, ParameterSet, Tensor};

/// Represents an error raised by an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollaboratorError {
    /// A batch did not carry a field the collaborator requires.
    #[error("missing batch field: {0}")]
    MissingField(String),

    /// Two tensors (or a tensor and its declared shape) disagree.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The dataset provider failed to produce a batch.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// The network failed during forward or backward.
    #[error("network error: {0}")]
    Network(String),

    /// The pose evaluator failed to decode or score a prediction.
    #[error("evaluator error: {0}")]
    Evaluator(String),

    /// Other unexpected errors.
    #[error("collaborator error: {0}")]
    Other(String),
}

/// Result type for collaborator calls.
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;
