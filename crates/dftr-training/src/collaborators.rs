use crate::config::{Capabilities, ObjectClass};
use crate::error::{TrainingError, TrainingResult};
use crate::reference::{LinearOffsetNet, MeanVoteEvaluator, SyntheticFrames};
use dftr_abstraction::{DatasetProvider, PoseEvaluator, PoseNetwork};

/// Batches per split produced by the reference dataset.
pub const REFERENCE_BATCHES_PER_SPLIT: usize = 16;

/// The externally supplied pieces a run drives. Any of them may be absent.
#[derive(Default)]
pub struct Collaborators {
    pub dataset: Option<Box<dyn DatasetProvider>>,
    pub network: Option<Box<dyn PoseNetwork>>,
    pub evaluator: Option<Box<dyn PoseEvaluator>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("dataset", &self.dataset.as_ref().map(|d| d.name().to_string()))
            .field("network", &self.network.as_ref().map(|n| n.name().to_string()))
            .field("evaluator", &self.evaluator.as_ref().map(|e| e.name().to_string()))
            .finish()
    }
}

impl Collaborators {
    /// Nothing linked.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Synthetic frames, linear offset head and mean-vote evaluator for `cls`.
    #[must_use]
    pub fn reference(cls: ObjectClass, seed: u64, batch_size: usize) -> Self {
        let frames = SyntheticFrames::new(seed, REFERENCE_BATCHES_PER_SPLIT, batch_size).with_object_id(cls.dataset_id());
        let evaluator = MeanVoteEvaluator::new(cls.dataset_id(), frames.model_keypoints().to_vec(), cls.is_symmetric());
        Self {
            dataset: Some(Box::new(frames)),
            network: Some(Box::new(LinearOffsetNet::new(seed))),
            evaluator: Some(Box::new(evaluator)),
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            dataset_provider: self.dataset.is_some(),
            network: self.network.is_some(),
            evaluator: self.evaluator.is_some(),
        }
    }
}

pub(crate) fn unavailable(what: &str) -> TrainingError {
    TrainingError::CollaboratorUnavailable(format!("no {what} is linked into this build"))
}

/// Fails when a collaborator the mode needs is missing, checked on the resolved flags.
pub(crate) fn require(capabilities: Capabilities, needs_evaluator: bool) -> TrainingResult<()> {
    if !capabilities.dataset_provider {
        return Err(unavailable("dataset provider"));
    }
    if !capabilities.network {
        return Err(unavailable("pose network"));
    }
    if needs_evaluator && !capabilities.evaluator {
        return Err(unavailable("pose evaluator"));
    }
    Ok(())
}
