use dftr_abstraction::CollaboratorError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Process exit codes, one per failure class so launchers can tell them apart.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const CONFIGURATION: i32 = 2;
    pub const ENVIRONMENT_NOT_READY: i32 = 3;
    pub const DISTRIBUTED_INIT: i32 = 4;
    pub const CHECKPOINT_LOAD: i32 = 5;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("distributed init error: {0}")]
    DistributedInit(String),

    #[error("distributed communication error: {0}")]
    Distributed(String),

    #[error("checkpoint load error: {0}")]
    CheckpointLoad(String),

    #[error("invalid schedule input: global step {0} is negative")]
    InvalidScheduleInput(i64),

    #[error("required collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("run interrupted after epoch {epoch}, step {step}")]
    Interrupted { epoch: usize, step: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    /// Exit code for this failure class.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::InvalidScheduleInput(_) => exit_codes::CONFIGURATION,
            Self::CollaboratorUnavailable(_) => exit_codes::ENVIRONMENT_NOT_READY,
            Self::DistributedInit(_) => exit_codes::DISTRIBUTED_INIT,
            Self::CheckpointLoad(_) => exit_codes::CHECKPOINT_LOAD,
            Self::Interrupted { .. } => exit_codes::INTERRUPTED,
            _ => exit_codes::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_failure_class() {
        let codes = [
            TrainingError::Configuration("x".into()).exit_code(),
            TrainingError::CollaboratorUnavailable("x".into()).exit_code(),
            TrainingError::DistributedInit("x".into()).exit_code(),
            TrainingError::CheckpointLoad("x".into()).exit_code(),
            TrainingError::Evaluation("x".into()).exit_code(),
        ];
        let mut unique = codes.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c != exit_codes::SUCCESS));
    }
}
