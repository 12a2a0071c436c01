//! DFTr Training
//!
//! Orchestration core for per-object Linemod pose training:
//! - Resolving an immutable run configuration (`ConfigResolver`, `RunConfig`)
//! - Multi-process coordination (`DistributedContext`)
//! - Loss scaling, schedules and the optimizer (`PrecisionManager`, `OptimizationScheduler`)
//! - Checkpoint save/resume (`CheckpointManager`)
//! - The mode state machine and evaluation (`TrainLoopDriver`, `EvalRunner`)
//! - Metric events (`MetricsSink`)

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod distributed;
pub mod driver;
pub mod env_check;
pub mod error;
pub mod eval;
pub mod layout;
pub mod metrics;
pub mod optimizer;
pub mod palette;
pub mod precision;
pub mod reference;
pub mod scheduler;
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointManifest, CheckpointTag, ResumePoint, CHECKPOINT_FORMAT_VERSION};
pub use collaborators::Collaborators;
pub use config::{
    parse_device_list, Capabilities, ConfigResolver, DebugLimits, DistributedConfig, LrPolicy, Mode, ModeFlags,
    ObjectClass, Overrides, PrecisionConfig, RunConfig, ScheduleConfig,
};
pub use distributed::{DistributedContext, DistributedState, GroupTimeouts, ProcessGroup, TcpProcessGroup};
pub use driver::{CancellationFlag, RunSummary, TrainLoopDriver};
pub use env_check::{CheckItem, CheckLevel, EnvironmentChecker, EnvironmentReport, ObjectDataStatus};
pub use error::{exit_codes, TrainingError, TrainingResult};
pub use eval::{EvalRunner, ObjectSummary, PoseEstimate, PoseSummary};
pub use layout::TrainingLayout;
pub use metrics::{
    EpochMetrics, JsonlMetricsSink, MemoryMetricsSink, MetricAccumulator, MetricEvent, MetricValue, MetricsSink,
    NullMetricsSink,
};
pub use optimizer::{Adam, AdamState, ParamGroup};
pub use palette::Palette;
pub use precision::{PrecisionManager, PrecisionState, StepOutcome, StepReport};
pub use scheduler::{OptimizationScheduler, OptimizationState, Schedule};
pub use session::run_session;
