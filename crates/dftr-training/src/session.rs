use crate::collaborators::{require, Collaborators};
use crate::config::RunConfig;
use crate::distributed::DistributedContext;
use crate::driver::{CancellationFlag, RunSummary, TrainLoopDriver};
use crate::error::TrainingResult;
use crate::metrics::{JsonlMetricsSink, MetricsSink, NullMetricsSink};
use tracing::info;

/// Runs one invocation end to end: collaborator checks, distributed setup, the driver,
/// and teardown.
///
/// Missing collaborators are reported before any process-group setup. Only rank 0
/// writes `run_config.json` and metric events; `sink` replaces the JSONL sink there.
pub fn run_session(
    config: &RunConfig,
    collaborators: Collaborators,
    sink: Option<Box<dyn MetricsSink>>,
    cancel: CancellationFlag,
) -> TrainingResult<RunSummary> {
    require(config.capabilities, config.mode.requires_evaluator())?;
    require(collaborators.capabilities(), config.mode.requires_evaluator())?;

    if config.is_primary() {
        config.write_to_log_dir()?;
    }

    let mut dist = DistributedContext::initialize(config)?;
    let mut sink: Box<dyn MetricsSink> = match sink {
        Some(sink) if dist.is_primary() => sink,
        _ if dist.is_primary() => Box::new(JsonlMetricsSink::open(config.layout.train_info_dir())?),
        _ => Box::new(NullMetricsSink),
    };

    let result = TrainLoopDriver::new(config, collaborators, &mut dist, sink.as_mut(), cancel)
        .and_then(|mut driver| driver.run());
    sink.flush();
    dist.teardown();

    if let Ok(summary) = &result {
        info!(
            mode = %config.mode,
            epochs = summary.epochs_completed,
            step = summary.global_step,
            checkpoints = summary.checkpoints.len(),
            "run finished"
        );
    }
    result
}
