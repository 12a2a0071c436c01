//! The per-run mode state machine.
//!
//! Train and Debug run the optimization loop; the evaluation modes replay the current
//! (or restored) weights over the test split without touching the optimizer, the
//! schedule or the loss scale.

use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointTag};
use crate::collaborators::{unavailable, Collaborators};
use crate::config::{Mode, RunConfig};
use crate::distributed::DistributedContext;
use crate::error::{TrainingError, TrainingResult};
use crate::eval::{EvalRunner, PoseSummary};
use crate::metrics::{EpochMetrics, MetricAccumulator, MetricEvent, MetricsSink};
use crate::palette::Palette;
use crate::precision::{PrecisionManager, StepOutcome};
use crate::scheduler::{OptimizationScheduler, Schedule};
use dftr_abstraction::dataset::fields;
use dftr_abstraction::network::outputs;
use dftr_abstraction::{DatasetProvider, PoseEvaluator, PoseNetwork, PredictionSource, Shard, Split};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Set from a signal handler; polled by the driver between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub mode: Option<Mode>,
    pub epochs_completed: usize,
    pub global_step: u64,
    pub overflow_skips: u64,
    pub loss_scale: Option<f32>,
    pub best_metric: Option<f64>,
    pub checkpoints: Vec<PathBuf>,
    pub metrics: EpochMetrics,
    pub pose: Option<PoseSummary>,
    pub images: Vec<PathBuf>,
}

/// Agrees on cancellation across ranks so every rank stops before the same step.
///
/// A failed exchange still counts as cancelled when this rank's own flag is set, so the
/// writer can flush even after a peer has already left.
fn cancel_agreed(cancel: &CancellationFlag, dist: &mut DistributedContext) -> TrainingResult<bool> {
    let local = cancel.is_cancelled();
    let mut votes = [if local { 1.0_f32 } else { 0.0 }];
    match dist.all_reduce_sum(&mut votes) {
        Ok(()) => Ok(votes[0] > 0.0),
        Err(e) if local => {
            warn!(error = %e, "cancel exchange failed, stopping locally");
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

/// Stops an evaluation pass; nothing is flushed.
fn check_cancelled(cancel: &CancellationFlag, batches_done: u64) -> TrainingResult<()> {
    if cancel.is_cancelled() {
        return Err(TrainingError::Interrupted { epoch: 0, step: batches_done });
    }
    Ok(())
}

pub struct TrainLoopDriver<'a> {
    config: &'a RunConfig,
    dist: &'a mut DistributedContext,
    sink: &'a mut dyn MetricsSink,
    cancel: CancellationFlag,
    dataset: Box<dyn DatasetProvider>,
    network: Box<dyn PoseNetwork>,
    evaluator: Option<Box<dyn PoseEvaluator>>,
}

impl<'a> TrainLoopDriver<'a> {
    /// Takes ownership of the collaborators; dataset and network are mandatory.
    pub fn new(
        config: &'a RunConfig,
        collaborators: Collaborators,
        dist: &'a mut DistributedContext,
        sink: &'a mut dyn MetricsSink,
        cancel: CancellationFlag,
    ) -> TrainingResult<Self> {
        let dataset = collaborators.dataset.ok_or_else(|| unavailable("dataset provider"))?;
        let network = collaborators.network.ok_or_else(|| unavailable("pose network"))?;
        Ok(Self { config, dist, sink, cancel, dataset, network, evaluator: collaborators.evaluator })
    }

    /// The network in its current state.
    #[must_use]
    pub fn network(&self) -> &dyn PoseNetwork {
        self.network.as_ref()
    }

    fn shard(&self) -> Shard {
        Shard { rank: self.dist.rank(), world_size: self.dist.world_size() }
    }

    fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(self.config.layout.clone(), self.config.cls, self.dist.is_primary())
    }

    pub fn run(&mut self) -> TrainingResult<RunSummary> {
        info!(
            cls = %self.config.cls,
            mode = %self.config.mode,
            rank = self.dist.rank(),
            world_size = self.dist.world_size(),
            dataset = self.dataset.name(),
            network = self.network.name(),
            "run starting"
        );
        let mut summary = match self.config.mode {
            Mode::Train | Mode::Debug => self.train(),
            Mode::Test => self.test_losses(),
            Mode::TestPose => self.test_pose(PredictionSource::Network, false),
            Mode::TestGroundTruth => self.test_pose(PredictionSource::GroundTruth, false),
            Mode::CalibrateMetrics => self.test_pose(PredictionSource::Network, true),
            Mode::ViewDepth => self.view_depth(),
        }?;
        summary.mode = Some(self.config.mode);
        self.sink.flush();
        Ok(summary)
    }

    fn train(&mut self) -> TrainingResult<RunSummary> {
        let config = self.config;
        let shard = self.shard();
        let cap = config.batch_cap().unwrap_or(usize::MAX);
        let epochs = config.effective_epochs();
        let batches_per_epoch = self.dataset.batches_per_epoch(Split::Train, shard).min(cap);

        let schedule = Schedule::new(config.schedule.clone(), epochs, batches_per_epoch, self.dist.world_size());
        let groups = config.schedule.param_groups.clone();
        let mut scheduler = OptimizationScheduler::new(schedule, self.network.parameters(), groups);
        let mut precision = PrecisionManager::new(config.precision.clone());
        let mut checkpoints = self.checkpoint_manager();
        let mut summary = RunSummary::default();

        let mut start_epoch = 0;
        let mut resume_skip = 0;
        if let Some(path) = &config.checkpoint {
            let resume = checkpoints.load(path)?.restore_into(self.network.as_mut(), &mut scheduler, &mut precision)?;
            checkpoints.observe_best_metric(resume.best_metric);
            start_epoch = resume.epoch;
            resume_skip = resume.batches_done;
            info!(
                path = %path.display(),
                epoch = resume.epoch,
                batches_done = resume.batches_done,
                step = resume.global_step,
                "resumed from checkpoint"
            );
        }
        if start_epoch >= epochs {
            warn!(start_epoch, epochs, "checkpoint already covers the epoch budget, nothing to train");
        }

        let mut epoch_metrics = EpochMetrics::new();
        for epoch in start_epoch..epochs {
            let mut acc = MetricAccumulator::new();
            let mut batches_done = std::mem::take(&mut resume_skip);
            let mut batches = self.dataset.batches(Split::Train, shard, epoch)?.take(cap).skip(batches_done);

            loop {
                if cancel_agreed(&self.cancel, self.dist)? {
                    drop(batches);
                    let ckpt = Checkpoint {
                        batches_done,
                        ..Checkpoint::capture(
                            config,
                            self.network.as_ref(),
                            &scheduler,
                            &precision,
                            epoch,
                            checkpoints.best_metric(),
                            acc.finish("train"),
                        )
                    };
                    if let Err(e) = checkpoints.save(&ckpt, CheckpointTag::Interrupted) {
                        warn!(error = %e, "failed to flush checkpoint on interrupt");
                    }
                    return Err(TrainingError::Interrupted { epoch, step: scheduler.step() });
                }
                let Some(batch) = batches.next() else { break };
                let batch = batch?;
                batches_done += 1;

                let step = scheduler.step();
                let (lr, momentum) = scheduler.advance(step as i64, self.network.as_mut())?;
                let report = precision.step(&batch, self.network.as_mut(), &mut scheduler, self.dist)?;
                acc.add_losses(&report.losses);
                if report.outcome == StepOutcome::Skipped {
                    acc.add("skipped", 1.0);
                } else {
                    acc.add("skipped", 0.0);
                }

                self.sink.record(MetricEvent::Scalar { tag: "train/loss".into(), step, value: f64::from(report.losses.total) });
                self.sink.record(MetricEvent::Scalar { tag: "train/lr".into(), step, value: lr });
                self.sink.record(MetricEvent::Scalar { tag: "train/bn_momentum".into(), step, value: momentum });
                self.sink.record(MetricEvent::Scalar {
                    tag: "train/loss_scale".into(),
                    step,
                    value: f64::from(report.loss_scale),
                });
                debug!(epoch, batch = batch.index, step, loss = report.losses.total, outcome = ?report.outcome, "step");
            }
            drop(batches);

            precision.end_epoch(epoch);
            let completed = epoch + 1;
            let mut metrics = acc.finish("train");
            metrics.insert_scalar("train/lr", scheduler.learning_rate());
            metrics.insert_scalar("train/bn_momentum", scheduler.bn_momentum());
            metrics.insert_scalar("train/loss_scale", f64::from(precision.loss_scale()));
            metrics.insert_scalar("train/overflow_skips", precision.state().overflow_skips as f64);

            let validation = if config.mode == Mode::Train { Some(self.validation_loss(epoch)?) } else { None };
            if let Some(val) = validation {
                metrics.insert_scalar("val/loss", val);
            }
            info!(
                epoch = completed,
                step = scheduler.step(),
                loss = metrics.scalar("train/loss"),
                val_loss = validation,
                lr = scheduler.learning_rate(),
                "epoch finished"
            );
            self.sink.record(MetricEvent::Epoch { phase: "train".into(), epoch: completed, metrics: metrics.clone() });

            let mut ckpt = Checkpoint::capture(
                config,
                self.network.as_ref(),
                &scheduler,
                &precision,
                completed,
                checkpoints.best_metric(),
                metrics.clone(),
            );
            if let Some(val) = validation {
                if checkpoints.save_if_best(&mut ckpt, val)? && self.dist.is_primary() {
                    info!(epoch = completed, val_loss = val, "new best checkpoint");
                    summary.checkpoints.push(checkpoints.path_for(CheckpointTag::Best));
                }
            }
            ckpt.best_metric = checkpoints.best_metric();
            if completed % config.checkpoint_interval == 0 || completed == epochs {
                if let Some(path) = checkpoints.save(&ckpt, CheckpointTag::Epoch(completed))? {
                    summary.checkpoints.push(path);
                }
            }
            summary.epochs_completed = completed;
            epoch_metrics = metrics;
        }

        summary.global_step = scheduler.step();
        summary.overflow_skips = precision.state().overflow_skips;
        summary.loss_scale = Some(precision.loss_scale());
        summary.best_metric = checkpoints.best_metric();
        summary.metrics = epoch_metrics;
        Ok(summary)
    }

    /// Mean total loss over the test split, averaged across ranks.
    fn validation_loss(&mut self, epoch: usize) -> TrainingResult<f64> {
        let shard = self.shard();
        let mut acc = MetricAccumulator::new();
        for batch in self.dataset.batches(Split::Test, shard, epoch)? {
            let losses = self.network.evaluate_loss(&batch?)?;
            acc.add_losses(&losses);
        }
        let (sum, count) = acc.totals("loss");
        let mut buf = [sum as f32, count as f32];
        self.dist.all_reduce_sum(&mut buf)?;
        if buf[1] <= 0.0 {
            return Ok(f64::INFINITY);
        }
        Ok(f64::from(buf[0]) / f64::from(buf[1]))
    }

    /// Restores weights for an evaluation mode when a checkpoint was given.
    fn restore_for_eval(&mut self) -> TrainingResult<usize> {
        let Some(path) = &self.config.checkpoint else {
            warn!(mode = %self.config.mode, "no checkpoint given, evaluating initial weights");
            return Ok(0);
        };
        let checkpoint = self.checkpoint_manager().load(path)?;
        let schedule = Schedule::new(self.config.schedule.clone(), 1, 1, 1);
        let mut scheduler = OptimizationScheduler::new(schedule, self.network.parameters(), Vec::new());
        let mut precision = PrecisionManager::new(self.config.precision.clone());
        let resume = checkpoint.restore_into(self.network.as_mut(), &mut scheduler, &mut precision)?;
        info!(path = %path.display(), epoch = resume.epoch, "evaluating checkpoint");
        Ok(resume.epoch)
    }

    fn test_losses(&mut self) -> TrainingResult<RunSummary> {
        let epoch = self.restore_for_eval()?;
        let shard = self.shard();
        let mut acc = MetricAccumulator::new();
        let mut seen = 0_u64;
        for batch in self.dataset.batches(Split::Test, shard, 0)? {
            check_cancelled(&self.cancel, seen)?;
            let losses = self.network.evaluate_loss(&batch?)?;
            acc.add_losses(&losses);
            seen += 1;
        }

        let (sum, count) = acc.totals("loss");
        let mut buf = [sum as f32, count as f32];
        self.dist.all_reduce_sum(&mut buf)?;
        let mut metrics = acc.finish("test");
        if buf[1] > 0.0 {
            metrics.insert_scalar("test/loss", f64::from(buf[0]) / f64::from(buf[1]));
        }
        info!(batches = seen, loss = metrics.scalar("test/loss"), "test pass finished");
        self.sink.record(MetricEvent::Epoch { phase: "test".into(), epoch, metrics: metrics.clone() });
        Ok(RunSummary { epochs_completed: epoch, metrics, ..RunSummary::default() })
    }

    fn test_pose(&mut self, source: PredictionSource, calibrate: bool) -> TrainingResult<RunSummary> {
        let epoch = self.restore_for_eval()?;
        let shard = self.shard();
        let evaluator = self.evaluator.as_deref_mut().ok_or_else(|| unavailable("pose evaluator"))?;
        let mut runner = EvalRunner::new(evaluator, source);
        let mut seen = 0_u64;
        for batch in self.dataset.batches(Split::Test, shard, 0)? {
            check_cancelled(&self.cancel, seen)?;
            runner.evaluate(self.network.as_ref(), &batch?)?;
            seen += 1;
        }
        let mut pose = runner.summary();

        if self.dist.is_distributed() {
            let mut totals = pose.overall.reduction_totals();
            self.dist.all_reduce_sum(&mut totals)?;
            pose.overall.apply_reduced_totals(totals);
        }

        let prefix = match source {
            PredictionSource::Network => "test_pose",
            PredictionSource::GroundTruth => "test_gt",
        };
        let metrics = pose.to_metrics(prefix);
        info!(
            batches = seen,
            instances = pose.overall.instances,
            accuracy = pose.overall.accuracy,
            mean_add = pose.overall.mean_add,
            source = ?source,
            "pose evaluation finished"
        );
        self.sink.record(MetricEvent::Epoch { phase: prefix.into(), epoch, metrics: metrics.clone() });

        if calibrate && self.dist.is_primary() {
            let path = self.config.layout.pose_metrics_path();
            std::fs::write(&path, serde_json::to_string_pretty(&pose)?)?;
            info!(path = %path.display(), "pose metrics written");
        }
        Ok(RunSummary { epochs_completed: epoch, metrics, pose: Some(pose), ..RunSummary::default() })
    }

    fn view_depth(&mut self) -> TrainingResult<RunSummary> {
        let epoch = self.restore_for_eval()?;
        let shard = self.shard();
        let palette = Palette::new(self.config.n_objects);
        let dir = self.config.layout.view_depth_dir();
        let primary = self.dist.is_primary();
        if primary {
            std::fs::create_dir_all(&dir)?;
        }

        let mut images = Vec::new();
        let mut seen = 0_u64;
        for batch in self.dataset.batches(Split::Test, shard, 0)? {
            check_cancelled(&self.cancel, seen)?;
            let batch = batch?;
            let output = self.network.infer(&batch)?;
            let Some(labels) = output.get(outputs::SEGMENTATION).or_else(|| batch.segmentation_labels()) else {
                warn!(batch = batch.index, "batch has no segmentation to render");
                continue;
            };
            for frame in 0..batch.size.max(1) {
                let Some(image) = palette.colorize(labels, frame) else { break };
                if primary {
                    let path = dir.join(format!("{:04}_{:02}.png", batch.index, frame));
                    image.save(&path).map_err(|e| TrainingError::Other(anyhow::anyhow!("{}: {}", path.display(), e)))?;
                    images.push(path);
                }
                self.sink.record(MetricEvent::Image {
                    tag: format!("view_dpt/{}", fields::LABELS),
                    step: seen,
                    image,
                });
            }
            seen += 1;
        }
        info!(batches = seen, images = images.len(), dir = %dir.display(), "segmentation views written");
        Ok(RunSummary { epochs_completed: epoch, images, ..RunSummary::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Capabilities, ConfigResolver, ModeFlags, Overrides};
    use crate::metrics::MemoryMetricsSink;
    use tempfile::TempDir;

    fn config(temp: &TempDir, modes: ModeFlags, epochs: usize) -> RunConfig {
        let overrides = Overrides {
            epochs: Some(epochs),
            mini_batch_size: Some(2),
            debug_batches: Some(2),
            modes,
            ..Default::default()
        };
        ConfigResolver::new(temp.path().to_path_buf(), Capabilities::all()).resolve("ape", &overrides).unwrap()
    }

    fn run(config: &RunConfig, cancel: CancellationFlag) -> (TrainingResult<RunSummary>, MemoryMetricsSink) {
        let sink = MemoryMetricsSink::new();
        let mut handle = sink.clone();
        let mut dist = DistributedContext::single(0);
        let collaborators = Collaborators::reference(config.cls, 3, 2);
        let result = TrainLoopDriver::new(config, collaborators, &mut dist, &mut handle, cancel)
            .and_then(|mut driver| driver.run());
        (result, sink)
    }

    #[test]
    fn test_debug_run_saves_single_epoch_checkpoint() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags { debug: true, ..Default::default() }, 1);
        let (result, sink) = run(&config, CancellationFlag::new());
        let summary = result.unwrap();

        assert_eq!(summary.epochs_completed, 1);
        assert_eq!(summary.global_step, 2);
        assert_eq!(summary.checkpoints, vec![config.layout.checkpoint_path("epoch_0001")]);
        assert!(!config.layout.checkpoint_path("best").exists());
        assert!(sink.events().iter().any(|e| matches!(e, MetricEvent::Epoch { epoch: 1, .. })));
    }

    #[test]
    fn test_train_mode_tracks_best_checkpoint() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags::default(), 2);
        let summary = run(&config, CancellationFlag::new()).0.unwrap();

        assert_eq!(summary.epochs_completed, 2);
        assert!(summary.best_metric.is_some());
        assert!(config.layout.checkpoint_path("best").exists());
        assert!(config.layout.checkpoint_path("epoch_0002").exists());
        assert!(summary.metrics.scalar("val/loss").is_some());
    }

    #[test]
    fn test_configured_param_groups_reach_the_optimizer() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp, ModeFlags { debug: true, ..Default::default() }, 1);
        config.schedule.param_groups = vec![crate::optimizer::ParamGroup {
            name: "bias".into(),
            prefix: Some("head.bias".into()),
            lr: 0.0,
            lr_scale: 0.5,
            weight_decay: 0.0,
        }];
        run(&config, CancellationFlag::new()).0.unwrap();

        let ckpt = CheckpointManager::new(config.layout.clone(), config.cls, false)
            .load(&config.layout.checkpoint_path("epoch_0001"))
            .unwrap();
        let groups = &ckpt.optimization.optimizer.groups;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "bias");
        assert!((groups[0].lr - 0.5 * ckpt.optimization.learning_rate).abs() < 1e-12);
        assert!((groups[1].lr - ckpt.optimization.learning_rate).abs() < 1e-12);
    }

    #[test]
    fn test_cancel_flushes_interrupted_checkpoint() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags::default(), 3);
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let err = run(&config, cancel).0.unwrap_err();

        assert!(matches!(err, TrainingError::Interrupted { epoch: 0, step: 0 }));
        assert_eq!(err.exit_code(), crate::error::exit_codes::INTERRUPTED);
        assert!(config.layout.checkpoint_path("interrupted").exists());
    }

    #[test]
    fn test_ground_truth_mode_is_perfect_and_leaves_no_checkpoints() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags { test_gt: true, ..Default::default() }, 1);
        let summary = run(&config, CancellationFlag::new()).0.unwrap();

        let pose = summary.pose.unwrap();
        assert!((pose.overall.accuracy - 1.0).abs() < f64::EPSILON);
        assert!(summary.checkpoints.is_empty());
        assert!(!config.layout.checkpoint_manifest_path().exists());
    }

    #[test]
    fn test_calibrate_writes_pose_metrics() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags { cal_metrics: true, ..Default::default() }, 1);
        run(&config, CancellationFlag::new()).0.unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(config.layout.pose_metrics_path()).unwrap()).unwrap();
        assert!(json["overall"]["instances"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_view_depth_writes_pngs() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags { view_dpt: true, ..Default::default() }, 1);
        let (result, sink) = run(&config, CancellationFlag::new());
        let summary = result.unwrap();

        assert!(!summary.images.is_empty());
        assert!(summary.images.iter().all(|p| p.starts_with(config.layout.view_depth_dir()) && p.exists()));
        assert!(sink.events().iter().any(|e| matches!(e, MetricEvent::Image { .. })));
    }

    #[test]
    fn test_missing_evaluator_fails_pose_modes_only() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp, ModeFlags { test_pose: true, ..Default::default() }, 1);
        let mut collaborators = Collaborators::reference(config.cls, 0, 2);
        collaborators.evaluator = None;
        let mut dist = DistributedContext::single(0);
        let mut sink = MemoryMetricsSink::new();
        let mut driver =
            TrainLoopDriver::new(&config, collaborators, &mut dist, &mut sink, CancellationFlag::new()).unwrap();
        let err = driver.run().unwrap_err();
        assert!(matches!(err, TrainingError::CollaboratorUnavailable(_)));
    }
}
