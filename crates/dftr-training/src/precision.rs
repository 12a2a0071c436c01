//! Dynamic loss scaling around one optimization step.

use crate::config::PrecisionConfig;
use crate::distributed::DistributedContext;
use crate::error::TrainingResult;
use crate::scheduler::OptimizationScheduler;
use dftr_abstraction::{Batch, BatchStatistics, LossBreakdown, PoseNetwork};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    /// Gradients overflowed; no update was made.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionState {
    pub loss_scale: f32,
    /// Total overflow skips since the run started.
    pub overflow_skips: u64,
    /// Consecutive clean steps since the scale last changed.
    pub clean_streak: u32,
}

/// What one call to [`PrecisionManager::step`] did.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub outcome: StepOutcome,
    pub losses: LossBreakdown,
    /// Scale used for this step's backward pass.
    pub loss_scale: f32,
}

#[derive(Debug, Clone)]
pub struct PrecisionManager {
    config: PrecisionConfig,
    state: PrecisionState,
    epoch_steps: u64,
    epoch_skips: u64,
}

impl PrecisionManager {
    #[must_use]
    pub fn new(config: PrecisionConfig) -> Self {
        let loss_scale = if config.enabled { config.init_scale } else { 1.0 };
        Self {
            config,
            state: PrecisionState { loss_scale, overflow_skips: 0, clean_streak: 0 },
            epoch_steps: 0,
            epoch_skips: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> &PrecisionState {
        &self.state
    }

    pub fn restore(&mut self, state: PrecisionState) {
        self.state = state;
    }

    #[must_use]
    pub fn loss_scale(&self) -> f32 {
        self.state.loss_scale
    }

    /// Forward/backward at the current scale, gradient sync, overflow check, then update.
    ///
    /// When distributed, gradients are averaged and batch-norm statistics summed across
    /// ranks before the overflow check, so every rank reaches the same outcome.
    pub fn step(
        &mut self,
        batch: &Batch,
        network: &mut dyn PoseNetwork,
        scheduler: &mut OptimizationScheduler,
        dist: &mut DistributedContext,
    ) -> TrainingResult<StepReport> {
        let scale = self.state.loss_scale;
        let mut pass = network.forward_backward(batch, scale)?;

        dist.all_reduce_mean(&mut pass.gradients)?;
        dist.sync_batch_statistics(&mut pass.batch_statistics)?;
        apply_batch_statistics(network, &pass.batch_statistics)?;

        self.epoch_steps += 1;
        let overflow = !pass.gradients.all_finite() || !pass.losses.total.is_finite();
        if overflow {
            self.state.overflow_skips += 1;
            self.state.clean_streak = 0;
            self.epoch_skips += 1;
            if self.config.enabled {
                self.state.loss_scale = (scale * self.config.backoff_factor).max(self.config.min_scale);
            }
            debug!(scale, next_scale = self.state.loss_scale, "gradient overflow, update skipped");
            return Ok(StepReport { outcome: StepOutcome::Skipped, losses: pass.losses, loss_scale: scale });
        }

        pass.gradients.scale_all(1.0 / scale);
        scheduler.apply_update(network, &pass.gradients)?;

        self.state.clean_streak += 1;
        if self.config.enabled && self.state.clean_streak >= self.config.growth_interval {
            self.state.loss_scale = scale * self.config.growth_factor;
            self.state.clean_streak = 0;
            debug!(scale = self.state.loss_scale, "loss scale grown");
        }
        Ok(StepReport { outcome: StepOutcome::Applied, losses: pass.losses, loss_scale: scale })
    }

    /// Closes the epoch's overflow accounting, returning the skipped fraction.
    ///
    /// Warns when the fraction exceeds the configured threshold.
    pub fn end_epoch(&mut self, epoch: usize) -> f64 {
        let ratio = if self.epoch_steps == 0 { 0.0 } else { self.epoch_skips as f64 / self.epoch_steps as f64 };
        if ratio > self.config.skip_warn_ratio {
            warn!(
                epoch,
                skipped = self.epoch_skips,
                steps = self.epoch_steps,
                ratio,
                loss_scale = self.state.loss_scale,
                "excessive overflow skips this epoch"
            );
        }
        self.epoch_steps = 0;
        self.epoch_skips = 0;
        ratio
    }
}

/// Folds finite statistics into the matching BN layers; non-finite ones are dropped.
fn apply_batch_statistics(network: &mut dyn PoseNetwork, stats: &[BatchStatistics]) -> TrainingResult<()> {
    for s in stats {
        if !s.is_finite() {
            debug!(layer = %s.layer, "non-finite batch statistics ignored");
            continue;
        }
        if let Some(layer) = network.batch_norm_layers_mut().iter_mut().find(|l| l.name == s.layer) {
            layer.update(s)?;
        }
    }
    Ok(())
}
