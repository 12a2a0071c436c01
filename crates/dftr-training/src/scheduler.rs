//! Learning-rate and batch-norm momentum schedules plus the optimizer they drive.

use crate::config::{LrPolicy, ScheduleConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::optimizer::{Adam, AdamState, ParamGroup};
use dftr_abstraction::{ParameterSet, PoseNetwork};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted verbatim in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationState {
    /// Applied optimizer updates so far.
    pub step: u64,
    pub learning_rate: f64,
    pub bn_momentum: f64,
    pub optimizer: AdamState,
}

/// Pure schedule: `(learning_rate, bn_momentum)` as a function of the global step.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    config: ScheduleConfig,
    /// Triangular half period, in steps.
    cycle_half_period: u64,
}

impl Schedule {
    /// The epoch budget and batches per epoch size the cyclic half period.
    #[must_use]
    pub fn new(config: ScheduleConfig, epochs: usize, batches_per_epoch: usize, world_size: usize) -> Self {
        let derived = (epochs as u64 * batches_per_epoch as u64)
            / config.clr_div.max(1)
            / (world_size.max(1) as u64);
        let cycle_half_period = config.cyclic_step_size.unwrap_or(derived).max(1);
        Self { config, cycle_half_period }
    }

    #[must_use]
    pub fn cycle_half_period(&self) -> u64 {
        self.cycle_half_period
    }

    fn decay_exponent(&self, step: u64) -> f64 {
        (step as f64 * self.config.mini_batch_size as f64 / self.config.decay_step).floor()
    }

    /// Evaluates both schedules at `global_step`.
    pub fn at(&self, global_step: i64) -> TrainingResult<(f64, f64)> {
        let step = u64::try_from(global_step).map_err(|_| TrainingError::InvalidScheduleInput(global_step))?;
        let c = &self.config;
        let k = self.decay_exponent(step);

        let lr = match c.policy {
            LrPolicy::StepDecay => (c.learning_rate * c.lr_decay.powf(k)).max(c.lr_clip),
            LrPolicy::Cyclic => {
                let ss = self.cycle_half_period as f64;
                let it = step as f64;
                let cycle = (1.0 + it / (2.0 * ss)).floor();
                let x = (it / ss - 2.0 * cycle + 1.0).abs();
                let lo = c.lr_clip.min(c.learning_rate);
                lo + (c.learning_rate - lo) * (1.0 - x).max(0.0)
            }
        };
        let momentum = (c.bn_momentum * c.bn_decay.powf(k)).max(c.bn_clip);
        Ok((lr, momentum))
    }
}

/// Owns the optimizer and applies the schedule once per optimization step.
#[derive(Debug, Clone)]
pub struct OptimizationScheduler {
    schedule: Schedule,
    optimizer: Adam,
    step: u64,
    learning_rate: f64,
    bn_momentum: f64,
}

impl OptimizationScheduler {
    #[must_use]
    pub fn new(schedule: Schedule, params: &ParameterSet, groups: Vec<ParamGroup>) -> Self {
        let c = &schedule.config;
        let optimizer = Adam::new(params, groups, c.learning_rate, c.weight_decay);
        let (learning_rate, bn_momentum) = (c.learning_rate, c.bn_momentum);
        Self { schedule, optimizer, step: 0, learning_rate, bn_momentum }
    }

    #[must_use]
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    #[must_use]
    pub fn bn_momentum(&self) -> f64 {
        self.bn_momentum
    }

    /// Sets rate and momentum for `global_step` on every parameter group and BN layer.
    pub fn advance(&mut self, global_step: i64, network: &mut dyn PoseNetwork) -> TrainingResult<(f64, f64)> {
        let (lr, momentum) = self.schedule.at(global_step)?;
        self.optimizer.set_learning_rate(lr);
        for layer in network.batch_norm_layers_mut() {
            layer.momentum = momentum as f32;
        }
        self.learning_rate = lr;
        self.bn_momentum = momentum;
        debug!(global_step, lr, momentum, "schedule advanced");
        Ok((lr, momentum))
    }

    /// Applies one optimizer update with unscaled gradients and counts it.
    pub fn apply_update(&mut self, network: &mut dyn PoseNetwork, grads: &ParameterSet) -> TrainingResult<()> {
        self.optimizer.step(network.parameters_mut(), grads)?;
        self.step += 1;
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> OptimizationState {
        OptimizationState {
            step: self.step,
            learning_rate: self.learning_rate,
            bn_momentum: self.bn_momentum,
            optimizer: self.optimizer.state().clone(),
        }
    }

    /// Restores a persisted state and re-applies it to the network's BN layers.
    pub fn restore(&mut self, state: OptimizationState, network: &mut dyn PoseNetwork) -> TrainingResult<()> {
        self.optimizer.load_state(network.parameters(), state.optimizer)?;
        self.step = state.step;
        self.learning_rate = state.learning_rate;
        self.bn_momentum = state.bn_momentum;
        for layer in network.batch_norm_layers_mut() {
            layer.momentum = state.bn_momentum as f32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(policy: LrPolicy) -> Schedule {
        let config = ScheduleConfig { policy, mini_batch_size: 8, decay_step: 80.0, ..ScheduleConfig::default() };
        Schedule::new(config, 6, 10, 1)
    }

    #[test]
    fn test_step_decay_halves_every_decay_step() {
        let s = schedule(LrPolicy::StepDecay);
        let (lr0, m0) = s.at(0).unwrap();
        assert!((lr0 - 1e-2).abs() < 1e-12);
        assert!((m0 - 0.9).abs() < 1e-12);

        // 10 steps * batch 8 = 80 = one decay period
        let (lr1, m1) = s.at(10).unwrap();
        assert!((lr1 - 5e-3).abs() < 1e-12);
        assert!((m1 - 0.45).abs() < 1e-12);
        assert_eq!(s.at(9).unwrap(), (lr0, m0));
    }

    #[test]
    fn test_schedules_are_clipped() {
        let s = schedule(LrPolicy::StepDecay);
        let (lr, m) = s.at(10_000).unwrap();
        assert!((lr - 1e-5).abs() < 1e-15);
        assert!((m - 1e-2).abs() < 1e-15);
    }

    #[test]
    fn test_cyclic_is_triangular() {
        let s = schedule(LrPolicy::Cyclic);
        // 6 epochs * 10 batches / 6
        assert_eq!(s.cycle_half_period(), 10);
        let (lo, _) = s.at(0).unwrap();
        let (hi, _) = s.at(10).unwrap();
        let (back, _) = s.at(20).unwrap();
        assert!((lo - 1e-5).abs() < 1e-12);
        assert!((hi - 1e-2).abs() < 1e-12);
        assert!((back - lo).abs() < 1e-12);
    }

    #[test]
    fn test_negative_step_is_rejected() {
        let s = schedule(LrPolicy::StepDecay);
        assert!(matches!(s.at(-1), Err(TrainingError::InvalidScheduleInput(-1))));
    }

    #[test]
    fn test_schedule_is_pure() {
        let s = schedule(LrPolicy::Cyclic);
        let first: Vec<_> = (0..40).map(|i| s.at(i).unwrap()).collect();
        let again: Vec<_> = (0..40).rev().map(|i| s.at(i).unwrap()).collect();
        assert_eq!(first, again.into_iter().rev().collect::<Vec<_>>());
    }
}
