//! Adam with L2 weight decay over named parameter groups.

use crate::error::{TrainingError, TrainingResult};
use dftr_abstraction::ParameterSet;
use serde::{Deserialize, Serialize};

/// A set of parameters sharing a learning rate and weight decay.
///
/// A parameter belongs to the first group whose prefix matches its name; the catch-all
/// group has no prefix. Run files declare groups as `[[param_groups]]` tables; `lr` is
/// set by the schedule and may be omitted there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamGroup {
    pub name: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub lr: f64,
    /// Multiplier applied to the scheduled rate.
    #[serde(default = "unit_scale")]
    pub lr_scale: f64,
    #[serde(default)]
    pub weight_decay: f64,
}

fn unit_scale() -> f64 {
    1.0
}

impl ParamGroup {
    #[must_use]
    pub fn catch_all(lr: f64, weight_decay: f64) -> Self {
        Self { name: "default".to_string(), prefix: None, lr, lr_scale: 1.0, weight_decay }
    }

    fn matches(&self, param: &str) -> bool {
        self.prefix.as_deref().is_none_or(|p| param.starts_with(p))
    }
}

/// Everything needed to continue optimization exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub groups: Vec<ParamGroup>,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Number of applied updates.
    pub t: u64,
    pub exp_avg: ParameterSet,
    pub exp_avg_sq: ParameterSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    state: AdamState,
}

impl Adam {
    /// Creates an optimizer whose moment buffers mirror `params`.
    #[must_use]
    pub fn new(params: &ParameterSet, mut groups: Vec<ParamGroup>, lr: f64, weight_decay: f64) -> Self {
        if !groups.iter().any(|g| g.prefix.is_none()) {
            groups.push(ParamGroup::catch_all(lr, weight_decay));
        }
        Self {
            state: AdamState {
                groups,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                t: 0,
                exp_avg: params.zeros_like(),
                exp_avg_sq: params.zeros_like(),
            },
        }
    }

    #[must_use]
    pub fn state(&self) -> &AdamState {
        &self.state
    }

    /// Replaces the state, refusing moment buffers that do not match `params`.
    pub fn load_state(&mut self, params: &ParameterSet, state: AdamState) -> TrainingResult<()> {
        for buffer in [&state.exp_avg, &state.exp_avg_sq] {
            if let Some(diff) = params.layout_mismatch(buffer) {
                return Err(TrainingError::CheckpointLoad(format!("optimizer state does not match model: {diff}")));
            }
        }
        self.state = state;
        Ok(())
    }

    #[must_use]
    pub fn groups(&self) -> &[ParamGroup] {
        &self.state.groups
    }

    /// Sets the scheduled rate on every group (scaled by the group's multiplier).
    pub fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.state.groups {
            group.lr = lr * group.lr_scale;
        }
    }

    #[must_use]
    pub fn steps_taken(&self) -> u64 {
        self.state.t
    }

    fn group_for(&self, name: &str) -> Option<&ParamGroup> {
        self.state.groups.iter().find(|g| g.prefix.is_some() && g.matches(name)).or_else(|| {
            self.state.groups.iter().find(|g| g.prefix.is_none())
        })
    }

    /// Applies one update. `grads` must already be unscaled.
    pub fn step(&mut self, params: &mut ParameterSet, grads: &ParameterSet) -> TrainingResult<()> {
        if let Some(diff) = params.layout_mismatch(grads) {
            return Err(TrainingError::Other(anyhow::anyhow!("gradient layout mismatch: {diff}")));
        }
        self.state.t += 1;
        let t = self.state.t as f64;
        let (b1, b2, eps) = (self.state.beta1, self.state.beta2, self.state.eps);
        let bias1 = 1.0 - b1.powf(t);
        let bias2 = 1.0 - b2.powf(t);

        let names: Vec<String> = params.names().cloned().collect();
        for name in names {
            let (lr, wd) = self.group_for(&name).map_or((0.0, 0.0), |g| (g.lr, g.weight_decay));
            let (Some(p), Some(g), Some(m), Some(v)) = (
                params.get_mut(&name),
                grads.get(&name),
                self.state.exp_avg.get_mut(&name),
                self.state.exp_avg_sq.get_mut(&name),
            ) else {
                continue;
            };
            let p = p.data_mut();
            let m = m.data_mut();
            let v = v.data_mut();
            for (i, g) in g.data().iter().enumerate() {
                let g = f64::from(*g) + wd * f64::from(p[i]);
                let mi = b1 * f64::from(m[i]) + (1.0 - b1) * g;
                let vi = b2 * f64::from(v[i]) + (1.0 - b2) * g * g;
                m[i] = mi as f32;
                v[i] = vi as f32;
                let update = lr * (mi / bias1) / ((vi / bias2).sqrt() + eps);
                p[i] = (f64::from(p[i]) - update) as f32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dftr_abstraction::Tensor;

    fn params() -> ParameterSet {
        let mut set = ParameterSet::new();
        set.insert("head.w", Tensor::from_vec(vec![1.0, -1.0]));
        set.insert("backbone.w", Tensor::from_vec(vec![0.5]));
        set
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut p = params();
        let mut grads = p.zeros_like();
        grads.get_mut("head.w").unwrap().data_mut().copy_from_slice(&[2.0, -3.0]);

        let mut adam = Adam::new(&p, Vec::new(), 0.1, 0.0);
        adam.step(&mut p, &grads).unwrap();

        // Bias-corrected first Adam step is lr * sign(g).
        let w = p.get("head.w").unwrap().data();
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] + 0.9).abs() < 1e-5);
        assert!((p.get("backbone.w").unwrap().data()[0] - 0.5).abs() < 1e-7);
        assert_eq!(adam.steps_taken(), 1);
    }

    #[test]
    fn test_groups_scale_learning_rate() {
        let p = params();
        let backbone = ParamGroup {
            name: "backbone".into(),
            prefix: Some("backbone.".into()),
            lr: 0.0,
            lr_scale: 0.1,
            weight_decay: 0.0,
        };
        let mut adam = Adam::new(&p, vec![backbone], 1.0, 0.0);
        adam.set_learning_rate(0.5);
        assert_eq!(adam.groups().len(), 2);
        assert!((adam.group_for("backbone.w").unwrap().lr - 0.05).abs() < 1e-12);
        assert!((adam.group_for("head.w").unwrap().lr - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_load_state_rejects_foreign_layout() {
        let p = params();
        let mut adam = Adam::new(&p, Vec::new(), 0.1, 0.0);
        let mut other = ParameterSet::new();
        other.insert("x", Tensor::from_vec(vec![0.0]));
        let foreign = Adam::new(&other, Vec::new(), 0.1, 0.0).state().clone();
        assert!(matches!(adam.load_state(&p, foreign), Err(TrainingError::CheckpointLoad(_))));
    }
}
