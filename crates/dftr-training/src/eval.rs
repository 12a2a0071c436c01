//! Pose evaluation over a test pass: per-batch decoding through the
//! [`PoseEvaluator`] and accuracy summaries per object and overall.

use crate::error::{TrainingError, TrainingResult};
use crate::metrics::EpochMetrics;
use dftr_abstraction::{Batch, EvaluationInput, InstanceEstimate, PoseEvaluator, PoseNetwork, PredictionSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// ADD thresholds (meters) swept for the accuracy curve.
const CURVE_MAX_METERS: f64 = 0.1;
const CURVE_POINTS: usize = 100;

/// Decoded poses for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    pub batch_index: usize,
    pub instances: Vec<InstanceEstimate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub instances: usize,
    pub scored: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub mean_add: f64,
    /// Instances that carry an ADD(-S) error.
    #[serde(default)]
    pub add_errors: usize,
    #[serde(default)]
    pub add_error_sum: f64,
    /// Area under the accuracy-vs-threshold curve on `[0, 0.1]` m.
    pub auc: f64,
}

impl ObjectSummary {
    /// Counters that sum across ranks: `[instances, scored, correct, add_error_sum, add_errors]`.
    #[must_use]
    pub fn reduction_totals(&self) -> [f32; 5] {
        [
            self.instances as f32,
            self.scored as f32,
            self.correct as f32,
            self.add_error_sum as f32,
            self.add_errors as f32,
        ]
    }

    /// Rebuilds counts, accuracy and mean ADD from totals summed over ranks.
    ///
    /// `auc` stays the local value since the error lists are not exchanged.
    pub fn apply_reduced_totals(&mut self, totals: [f32; 5]) {
        let [instances, scored, correct, error_sum, errors] = totals;
        self.instances = instances as usize;
        self.scored = scored as usize;
        self.correct = correct as usize;
        self.add_error_sum = f64::from(error_sum);
        self.add_errors = errors as usize;
        self.accuracy = if scored > 0.0 { f64::from(correct) / f64::from(scored) } else { 0.0 };
        self.mean_add = if errors > 0.0 { f64::from(error_sum) / f64::from(errors) } else { 0.0 };
    }
}

/// Aggregate pose accuracy over an evaluation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseSummary {
    pub source: Option<PredictionSource>,
    pub batches: usize,
    pub overall: ObjectSummary,
    pub per_object: BTreeMap<u32, ObjectSummary>,
    /// Accuracy at each threshold of the sweep, for calibration reports.
    pub accuracy_curve: Vec<f64>,
}

impl PoseSummary {
    #[must_use]
    pub fn to_metrics(&self, prefix: &str) -> EpochMetrics {
        let mut m = EpochMetrics::new();
        m.insert_scalar(format!("{prefix}/instances"), self.overall.instances as f64);
        m.insert_scalar(format!("{prefix}/accuracy"), self.overall.accuracy);
        m.insert_scalar(format!("{prefix}/mean_add"), self.overall.mean_add);
        m.insert_scalar(format!("{prefix}/auc"), self.overall.auc);
        for (obj, s) in &self.per_object {
            m.insert_scalar(format!("{prefix}/obj_{obj:02}/accuracy"), s.accuracy);
        }
        if !self.accuracy_curve.is_empty() {
            m.insert_array(format!("{prefix}/accuracy_curve"), self.accuracy_curve.clone());
        }
        m
    }
}

fn curve(errors: &[f64]) -> Vec<f64> {
    if errors.is_empty() {
        return Vec::new();
    }
    (0..=CURVE_POINTS)
        .map(|k| {
            let t = CURVE_MAX_METERS * k as f64 / CURVE_POINTS as f64;
            errors.iter().filter(|e| **e < t).count() as f64 / errors.len() as f64
        })
        .collect()
}

fn summarize(instances: &[&InstanceEstimate]) -> (ObjectSummary, Vec<f64>) {
    let errors: Vec<f64> = instances.iter().filter_map(|i| i.add_error).map(f64::from).collect();
    let correct = instances.iter().filter(|i| i.correct == Some(true)).count();
    let scored = instances.iter().filter(|i| i.correct.is_some()).count();
    let curve = curve(&errors);
    let auc = if curve.is_empty() { 0.0 } else { curve.iter().sum::<f64>() / curve.len() as f64 };
    let add_error_sum: f64 = errors.iter().sum();
    let summary = ObjectSummary {
        instances: instances.len(),
        scored,
        correct,
        accuracy: if scored == 0 { 0.0 } else { correct as f64 / scored as f64 },
        mean_add: if errors.is_empty() { 0.0 } else { add_error_sum / errors.len() as f64 },
        add_errors: errors.len(),
        add_error_sum,
        auc,
    };
    (summary, curve)
}

/// Inference plus pose evaluation for the evaluation modes.
pub struct EvalRunner<'a> {
    evaluator: &'a mut dyn PoseEvaluator,
    source: PredictionSource,
    estimates: Vec<PoseEstimate>,
}

impl<'a> EvalRunner<'a> {
    #[must_use]
    pub fn new(evaluator: &'a mut dyn PoseEvaluator, source: PredictionSource) -> Self {
        Self { evaluator, source, estimates: Vec::new() }
    }

    /// Runs inference and decodes poses; evaluator failures are returned as errors.
    pub fn evaluate(&mut self, network: &dyn PoseNetwork, batch: &Batch) -> TrainingResult<PoseEstimate> {
        let output = network.infer(batch)?;
        let instances = self
            .evaluator
            .evaluate(EvaluationInput { batch, output: &output, source: self.source })
            .map_err(|e| {
                TrainingError::Evaluation(format!("{} failed on batch {}: {}", self.evaluator.name(), batch.index, e))
            })?;
        debug!(batch = batch.index, instances = instances.len(), "batch evaluated");
        let estimate = PoseEstimate { batch_index: batch.index, instances };
        self.estimates.push(estimate.clone());
        Ok(estimate)
    }

    #[must_use]
    pub fn estimates(&self) -> &[PoseEstimate] {
        &self.estimates
    }

    #[must_use]
    pub fn summary(&self) -> PoseSummary {
        let all: Vec<&InstanceEstimate> = self.estimates.iter().flat_map(|e| &e.instances).collect();
        let (overall, accuracy_curve) = summarize(&all);

        let mut by_object: BTreeMap<u32, Vec<&InstanceEstimate>> = BTreeMap::new();
        for inst in all.iter().copied() {
            by_object.entry(inst.obj_id).or_default().push(inst);
        }
        let per_object = by_object.into_iter().map(|(obj, insts)| (obj, summarize(&insts).0)).collect();

        PoseSummary { source: Some(self.source), batches: self.estimates.len(), overall, per_object, accuracy_curve }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{LinearOffsetNet, MeanVoteEvaluator, SyntheticFrames};
    use dftr_abstraction::{CollaboratorError, CollaboratorResult, DatasetProvider, Pose, Shard, Split};

    struct FailingEvaluator;

    impl PoseEvaluator for FailingEvaluator {
        fn name(&self) -> &str {
            "failing"
        }

        fn evaluate(&mut self, _input: EvaluationInput<'_>) -> CollaboratorResult<Vec<InstanceEstimate>> {
            Err(CollaboratorError::Evaluator("voting diverged".into()))
        }
    }

    #[test]
    fn test_ground_truth_source_scores_every_instance() {
        let mut data = SyntheticFrames::new(11, 2, 2);
        let net = LinearOffsetNet::new(11);
        let mut evaluator = MeanVoteEvaluator::new(1, data.model_keypoints().to_vec(), false);
        let mut runner = EvalRunner::new(&mut evaluator, PredictionSource::GroundTruth);

        for batch in data.batches(Split::Test, Shard::single(), 0).unwrap() {
            let estimate = runner.evaluate(&net, &batch.unwrap()).unwrap();
            assert_eq!(estimate.instances.len(), 2);
        }
        let summary = runner.summary();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.overall.instances, 4);
        assert!((summary.overall.accuracy - 1.0).abs() < f64::EPSILON);
        assert_eq!(summary.accuracy_curve.len(), CURVE_POINTS + 1);
        assert!(summary.to_metrics("test").scalar("test/accuracy").is_some());
    }

    fn instance(add_error: Option<f32>) -> InstanceEstimate {
        InstanceEstimate {
            obj_id: 1,
            pose: Pose::identity(),
            add_error,
            symmetric: false,
            correct: add_error.map(|e| e < 0.01),
        }
    }

    #[test]
    fn test_reduced_totals_match_pooled_summary() {
        let rank0 = [instance(Some(0.002)), instance(None), instance(None)];
        let rank1 = [instance(Some(0.03)), instance(Some(0.004))];
        let (local0, _) = summarize(&rank0.iter().collect::<Vec<_>>());
        let (local1, _) = summarize(&rank1.iter().collect::<Vec<_>>());
        let (pooled, _) = summarize(&rank0.iter().chain(&rank1).collect::<Vec<_>>());

        let mut totals = local0.reduction_totals();
        for (t, v) in totals.iter_mut().zip(local1.reduction_totals()) {
            *t += v;
        }
        let mut merged = local0.clone();
        merged.apply_reduced_totals(totals);

        assert_eq!(merged.instances, 5);
        assert_eq!(merged.add_errors, 3);
        assert_eq!((merged.scored, merged.correct), (pooled.scored, pooled.correct));
        assert!((merged.accuracy - pooled.accuracy).abs() < 1e-9);
        assert!((merged.mean_add - pooled.mean_add).abs() < 1e-6);
        assert!((pooled.mean_add - 0.012).abs() < 1e-6);
    }

    #[test]
    fn test_evaluator_failure_is_surfaced() {
        let mut data = SyntheticFrames::new(1, 1, 1);
        let net = LinearOffsetNet::new(1);
        let batch = data.batches(Split::Test, Shard::single(), 0).unwrap().next().unwrap().unwrap();
        let mut evaluator = FailingEvaluator;
        let mut runner = EvalRunner::new(&mut evaluator, PredictionSource::Network);

        let err = runner.evaluate(&net, &batch).unwrap_err();
        assert!(matches!(err, TrainingError::Evaluation(msg) if msg.contains("voting diverged")));
        assert!(runner.estimates().is_empty());
    }
}
