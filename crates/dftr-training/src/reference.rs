//! Small deterministic collaborators for smoke runs and tests.
//!
//! Frames are point clouds sampled from a box-shaped object at a fixed pose. The
//! network is a linear head from batch-normalized points to keypoint and center
//! offsets, with analytic gradients. The evaluator votes by averaging `point + offset`.

use dftr_abstraction::dataset::fields;
use dftr_abstraction::network::{loss_terms, outputs};
use dftr_abstraction::{
    Batch, BatchIter, BatchNormLayer, BatchStatistics, CollaboratorError, CollaboratorResult, DatasetProvider,
    EvaluationInput, GroundTruthPose, InstanceEstimate, LossBreakdown, NetworkOutput, ParameterSet, Pose,
    PoseEvaluator, PoseNetwork, PredictionSource, Shard, Split, Tensor, TrainingPass,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Keypoints per object (the center is predicted separately).
pub const NUM_KEYPOINTS: usize = 8;
/// Points sampled per frame.
pub const POINTS_PER_FRAME: usize = 32;
/// Side of the square label/depth maps.
pub const MAP_SIZE: usize = 8;

const OBJECT_HALF_EXTENT: f32 = 0.05;
const BN_EPS: f32 = 1e-5;

fn split_salt(split: Split) -> u64 {
    match split {
        Split::Train => 0x7472_6169,
        Split::Test => 0x7465_7374,
    }
}

/// Synthetic keypoint-offset frames.
#[derive(Debug, Clone)]
pub struct SyntheticFrames {
    seed: u64,
    batches: usize,
    batch_size: usize,
    obj_id: u32,
    model_keypoints: Vec<[f32; 3]>,
    pose: Pose,
}

impl SyntheticFrames {
    /// `batches` per split, each of `batch_size` frames.
    #[must_use]
    pub fn new(seed: u64, batches: usize, batch_size: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let model_keypoints = (0..NUM_KEYPOINTS)
            .map(|_| {
                [
                    rng.gen_range(-OBJECT_HALF_EXTENT..OBJECT_HALF_EXTENT),
                    rng.gen_range(-OBJECT_HALF_EXTENT..OBJECT_HALF_EXTENT),
                    rng.gen_range(-OBJECT_HALF_EXTENT..OBJECT_HALF_EXTENT),
                ]
            })
            .collect();
        let mut pose = Pose::identity();
        pose.translation = [rng.gen_range(-0.1..0.1), rng.gen_range(-0.1..0.1), rng.gen_range(0.6..1.0)];
        Self { seed, batches, batch_size: batch_size.max(1), obj_id: 1, model_keypoints, pose }
    }

    #[must_use]
    pub fn with_object_id(mut self, obj_id: u32) -> Self {
        self.obj_id = obj_id;
        self
    }

    #[must_use]
    pub fn model_keypoints(&self) -> &[[f32; 3]] {
        &self.model_keypoints
    }

    #[must_use]
    pub fn object_id(&self) -> u32 {
        self.obj_id
    }

    fn make_batch(&self, split: Split, epoch: usize, index: usize) -> CollaboratorResult<Batch> {
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ split_salt(split) ^ ((epoch as u64) << 32) ^ (index as u64).wrapping_mul(0x9E37_79B9),
        );
        let n = self.batch_size * POINTS_PER_FRAME;
        let mut points = Vec::with_capacity(n * 3);
        let mut kp_targets = Vec::with_capacity(n * NUM_KEYPOINTS * 3);
        let mut ctr_targets = Vec::with_capacity(n * 3);
        let center = self.pose.translation;

        for _ in 0..n {
            let u = [
                rng.gen_range(-OBJECT_HALF_EXTENT..OBJECT_HALF_EXTENT),
                rng.gen_range(-OBJECT_HALF_EXTENT..OBJECT_HALF_EXTENT),
                rng.gen_range(-OBJECT_HALF_EXTENT..OBJECT_HALF_EXTENT),
            ];
            let p = self.pose.transform(u);
            points.extend_from_slice(&p);
            for k in &self.model_keypoints {
                let kc = self.pose.transform(*k);
                kp_targets.extend((0..3).map(|d| kc[d] - p[d]));
            }
            ctr_targets.extend((0..3).map(|d| center[d] - p[d]));
        }

        let cells = MAP_SIZE * MAP_SIZE;
        let mut labels = Vec::with_capacity(self.batch_size * cells);
        let mut depth = Vec::with_capacity(self.batch_size * cells);
        for _ in 0..self.batch_size {
            let (r0, c0) = (rng.gen_range(0..MAP_SIZE / 2), rng.gen_range(0..MAP_SIZE / 2));
            for r in 0..MAP_SIZE {
                for c in 0..MAP_SIZE {
                    let inside = (r0..r0 + MAP_SIZE / 2).contains(&r) && (c0..c0 + MAP_SIZE / 2).contains(&c);
                    labels.push(if inside { 1.0 } else { 0.0 });
                    depth.push(if inside { center[2] } else { 1.5 });
                }
            }
        }

        let mut inputs = BTreeMap::new();
        inputs.insert(fields::POINTS.to_string(), Tensor::new(vec![n, 3], points)?);
        inputs.insert(fields::DEPTH.to_string(), Tensor::new(vec![self.batch_size, MAP_SIZE, MAP_SIZE], depth)?);
        let mut targets = BTreeMap::new();
        targets.insert(fields::KEYPOINT_TARGETS.to_string(), Tensor::new(vec![n, NUM_KEYPOINTS * 3], kp_targets)?);
        targets.insert(fields::CENTER_TARGETS.to_string(), Tensor::new(vec![n, 3], ctr_targets)?);
        targets.insert(fields::LABELS.to_string(), Tensor::new(vec![self.batch_size, MAP_SIZE, MAP_SIZE], labels)?);

        Ok(Batch {
            index,
            size: self.batch_size,
            inputs,
            targets,
            ground_truth: vec![GroundTruthPose { obj_id: self.obj_id, pose: self.pose }; self.batch_size],
        })
    }
}

impl DatasetProvider for SyntheticFrames {
    fn name(&self) -> &str {
        "synthetic-frames"
    }

    fn batches_per_epoch(&self, _split: Split, shard: Shard) -> usize {
        (0..self.batches).filter(|i| shard.contains(*i)).count()
    }

    fn batches(&mut self, split: Split, shard: Shard, epoch: usize) -> CollaboratorResult<BatchIter<'_>> {
        let this = self.clone();
        Ok(Box::new((0..self.batches).filter(move |i| shard.contains(*i)).map(move |i| this.make_batch(split, epoch, i))))
    }
}

const OUT_DIM: usize = (NUM_KEYPOINTS + 1) * 3;
const WEIGHT: &str = "head.weight";
const BIAS: &str = "head.bias";

/// Linear offset head over batch-normalized points.
#[derive(Debug, Clone)]
pub struct LinearOffsetNet {
    params: ParameterSet,
    bn: Vec<BatchNormLayer>,
    overflow_pending: bool,
}

impl LinearOffsetNet {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        let weight: Vec<f32> = (0..OUT_DIM * 3).map(|_| rng.gen_range(-0.1..0.1)).collect();
        let mut params = ParameterSet::new();
        params.insert(WEIGHT, Tensor::zeros(vec![OUT_DIM, 3]));
        if let Some(w) = params.get_mut(WEIGHT) {
            w.data_mut().copy_from_slice(&weight);
        }
        params.insert(BIAS, Tensor::zeros(vec![OUT_DIM]));
        Self { params, bn: vec![BatchNormLayer::new("bn.input", 3, 0.9)], overflow_pending: false }
    }

    /// Makes the next backward pass produce non-finite gradients.
    pub fn inject_overflow(&mut self) {
        self.overflow_pending = true;
    }

    fn normalized_points(&self, batch: &Batch) -> CollaboratorResult<Vec<[f32; 3]>> {
        let points = batch.input(fields::POINTS)?;
        if points.shape().len() != 2 || points.shape()[1] != 3 {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "{} must be [n, 3], got {:?}",
                fields::POINTS,
                points.shape()
            )));
        }
        let bn = &self.bn[0];
        Ok(points
            .data()
            .chunks_exact(3)
            .map(|p| {
                let mut x = [0.0; 3];
                for j in 0..3 {
                    x[j] = (p[j] - bn.running_mean[j]) / (bn.running_var[j] + BN_EPS).sqrt();
                }
                x
            })
            .collect())
    }

    fn predict(&self, xs: &[[f32; 3]]) -> CollaboratorResult<Vec<[f32; OUT_DIM]>> {
        let w = self.params.get(WEIGHT).ok_or_else(|| CollaboratorError::MissingField(WEIGHT.into()))?.data();
        let b = self.params.get(BIAS).ok_or_else(|| CollaboratorError::MissingField(BIAS.into()))?.data();
        Ok(xs
            .iter()
            .map(|x| {
                let mut out = [0.0; OUT_DIM];
                for (d, o) in out.iter_mut().enumerate() {
                    *o = b[d] + w[d * 3] * x[0] + w[d * 3 + 1] * x[1] + w[d * 3 + 2] * x[2];
                }
                out
            })
            .collect())
    }

    fn targets(batch: &Batch, n: usize) -> CollaboratorResult<(&[f32], &[f32])> {
        let kp = batch.target(fields::KEYPOINT_TARGETS)?;
        let ctr = batch.target(fields::CENTER_TARGETS)?;
        if kp.numel() != n * NUM_KEYPOINTS * 3 || ctr.numel() != n * 3 {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "offset targets {:?}/{:?} do not match {} points",
                kp.shape(),
                ctr.shape(),
                n
            )));
        }
        Ok((kp.data(), ctr.data()))
    }

    /// Returns the losses and the loss gradient per prediction.
    fn losses(preds: &[[f32; OUT_DIM]], kp: &[f32], ctr: &[f32]) -> (LossBreakdown, Vec<[f32; OUT_DIM]>) {
        let n = preds.len();
        let kp_dims = NUM_KEYPOINTS * 3;
        let kp_norm = (n * kp_dims).max(1) as f32;
        let ctr_norm = (n * 3).max(1) as f32;
        let (mut kp_loss, mut ctr_loss) = (0.0_f32, 0.0_f32);
        let mut dpred = vec![[0.0_f32; OUT_DIM]; n];

        for (i, pred) in preds.iter().enumerate() {
            for d in 0..kp_dims {
                let diff = pred[d] - kp[i * kp_dims + d];
                kp_loss += diff * diff;
                dpred[i][d] = 2.0 * diff / kp_norm;
            }
            for d in 0..3 {
                let diff = pred[kp_dims + d] - ctr[i * 3 + d];
                ctr_loss += diff * diff;
                dpred[i][kp_dims + d] = 2.0 * diff / ctr_norm;
            }
        }
        kp_loss /= kp_norm;
        ctr_loss /= ctr_norm;

        let mut terms = BTreeMap::new();
        terms.insert(loss_terms::KEYPOINT_OFFSET.to_string(), kp_loss);
        terms.insert(loss_terms::CENTER_OFFSET.to_string(), ctr_loss);
        (LossBreakdown { total: kp_loss + ctr_loss, terms }, dpred)
    }
}

impl PoseNetwork for LinearOffsetNet {
    fn name(&self) -> &str {
        "linear-offset"
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    fn batch_norm_layers(&self) -> &[BatchNormLayer] {
        &self.bn
    }

    fn batch_norm_layers_mut(&mut self) -> &mut [BatchNormLayer] {
        &mut self.bn
    }

    fn forward_backward(&mut self, batch: &Batch, loss_scale: f32) -> CollaboratorResult<TrainingPass> {
        let xs = self.normalized_points(batch)?;
        let preds = self.predict(&xs)?;
        let (kp, ctr) = Self::targets(batch, xs.len())?;
        let (losses, dpred) = Self::losses(&preds, kp, ctr);

        let mut gw = vec![0.0_f32; OUT_DIM * 3];
        let mut gb = vec![0.0_f32; OUT_DIM];
        for (x, dp) in xs.iter().zip(&dpred) {
            for d in 0..OUT_DIM {
                let g = dp[d] * loss_scale;
                gb[d] += g;
                for j in 0..3 {
                    gw[d * 3 + j] += g * x[j];
                }
            }
        }
        if std::mem::take(&mut self.overflow_pending) {
            gw[0] = f32::INFINITY;
        }

        let mut gradients = ParameterSet::new();
        gradients.insert(WEIGHT, Tensor::new(vec![OUT_DIM, 3], gw)?);
        gradients.insert(BIAS, Tensor::new(vec![OUT_DIM], gb)?);

        let raw = batch.input(fields::POINTS)?.data();
        let mut stats = BatchStatistics {
            layer: self.bn[0].name.clone(),
            count: xs.len() as f32,
            sum: vec![0.0; 3],
            sum_sq: vec![0.0; 3],
        };
        for p in raw.chunks_exact(3) {
            for j in 0..3 {
                stats.sum[j] += p[j];
                stats.sum_sq[j] += p[j] * p[j];
            }
        }

        Ok(TrainingPass { losses, gradients, batch_statistics: vec![stats] })
    }

    fn evaluate_loss(&self, batch: &Batch) -> CollaboratorResult<LossBreakdown> {
        let xs = self.normalized_points(batch)?;
        let preds = self.predict(&xs)?;
        let (kp, ctr) = Self::targets(batch, xs.len())?;
        Ok(Self::losses(&preds, kp, ctr).0)
    }

    fn infer(&self, batch: &Batch) -> CollaboratorResult<NetworkOutput> {
        let xs = self.normalized_points(batch)?;
        let preds = self.predict(&xs)?;
        let n = preds.len();
        let kp_dims = NUM_KEYPOINTS * 3;
        let mut kp = Vec::with_capacity(n * kp_dims);
        let mut ctr = Vec::with_capacity(n * 3);
        for p in &preds {
            kp.extend_from_slice(&p[..kp_dims]);
            ctr.extend_from_slice(&p[kp_dims..]);
        }

        let mut tensors = BTreeMap::new();
        tensors.insert(outputs::KEYPOINT_OFFSETS.to_string(), Tensor::new(vec![n, kp_dims], kp)?);
        tensors.insert(outputs::CENTER_OFFSETS.to_string(), Tensor::new(vec![n, 3], ctr)?);

        // Foreground is everything nearer than the background plane.
        if let Some(depth) = batch.inputs.get(fields::DEPTH) {
            let seg: Vec<f32> = depth.data().iter().map(|d| if *d < 1.2 { 1.0 } else { 0.0 }).collect();
            tensors.insert(outputs::SEGMENTATION.to_string(), Tensor::new(depth.shape().to_vec(), seg)?);
        }
        Ok(NetworkOutput { tensors })
    }
}

/// Translation-only pose decoding by mean center voting, scored with ADD or ADD-S.
#[derive(Debug, Clone)]
pub struct MeanVoteEvaluator {
    obj_id: u32,
    model_keypoints: Vec<[f32; 3]>,
    symmetric: bool,
    /// Fraction of the keypoint diameter below which an estimate counts as correct.
    threshold: f32,
}

impl MeanVoteEvaluator {
    #[must_use]
    pub fn new(obj_id: u32, model_keypoints: Vec<[f32; 3]>, symmetric: bool) -> Self {
        Self { obj_id, model_keypoints, symmetric, threshold: 0.1 }
    }

    fn diameter(&self) -> f32 {
        let mut d = 0.0_f32;
        for a in &self.model_keypoints {
            for b in &self.model_keypoints {
                d = d.max(dist(*a, *b));
            }
        }
        d
    }

    fn add_error(&self, est: &Pose, gt: &Pose) -> f32 {
        if self.model_keypoints.is_empty() {
            return 0.0;
        }
        let est_pts: Vec<[f32; 3]> = self.model_keypoints.iter().map(|k| est.transform(*k)).collect();
        let gt_pts: Vec<[f32; 3]> = self.model_keypoints.iter().map(|k| gt.transform(*k)).collect();
        let total: f32 = if self.symmetric {
            est_pts.iter().map(|e| gt_pts.iter().map(|g| dist(*e, *g)).fold(f32::INFINITY, f32::min)).sum()
        } else {
            est_pts.iter().zip(&gt_pts).map(|(e, g)| dist(*e, *g)).sum()
        };
        total / self.model_keypoints.len() as f32
    }
}

fn dist(a: [f32; 3], b: [f32; 3]) -> f32 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

impl PoseEvaluator for MeanVoteEvaluator {
    fn name(&self) -> &str {
        "mean-vote"
    }

    fn evaluate(&mut self, input: EvaluationInput<'_>) -> CollaboratorResult<Vec<InstanceEstimate>> {
        let batch = input.batch;
        let points = batch.input(fields::POINTS)?.data();
        let offsets = match input.source {
            PredictionSource::Network => input
                .output
                .get(outputs::CENTER_OFFSETS)
                .ok_or_else(|| CollaboratorError::MissingField(outputs::CENTER_OFFSETS.to_string()))?,
            PredictionSource::GroundTruth => batch.target(fields::CENTER_TARGETS)?,
        }
        .data();

        if batch.size == 0 || points.len() != offsets.len() || points.len() % (batch.size * 3) != 0 {
            return Err(CollaboratorError::Evaluator(format!(
                "cannot split {} points / {} offsets into {} frames",
                points.len() / 3,
                offsets.len() / 3,
                batch.size
            )));
        }
        let per_frame = points.len() / 3 / batch.size;
        let diameter = self.diameter();

        let mut estimates = Vec::with_capacity(batch.size);
        for f in 0..batch.size {
            let mut center = [0.0_f32; 3];
            for i in f * per_frame..(f + 1) * per_frame {
                for d in 0..3 {
                    center[d] += points[i * 3 + d] + offsets[i * 3 + d];
                }
            }
            for c in &mut center {
                *c /= per_frame as f32;
            }
            let mut pose = Pose::identity();
            pose.translation = center;

            let gt = batch.ground_truth.get(f);
            let add_error = gt.map(|g| self.add_error(&pose, &g.pose));
            estimates.push(InstanceEstimate {
                obj_id: gt.map_or(self.obj_id, |g| g.obj_id),
                pose,
                add_error,
                symmetric: self.symmetric,
                correct: add_error.map(|e| e < self.threshold * diameter),
            });
        }
        Ok(estimates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_batch(data: &mut SyntheticFrames, split: Split) -> Batch {
        data.batches(split, Shard::single(), 0).unwrap().next().unwrap().unwrap()
    }

    #[test]
    fn test_frames_are_deterministic() {
        let mut a = SyntheticFrames::new(3, 4, 2);
        let mut b = SyntheticFrames::new(3, 4, 2);
        assert_eq!(first_batch(&mut a, Split::Train), first_batch(&mut b, Split::Train));
        assert_ne!(first_batch(&mut a, Split::Train), first_batch(&mut a, Split::Test));
        assert_eq!(a.batches_per_epoch(Split::Train, Shard { rank: 1, world_size: 2 }), 2);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut data = SyntheticFrames::new(5, 1, 1);
        let batch = first_batch(&mut data, Split::Train);
        let mut net = LinearOffsetNet::new(5);
        let pass = net.forward_backward(&batch, 1.0).unwrap();
        let analytic = pass.gradients.get(BIAS).unwrap().data()[0];

        let h = 1e-3;
        let mut plus = net.clone();
        plus.parameters_mut().get_mut(BIAS).unwrap().data_mut()[0] += h;
        let mut minus = net.clone();
        minus.parameters_mut().get_mut(BIAS).unwrap().data_mut()[0] -= h;
        let numeric = (plus.evaluate_loss(&batch).unwrap().total - minus.evaluate_loss(&batch).unwrap().total) / (2.0 * h);
        assert!((analytic - numeric).abs() < 1e-3, "analytic {analytic} vs numeric {numeric}");
    }

    #[test]
    fn test_ground_truth_voting_recovers_pose() {
        let mut data = SyntheticFrames::new(9, 1, 2).with_object_id(6);
        let batch = first_batch(&mut data, Split::Test);
        let mut eval = MeanVoteEvaluator::new(6, data.model_keypoints().to_vec(), false);
        let output = NetworkOutput::default();
        let estimates = eval
            .evaluate(EvaluationInput { batch: &batch, output: &output, source: PredictionSource::GroundTruth })
            .unwrap();

        assert_eq!(estimates.len(), 2);
        assert!(estimates.iter().all(|e| e.correct == Some(true) && e.obj_id == 6));
        assert!(estimates[0].add_error.unwrap() < 1e-4);
    }

    #[test]
    fn test_missing_prediction_is_an_error() {
        let mut data = SyntheticFrames::new(9, 1, 1);
        let batch = first_batch(&mut data, Split::Test);
        let mut eval = MeanVoteEvaluator::new(1, data.model_keypoints().to_vec(), true);
        let output = NetworkOutput::default();
        let result = eval.evaluate(EvaluationInput { batch: &batch, output: &output, source: PredictionSource::Network });
        assert!(matches!(result, Err(CollaboratorError::MissingField(_))));
    }
}
