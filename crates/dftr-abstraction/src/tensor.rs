//! Host-side tensor containers shared by every collaborator.

use crate::{CollaboratorError, CollaboratorResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dense, row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` holds exactly `shape.iter().product()` values.
    ///
    /// # Errors
    /// Returns `CollaboratorError::ShapeMismatch` if the element count disagrees with the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> CollaboratorResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Creates a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, data: vec![0.0; n] }
    }

    /// Creates a one-dimensional tensor.
    #[must_use]
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// True when no element is infinite or NaN.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Multiplies every element by `factor` in place.
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }
}

/// Named tensors in a deterministic (sorted) order.
///
/// Used for model parameters, gradients, and optimizer moment estimates. The sorted
/// order is what makes flattening for all-reduce identical on every process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, Tensor>);

impl ParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.0.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Tensor)> {
        self.0.iter_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of scalar elements across all tensors.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.0.values().map(Tensor::numel).sum()
    }

    /// True when every tensor is finite.
    #[must_use]
    pub fn all_finite(&self) -> bool {
        self.0.values().all(Tensor::is_finite)
    }

    /// Multiplies every tensor by `factor`.
    pub fn scale_all(&mut self, factor: f32) {
        for t in self.0.values_mut() {
            t.scale(factor);
        }
    }

    /// A set with the same names and shapes, filled with zeros.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self(self.0.iter().map(|(k, t)| (k.clone(), Tensor::zeros(t.shape().to_vec()))).collect())
    }

    /// Concatenates all tensors (in name order) into one flat buffer.
    #[must_use]
    pub fn flatten(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.numel());
        for t in self.0.values() {
            out.extend_from_slice(t.data());
        }
        out
    }

    /// Overwrites all tensors from a flat buffer produced by [`ParameterSet::flatten`].
    ///
    /// # Errors
    /// Returns `CollaboratorError::ShapeMismatch` if the buffer length differs from `numel()`.
    pub fn unflatten_from(&mut self, flat: &[f32]) -> CollaboratorResult<()> {
        if flat.len() != self.numel() {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "flat buffer has {} values, parameter set has {}",
                flat.len(),
                self.numel()
            )));
        }
        let mut offset = 0;
        for t in self.0.values_mut() {
            let n = t.numel();
            t.data_mut().copy_from_slice(&flat[offset..offset + n]);
            offset += n;
        }
        Ok(())
    }

    /// Describes the first difference in names or shapes between two sets, if any.
    #[must_use]
    pub fn layout_mismatch(&self, other: &Self) -> Option<String> {
        for (name, t) in &self.0 {
            match other.0.get(name) {
                None => return Some(format!("parameter '{name}' missing")),
                Some(o) if o.shape() != t.shape() => {
                    return Some(format!(
                        "parameter '{name}' has shape {:?}, expected {:?}",
                        o.shape(),
                        t.shape()
                    ));
                }
                Some(_) => {}
            }
        }
        other
            .0
            .keys()
            .find(|name| !self.0.contains_key(*name))
            .map(|name| format!("unexpected parameter '{name}'"))
    }
}

/// Per-step batch statistics reported by one batch-normalization layer.
///
/// Sums rather than means are carried so that statistics from several devices can be
/// combined exactly by summation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    /// Layer name, matching `BatchNormLayer::name`.
    pub layer: String,
    /// Number of samples the sums were taken over.
    pub count: f32,
    /// Per-feature sum of activations.
    pub sum: Vec<f32>,
    /// Per-feature sum of squared activations.
    pub sum_sq: Vec<f32>,
}

impl BatchStatistics {
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.count.is_finite()
            && self.sum.iter().all(|v| v.is_finite())
            && self.sum_sq.iter().all(|v| v.is_finite())
    }

    /// Appends `[count, sum.., sum_sq..]` to `out`.
    pub fn write_flat(&self, out: &mut Vec<f32>) {
        out.push(self.count);
        out.extend_from_slice(&self.sum);
        out.extend_from_slice(&self.sum_sq);
    }

    /// Reads back the layout written by [`BatchStatistics::write_flat`], returning the
    /// number of values consumed.
    ///
    /// Returns `CollaboratorError::ShapeMismatch` if `sum` and `sum_sq` disagree in length
    /// or `flat` is too short; `self` is left untouched in that case.
    pub fn read_flat(&mut self, flat: &[f32]) -> CollaboratorResult<usize> {
        let f = self.sum.len();
        if self.sum_sq.len() != f {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "layer '{}' reports {} sums but {} squared sums",
                self.layer,
                f,
                self.sum_sq.len()
            )));
        }
        let needed = 1 + 2 * f;
        if flat.len() < needed {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "layer '{}' needs {} values, buffer holds {}",
                self.layer,
                needed,
                flat.len()
            )));
        }
        self.count = flat[0];
        self.sum.copy_from_slice(&flat[1..=f]);
        self.sum_sq.copy_from_slice(&flat[1 + f..needed]);
        Ok(needed)
    }

    /// Length of the flat layout.
    #[must_use]
    pub fn flat_len(&self) -> usize {
        1 + self.sum.len() + self.sum_sq.len()
    }
}

/// Running statistics and momentum of a batch-normalization layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormLayer {
    pub name: String,
    /// Weight given to the newest batch: `running = (1 - m) * running + m * batch`.
    pub momentum: f32,
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
}

impl BatchNormLayer {
    #[must_use]
    pub fn new(name: impl Into<String>, features: usize, momentum: f32) -> Self {
        Self {
            name: name.into(),
            momentum,
            running_mean: vec![0.0; features],
            running_var: vec![1.0; features],
        }
    }

    #[must_use]
    pub fn features(&self) -> usize {
        self.running_mean.len()
    }

    /// Folds one step's statistics into the running estimates (unbiased variance).
    ///
    /// # Errors
    /// Returns `CollaboratorError::ShapeMismatch` if the feature counts differ.
    pub fn update(&mut self, stats: &BatchStatistics) -> CollaboratorResult<()> {
        if stats.sum.len() != self.features() || stats.sum_sq.len() != self.features() {
            return Err(CollaboratorError::ShapeMismatch(format!(
                "batch norm '{}' has {} features, statistics carry {}",
                self.name,
                self.features(),
                stats.sum.len()
            )));
        }
        if stats.count < 1.0 {
            return Ok(());
        }
        let m = self.momentum;
        let n = stats.count;
        for i in 0..self.features() {
            let mean = stats.sum[i] / n;
            let biased = (stats.sum_sq[i] / n - mean * mean).max(0.0);
            let var = if n > 1.0 { biased * n / (n - 1.0) } else { biased };
            self.running_mean[i] = (1.0 - m) * self.running_mean[i] + m * mean;
            self.running_var[i] = (1.0 - m) * self.running_var[i] + m * var;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ParameterSet {
        let mut set = ParameterSet::new();
        set.insert("b", Tensor::from_vec(vec![3.0]));
        set.insert("a", Tensor::new(vec![2, 1], vec![1.0, 2.0]).unwrap());
        set
    }

    #[test]
    fn test_tensor_new_rejects_bad_shape() {
        assert!(Tensor::new(vec![2, 2], vec![1.0; 3]).is_err());
    }

    #[test]
    fn test_flatten_uses_name_order() {
        let set = sample_set();
        assert_eq!(set.flatten(), vec![1.0, 2.0, 3.0]);

        let mut copy = set.zeros_like();
        copy.unflatten_from(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(copy, set);
        assert!(copy.unflatten_from(&[1.0]).is_err());
    }

    #[test]
    fn test_layout_mismatch_reports_shape_and_extra_names() {
        let set = sample_set();
        let mut other = set.clone();
        other.insert("a", Tensor::from_vec(vec![1.0, 2.0]));
        assert!(set.layout_mismatch(&other).unwrap().contains("shape"));

        let mut extra = set.clone();
        extra.insert("c", Tensor::from_vec(vec![0.0]));
        assert!(set.layout_mismatch(&extra).unwrap().contains("unexpected"));
        assert!(set.layout_mismatch(&set.clone()).is_none());
    }

    #[test]
    fn test_batch_norm_update_uses_momentum() {
        let mut bn = BatchNormLayer::new("bn", 1, 0.5);
        let stats = BatchStatistics { layer: "bn".into(), count: 2.0, sum: vec![4.0], sum_sq: vec![10.0] };
        bn.update(&stats).unwrap();
        // mean 2, biased var 1, unbiased var 2
        assert!((bn.running_mean[0] - 1.0).abs() < 1e-6);
        assert!((bn.running_var[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_batch_statistics_flat_roundtrip() {
        let stats = BatchStatistics { layer: "bn".into(), count: 3.0, sum: vec![1.0, 2.0], sum_sq: vec![3.0, 4.0] };
        let mut flat = Vec::new();
        stats.write_flat(&mut flat);
        assert_eq!(flat.len(), stats.flat_len());

        let mut back = BatchStatistics { layer: "bn".into(), count: 0.0, sum: vec![0.0; 2], sum_sq: vec![0.0; 2] };
        assert_eq!(back.read_flat(&flat).unwrap(), 5);
        assert_eq!(back, stats);
    }

    #[test]
    fn test_batch_statistics_read_rejects_bad_lengths() {
        let flat = [2.0, 1.0, 1.0];
        let mut ragged = BatchStatistics { layer: "bn".into(), count: 0.0, sum: vec![0.0; 2], sum_sq: vec![0.0] };
        assert!(matches!(ragged.read_flat(&flat), Err(CollaboratorError::ShapeMismatch(_))));

        let mut wide = BatchStatistics { layer: "bn".into(), count: 0.0, sum: vec![0.0; 2], sum_sq: vec![0.0; 2] };
        let err = wide.read_flat(&flat).unwrap_err();
        assert!(matches!(err, CollaboratorError::ShapeMismatch(msg) if msg.contains("needs 5")));
        assert!(wide.count.abs() < f32::EPSILON);
    }
}
