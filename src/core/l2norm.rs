//! Hypersphere normalizer.
//!
//! Projects every lane of an array along one axis onto the unit sphere. A lane
//! may be split into `groups` contiguous sub-vectors, each normalized on its
//! own sphere. With a non-zero `tolerance` the projection becomes a soft clamp:
//! lanes whose norm already lies in `[1 - tol, 1 + tol]` pass through unscaled.

use ndarray::{s, Array, ArrayBase, ArrayViewMut1, Axis, Data, DataMut, Dimension};
use serde::{Deserialize, Serialize};

use crate::error::{NgptError, Result};

/// Floor applied to the norm in exact mode so a zero lane never divides by zero.
pub const EXACT_NORM_FLOOR: f32 = 1e-12;

/// Floating-point precision the weights are meant to be trained in.
///
/// Only affects the divisor floor of the tolerance-band normalizer; arithmetic
/// stays in `f32`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    #[default]
    Single,
}

impl Precision {
    /// Smallest divisor the tolerance-band normalizer will use.
    pub fn norm_floor(self) -> f32 {
        match self {
            Precision::Half => 1e-5,
            Precision::Single => 1e-10,
        }
    }
}

/// Axis a normalizer operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormAxis {
    /// The last axis of whatever array is passed in.
    Last,
    Index(usize),
}

impl NormAxis {
    fn resolve(self, ndim: usize) -> Axis {
        match self {
            NormAxis::Last => Axis(ndim.saturating_sub(1)),
            NormAxis::Index(i) => Axis(i),
        }
    }
}

/// Hypersphere normalizer configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct L2Norm {
    pub axis: NormAxis,

    /// Half-width of the accepted norm band. Zero means exact projection.
    pub tolerance: f32,

    /// Number of independent spheres per lane.
    pub groups: usize,

    /// Divisor floor used when `tolerance > 0`.
    pub eps: f32,
}

impl L2Norm {
    /// Exact, single-group normalizer.
    pub fn new(axis: NormAxis) -> Self {
        Self {
            axis,
            tolerance: 0.0,
            groups: 1,
            eps: Precision::Single.norm_floor(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f32, precision: Precision) -> Self {
        self.tolerance = tolerance;
        self.eps = precision.norm_floor();
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Check that lanes of length `lane_len` can be normalized with this config.
    pub fn validate(&self, lane_len: usize) -> Result<()> {
        if !(0.0..1.0).contains(&self.tolerance) {
            return Err(NgptError::config(format!(
                "norm tolerance must lie in [0, 1), got {}",
                self.tolerance
            )));
        }
        if self.groups == 0 {
            return Err(NgptError::config("number of hyperspheres must be at least 1"));
        }
        if lane_len % self.groups != 0 {
            return Err(NgptError::config(format!(
                "dimension {} is not divisible into {} hyperspheres",
                lane_len, self.groups
            )));
        }
        Ok(())
    }

    /// Return a normalized copy of `t`.
    pub fn apply<S, D>(&self, t: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let mut out = t.to_owned();
        self.apply_inplace(&mut out);
        out
    }

    /// Normalize `t` in place.
    pub fn apply_inplace<S, D>(&self, t: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        let axis = self.axis.resolve(t.ndim());
        let len = t.len_of(axis);
        let groups = self.groups.max(1);
        assert_eq!(
            len % groups,
            0,
            "lane length {len} not divisible into {groups} groups"
        );
        let size = len / groups;
        if size == 0 {
            return;
        }

        for mut lane in t.lanes_mut(axis) {
            for g in 0..groups {
                let chunk = lane.slice_mut(s![g * size..(g + 1) * size]);
                self.normalize_group(chunk);
            }
        }
    }

    /// Largest distance of any group norm from the accepted band.
    ///
    /// Zero means every group of every lane already satisfies the constraint.
    pub fn max_violation<S, D>(&self, t: &ArrayBase<S, D>) -> f32
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let axis = self.axis.resolve(t.ndim());
        let groups = self.groups.max(1);
        let size = t.len_of(axis) / groups;
        if size == 0 {
            return 0.0;
        }

        let mut worst = 0.0f32;
        for lane in t.lanes(axis) {
            for g in 0..groups {
                let chunk = lane.slice(s![g * size..(g + 1) * size]);
                let norm = chunk.iter().map(|v| v * v).sum::<f32>().sqrt();
                worst = worst.max(((norm - 1.0).abs() - self.tolerance).max(0.0));
            }
        }
        worst
    }

    fn normalize_group(&self, mut chunk: ArrayViewMut1<'_, f32>) {
        let norm = chunk.iter().map(|v| v * v).sum::<f32>().sqrt();
        let divisor = if self.tolerance == 0.0 {
            norm.max(EXACT_NORM_FLOOR)
        } else {
            // Target is a constant w.r.t. gradients.
            let target = norm.clamp(1.0 - self.tolerance, 1.0 + self.tolerance);
            (norm / target).max(self.eps)
        };
        chunk.mapv_inplace(|v| v / divisor);
    }
}

/// Euclidean norm of every lane along the last axis.
pub fn lane_norms<S, D>(t: &ArrayBase<S, D>) -> Vec<f32>
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    let axis = Axis(t.ndim().saturating_sub(1));
    t.lanes(axis)
        .into_iter()
        .map(|lane| lane.iter().map(|v| v * v).sum::<f32>().sqrt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, concatenate, Array2, Array3};

    fn ramp3(b: usize, n: usize, d: usize) -> Array3<f32> {
        Array3::from_shape_fn((b, n, d), |(i, j, k)| {
            ((i * 31 + j * 7 + k * 3) % 11) as f32 - 4.5
        })
    }

    #[test]
    fn test_unit_norm_last_axis() {
        let x = ramp3(2, 3, 8);
        let out = L2Norm::new(NormAxis::Last).apply(&x);
        for n in lane_norms(&out) {
            assert!((n - 1.0).abs() < 1e-5, "norm {n}");
        }
    }

    #[test]
    fn test_idempotent() {
        let norm = L2Norm::new(NormAxis::Last);
        let once = norm.apply(&ramp3(2, 4, 6));
        let twice = norm.apply(&once);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_group_independence() {
        let x = ramp3(1, 3, 8);
        let grouped = L2Norm::new(NormAxis::Last).with_groups(2).apply(&x);

        let single = L2Norm::new(NormAxis::Last);
        let left = single.apply(&x.slice(s![.., .., ..4]));
        let right = single.apply(&x.slice(s![.., .., 4..]));
        let manual = concatenate![Axis(2), left, right];

        for (a, b) in grouped.iter().zip(manual.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_lane_stays_finite() {
        let x = Array2::<f32>::zeros((2, 4));
        let exact = L2Norm::new(NormAxis::Last).apply(&x);
        assert!(exact.iter().all(|v| *v == 0.0));

        let soft = L2Norm::new(NormAxis::Last)
            .with_tolerance(0.1, Precision::Half)
            .apply(&x);
        assert!(soft.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_tolerance_band_passthrough() {
        // norm 1.05 is inside [0.9, 1.1]: unchanged
        let x = array![[1.05f32, 0.0, 0.0]];
        let out = L2Norm::new(NormAxis::Last)
            .with_tolerance(0.1, Precision::Single)
            .apply(&x);
        assert!((out[[0, 0]] - 1.05).abs() < 1e-6);
    }

    #[test]
    fn test_tolerance_band_clamps_outliers() {
        let x = array![[3.0f32, 4.0], [0.03, 0.04]];
        let out = L2Norm::new(NormAxis::Last)
            .with_tolerance(0.1, Precision::Single)
            .apply(&x);
        let norms = lane_norms(&out);
        assert!((norms[0] - 1.1).abs() < 1e-5);
        assert!((norms[1] - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_axis_zero_normalizes_columns() {
        let w = array![[3.0f32, 1.0], [4.0, 0.0]];
        let out = L2Norm::new(NormAxis::Index(0)).apply(&w);
        assert!((out[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((out[[1, 0]] - 0.8).abs() < 1e-6);
        assert!((out[[0, 1]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_validate() {
        let norm = L2Norm::new(NormAxis::Last).with_groups(3);
        assert!(norm.validate(9).is_ok());
        assert!(norm.validate(8).is_err());

        let bad = L2Norm::new(NormAxis::Last).with_tolerance(1.0, Precision::Single);
        assert!(bad.validate(4).is_err());
    }

    #[test]
    fn test_max_violation() {
        let norm = L2Norm::new(NormAxis::Last);
        let x = array![[3.0f32, 4.0], [0.6, 0.8]];
        assert!((norm.max_violation(&x) - 4.0).abs() < 1e-5);
        assert!(norm.max_violation(&norm.apply(&x)) < 1e-6);

        let banded = L2Norm::new(NormAxis::Last).with_tolerance(0.5, Precision::Single);
        assert!((banded.max_violation(&x) - 3.5).abs() < 1e-5);
    }

    #[test]
    fn test_precision_floor() {
        assert!(Precision::Half.norm_floor() > Precision::Single.norm_floor());
    }
}
