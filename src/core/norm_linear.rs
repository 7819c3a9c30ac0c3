//! Norm-constrained linear projection.
//!
//! `y = (x · Wᵀ) / groups`, where every row of `W` (input-axis normalization)
//! or every column (output-axis normalization) lives on the unit hypersphere.
//!
//! How the constraint is enforced is a per-projection strategy:
//! - [`EagerView`] normalizes the raw weight on every read. The stored weight
//!   may drift in magnitude; forward never sees the drift.
//! - [`LazyView`] reads the stored weight as-is. The training loop must call
//!   [`NormLinear::normalize_weights`] after every optimizer step.

use std::fmt;

use ndarray::{Array2, Array3, ArrayBase, ArrayViewD, ArrayViewMutD, Axis, CowArray, Data, Ix2, Ix3};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use super::l2norm::{L2Norm, NormAxis, Precision};
use super::params::{join, Parameters};
use crate::error::{NgptError, Result};

/// Strategy mapping a stored weight to the weight used by forward.
pub trait WeightView: Send + Sync + fmt::Debug {
    fn effective<'a>(&self, raw: &'a Array2<f32>, norm: &L2Norm) -> CowArray<'a, f32, Ix2>;

    /// Make the stored weight satisfy the constraint.
    fn renormalize(&self, raw: &mut Array2<f32>, norm: &L2Norm);

    /// Whether the stored weight drifts unless `renormalize` runs after each update.
    fn needs_external_sync(&self) -> bool;
}

/// Transform-on-read.
#[derive(Debug)]
pub struct EagerView;

impl WeightView for EagerView {
    fn effective<'a>(&self, raw: &'a Array2<f32>, norm: &L2Norm) -> CowArray<'a, f32, Ix2> {
        CowArray::from(norm.apply(raw))
    }

    /// Sync: copy the normalized view back onto storage.
    fn renormalize(&self, raw: &mut Array2<f32>, norm: &L2Norm) {
        let synced = self.effective(raw, norm).into_owned();
        raw.assign(&synced);
    }

    fn needs_external_sync(&self) -> bool {
        false
    }
}

/// Identity on read, explicit renormalization after every update.
#[derive(Debug)]
pub struct LazyView;

impl WeightView for LazyView {
    fn effective<'a>(&self, raw: &'a Array2<f32>, _norm: &L2Norm) -> CowArray<'a, f32, Ix2> {
        CowArray::from(raw.view())
    }

    fn renormalize(&self, raw: &mut Array2<f32>, norm: &L2Norm) {
        norm.apply_inplace(raw);
    }

    fn needs_external_sync(&self) -> bool {
        true
    }
}

/// Enforcement policy selected in configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    #[default]
    Eager,
    Lazy,
}

impl Enforcement {
    pub fn view(self) -> &'static dyn WeightView {
        match self {
            Enforcement::Eager => &EagerView,
            Enforcement::Lazy => &LazyView,
        }
    }
}

/// Settings shared by every projection of a network.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectionConfig {
    pub enforcement: Enforcement,

    /// Tolerance band of the weight normalizer.
    pub tolerance: f32,

    pub precision: Precision,

    /// Number of hyperspheres each normalized vector is split into.
    pub groups: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            enforcement: Enforcement::Eager,
            tolerance: 0.0,
            precision: Precision::Single,
            groups: 1,
        }
    }
}

/// Shape-only identity of a [`NormLinear`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProjectionSignature {
    pub dim_in: usize,
    pub dim_out: usize,
}

#[derive(Clone)]
pub struct NormLinear {
    dim_in: usize,
    dim_out: usize,

    /// Stored weight `[dim_out, dim_in]`.
    weight: Array2<f32>,

    norm: L2Norm,

    /// `1 / groups`.
    output_scale: f32,

    enforcement: Enforcement,
}

impl fmt::Debug for NormLinear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormLinear")
            .field("dim_in", &self.dim_in)
            .field("dim_out", &self.dim_out)
            .field("norm", &self.norm)
            .field("enforcement", &self.enforcement)
            .finish()
    }
}

impl NormLinear {
    /// Random projection with a normalized stored weight.
    ///
    /// `norm_dim_in` normalizes each row (one per output feature) along the
    /// input axis; otherwise each column is normalized along the output axis.
    pub fn new<R: Rng + ?Sized>(
        dim_in: usize,
        dim_out: usize,
        norm_dim_in: bool,
        config: &ProjectionConfig,
        rng: &mut R,
    ) -> Result<Self> {
        if dim_in == 0 || dim_out == 0 {
            return Err(NgptError::config(format!(
                "projection dimensions must be positive, got {dim_in} -> {dim_out}"
            )));
        }

        let std = (dim_in as f32).powf(-0.5);
        let dist = Normal::new(0.0f32, std).map_err(|e| NgptError::config(e.to_string()))?;
        let weight = Array2::from_shape_simple_fn((dim_out, dim_in), || dist.sample(&mut *rng));

        Self::from_weight(weight, norm_dim_in, config)
    }

    /// Wrap an existing `[dim_out, dim_in]` weight. The stored copy is normalized.
    pub fn from_weight(weight: Array2<f32>, norm_dim_in: bool, config: &ProjectionConfig) -> Result<Self> {
        let (dim_out, dim_in) = weight.dim();
        let (axis, lane_len) = if norm_dim_in {
            (Axis(1), dim_in)
        } else {
            (Axis(0), dim_out)
        };
        let norm = L2Norm::new(NormAxis::Index(axis.index()))
            .with_tolerance(config.tolerance, config.precision)
            .with_groups(config.groups);
        norm.validate(lane_len)?;

        let mut linear = Self {
            dim_in,
            dim_out,
            weight,
            norm,
            output_scale: 1.0 / config.groups as f32,
            enforcement: config.enforcement,
        };
        linear.normalize_weights();
        Ok(linear)
    }

    /// Weight actually used by forward.
    pub fn weight(&self) -> CowArray<'_, f32, Ix2> {
        self.enforcement.view().effective(&self.weight, &self.norm)
    }

    /// Stored parameter, normalized or not depending on policy and history.
    pub fn raw_weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn raw_weight_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weight
    }

    /// Force the stored weight onto the hypersphere.
    ///
    /// Mandatory after every optimizer step under lazy enforcement; under eager
    /// enforcement this only syncs the stored value with what forward uses.
    pub fn normalize_weights(&mut self) {
        self.enforcement.view().renormalize(&mut self.weight, &self.norm);
    }

    /// How far the stored weight sits outside the norm band.
    pub fn stored_deviation(&self) -> f32 {
        self.norm.max_violation(&self.weight)
    }

    /// Apply to row vectors `[rows, dim_in]`.
    pub fn forward_rows<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix2>) -> Result<Array2<f32>> {
        if x.ncols() != self.dim_in {
            return Err(NgptError::ShapeMismatch {
                what: "projection input",
                expected: vec![x.nrows(), self.dim_in],
                actual: x.shape().to_vec(),
            });
        }
        let weight = self.weight();
        let mut y = x.dot(&weight.t());
        y *= self.output_scale;
        Ok(y)
    }

    /// Apply along the last axis of `[batch, seq, dim_in]`.
    pub fn forward<S: Data<Elem = f32>>(&self, x: &ArrayBase<S, Ix3>) -> Result<Array3<f32>> {
        let (b, n, d) = x.dim();
        let rows = x.to_shape((b * n, d))?;
        let y = self.forward_rows(&rows)?;
        Ok(y.into_shape_with_order((b, n, self.dim_out))?)
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    pub fn enforcement(&self) -> Enforcement {
        self.enforcement
    }

    pub fn signature(&self) -> ProjectionSignature {
        ProjectionSignature {
            dim_in: self.dim_in,
            dim_out: self.dim_out,
        }
    }
}

impl Parameters for NormLinear {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        f(&join(prefix, "weight"), self.weight.view().into_dyn());
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        f(&join(prefix, "weight"), self.weight.view_mut().into_dyn());
    }
}
