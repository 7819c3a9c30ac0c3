//! Decoupled per-channel scale.
//!
//! The stored parameter starts at `scale` and is multiplied by `init / scale`
//! on every read, so the effective value starts at `init` while an optimizer
//! step on the stored value moves the effective value `init / scale` times as
//! far. `scale` therefore acts as a per-parameter learning-rate knob.

use ndarray::Array1;

use crate::error::{NgptError, Result};

/// Shape-only identity of a [`Scale`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScaleSignature {
    pub dim: usize,
}

#[derive(Clone, Debug)]
pub struct Scale {
    dim: usize,

    /// Learned value, initialised to `scale`.
    pub stored: Array1<f32>,

    /// `init / scale`.
    forward_ratio: f32,
}

impl Scale {
    pub fn new(dim: usize, init: f32, scale: f32) -> Result<Self> {
        if !scale.is_finite() || scale == 0.0 {
            return Err(NgptError::config(format!(
                "scale must be finite and non-zero, got {scale}"
            )));
        }
        if !init.is_finite() {
            return Err(NgptError::config(format!("scale init must be finite, got {init}")));
        }
        Ok(Self {
            dim,
            stored: Array1::from_elem(dim, scale),
            forward_ratio: init / scale,
        })
    }

    /// Effective per-channel value.
    pub fn value(&self) -> Array1<f32> {
        &self.stored * self.forward_ratio
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn forward_ratio(&self) -> f32 {
        self.forward_ratio
    }

    pub fn signature(&self) -> ScaleSignature {
        ScaleSignature { dim: self.dim }
    }
}
