//! Gated feedforward block.

use ndarray::{Array3, ArrayViewD, ArrayViewMutD};
use rand::Rng;

use super::norm_linear::{NormLinear, ProjectionConfig};
use super::params::{join, Parameters};
use super::residual::Branch;
use super::scale::Scale;
use crate::error::{NgptError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct FeedForwardConfig {
    pub dim: usize,
    pub expand_factor: f64,
    pub s_hidden_init: f32,
    pub s_hidden_scale: f32,
    pub s_gate_init: f32,
    pub s_gate_scale: f32,
}

/// Shape-only identity of a [`FeedForward`] block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeedForwardSignature {
    pub dim: usize,
    pub expand_factor: f64,
}

/// Hidden width: two thirds of `dim * expand_factor`, so the gated block has
/// the parameter count of an ungated one at the same expansion.
pub fn inner_dim(dim: usize, expand_factor: f64) -> usize {
    (dim as f64 * expand_factor * 2.0 / 3.0) as usize
}

#[derive(Clone, Debug)]
pub struct FeedForward {
    dim: usize,
    expand_factor: f64,
    dim_inner: usize,

    pub to_hidden: NormLinear,
    pub to_gate: NormLinear,
    pub to_out: NormLinear,

    hidden_scale: Scale,
    gate_scale: Scale,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(
        config: &FeedForwardConfig,
        proj: &ProjectionConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let dim_inner = inner_dim(config.dim, config.expand_factor);
        if dim_inner == 0 {
            return Err(NgptError::config(format!(
                "feedforward inner dimension is zero for dim {} and expand factor {}",
                config.dim, config.expand_factor
            )));
        }

        Ok(Self {
            dim: config.dim,
            expand_factor: config.expand_factor,
            dim_inner,
            to_hidden: NormLinear::new(config.dim, dim_inner, true, proj, rng)?,
            to_gate: NormLinear::new(config.dim, dim_inner, true, proj, rng)?,
            to_out: NormLinear::new(dim_inner, config.dim, false, proj, rng)?,
            hidden_scale: Scale::new(dim_inner, config.s_hidden_init, config.s_hidden_scale)?,
            gate_scale: Scale::new(dim_inner, config.s_gate_init, config.s_gate_scale)?,
        })
    }

    pub fn dim_inner(&self) -> usize {
        self.dim_inner
    }

    pub fn norm_linears_mut(&mut self) -> [&mut NormLinear; 3] {
        [&mut self.to_hidden, &mut self.to_gate, &mut self.to_out]
    }

    pub fn norm_linears(&self) -> [&NormLinear; 3] {
        [&self.to_hidden, &self.to_gate, &self.to_out]
    }

    pub fn signature(&self) -> FeedForwardSignature {
        FeedForwardSignature {
            dim: self.dim,
            expand_factor: self.expand_factor,
        }
    }
}

impl Branch for FeedForward {
    type Args<'a> = ();
    type Extra = ();

    fn forward(&self, x: &Array3<f32>, _: ()) -> Result<(Array3<f32>, ())> {
        let hidden = self.to_hidden.forward(x)? * &self.hidden_scale.value();

        // sqrt(dim) restores the variance the unit-norm rows take away
        let gate_gain = &self.gate_scale.value() * (self.dim as f32).sqrt();
        let gate = self.to_gate.forward(x)? * &gate_gain;

        let gated = gate.mapv(silu) * &hidden;
        Ok((self.to_out.forward(&gated)?, ()))
    }
}

impl Parameters for FeedForward {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.to_hidden.visit(&join(prefix, "to_hidden"), f);
        self.to_gate.visit(&join(prefix, "to_gate"), f);
        self.to_out.visit(&join(prefix, "to_out"), f);
        f(&join(prefix, "hidden_scale"), self.hidden_scale.stored.view().into_dyn());
        f(&join(prefix, "gate_scale"), self.gate_scale.stored.view().into_dyn());
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.to_hidden.visit_mut(&join(prefix, "to_hidden"), f);
        self.to_gate.visit_mut(&join(prefix, "to_gate"), f);
        self.to_out.visit_mut(&join(prefix, "to_out"), f);
        f(
            &join(prefix, "hidden_scale"),
            self.hidden_scale.stored.view_mut().into_dyn(),
        );
        f(
            &join(prefix, "gate_scale"),
            self.gate_scale.stored.view_mut().into_dyn(),
        );
    }
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(dim: usize) -> FeedForwardConfig {
        FeedForwardConfig {
            dim,
            expand_factor: 4.0,
            s_hidden_init: 1.0,
            s_hidden_scale: 1.0,
            s_gate_init: 1.0,
            s_gate_scale: 1.0,
        }
    }

    #[test]
    fn test_inner_dim() {
        assert_eq!(inner_dim(16, 4.0), 42);
        assert_eq!(inner_dim(3, 4.0), 8);
        assert_eq!(inner_dim(512, 4.0), 1365);
        assert_eq!(inner_dim(1, 1.0), 0);
        // 2.6 is not exact in binary; the product must still truncate to 26
        assert_eq!(inner_dim(15, 2.6), 26);
        assert_eq!(inner_dim(30, 2.6), 52);
    }

    #[test]
    fn test_forward_shape_and_per_position() {
        let mut rng = StdRng::seed_from_u64(21);
        let ff = FeedForward::new(&config(16), &ProjectionConfig::default(), &mut rng).unwrap();
        assert_eq!(ff.dim_inner(), 42);

        let x = Array3::from_shape_fn((2, 3, 16), |(b, n, d)| ((b + n + d) % 5) as f32 * 0.2 - 0.4);
        let (y, ()) = ff.forward(&x, ()).unwrap();
        assert_eq!(y.dim(), (2, 3, 16));

        let mut x2 = x.clone();
        x2.slice_mut(s![.., 2, ..]).fill(1.0);
        let (y2, ()) = ff.forward(&x2, ()).unwrap();
        for (a, b) in y.slice(s![.., ..2, ..]).iter().zip(y2.slice(s![.., ..2, ..]).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_hidden_scale_silences_block() {
        let mut rng = StdRng::seed_from_u64(22);
        let cfg = FeedForwardConfig {
            s_hidden_init: 0.0,
            ..config(8)
        };
        let ff = FeedForward::new(&cfg, &ProjectionConfig::default(), &mut rng).unwrap();
        let x = Array3::from_elem((1, 2, 8), 0.3f32);
        let (y, ()) = ff.forward(&x, ()).unwrap();
        assert!(y.iter().all(|v| v.abs() < 1e-7));
    }

    #[test]
    fn test_rejects_empty_inner() {
        let mut rng = StdRng::seed_from_u64(23);
        let cfg = FeedForwardConfig {
            expand_factor: 0.1,
            ..config(4)
        };
        assert!(FeedForward::new(&cfg, &ProjectionConfig::default(), &mut rng).is_err());
    }

    #[test]
    fn test_silu() {
        assert!(silu(0.0).abs() < 1e-7);
        assert!(silu(1.0) > 0.5);
        assert!(silu(-1.0) < 0.0);
    }

    #[test]
    fn test_parameter_count() {
        let mut rng = StdRng::seed_from_u64(24);
        let ff = FeedForward::new(&config(16), &ProjectionConfig::default(), &mut rng).unwrap();
        assert_eq!(ff.parameter_count(), 3 * 16 * 42 + 2 * 42);
    }
}
