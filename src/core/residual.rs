//! Spherical residual fusion.
//!
//! Instead of `x + f(x)`, the wrapper moves `x` toward the normalized branch
//! output by a learned per-channel amount and projects the result back onto
//! the sphere:
//!
//! ```text
//! out   = N(f(x))
//! fused = x + alpha ⊙ (out - x)
//! y     = N(fused)
//! ```

use ndarray::{Array3, ArrayViewD, ArrayViewMutD};

use super::l2norm::{L2Norm, NormAxis};
use super::params::{join, Parameters};
use super::scale::Scale;
use crate::error::{NgptError, Result};

/// A block that can sit inside a [`Residual`].
///
/// `Extra` is an auxiliary payload returned next to the primary output; the
/// wrapper hands it back untouched.
pub trait Branch {
    type Args<'a>;
    type Extra;

    fn forward(&self, x: &Array3<f32>, args: Self::Args<'_>) -> Result<(Array3<f32>, Self::Extra)>;
}

#[derive(Clone, Debug)]
pub struct Residual<B> {
    pub inner: B,

    /// Interpolation weight `alpha` over the model dimension.
    branch_scale: Scale,

    norm: L2Norm,
}

impl<B: Branch> Residual<B> {
    pub fn new(inner: B, dim: usize, init: f32, scale: f32) -> Result<Self> {
        Ok(Self {
            inner,
            branch_scale: Scale::new(dim, init, scale)?,
            norm: L2Norm::new(NormAxis::Last),
        })
    }

    pub fn forward(&self, x: &Array3<f32>, args: B::Args<'_>) -> Result<(Array3<f32>, B::Extra)> {
        let (out, extra) = self.inner.forward(x, args)?;
        Ok((self.fuse(x, &out)?, extra))
    }

    /// Interpolate from `x` toward the branch output and renormalize.
    pub fn fuse(&self, x: &Array3<f32>, out: &Array3<f32>) -> Result<Array3<f32>> {
        if out.dim() != x.dim() {
            return Err(NgptError::ShapeMismatch {
                what: "residual branch output",
                expected: x.shape().to_vec(),
                actual: out.shape().to_vec(),
            });
        }
        let out = self.norm.apply(out);
        let alpha = self.branch_scale.value();
        let fused = x + &((&out - x) * &alpha);
        Ok(self.norm.apply(&fused))
    }

    pub fn branch_scale(&self) -> &Scale {
        &self.branch_scale
    }
}

impl<B: Parameters> Parameters for Residual<B> {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.inner.visit(prefix, f);
        f(&join(prefix, "branch_scale"), self.branch_scale.stored.view().into_dyn());
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.inner.visit_mut(prefix, f);
        f(
            &join(prefix, "branch_scale"),
            self.branch_scale.stored.view_mut().into_dyn(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::l2norm::lane_norms;

    /// Branch returning an arbitrary-norm affine map of its input plus a tag.
    struct Affine {
        gain: f32,
        bias: f32,
    }

    impl Branch for Affine {
        type Args<'a> = u32;
        type Extra = u32;

        fn forward(&self, x: &Array3<f32>, tag: u32) -> Result<(Array3<f32>, u32)> {
            Ok((x.mapv(|v| v * self.gain + self.bias), tag))
        }
    }

    fn unit_input() -> Array3<f32> {
        let x = Array3::from_shape_fn((2, 3, 4), |(b, n, d)| (b + 2 * n + 3 * d) as f32 - 4.0);
        L2Norm::new(NormAxis::Last).apply(&x)
    }

    #[test]
    fn test_output_is_unit_norm_for_arbitrary_branch() {
        for &(gain, bias) in &[(1000.0f32, 3.0f32), (-0.001, 0.0), (0.0, 25.0)] {
            let res = Residual::new(Affine { gain, bias }, 4, 0.3, 0.5).unwrap();
            let (y, tag) = res.forward(&unit_input(), 9).unwrap();
            assert_eq!(tag, 9);
            for n in lane_norms(&y) {
                assert!((n - 1.0).abs() < 1e-5, "norm {n}");
            }
        }
    }

    #[test]
    fn test_non_unit_input_still_unit_output() {
        let res = Residual::new(Affine { gain: 2.0, bias: 1.0 }, 4, 0.5, 1.0).unwrap();
        let x = Array3::from_elem((1, 2, 4), 10.0f32);
        let (y, _) = res.forward(&x, 0).unwrap();
        for n in lane_norms(&y) {
            assert!((n - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_alpha_endpoints() {
        let x = unit_input();

        // alpha = 0 keeps the input
        let keep = Residual::new(Affine { gain: -3.0, bias: 0.5 }, 4, 0.0, 1.0).unwrap();
        let (y, _) = keep.forward(&x, 0).unwrap();
        for (a, b) in y.iter().zip(x.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        // alpha = 1 replaces it with the normalized branch output
        let replace = Residual::new(Affine { gain: -3.0, bias: 0.0 }, 4, 1.0, 1.0).unwrap();
        let (y, _) = replace.forward(&x, 0).unwrap();
        for (a, b) in y.iter().zip(x.iter()) {
            assert!((a + b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let res = Residual::new(Affine { gain: 1.0, bias: 0.0 }, 4, 0.5, 1.0).unwrap();
        let x = unit_input();
        let out = Array3::zeros((2, 3, 5));
        assert!(res.fuse(&x, &out).is_err());
    }
}
