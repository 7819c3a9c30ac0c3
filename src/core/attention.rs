//! Multi-head attention built from norm-constrained projections.
//!
//! Queries and keys are normalized per head and queries are scaled by a
//! decoupled scale, so the kernel runs with an explicit scale of
//! `sqrt(dim_head)` rather than the usual `1 / sqrt(dim_head)`.

use ndarray::{s, Array2, Array3, Array4, ArrayViewD, ArrayViewMutD};
use rand::Rng;

use super::l2norm::{L2Norm, NormAxis};
use super::norm_linear::{NormLinear, ProjectionConfig};
use super::params::{join, Parameters};
use super::residual::Branch;
use super::rotary::Rotary;
use super::scale::Scale;
use crate::error::{NgptError, Result};
use crate::kernels::attention::AttentionKernel;

/// Per-block attention hyperparameters.
#[derive(Clone, Debug, PartialEq)]
pub struct AttentionConfig {
    pub dim: usize,
    pub heads: usize,
    pub dim_head: usize,
    pub causal: bool,

    /// Normalize queries and keys per head before scoring.
    pub norm_qk: bool,

    pub s_qk_init: f32,
    pub s_qk_scale: f32,
}

/// Shape-only identity of an [`Attention`] block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttentionSignature {
    pub dim: usize,
    pub heads: usize,
    pub dim_head: usize,
}

/// Per-call inputs besides the token states.
#[derive(Clone, Copy)]
pub struct AttentionArgs<'a> {
    pub kernel: &'a dyn AttentionKernel,

    /// `[batch, seq]`, `true` for keys that may be attended to.
    pub mask: Option<&'a Array2<bool>>,

    pub rotary: Option<&'a dyn Rotary>,

    /// Values carried from an earlier layer, `[batch, heads, seq, dim_head]`.
    pub value_residual: Option<&'a Array4<f32>>,

    /// Hand this block's values back to the caller.
    pub return_values: bool,
}

impl<'a> AttentionArgs<'a> {
    pub fn new(kernel: &'a dyn AttentionKernel) -> Self {
        Self {
            kernel,
            mask: None,
            rotary: None,
            value_residual: None,
            return_values: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Attention {
    dim: usize,
    heads: usize,
    dim_head: usize,
    causal: bool,
    norm_qk: bool,

    pub to_q: NormLinear,
    pub to_k: NormLinear,
    pub to_v: NormLinear,

    /// Output projection, normalized along the model axis.
    pub to_out: NormLinear,

    qk_norm: L2Norm,
    qk_scale: Scale,
    attn_scale: f32,
}

impl Attention {
    pub fn new<R: Rng + ?Sized>(
        config: &AttentionConfig,
        proj: &ProjectionConfig,
        rng: &mut R,
    ) -> Result<Self> {
        if config.heads == 0 || config.dim_head == 0 {
            return Err(NgptError::config("attention needs at least one head of positive width"));
        }
        let dim_inner = config.heads * config.dim_head;

        let qk_norm = L2Norm::new(NormAxis::Last)
            .with_tolerance(proj.tolerance, proj.precision)
            .with_groups(proj.groups);
        qk_norm.validate(config.dim_head)?;

        Ok(Self {
            dim: config.dim,
            heads: config.heads,
            dim_head: config.dim_head,
            causal: config.causal,
            norm_qk: config.norm_qk,
            to_q: NormLinear::new(config.dim, dim_inner, true, proj, rng)?,
            to_k: NormLinear::new(config.dim, dim_inner, true, proj, rng)?,
            to_v: NormLinear::new(config.dim, dim_inner, true, proj, rng)?,
            to_out: NormLinear::new(dim_inner, config.dim, false, proj, rng)?,
            qk_norm,
            qk_scale: Scale::new(dim_inner, config.s_qk_init, config.s_qk_scale)?,
            attn_scale: (config.dim_head as f32).sqrt(),
        })
    }

    /// `[b, n, h * d]` -> `[b, h, n, d]`
    fn split_heads(&self, t: Array3<f32>) -> Result<Array4<f32>> {
        let (b, n, _) = t.dim();
        let t = t.into_shape_with_order((b, n, self.heads, self.dim_head))?;
        Ok(t.permuted_axes([0, 2, 1, 3]).as_standard_layout().into_owned())
    }

    /// `[b, h, n, d]` -> `[b, n, h * d]`
    fn merge_heads(&self, t: Array4<f32>) -> Result<Array3<f32>> {
        let (b, h, n, d) = t.dim();
        let t = t.permuted_axes([0, 2, 1, 3]).as_standard_layout().into_owned();
        Ok(t.into_shape_with_order((b, n, h * d))?)
    }

    pub fn norm_linears_mut(&mut self) -> [&mut NormLinear; 4] {
        [&mut self.to_q, &mut self.to_k, &mut self.to_v, &mut self.to_out]
    }

    pub fn norm_linears(&self) -> [&NormLinear; 4] {
        [&self.to_q, &self.to_k, &self.to_v, &self.to_out]
    }

    pub fn qk_scale(&self) -> &Scale {
        &self.qk_scale
    }

    pub fn causal(&self) -> bool {
        self.causal
    }

    pub fn signature(&self) -> AttentionSignature {
        AttentionSignature {
            dim: self.dim,
            heads: self.heads,
            dim_head: self.dim_head,
        }
    }
}

impl Branch for Attention {
    type Args<'a> = AttentionArgs<'a>;
    type Extra = Option<Array4<f32>>;

    fn forward(
        &self,
        x: &Array3<f32>,
        args: AttentionArgs<'_>,
    ) -> Result<(Array3<f32>, Option<Array4<f32>>)> {
        let (batch, seq, _) = x.dim();
        if let Some(mask) = args.mask {
            if mask.dim() != (batch, seq) {
                return Err(NgptError::ShapeMismatch {
                    what: "attention mask",
                    expected: vec![batch, seq],
                    actual: mask.shape().to_vec(),
                });
            }
        }

        let mut q = self.split_heads(self.to_q.forward(x)?)?;
        let mut k = self.split_heads(self.to_k.forward(x)?)?;
        let mut v = self.split_heads(self.to_v.forward(x)?)?;

        if let Some(carried) = args.value_residual {
            if carried.dim() != v.dim() {
                return Err(NgptError::ShapeMismatch {
                    what: "value residual",
                    expected: v.shape().to_vec(),
                    actual: carried.shape().to_vec(),
                });
            }
            v = (&v + carried) * 0.5;
        }

        if let Some(rotary) = args.rotary {
            rotary.rotate(&mut q);
            rotary.rotate(&mut k);
        }

        if self.norm_qk {
            self.qk_norm.apply_inplace(&mut q);
            self.qk_norm.apply_inplace(&mut k);
        }

        let qk_scale = self
            .qk_scale
            .value()
            .into_shape_with_order((self.heads, 1, self.dim_head))?;
        let q = q * &qk_scale;

        // Rows with no valid key at all; checked before the kernel runs.
        let dead_rows: Vec<usize> = args
            .mask
            .map(|mask| {
                mask.outer_iter()
                    .enumerate()
                    .filter(|(_, row)| !row.iter().any(|&valid| valid))
                    .map(|(b, _)| b)
                    .collect()
            })
            .unwrap_or_default();

        let attended = args
            .kernel
            .attend(&q, &k, &v, args.mask, self.causal, self.attn_scale);

        let mut out = self.to_out.forward(&self.merge_heads(attended)?)?;
        for &b in &dead_rows {
            out.slice_mut(s![b, .., ..]).fill(0.0);
        }

        Ok((out, args.return_values.then_some(v)))
    }
}

impl Parameters for Attention {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.to_q.visit(&join(prefix, "to_q"), f);
        self.to_k.visit(&join(prefix, "to_k"), f);
        self.to_v.visit(&join(prefix, "to_v"), f);
        self.to_out.visit(&join(prefix, "to_out"), f);
        f(&join(prefix, "qk_scale"), self.qk_scale.stored.view().into_dyn());
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.to_q.visit_mut(&join(prefix, "to_q"), f);
        self.to_k.visit_mut(&join(prefix, "to_k"), f);
        self.to_v.visit_mut(&join(prefix, "to_v"), f);
        self.to_out.visit_mut(&join(prefix, "to_out"), f);
        f(&join(prefix, "qk_scale"), self.qk_scale.stored.view_mut().into_dyn());
    }
}
