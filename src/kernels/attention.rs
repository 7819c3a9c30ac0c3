//! Scaled dot-product attention kernel.
//!
//! Attention blocks call the kernel through [`AttentionKernel`]; the only
//! implementation shipped here is the CPU math backend, which runs every
//! `(batch, head)` pair on the rayon pool.

use ndarray::{s, Array1, Array2, Array4, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Weighted-value attention over per-head tensors.
///
/// `q`, `k`, `v` are `[batch, heads, seq, dim_head]`; `mask` is `[batch, seq_k]`
/// with `true` marking keys that may be attended to. `causal` and `mask` must
/// both be honoured when given together. For a query with no admissible key
/// the output row is unspecified but must be finite.
pub trait AttentionKernel: Send + Sync {
    fn attend(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
        mask: Option<&Array2<bool>>,
        causal: bool,
        scale: f32,
    ) -> Array4<f32>;
}

/// Reference math backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct MathAttention;

impl AttentionKernel for MathAttention {
    fn attend(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
        mask: Option<&Array2<bool>>,
        causal: bool,
        scale: f32,
    ) -> Array4<f32> {
        let (batch, heads, seq, _) = q.dim();
        let dim_v = v.len_of(Axis(3));

        let per_head: Vec<Array2<f32>> = (0..batch * heads)
            .into_par_iter()
            .map(|idx| {
                let (b, h) = (idx / heads, idx % heads);
                attend_head(
                    q.slice(s![b, h, .., ..]),
                    k.slice(s![b, h, .., ..]),
                    v.slice(s![b, h, .., ..]),
                    mask.map(|m| m.row(b)),
                    causal,
                    scale,
                )
            })
            .collect();

        let mut out = Array4::zeros((batch, heads, seq, dim_v));
        for (idx, head) in per_head.into_iter().enumerate() {
            out.slice_mut(s![idx / heads, idx % heads, .., ..]).assign(&head);
        }
        out
    }
}

fn attend_head(
    q: ArrayView2<'_, f32>,
    k: ArrayView2<'_, f32>,
    v: ArrayView2<'_, f32>,
    key_mask: Option<ArrayView1<'_, bool>>,
    causal: bool,
    scale: f32,
) -> Array2<f32> {
    let scores = q.dot(&k.t()) * scale;
    let mut out = Array2::zeros((q.nrows(), v.ncols()));

    for (i, row) in scores.outer_iter().enumerate() {
        let allowed = |j: usize| (!causal || j <= i) && key_mask.map_or(true, |m| m[j]);
        // No admissible key: leave the row at zero.
        if let Some(weights) = masked_softmax(row, allowed) {
            out.row_mut(i).assign(&weights.dot(&v));
        }
    }
    out
}

/// Softmax over the admissible entries; `None` when nothing is admissible.
fn masked_softmax(scores: ArrayView1<'_, f32>, allowed: impl Fn(usize) -> bool) -> Option<Array1<f32>> {
    let max_val = scores
        .iter()
        .enumerate()
        .filter(|(j, _)| allowed(*j))
        .map(|(_, &s)| s)
        .fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        return None;
    }

    let mut weights = Array1::zeros(scores.len());
    for (j, &s) in scores.iter().enumerate() {
        if allowed(j) {
            weights[j] = (s - max_val).exp();
        }
    }
    let sum = weights.sum();
    if sum > 0.0 {
        Some(weights / sum)
    } else {
        None
    }
}
