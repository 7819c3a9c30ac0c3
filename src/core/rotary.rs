//! Rotary positional transform.
//!
//! Consumed by attention through the [`Rotary`] trait. [`RotaryEmbedding`]
//! rotates interleaved channel pairs `(2i, 2i + 1)` by `position * inv_freq[i]`.

use ndarray::{Array4, Axis};

const ROPE_BASE: f32 = 10_000.0;

/// Deterministic position-dependent rotation of per-head vectors.
pub trait Rotary: Send + Sync {
    /// Rotate `[batch, heads, seq, dim_head]` in place; position is the seq index.
    fn rotate(&self, x: &mut Array4<f32>);
}

#[derive(Clone, Debug)]
pub struct RotaryEmbedding {
    dim: usize,
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(dim: usize) -> Self {
        let inv_freq = (0..dim / 2)
            .map(|i| ROPE_BASE.powf(-((2 * i) as f32) / dim as f32))
            .collect();
        Self { dim, inv_freq }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Rotary for RotaryEmbedding {
    fn rotate(&self, x: &mut Array4<f32>) {
        let rot = self.dim.min(x.len_of(Axis(3))) / 2;
        if rot == 0 {
            return;
        }

        for mut batch in x.outer_iter_mut() {
            for mut head in batch.outer_iter_mut() {
                for (pos, mut v) in head.outer_iter_mut().enumerate() {
                    for (i, &freq) in self.inv_freq.iter().take(rot).enumerate() {
                        let theta = pos as f32 * freq;
                        let (sin, cos) = theta.sin_cos();
                        let a = v[2 * i];
                        let b = v[2 * i + 1];
                        v[2 * i] = a * cos - b * sin;
                        v[2 * i + 1] = a * sin + b * cos;
                    }
                }
            }
        }
    }
}
