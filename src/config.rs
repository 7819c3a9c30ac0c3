//! Network hyperparameters.
//!
//! Every decoupled-scale pair can be given once for the whole stack or once
//! per layer through [`PerLayer`]; [`NetworkConfig::layer_hyperparams`]
//! expands them into one explicit [`LayerHyperparams`] per layer before any
//! weight is allocated.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::attention::AttentionConfig;
use crate::core::feedforward::{inner_dim, FeedForwardConfig};
use crate::core::l2norm::{L2Norm, NormAxis, Precision};
use crate::core::norm_linear::{Enforcement, ProjectionConfig};
use crate::error::{NgptError, Result};

/// Default vocabulary size.
pub const NUM_TOKENS: usize = 256;

/// Default model dimension.
pub const DIM: usize = 512;

/// Default number of layers.
pub const DEPTH: usize = 8;

/// Default attention head width.
pub const DIM_HEAD: usize = 64;

/// Default number of attention heads.
pub const HEADS: usize = 8;

/// Default feedforward expansion (before the 2/3 gating correction).
pub const FF_EXPAND_FACTOR: f64 = 4.0;

/// Targets equal to this id do not contribute to the loss.
pub const CE_IGNORE_INDEX: i64 = -1;

/// One value shared by every layer, or one value per layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerLayer<T> {
    Shared(T),
    Each(Vec<T>),
}

impl<T: Clone> PerLayer<T> {
    /// Expand to exactly `depth` values.
    pub fn resolve(&self, depth: usize, name: &str) -> Result<Vec<T>> {
        match self {
            PerLayer::Shared(v) => Ok(vec![v.clone(); depth]),
            PerLayer::Each(vs) if vs.len() == depth => Ok(vs.clone()),
            PerLayer::Each(vs) => Err(NgptError::config(format!(
                "{name} has {} per-layer values but depth is {depth}",
                vs.len()
            ))),
        }
    }
}

impl<T> From<T> for PerLayer<T> {
    fn from(v: T) -> Self {
        PerLayer::Shared(v)
    }
}

fn resolve_or(value: &Option<PerLayer<f32>>, default: f32, depth: usize, name: &str) -> Result<Vec<f32>> {
    match value {
        Some(v) => v.resolve(depth, name),
        None => Ok(vec![default; depth]),
    }
}

/// Same acceptance rule as [`crate::core::scale::Scale::new`].
fn check_scale(name: &str, init: f32, scale: f32) -> Result<()> {
    if !scale.is_finite() || scale == 0.0 {
        return Err(NgptError::config(format!(
            "{name} scale must be finite and non-zero, got {scale}"
        )));
    }
    if !init.is_finite() {
        return Err(NgptError::config(format!("{name} init must be finite, got {init}")));
    }
    Ok(())
}

/// Scale hyperparameters of a single layer, defaults already applied.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerHyperparams {
    pub alpha_attn_init: f32,
    pub alpha_attn_scale: f32,
    pub alpha_ff_init: f32,
    pub alpha_ff_scale: f32,
    pub s_qk_init: f32,
    pub s_qk_scale: f32,
    pub s_ff_hidden_init: f32,
    pub s_ff_hidden_scale: f32,
    pub s_ff_gate_init: f32,
    pub s_ff_gate_scale: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub num_tokens: usize,
    pub dim: usize,
    pub depth: usize,
    pub dim_head: usize,
    pub heads: usize,

    /// Normalize queries and keys per head.
    pub attn_norm_qk: bool,

    pub ff_expand_factor: f64,
    pub ce_ignore_index: i64,
    pub enforcement: Enforcement,

    /// Compute logits against the embedding table instead of a separate projection.
    pub tied_embedding: bool,

    /// Number of independent spheres every normalized vector is split into.
    pub num_hyperspheres: usize,

    pub causal: bool,

    /// Blend the first layer's attention values into every later layer.
    pub add_value_residual: bool,

    /// Residual interpolation init for every layer unless overridden; `1 / depth` when unset.
    pub alpha_init: Option<f32>,

    pub s_logit_init: f32,
    /// `dim^-0.5` when unset.
    pub s_logit_scale: Option<f32>,

    pub alpha_attn_init: Option<PerLayer<f32>>,
    /// `dim^-0.5` when unset.
    pub alpha_attn_scale: Option<PerLayer<f32>>,
    pub alpha_ff_init: Option<PerLayer<f32>>,
    /// `dim^-0.5` when unset.
    pub alpha_ff_scale: Option<PerLayer<f32>>,
    pub s_qk_init: PerLayer<f32>,
    /// `dim^-1` when unset.
    pub s_qk_scale: Option<PerLayer<f32>>,
    pub s_ff_hidden_init: PerLayer<f32>,
    pub s_ff_hidden_scale: PerLayer<f32>,
    pub s_ff_gate_init: PerLayer<f32>,
    pub s_ff_gate_scale: PerLayer<f32>,

    /// Norm tolerance band; zero keeps every vector exactly on the sphere.
    pub norm_eps: f32,

    pub precision: Precision,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_tokens: NUM_TOKENS,
            dim: DIM,
            depth: DEPTH,
            dim_head: DIM_HEAD,
            heads: HEADS,
            attn_norm_qk: true,
            ff_expand_factor: FF_EXPAND_FACTOR,
            ce_ignore_index: CE_IGNORE_INDEX,
            enforcement: Enforcement::Eager,
            tied_embedding: false,
            num_hyperspheres: 1,
            causal: true,
            add_value_residual: true,
            alpha_init: None,
            s_logit_init: 1.0,
            s_logit_scale: None,
            alpha_attn_init: None,
            alpha_attn_scale: None,
            alpha_ff_init: None,
            alpha_ff_scale: None,
            s_qk_init: PerLayer::Shared(1.0),
            s_qk_scale: None,
            s_ff_hidden_init: PerLayer::Shared(1.0),
            s_ff_hidden_scale: PerLayer::Shared(1.0),
            s_ff_gate_init: PerLayer::Shared(1.0),
            s_ff_gate_scale: PerLayer::Shared(1.0),
            norm_eps: 0.0,
            precision: Precision::Single,
        }
    }
}

impl NetworkConfig {
    pub fn new(num_tokens: usize, dim: usize, depth: usize) -> Self {
        Self {
            num_tokens,
            dim,
            depth,
            ..Default::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: NetworkConfig = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config '{}'", path.display()))?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize config")
    }

    /// Fail fast on anything that would break construction.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("num_tokens", self.num_tokens),
            ("dim", self.dim),
            ("depth", self.depth),
            ("dim_head", self.dim_head),
            ("heads", self.heads),
            ("num_hyperspheres", self.num_hyperspheres),
        ] {
            if value == 0 {
                return Err(NgptError::config(format!("{name} must be positive")));
            }
        }

        let norm = L2Norm::new(NormAxis::Last)
            .with_tolerance(self.norm_eps, self.precision)
            .with_groups(self.num_hyperspheres);
        norm.validate(self.dim)?;
        norm.validate(self.dim_head)?;

        let ef = self.ff_expand_factor;
        if !ef.is_finite() || ef <= 0.0 || inner_dim(self.dim, ef) == 0 {
            return Err(NgptError::config(format!(
                "ff_expand_factor {} leaves no feedforward width at dim {}",
                self.ff_expand_factor, self.dim
            )));
        }

        check_scale("s_logit", self.s_logit_init, self.logit_scale())?;
        for (i, layer) in self.layer_hyperparams()?.iter().enumerate() {
            for (name, init, scale) in [
                ("alpha_attn", layer.alpha_attn_init, layer.alpha_attn_scale),
                ("alpha_ff", layer.alpha_ff_init, layer.alpha_ff_scale),
                ("s_qk", layer.s_qk_init, layer.s_qk_scale),
                ("s_ff_hidden", layer.s_ff_hidden_init, layer.s_ff_hidden_scale),
                ("s_ff_gate", layer.s_ff_gate_init, layer.s_ff_gate_scale),
            ] {
                check_scale(&format!("layer {i} {name}"), init, scale)?;
            }
        }
        Ok(())
    }

    /// Expand every scale hyperparameter to one value per layer.
    pub fn layer_hyperparams(&self) -> Result<Vec<LayerHyperparams>> {
        let depth = self.depth;
        let dim = self.dim as f32;
        let alpha_init = self.alpha_init.unwrap_or(1.0 / depth as f32);

        let alpha_attn_init = resolve_or(&self.alpha_attn_init, alpha_init, depth, "alpha_attn_init")?;
        let alpha_attn_scale = resolve_or(&self.alpha_attn_scale, dim.powf(-0.5), depth, "alpha_attn_scale")?;
        let alpha_ff_init = resolve_or(&self.alpha_ff_init, alpha_init, depth, "alpha_ff_init")?;
        let alpha_ff_scale = resolve_or(&self.alpha_ff_scale, dim.powf(-0.5), depth, "alpha_ff_scale")?;
        let s_qk_init = self.s_qk_init.resolve(depth, "s_qk_init")?;
        let s_qk_scale = resolve_or(&self.s_qk_scale, dim.powi(-1), depth, "s_qk_scale")?;
        let s_ff_hidden_init = self.s_ff_hidden_init.resolve(depth, "s_ff_hidden_init")?;
        let s_ff_hidden_scale = self.s_ff_hidden_scale.resolve(depth, "s_ff_hidden_scale")?;
        let s_ff_gate_init = self.s_ff_gate_init.resolve(depth, "s_ff_gate_init")?;
        let s_ff_gate_scale = self.s_ff_gate_scale.resolve(depth, "s_ff_gate_scale")?;

        Ok((0..depth)
            .map(|i| LayerHyperparams {
                alpha_attn_init: alpha_attn_init[i],
                alpha_attn_scale: alpha_attn_scale[i],
                alpha_ff_init: alpha_ff_init[i],
                alpha_ff_scale: alpha_ff_scale[i],
                s_qk_init: s_qk_init[i],
                s_qk_scale: s_qk_scale[i],
                s_ff_hidden_init: s_ff_hidden_init[i],
                s_ff_hidden_scale: s_ff_hidden_scale[i],
                s_ff_gate_init: s_ff_gate_init[i],
                s_ff_gate_scale: s_ff_gate_scale[i],
            })
            .collect())
    }

    pub fn projection_config(&self) -> ProjectionConfig {
        ProjectionConfig {
            enforcement: self.enforcement,
            tolerance: self.norm_eps,
            precision: self.precision,
            groups: self.num_hyperspheres,
        }
    }

    pub fn attention_config(&self, layer: &LayerHyperparams) -> AttentionConfig {
        AttentionConfig {
            dim: self.dim,
            heads: self.heads,
            dim_head: self.dim_head,
            causal: self.causal,
            norm_qk: self.attn_norm_qk,
            s_qk_init: layer.s_qk_init,
            s_qk_scale: layer.s_qk_scale,
        }
    }

    pub fn feedforward_config(&self, layer: &LayerHyperparams) -> FeedForwardConfig {
        FeedForwardConfig {
            dim: self.dim,
            expand_factor: self.ff_expand_factor,
            s_hidden_init: layer.s_ff_hidden_init,
            s_hidden_scale: layer.s_ff_hidden_scale,
            s_gate_init: layer.s_ff_gate_init,
            s_gate_scale: layer.s_ff_gate_scale,
        }
    }

    pub fn logit_scale(&self) -> f32 {
        self.s_logit_scale.unwrap_or((self.dim as f32).powf(-0.5))
    }
}
