//! Full network: token embedding, a stack of spherical residual layers,
//! scaled logits and the optional next-token loss.
//!
//! Every hidden state between blocks lies on the unit hypersphere over the
//! full model dimension, so the stack needs no pre-norm and no final norm
//! before the logits.

use std::borrow::Cow;
use std::sync::Arc;

use ndarray::{s, stack, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use super::attention::{Attention, AttentionArgs, AttentionSignature};
use super::feedforward::{FeedForward, FeedForwardSignature};
use super::norm_linear::{Enforcement, NormLinear, ProjectionSignature};
use super::params::{join, Parameters};
use super::residual::Residual;
use super::rotary::{Rotary, RotaryEmbedding};
use super::scale::Scale;
use crate::config::NetworkConfig;
use crate::error::{NgptError, Result};
use crate::kernels::attention::{AttentionKernel, MathAttention};

/// One attention block followed by one feedforward block.
#[derive(Clone, Debug)]
pub struct Layer {
    pub attn: Residual<Attention>,
    pub ff: Residual<FeedForward>,
}

/// Shape-only identity of a network. Two networks with equal signatures hold
/// parameters of identical names and shapes.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkSignature {
    pub token_embed: ProjectionSignature,
    pub layers: Vec<(AttentionSignature, FeedForwardSignature)>,
    pub to_logits: Option<ProjectionSignature>,
    pub num_hyperspheres: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Treat `ids` as `inputs ++ [last target]` and return the mean cross-entropy.
    pub return_loss: bool,

    /// Also return every intermediate hidden state.
    pub return_hiddens: bool,
}

#[derive(Clone, Debug)]
pub enum Prediction {
    /// `[batch, seq, num_tokens]`
    Logits(Array3<f32>),
    Loss(f32),
}

#[derive(Clone, Debug)]
pub struct ForwardOutput {
    pub prediction: Prediction,

    /// `[1 + 2 * depth, batch, seq, dim]`: the embedding, then the state after
    /// every attention and every feedforward block.
    pub hiddens: Option<Array4<f32>>,
}

impl ForwardOutput {
    pub fn logits(&self) -> Option<&Array3<f32>> {
        match &self.prediction {
            Prediction::Logits(logits) => Some(logits),
            Prediction::Loss(_) => None,
        }
    }

    pub fn loss(&self) -> Option<f32> {
        match self.prediction {
            Prediction::Loss(loss) => Some(loss),
            Prediction::Logits(_) => None,
        }
    }
}

/// The normalized transformer.
#[derive(Clone)]
pub struct NgptModel {
    config: NetworkConfig,

    /// `[num_tokens, dim]`, one unit row per token.
    pub token_embed: NormLinear,

    pub layers: Vec<Layer>,

    /// Absent when the embedding is tied.
    pub to_logits: Option<NormLinear>,

    logit_scale: Scale,

    rotary: Arc<dyn Rotary>,
    kernel: Arc<dyn AttentionKernel>,
}

impl NgptModel {
    /// Build a network with weights drawn from a seeded generator.
    pub fn new(config: NetworkConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::with_rng(config, &mut rng)
    }

    pub fn with_rng<R: Rng + ?Sized>(config: NetworkConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let proj = config.projection_config();
        let hyper = config.layer_hyperparams()?;

        let token_embed = NormLinear::new(config.dim, config.num_tokens, true, &proj, rng)?;

        let mut layers = Vec::with_capacity(config.depth);
        for layer in &hyper {
            let attn = Attention::new(&config.attention_config(layer), &proj, rng)?;
            let ff = FeedForward::new(&config.feedforward_config(layer), &proj, rng)?;
            layers.push(Layer {
                attn: Residual::new(attn, config.dim, layer.alpha_attn_init, layer.alpha_attn_scale)?,
                ff: Residual::new(ff, config.dim, layer.alpha_ff_init, layer.alpha_ff_scale)?,
            });
        }

        let to_logits = if config.tied_embedding {
            None
        } else {
            Some(NormLinear::new(config.dim, config.num_tokens, true, &proj, rng)?)
        };
        let logit_scale = Scale::new(config.num_tokens, config.s_logit_init, config.logit_scale())?;

        let model = Self {
            rotary: Arc::new(RotaryEmbedding::new(config.dim_head)),
            kernel: Arc::new(MathAttention),
            config,
            token_embed,
            layers,
            to_logits,
            logit_scale,
        };

        tracing::info!(
            num_tokens = model.config.num_tokens,
            dim = model.config.dim,
            depth = model.config.depth,
            heads = model.config.heads,
            params = model.parameter_count(),
            enforcement = ?model.config.enforcement,
            "initialised nGPT"
        );
        if model.config.enforcement == Enforcement::Lazy {
            tracing::warn!("lazy weight enforcement: norm_weights() must run after every parameter update");
        }
        Ok(model)
    }

    /// Replace the attention backend.
    pub fn with_kernel(mut self, kernel: impl AttentionKernel + 'static) -> Self {
        self.kernel = Arc::new(kernel);
        self
    }

    /// Replace the positional transform.
    pub fn with_rotary(mut self, rotary: impl Rotary + 'static) -> Self {
        self.rotary = Arc::new(rotary);
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn logit_scale(&self) -> &Scale {
        &self.logit_scale
    }

    /// Run the network on `[batch, seq]` token ids.
    ///
    /// `mask` is `[batch, seq]` with `true` for keys that may be attended to.
    /// With `return_loss` the final position of `ids` only serves as a target
    /// and the mask is trimmed to the input length to match.
    pub fn forward(
        &self,
        ids: &Array2<i64>,
        mask: Option<&Array2<bool>>,
        options: ForwardOptions,
    ) -> Result<ForwardOutput> {
        let (batch, seq) = ids.dim();
        if let Some(mask) = mask {
            if mask.dim() != (batch, seq) {
                return Err(NgptError::ShapeMismatch {
                    what: "token mask",
                    expected: vec![batch, seq],
                    actual: mask.shape().to_vec(),
                });
            }
        }

        if !options.return_loss {
            let (logits, hiddens) = self.run(ids.view(), mask.map(Cow::Borrowed), options.return_hiddens)?;
            return Ok(ForwardOutput {
                prediction: Prediction::Logits(logits),
                hiddens,
            });
        }

        if !self.config.causal {
            return Err(NgptError::precondition(
                "next-token loss needs a causal network",
            ));
        }
        if seq < 2 {
            return Err(NgptError::precondition(format!(
                "next-token loss needs at least two tokens per sequence, got {seq}"
            )));
        }

        let inputs = ids.slice(s![.., ..seq - 1]);
        let labels = ids.slice(s![.., 1..]);
        let mask = mask.map(|m| Cow::Owned(m.slice(s![.., ..seq - 1]).to_owned()));

        let (logits, hiddens) = self.run(inputs, mask, options.return_hiddens)?;
        let loss = cross_entropy(logits.view(), labels, self.config.ce_ignore_index)?;
        Ok(ForwardOutput {
            prediction: Prediction::Loss(loss),
            hiddens,
        })
    }

    /// Logits for every position.
    pub fn logits(&self, ids: &Array2<i64>, mask: Option<&Array2<bool>>) -> Result<Array3<f32>> {
        let output = self.forward(ids, mask, ForwardOptions::default())?;
        match output.prediction {
            Prediction::Logits(logits) => Ok(logits),
            Prediction::Loss(_) => Err(NgptError::precondition("expected logits, got a loss")),
        }
    }

    /// Mean next-token cross-entropy.
    pub fn loss(&self, ids: &Array2<i64>, mask: Option<&Array2<bool>>) -> Result<f32> {
        let options = ForwardOptions {
            return_loss: true,
            ..Default::default()
        };
        let output = self.forward(ids, mask, options)?;
        output
            .loss()
            .ok_or_else(|| NgptError::precondition("expected a loss, got logits"))
    }

    /// Look up the unit embedding of every id.
    pub fn embed(&self, ids: ArrayView2<'_, i64>) -> Result<Array3<f32>> {
        let num_tokens = self.config.num_tokens;
        let indices = ids
            .iter()
            .map(|&id| {
                usize::try_from(id)
                    .ok()
                    .filter(|&i| i < num_tokens)
                    .ok_or(NgptError::TokenOutOfRange { id, num_tokens })
            })
            .collect::<Result<Vec<_>>>()?;

        let table = self.token_embed.weight();
        let rows = table.select(Axis(0), &indices);
        let (batch, seq) = ids.dim();
        Ok(rows.into_shape_with_order((batch, seq, self.config.dim))?)
    }

    fn run(
        &self,
        inputs: ArrayView2<'_, i64>,
        mask: Option<Cow<'_, Array2<bool>>>,
        return_hiddens: bool,
    ) -> Result<(Array3<f32>, Option<Array4<f32>>)> {
        let mut tokens = self.embed(inputs)?;
        let mut hiddens = Vec::new();
        if return_hiddens {
            hiddens.push(tokens.clone());
        }

        let carry_values = self.config.add_value_residual;
        let mut first_values: Option<Array4<f32>> = None;

        for layer in &self.layers {
            let args = AttentionArgs {
                kernel: self.kernel.as_ref(),
                mask: mask.as_deref(),
                rotary: Some(self.rotary.as_ref()),
                value_residual: first_values.as_ref().filter(|_| carry_values),
                return_values: carry_values && first_values.is_none(),
            };
            let (next, values) = layer.attn.forward(&tokens, args)?;
            if first_values.is_none() {
                first_values = values;
            }
            tokens = next;
            if return_hiddens {
                hiddens.push(tokens.clone());
            }

            let (next, ()) = layer.ff.forward(&tokens, ())?;
            tokens = next;
            if return_hiddens {
                hiddens.push(tokens.clone());
            }
        }

        let head = self.to_logits.as_ref().unwrap_or(&self.token_embed);
        let logits = head.forward(&tokens)? * &self.logit_scale.value();

        let hiddens = if return_hiddens {
            let views: Vec<_> = hiddens.iter().map(|h| h.view()).collect();
            Some(stack(Axis(0), &views)?)
        } else {
            None
        };
        Ok((logits, hiddens))
    }

    pub fn norm_linears(&self) -> Vec<&NormLinear> {
        let mut out = vec![&self.token_embed];
        out.extend(self.to_logits.as_ref());
        for layer in &self.layers {
            out.extend(layer.attn.inner.norm_linears());
            out.extend(layer.ff.inner.norm_linears());
        }
        out
    }

    pub fn norm_linears_mut(&mut self) -> Vec<&mut NormLinear> {
        let mut out = vec![&mut self.token_embed];
        out.extend(self.to_logits.as_mut());
        for layer in &mut self.layers {
            out.extend(layer.attn.inner.norm_linears_mut());
            out.extend(layer.ff.inner.norm_linears_mut());
        }
        out
    }

    /// Project every stored weight back onto the hypersphere.
    ///
    /// Must run after every optimizer step under lazy enforcement. Under eager
    /// enforcement it only syncs storage with what forward already uses.
    pub fn norm_weights(&mut self) {
        let linears = self.norm_linears_mut();
        let count = linears.len();
        linears.into_par_iter().for_each(|linear| linear.normalize_weights());
        tracing::debug!(projections = count, "renormalized weights");
    }

    /// Largest distance of any stored weight vector from the allowed norm band.
    pub fn max_weight_deviation(&self) -> f32 {
        self.norm_linears()
            .into_iter()
            .map(NormLinear::stored_deviation)
            .fold(0.0, f32::max)
    }

    pub fn signature(&self) -> NetworkSignature {
        NetworkSignature {
            token_embed: self.token_embed.signature(),
            layers: self
                .layers
                .iter()
                .map(|l| (l.attn.inner.signature(), l.ff.inner.signature()))
                .collect(),
            to_logits: self.to_logits.as_ref().map(NormLinear::signature),
            num_hyperspheres: self.config.num_hyperspheres,
        }
    }
}

impl Parameters for NgptModel {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.token_embed.visit(&join(prefix, "token_embed"), f);
        for (i, layer) in self.layers.iter().enumerate() {
            let base = join(prefix, &format!("layers.{i}"));
            layer.attn.visit(&join(&base, "attn"), f);
            layer.ff.visit(&join(&base, "ff"), f);
        }
        if let Some(to_logits) = &self.to_logits {
            to_logits.visit(&join(prefix, "to_logits"), f);
        }
        f(&join(prefix, "logit_scale"), self.logit_scale.stored.view().into_dyn());
    }

    fn visit_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>)) {
        self.token_embed.visit_mut(&join(prefix, "token_embed"), f);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let base = join(prefix, &format!("layers.{i}"));
            layer.attn.visit_mut(&join(&base, "attn"), f);
            layer.ff.visit_mut(&join(&base, "ff"), f);
        }
        if let Some(to_logits) = &mut self.to_logits {
            to_logits.visit_mut(&join(prefix, "to_logits"), f);
        }
        f(
            &join(prefix, "logit_scale"),
            self.logit_scale.stored.view_mut().into_dyn(),
        );
    }
}

/// Mean cross-entropy of `logits` `[batch, seq, classes]` against integer
/// `labels` `[batch, seq]`. Positions labelled `ignore_index` are skipped; if
/// every position is skipped the loss is zero.
pub fn cross_entropy(logits: ArrayView3<'_, f32>, labels: ArrayView2<'_, i64>, ignore_index: i64) -> Result<f32> {
    let (batch, seq, classes) = logits.dim();
    if labels.dim() != (batch, seq) {
        return Err(NgptError::ShapeMismatch {
            what: "loss targets",
            expected: vec![batch, seq],
            actual: labels.shape().to_vec(),
        });
    }

    let mut total = 0.0f64;
    let mut counted = 0usize;
    for ((b, n), &label) in labels.indexed_iter() {
        if label == ignore_index {
            continue;
        }
        let target = usize::try_from(label)
            .ok()
            .filter(|&t| t < classes)
            .ok_or(NgptError::TokenOutOfRange {
                id: label,
                num_tokens: classes,
            })?;

        let row = logits.slice(s![b, n, ..]);
        let max = row.fold(f32::NEG_INFINITY, |a, &v| a.max(v));
        let log_sum = max + row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        total += f64::from(log_sum - row[target]);
        counted += 1;
    }

    if counted == 0 {
        tracing::warn!("every target is ignored; loss is zero");
        return Ok(0.0);
    }
    Ok((total / counted as f64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerLayer;
    use crate::core::l2norm::lane_norms;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_config() -> NetworkConfig {
        NetworkConfig {
            heads: 2,
            dim_head: 8,
            ..NetworkConfig::new(50, 16, 2)
        }
    }

    fn token_ids(batch: usize, seq: usize) -> Array2<i64> {
        Array2::from_shape_fn((batch, seq), |(b, n)| ((b * 17 + n * 7 + 3) % 50) as i64)
    }

    fn with_loss() -> ForwardOptions {
        ForwardOptions {
            return_loss: true,
            return_hiddens: true,
        }
    }

    fn assert_close(a: &Array3<f32>, b: &Array3<f32>, tol: f32) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{x} vs {y}");
        }
    }

    #[test]
    fn test_small_network_loss_and_hiddens() {
        let model = NgptModel::new(small_config(), 0).unwrap();
        let ids = token_ids(3, 9);

        let out = model.forward(&ids, None, with_loss()).unwrap();
        let loss = out.loss().unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
        assert_eq!(out.hiddens.unwrap().dim(), (5, 3, 8, 16));

        let out = model
            .forward(
                &ids,
                None,
                ForwardOptions {
                    return_hiddens: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(out.logits().unwrap().dim(), (3, 9, 50));
        assert_eq!(out.hiddens.unwrap().dim(), (5, 3, 9, 16));
    }

    #[test]
    fn test_hiddens_lie_on_sphere() {
        let model = NgptModel::new(small_config(), 1).unwrap();
        let out = model
            .forward(
                &token_ids(2, 6),
                None,
                ForwardOptions {
                    return_hiddens: true,
                    ..Default::default()
                },
            )
            .unwrap();
        for hidden in out.hiddens.unwrap().outer_iter() {
            for n in lane_norms(&hidden) {
                assert!((n - 1.0).abs() < 1e-4, "norm {n}");
            }
        }
    }

    #[test]
    fn test_fully_masked_row_passes_through_attention() {
        let model = NgptModel::new(small_config(), 2).unwrap();
        let ids = token_ids(3, 5);
        let mut mask = Array2::from_elem((3, 5), true);
        mask.row_mut(1).fill(false);

        let out = model
            .forward(
                &ids,
                Some(&mask),
                ForwardOptions {
                    return_hiddens: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(out.logits().unwrap().iter().all(|v| v.is_finite()));

        // attention contributes nothing, so the state after it is the embedding
        let hiddens = out.hiddens.unwrap();
        let before = hiddens.slice(s![0, 1, .., ..]);
        let after = hiddens.slice(s![1, 1, .., ..]);
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        let loss = model.loss(&ids, Some(&mask)).unwrap();
        assert!(loss.is_finite());
    }

    #[test]
    fn test_causal_prefix_unaffected_by_later_tokens() {
        let model = NgptModel::new(small_config(), 3).unwrap();
        let ids = token_ids(1, 6);
        let mut changed = ids.clone();
        changed[[0, 5]] = (changed[[0, 5]] + 1) % 50;

        let a = model.logits(&ids, None).unwrap();
        let b = model.logits(&changed, None).unwrap();
        for (x, y) in a.slice(s![.., ..5, ..]).iter().zip(b.slice(s![.., ..5, ..]).iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_tied_logits_match_untied_with_shared_table() {
        let tied = NgptModel::new(
            NetworkConfig {
                tied_embedding: true,
                ..small_config()
            },
            4,
        )
        .unwrap();
        let mut untied = NgptModel::new(small_config(), 4).unwrap();
        assert!(tied.to_logits.is_none());

        let table = tied.token_embed.raw_weight().clone();
        if let Some(to_logits) = untied.to_logits.as_mut() {
            to_logits.raw_weight_mut().assign(&table);
        }

        let ids = token_ids(2, 7);
        assert_close(
            &tied.logits(&ids, None).unwrap(),
            &untied.logits(&ids, None).unwrap(),
            1e-5,
        );
    }

    #[test]
    fn test_ignored_targets_do_not_contribute() {
        let model = NgptModel::new(small_config(), 5).unwrap();
        let ids = token_ids(2, 8);
        let logits = model.logits(&ids.slice(s![.., ..7]).to_owned(), None).unwrap();

        let mut masked = ids.clone();
        masked.column_mut(7).fill(-1);
        let loss = model.loss(&masked, None).unwrap();

        let expected = cross_entropy(logits.slice(s![.., ..6, ..]), ids.slice(s![.., 1..7]), -1).unwrap();
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_cross_entropy() {
        let logits = Array3::zeros((1, 2, 4));
        let labels = ndarray::array![[0i64, 3]];
        let loss = cross_entropy(logits.view(), labels.view(), -1).unwrap();
        assert!((loss - 4.0f32.ln()).abs() < 1e-6);

        // changing logits at an ignored position changes nothing
        let mut varied = logits.clone();
        varied.slice_mut(s![0, 1, ..]).assign(&ndarray::array![5.0f32, -2.0, 0.5, 9.0]);
        let ignore_second = ndarray::array![[0i64, -1]];
        let a = cross_entropy(logits.view(), ignore_second.view(), -1).unwrap();
        let b = cross_entropy(varied.view(), ignore_second.view(), -1).unwrap();
        assert!((a - b).abs() < 1e-7);

        let all_ignored = ndarray::array![[-1i64, -1]];
        assert_eq!(cross_entropy(logits.view(), all_ignored.view(), -1).unwrap(), 0.0);

        let out_of_range = ndarray::array![[0i64, 4]];
        assert!(cross_entropy(logits.view(), out_of_range.view(), -1).is_err());
    }

    #[test]
    fn test_loss_preconditions() {
        let bidirectional = NgptModel::new(
            NetworkConfig {
                causal: false,
                ..small_config()
            },
            6,
        )
        .unwrap();
        let ids = token_ids(2, 4);
        assert!(bidirectional.logits(&ids, None).is_ok());
        assert!(matches!(
            bidirectional.loss(&ids, None),
            Err(NgptError::Precondition(_))
        ));

        let model = NgptModel::new(small_config(), 6).unwrap();
        assert!(matches!(
            model.loss(&token_ids(2, 1), None),
            Err(NgptError::Precondition(_))
        ));
    }

    #[test]
    fn test_token_out_of_range() {
        let model = NgptModel::new(small_config(), 7).unwrap();
        let mut ids = token_ids(1, 4);
        ids[[0, 2]] = 50;
        assert!(matches!(
            model.logits(&ids, None),
            Err(NgptError::TokenOutOfRange { id: 50, num_tokens: 50 })
        ));
        ids[[0, 2]] = -1;
        assert!(model.logits(&ids, None).is_err());
    }

    #[test]
    fn test_mask_shape_checked() {
        let model = NgptModel::new(small_config(), 7).unwrap();
        let mask = Array2::from_elem((2, 3), true);
        assert!(matches!(
            model.logits(&token_ids(2, 4), Some(&mask)),
            Err(NgptError::ShapeMismatch { .. })
        ));
    }

    fn scale_weights(model: &mut NgptModel, factor: f32) {
        model.visit_mut("", &mut |name, mut p| {
            if name.ends_with(".weight") {
                p.mapv_inplace(|v| v * factor);
            }
        });
    }

    #[test]
    fn test_lazy_enforcement_needs_renormalization() {
        let mut model = NgptModel::new(
            NetworkConfig {
                enforcement: Enforcement::Lazy,
                ..small_config()
            },
            8,
        )
        .unwrap();
        let ids = token_ids(2, 5);
        let reference = model.logits(&ids, None).unwrap();
        assert!(model.max_weight_deviation() < 1e-5);

        scale_weights(&mut model, 3.0);
        assert!(model.max_weight_deviation() > 1.0);
        let drifted = model.logits(&ids, None).unwrap();
        assert!(drifted.iter().zip(reference.iter()).any(|(a, b)| (a - b).abs() > 1e-3));

        model.norm_weights();
        assert!(model.max_weight_deviation() < 1e-5);
        assert_close(&model.logits(&ids, None).unwrap(), &reference, 1e-4);
    }

    #[test]
    fn test_eager_enforcement_hides_drift() {
        let mut model = NgptModel::new(small_config(), 9).unwrap();
        let ids = token_ids(2, 5);
        let reference = model.logits(&ids, None).unwrap();

        scale_weights(&mut model, 3.0);
        assert!(model.max_weight_deviation() > 1.0);
        assert_close(&model.logits(&ids, None).unwrap(), &reference, 1e-4);

        model.norm_weights();
        assert!(model.max_weight_deviation() < 1e-5);
    }

    #[test]
    fn test_same_seed_same_network() {
        let a = NgptModel::new(small_config(), 10).unwrap();
        let b = NgptModel::new(small_config(), 10).unwrap();
        let c = NgptModel::new(small_config(), 11).unwrap();
        let ids = token_ids(2, 4);

        assert_close(&a.logits(&ids, None).unwrap(), &b.logits(&ids, None).unwrap(), 1e-7);
        assert_eq!(a.signature(), c.signature());

        let tied = NgptModel::new(
            NetworkConfig {
                tied_embedding: true,
                ..small_config()
            },
            10,
        )
        .unwrap();
        assert_ne!(a.signature(), tied.signature());
    }

    #[test]
    fn test_parameter_names_and_count() {
        let model = NgptModel::new(small_config(), 12).unwrap();
        let mut names = Vec::new();
        model.visit("", &mut |name, _| names.push(name.to_string()));

        assert_eq!(names.first().map(String::as_str), Some("token_embed.weight"));
        assert!(names.contains(&"layers.0.attn.to_q.weight".to_string()));
        assert!(names.contains(&"layers.0.attn.branch_scale".to_string()));
        assert!(names.contains(&"layers.1.ff.gate_scale".to_string()));
        assert!(names.contains(&"to_logits.weight".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("logit_scale"));

        let attn = 4 * 16 * 16 + 16 + 16;
        let ff = 3 * 16 * 42 + 2 * 42 + 16;
        assert_eq!(model.parameter_count(), 2 * 50 * 16 + 2 * (attn + ff) + 50);
    }

    #[test]
    fn test_per_layer_length_mismatch() {
        let config = NetworkConfig {
            s_qk_init: PerLayer::Each(vec![1.0, 1.0, 1.0]),
            ..small_config()
        };
        assert!(matches!(NgptModel::new(config, 0), Err(NgptError::Config(_))));
    }

    #[test]
    fn test_hyperspheres_and_tolerance() {
        let config = NetworkConfig {
            num_hyperspheres: 2,
            norm_eps: 0.05,
            ..small_config()
        };
        let mut model = NgptModel::new(config, 13).unwrap();
        let out = model.forward(&token_ids(2, 5), None, with_loss()).unwrap();
        assert!(out.loss().unwrap().is_finite());

        // every half-row of the embedding table sits inside the band
        let table = model.token_embed.weight();
        for row in table.rows() {
            for half in [row.slice(s![..8]), row.slice(s![8..])] {
                let n = half.iter().map(|v| v * v).sum::<f32>().sqrt();
                assert!((0.95 - 1e-5..=1.05 + 1e-5).contains(&n), "group norm {n}");
            }
        }
        assert!(model.max_weight_deviation() < 1e-6);

        // after the first block, hidden states are unit over the whole model
        // dimension; the embedding itself is unit per group only
        for hidden in out.hiddens.unwrap().outer_iter().skip(1) {
            for n in lane_norms(&hidden) {
                assert!((n - 1.0).abs() < 1e-4, "norm {n}");
            }
        }

        scale_weights(&mut model, 3.0);
        assert!(model.max_weight_deviation() > 1.0);
        model.norm_weights();
        assert!(model.max_weight_deviation() < 1e-6);
        for row in model.token_embed.raw_weight().rows() {
            let n = row.slice(s![..8]).iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((n - 1.05).abs() < 1e-4, "clamped to the band edge, got {n}");
        }
    }

    struct CountingKernel {
        calls: Arc<AtomicUsize>,
    }

    impl AttentionKernel for CountingKernel {
        fn attend(
            &self,
            q: &Array4<f32>,
            k: &Array4<f32>,
            v: &Array4<f32>,
            mask: Option<&Array2<bool>>,
            causal: bool,
            scale: f32,
        ) -> Array4<f32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MathAttention.attend(q, k, v, mask, causal, scale)
        }
    }

    #[test]
    fn test_custom_kernel_is_used() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reference = NgptModel::new(small_config(), 14).unwrap();
        let model = reference.clone().with_kernel(CountingKernel { calls: calls.clone() });

        let ids = token_ids(1, 4);
        assert_close(
            &model.logits(&ids, None).unwrap(),
            &reference.logits(&ids, None).unwrap(),
            1e-7,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct NoRotation;

    impl Rotary for NoRotation {
        fn rotate(&self, _x: &mut Array4<f32>) {}
    }

    #[test]
    fn test_custom_rotary_is_used() {
        let reference = NgptModel::new(small_config(), 15).unwrap();
        let unrotated = reference.clone().with_rotary(NoRotation);
        let ids = token_ids(1, 5);
        let a = reference.logits(&ids, None).unwrap();
        let b = unrotated.logits(&ids, None).unwrap();

        // position 0 is never rotated and sees only itself
        for (x, y) in a.slice(s![0, 0, ..]).iter().zip(b.slice(s![0, 0, ..]).iter()) {
            assert!((x - y).abs() < 1e-5);
        }
        assert!(a
            .slice(s![0, 1.., ..])
            .iter()
            .zip(b.slice(s![0, 1.., ..]).iter())
            .any(|(x, y)| (x - y).abs() > 1e-6));
    }
}
