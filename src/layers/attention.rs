//! Multi-Head Self-Attention (BERT)
//!
//! Bidirectional scaled dot-product attention. Every position may attend to
//! every non-padding position of the same sequence.
//!
//! ```text
//! Q, K, V  = x @ W_q + b_q,  x @ W_k + b_k,  x @ W_v + b_v
//! per head h (columns h·d_h .. (h+1)·d_h):
//!   scores_h = Q_h @ K_h^T / √d_h + padding_bias
//!   probs_h  = dropout(softmax(scores_h))
//!   ctx_h    = probs_h @ V_h
//! ctx       = concat_h(ctx_h)
//! y         = LayerNorm(dropout(ctx @ W_o + b_o) + x)
//! ```
//!
//! `padding_bias` is a large negative number on key columns whose attention
//! mask is 0, so padded tokens receive exactly zero probability.
//!
//! ## Backward Pass
//!
//! Per head, with `G = ∂L/∂scores_h`:
//!
//! ```text
//! grad_V_h     = probs_h^T @ grad_ctx_h
//! grad_probs_h = grad_ctx_h @ V_h^T
//! G            = probs_h ⊙ (grad_probs_h - rowsum(grad_probs_h ⊙ probs_h))
//! grad_Q_h     = G @ K_h / √d_h
//! grad_K_h     = G^T @ Q_h / √d_h
//! ```
//!
//! Heads are independent, so both passes fan out over heads with Rayon.

use super::dropout::{DropoutCache, TrainableDropout};
use super::linear::{LinearCache, TrainableLinear};
use super::output::{OutputCache, TrainableOutput};
use crate::encoder::EncoderConfig;
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Additive bias for masked attention scores.
pub(crate) const MASK_BIAS: f32 = -1e9;

/// Row-wise softmax backward: `p ⊙ (g - rowsum(g ⊙ p))`.
pub(crate) fn softmax_backward(probs: &Tensor, grad_probs: &Tensor) -> Tensor {
    let cols = probs.cols();
    let mut out = vec![0.0; probs.data.len()];
    out.par_chunks_mut(cols)
        .zip(probs.data.par_chunks(cols))
        .zip(grad_probs.data.par_chunks(cols))
        .for_each(|((o, p), g)| {
            let dot: f32 = p.iter().zip(g).map(|(a, b)| a * b).sum();
            for j in 0..cols {
                o[j] = p[j] * (g[j] - dot);
            }
        });
    Tensor::new(out, probs.shape.clone())
}

/// One independent RNG per head, drawn from the caller's RNG so results do
/// not depend on how Rayon schedules the heads.
pub(crate) fn head_rngs(rng: Option<&mut StdRng>, n_heads: usize) -> Vec<Option<StdRng>> {
    match rng {
        Some(rng) => (0..n_heads)
            .map(|_| Some(StdRng::seed_from_u64(rng.gen())))
            .collect(),
        None => (0..n_heads).map(|_| None).collect(),
    }
}

/// Multi-head self-attention plus its residual output sub-layer.
#[derive(Clone, Debug)]
pub struct TrainableSelfAttention {
    pub query: TrainableLinear,
    pub key: TrainableLinear,
    pub value: TrainableLinear,
    pub output: TrainableOutput,
    pub attn_dropout: TrainableDropout,
    pub n_heads: usize,
}

/// Per-head forward state
pub struct HeadCache {
    probs: Tensor,
    probs_dropped: Tensor,
    dropout: DropoutCache,
}

/// Cache for attention backward pass
pub struct AttentionCache {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    q_cache: LinearCache,
    k_cache: LinearCache,
    v_cache: LinearCache,
    heads: Vec<HeadCache>,
    output: OutputCache,
}

impl TrainableSelfAttention {
    pub fn new(config: &EncoderConfig, rng: &mut StdRng) -> Self {
        let h = config.hidden_size;
        let std = config.initializer_range;
        Self {
            query: TrainableLinear::new(h, h, std, rng),
            key: TrainableLinear::new(h, h, std, rng),
            value: TrainableLinear::new(h, h, std, rng),
            output: TrainableOutput::new(
                h,
                h,
                config.layer_norm_eps,
                config.hidden_dropout_prob,
                std,
                rng,
            ),
            attn_dropout: TrainableDropout::new(config.attention_probs_dropout_prob),
            n_heads: config.num_attention_heads,
        }
    }

    fn head_dim(&self) -> usize {
        self.query.out_features() / self.n_heads
    }

    /// # Arguments
    ///
    /// * `x` - `[seq_len, hidden]`
    /// * `mask` - attention mask per position (1.0 = token, 0.0 = padding)
    /// * `rng` - dropout RNG, `None` in evaluation
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &[f32],
        mut rng: Option<&mut StdRng>,
    ) -> (Tensor, AttentionCache) {
        let seq_len = x.shape[0];
        let dh = self.head_dim();
        let scale = 1.0 / (dh as f32).sqrt();

        let (q, q_cache) = self.query.forward(x);
        let (k, k_cache) = self.key.forward(x);
        let (v, v_cache) = self.value.forward(x);

        let key_bias: Vec<f32> = mask
            .iter()
            .map(|&m| if m > 0.0 { 0.0 } else { MASK_BIAS })
            .collect();
        let key_bias = Tensor::new(key_bias, vec![seq_len]);

        let rngs = head_rngs(rng.as_deref_mut(), self.n_heads);
        let (contexts, heads): (Vec<Tensor>, Vec<HeadCache>) = rngs
            .into_par_iter()
            .enumerate()
            .map(|(h, mut head_rng)| {
                let q_h = q.slice_cols(h * dh, (h + 1) * dh);
                let k_h = k.slice_cols(h * dh, (h + 1) * dh);
                let v_h = v.slice_cols(h * dh, (h + 1) * dh);

                let scores = q_h.matmul_transposed(&k_h).mul_scalar(scale).add(&key_bias);
                let probs = scores.softmax_rows();
                let (probs_dropped, dropout) =
                    self.attn_dropout.forward(&probs, head_rng.as_mut());
                let ctx = probs_dropped.matmul(&v_h);
                (
                    ctx,
                    HeadCache {
                        probs,
                        probs_dropped,
                        dropout,
                    },
                )
            })
            .unzip();

        let ctx = Tensor::concat_cols(&contexts);
        let (y, output) = self.output.forward(&ctx, x, rng);

        let cache = AttentionCache {
            q,
            k,
            v,
            q_cache,
            k_cache,
            v_cache,
            heads,
            output,
        };
        (y, cache)
    }

    /// Accumulates parameter gradients under `prefix` (e.g.
    /// `encoder.layer.3.attention`) and returns the gradient for `x`.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &AttentionCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        let dh = self.head_dim();
        let scale = 1.0 / (dh as f32).sqrt();

        let (grad_ctx, grad_residual) =
            self.output
                .backward(grad_out, &cache.output, &format!("{prefix}.output"), grads);

        let per_head: Vec<(Tensor, Tensor, Tensor)> = cache
            .heads
            .par_iter()
            .enumerate()
            .map(|(h, head)| {
                let cols = (h * dh, (h + 1) * dh);
                let q_h = cache.q.slice_cols(cols.0, cols.1);
                let k_h = cache.k.slice_cols(cols.0, cols.1);
                let v_h = cache.v.slice_cols(cols.0, cols.1);
                let grad_ctx_h = grad_ctx.slice_cols(cols.0, cols.1);

                let grad_v = head.probs_dropped.transpose_matmul(&grad_ctx_h);
                let grad_probs_dropped = grad_ctx_h.matmul_transposed(&v_h);
                let grad_probs = self.attn_dropout.backward(&grad_probs_dropped, &head.dropout);
                let grad_scores = softmax_backward(&head.probs, &grad_probs);

                let grad_q = grad_scores.matmul(&k_h).mul_scalar(scale);
                let grad_k = grad_scores.transpose_matmul(&q_h).mul_scalar(scale);
                (grad_q, grad_k, grad_v)
            })
            .collect();

        let mut grad_q = Vec::with_capacity(self.n_heads);
        let mut grad_k = Vec::with_capacity(self.n_heads);
        let mut grad_v = Vec::with_capacity(self.n_heads);
        for (q, k, v) in per_head {
            grad_q.push(q);
            grad_k.push(k);
            grad_v.push(v);
        }

        let mut grad_x = self
            .query
            .backward(&Tensor::concat_cols(&grad_q), &cache.q_cache)
            .accumulate_into(&format!("{prefix}.self.query"), grads);
        grad_x.add_assign(
            &self
                .key
                .backward(&Tensor::concat_cols(&grad_k), &cache.k_cache)
                .accumulate_into(&format!("{prefix}.self.key"), grads),
        );
        grad_x.add_assign(
            &self
                .value
                .backward(&Tensor::concat_cols(&grad_v), &cache.v_cache)
                .accumulate_into(&format!("{prefix}.self.value"), grads),
        );
        grad_x.add_assign(&grad_residual);
        grad_x
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.query.visit_parameters(&format!("{prefix}.self.query"), f);
        self.key.visit_parameters(&format!("{prefix}.self.key"), f);
        self.value.visit_parameters(&format!("{prefix}.self.value"), f);
        self.output.visit_parameters(&format!("{prefix}.output"), f);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.query
            .visit_parameters_mut(&format!("{prefix}.self.query"), f);
        self.key.visit_parameters_mut(&format!("{prefix}.self.key"), f);
        self.value
            .visit_parameters_mut(&format!("{prefix}.self.value"), f);
        self.output
            .visit_parameters_mut(&format!("{prefix}.output"), f);
    }
}
