//! Disentangled Self-Attention (DeBERTa)
//!
//! Each token is represented by its content vector and, separately, by its
//! relative distance to every other token. The attention score between
//! query `i` and key `j` sums three terms:
//!
//! ```text
//! content → content   Qs_i · K_j
//! content → position  Qs_i · Kr[δ(i,j)]        (c2p)
//! position → content  K_j  · Qrs[δ(i,j)]       (p2c)
//!
//! Qs  = (x W_q + q_bias) / √(3·d_h)
//! K   =  x W_k                                   (no bias)
//! Kr  =  R W_pos                                 (no bias)
//! Qrs = (R W_pos_q + b_pos_q) / √(3·d_h)
//! δ(i,j) = clamp(i - j + span, 0, 2·span - 1)
//! ```
//!
//! `R` is the window `rel_embeddings[max_rel - span .. max_rel + span]` with
//! `span = min(seq_len, max_rel)`, after dropout. While `seq_len <= max_rel`
//! the row used for a pair is `max_rel + i - j` regardless of the sequence
//! length, which keeps padded and unpadded batches consistent.
//!
//! Masking is pairwise: a pair is valid when both tokens are real. Invalid
//! pairs are removed before the softmax and zeroed after it, so padded query
//! rows attend to nothing.

use super::attention::{head_rngs, softmax_backward, MASK_BIAS};
use super::dropout::{DropoutCache, TrainableDropout};
use super::linear::{LinearCache, TrainableLinear};
use super::output::{OutputCache, TrainableOutput};
use crate::encoder::EncoderConfig;
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rayon::prelude::*;

#[derive(Clone, Debug)]
pub struct TrainableDisentangledAttention {
    /// `in_proj` query rows, with `q_bias` as its bias
    pub query_proj: TrainableLinear,
    /// `in_proj` key rows, no bias
    pub key_proj: TrainableLinear,
    /// `in_proj` value rows, with `v_bias` as its bias
    pub value_proj: TrainableLinear,
    /// Relative keys, present when c2p is enabled
    pub pos_proj: Option<TrainableLinear>,
    /// Relative queries, present when p2c is enabled
    pub pos_q_proj: Option<TrainableLinear>,
    pub output: TrainableOutput,
    pub attn_dropout: TrainableDropout,
    pub pos_dropout: TrainableDropout,
    pub n_heads: usize,
    pub max_relative_positions: usize,
}

struct HeadCache {
    probs: Tensor,
    probs_dropped: Tensor,
    dropout: DropoutCache,
}

pub struct DisentangledCache {
    qs: Tensor,
    k: Tensor,
    v: Tensor,
    q_cache: LinearCache,
    k_cache: LinearCache,
    v_cache: LinearCache,
    kr: Option<(Tensor, LinearCache)>,
    qrs: Option<(Tensor, LinearCache)>,
    pos_dropout: DropoutCache,
    rel_index: Vec<usize>,
    window_start: usize,
    window_len: usize,
    heads: Vec<HeadCache>,
    output: OutputCache,
}

/// Gradient for the rows of the shared relative embedding table this layer read.
pub struct RelativeGradient {
    pub start: usize,
    pub grad: Tensor,
}

impl TrainableDisentangledAttention {
    pub fn new(config: &EncoderConfig, rng: &mut StdRng) -> Self {
        let h = config.hidden_size;
        let std = config.initializer_range;
        let mut query_proj = TrainableLinear::new_no_bias(h, h, std, rng);
        query_proj.bias = Some(Tensor::zeros(vec![h]));
        let key_proj = TrainableLinear::new_no_bias(h, h, std, rng);
        let mut value_proj = TrainableLinear::new_no_bias(h, h, std, rng);
        value_proj.bias = Some(Tensor::zeros(vec![h]));

        Self {
            query_proj,
            key_proj,
            value_proj,
            pos_proj: config
                .uses_c2p()
                .then(|| TrainableLinear::new_no_bias(h, h, std, rng)),
            pos_q_proj: config
                .uses_p2c()
                .then(|| TrainableLinear::new(h, h, std, rng)),
            output: TrainableOutput::new(
                h,
                h,
                config.layer_norm_eps,
                config.hidden_dropout_prob,
                std,
                rng,
            ),
            attn_dropout: TrainableDropout::new(config.attention_probs_dropout_prob),
            pos_dropout: TrainableDropout::new(config.hidden_dropout_prob),
            n_heads: config.num_attention_heads,
            max_relative_positions: config.relative_span(),
        }
    }

    fn head_dim(&self) -> usize {
        self.query_proj.out_features() / self.n_heads
    }

    fn scale(&self) -> f32 {
        let factor = 1 + self.pos_proj.is_some() as usize + self.pos_q_proj.is_some() as usize;
        1.0 / ((self.head_dim() * factor) as f32).sqrt()
    }

    /// # Arguments
    ///
    /// * `x` - `[seq_len, hidden]`
    /// * `mask` - attention mask per position (1.0 = token, 0.0 = padding)
    /// * `rel_embeddings` - shared table `[2·max_rel, hidden]`
    /// * `rng` - dropout RNG, `None` in evaluation
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &[f32],
        rel_embeddings: &Tensor,
        mut rng: Option<&mut StdRng>,
    ) -> (Tensor, DisentangledCache) {
        let seq_len = x.shape[0];
        let dh = self.head_dim();
        let scale = self.scale();
        let max_rel = self.max_relative_positions;
        let span = seq_len.min(max_rel);
        let window_start = max_rel - span;
        let window_len = 2 * span;

        let (q, q_cache) = self.query_proj.forward(x);
        let qs = q.mul_scalar(scale);
        let (k, k_cache) = self.key_proj.forward(x);
        let (v, v_cache) = self.value_proj.forward(x);

        let window = rel_embeddings.slice_rows(window_start, window_start + window_len);
        let (window, pos_dropout) = self.pos_dropout.forward(&window, rng.as_deref_mut());
        let kr = self.pos_proj.as_ref().map(|p| p.forward(&window));
        let qrs = self.pos_q_proj.as_ref().map(|p| {
            let (qr, cache) = p.forward(&window);
            (qr.mul_scalar(scale), cache)
        });

        let mut rel_index = Vec::with_capacity(seq_len * seq_len);
        for i in 0..seq_len {
            for j in 0..seq_len {
                let delta = i as isize - j as isize + span as isize;
                rel_index.push(delta.clamp(0, window_len as isize - 1) as usize);
            }
        }

        let mut invalid = vec![0.0; seq_len * seq_len];
        for i in 0..seq_len {
            for j in 0..seq_len {
                if mask[i] <= 0.0 || mask[j] <= 0.0 {
                    invalid[i * seq_len + j] = 1.0;
                }
            }
        }
        let invalid = Tensor::new(invalid, vec![seq_len, seq_len]);

        let rngs = head_rngs(rng.as_deref_mut(), self.n_heads);
        let (contexts, heads): (Vec<Tensor>, Vec<HeadCache>) = rngs
            .into_par_iter()
            .enumerate()
            .map(|(h, mut head_rng)| {
                let (c0, c1) = (h * dh, (h + 1) * dh);
                let qs_h = qs.slice_cols(c0, c1);
                let k_h = k.slice_cols(c0, c1);
                let v_h = v.slice_cols(c0, c1);

                let mut scores = qs_h.matmul_transposed(&k_h);
                if let Some((kr, _)) = &kr {
                    let c2p = qs_h.matmul_transposed(&kr.slice_cols(c0, c1));
                    for i in 0..seq_len {
                        for j in 0..seq_len {
                            scores.data[i * seq_len + j] +=
                                c2p.data[i * window_len + rel_index[i * seq_len + j]];
                        }
                    }
                }
                if let Some((qrs, _)) = &qrs {
                    let p2c = k_h.matmul_transposed(&qrs.slice_cols(c0, c1));
                    for i in 0..seq_len {
                        for j in 0..seq_len {
                            scores.data[i * seq_len + j] +=
                                p2c.data[j * window_len + rel_index[i * seq_len + j]];
                        }
                    }
                }

                let mut probs = scores.masked_fill(&invalid, MASK_BIAS).softmax_rows();
                for (p, &m) in probs.data.iter_mut().zip(&invalid.data) {
                    if m != 0.0 {
                        *p = 0.0;
                    }
                }

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

        let cache = DisentangledCache {
            qs,
            k,
            v,
            q_cache,
            k_cache,
            v_cache,
            kr,
            qrs,
            pos_dropout,
            rel_index,
            window_start,
            window_len,
            heads,
            output,
        };
        (y, cache)
    }

    /// Accumulates projection gradients under `prefix` and returns the input
    /// gradient together with the gradient for the relative embedding rows.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &DisentangledCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> (Tensor, RelativeGradient) {
        let dh = self.head_dim();
        let scale = self.scale();
        let seq_len = grad_out.shape[0];
        let window_len = cache.window_len;

        let (grad_ctx, grad_residual) =
            self.output
                .backward(grad_out, &cache.output, &format!("{prefix}.output"), grads);

        struct HeadGrads {
            qs: Tensor,
            k: Tensor,
            v: Tensor,
            kr: Option<Tensor>,
            qrs: Option<Tensor>,
        }

        let per_head: Vec<HeadGrads> = cache
            .heads
            .par_iter()
            .enumerate()
            .map(|(h, head)| {
                let (c0, c1) = (h * dh, (h + 1) * dh);
                let qs_h = cache.qs.slice_cols(c0, c1);
                let k_h = cache.k.slice_cols(c0, c1);
                let v_h = cache.v.slice_cols(c0, c1);
                let grad_ctx_h = grad_ctx.slice_cols(c0, c1);

                let grad_v = head.probs_dropped.transpose_matmul(&grad_ctx_h);
                let grad_probs_dropped = grad_ctx_h.matmul_transposed(&v_h);
                let grad_probs = self.attn_dropout.backward(&grad_probs_dropped, &head.dropout);
                let grad_scores = softmax_backward(&head.probs, &grad_probs);

                let mut grad_qs = grad_scores.matmul(&k_h);
                let mut grad_k = grad_scores.transpose_matmul(&qs_h);

                let grad_kr = cache.kr.as_ref().map(|(kr, _)| {
                    let kr_h = kr.slice_cols(c0, c1);
                    let mut grad_c2p = Tensor::zeros(vec![seq_len, window_len]);
                    for i in 0..seq_len {
                        for j in 0..seq_len {
                            let r = cache.rel_index[i * seq_len + j];
                            grad_c2p.data[i * window_len + r] += grad_scores.data[i * seq_len + j];
                        }
                    }
                    grad_qs.add_assign(&grad_c2p.matmul(&kr_h));
                    grad_c2p.transpose_matmul(&qs_h)
                });

                let grad_qrs = cache.qrs.as_ref().map(|(qrs, _)| {
                    let qrs_h = qrs.slice_cols(c0, c1);
                    let mut grad_p2c = Tensor::zeros(vec![seq_len, window_len]);
                    for i in 0..seq_len {
                        for j in 0..seq_len {
                            let r = cache.rel_index[i * seq_len + j];
                            grad_p2c.data[j * window_len + r] += grad_scores.data[i * seq_len + j];
                        }
                    }
                    grad_k.add_assign(&grad_p2c.matmul(&qrs_h));
                    grad_p2c.transpose_matmul(&k_h)
                });

                HeadGrads {
                    qs: grad_qs,
                    k: grad_k,
                    v: grad_v,
                    kr: grad_kr,
                    qrs: grad_qrs,
                }
            })
            .collect();

        let mut grad_qs = Vec::with_capacity(self.n_heads);
        let mut grad_k = Vec::with_capacity(self.n_heads);
        let mut grad_v = Vec::with_capacity(self.n_heads);
        let mut grad_kr = Vec::with_capacity(self.n_heads);
        let mut grad_qrs = Vec::with_capacity(self.n_heads);
        for g in per_head {
            grad_qs.push(g.qs);
            grad_k.push(g.k);
            grad_v.push(g.v);
            grad_kr.extend(g.kr);
            grad_qrs.extend(g.qrs);
        }

        let mut grad_x = self
            .query_proj
            .backward(
                &Tensor::concat_cols(&grad_qs).mul_scalar(scale),
                &cache.q_cache,
            )
            .accumulate_into(&format!("{prefix}.self.query_proj"), grads);
        grad_x.add_assign(
            &self
                .key_proj
                .backward(&Tensor::concat_cols(&grad_k), &cache.k_cache)
                .accumulate_into(&format!("{prefix}.self.key_proj"), grads),
        );
        grad_x.add_assign(
            &self
                .value_proj
                .backward(&Tensor::concat_cols(&grad_v), &cache.v_cache)
                .accumulate_into(&format!("{prefix}.self.value_proj"), grads),
        );
        grad_x.add_assign(&grad_residual);

        let mut grad_window = Tensor::zeros(vec![window_len, grad_out.shape[1]]);
        if let (Some(pos_proj), Some((_, kr_cache))) = (&self.pos_proj, &cache.kr) {
            grad_window.add_assign(
                &pos_proj
                    .backward(&Tensor::concat_cols(&grad_kr), kr_cache)
                    .accumulate_into(&format!("{prefix}.self.pos_proj"), grads),
            );
        }
        if let (Some(pos_q_proj), Some((_, qr_cache))) = (&self.pos_q_proj, &cache.qrs) {
            grad_window.add_assign(
                &pos_q_proj
                    .backward(
                        &Tensor::concat_cols(&grad_qrs).mul_scalar(scale),
                        qr_cache,
                    )
                    .accumulate_into(&format!("{prefix}.self.pos_q_proj"), grads),
            );
        }
        let grad_window = self.pos_dropout.backward(&grad_window, &cache.pos_dropout);

        (
            grad_x,
            RelativeGradient {
                start: cache.window_start,
                grad: grad_window,
            },
        )
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.query_proj
            .visit_parameters(&format!("{prefix}.self.query_proj"), f);
        self.key_proj
            .visit_parameters(&format!("{prefix}.self.key_proj"), f);
        self.value_proj
            .visit_parameters(&format!("{prefix}.self.value_proj"), f);
        if let Some(p) = &self.pos_proj {
            p.visit_parameters(&format!("{prefix}.self.pos_proj"), f);
        }
        if let Some(p) = &self.pos_q_proj {
            p.visit_parameters(&format!("{prefix}.self.pos_q_proj"), f);
        }
        self.output.visit_parameters(&format!("{prefix}.output"), f);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.query_proj
            .visit_parameters_mut(&format!("{prefix}.self.query_proj"), f);
        self.key_proj
            .visit_parameters_mut(&format!("{prefix}.self.key_proj"), f);
        self.value_proj
            .visit_parameters_mut(&format!("{prefix}.self.value_proj"), f);
        if let Some(p) = &mut self.pos_proj {
            p.visit_parameters_mut(&format!("{prefix}.self.pos_proj"), f);
        }
        if let Some(p) = &mut self.pos_q_proj {
            p.visit_parameters_mut(&format!("{prefix}.self.pos_q_proj"), f);
        }
        self.output
            .visit_parameters_mut(&format!("{prefix}.output"), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::normal_init;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    struct Fixture {
        attn: TrainableDisentangledAttention,
        rel: Tensor,
        x: Tensor,
        probe: Tensor,
    }

    fn fixture(max_rel: i64) -> Fixture {
        let mut config = EncoderConfig::tiny_deberta(16);
        config.hidden_size = 8;
        config.num_attention_heads = 2;
        config.max_relative_positions = max_rel;
        config.initializer_range = 0.3;
        let mut rng = StdRng::seed_from_u64(5);
        let attn = TrainableDisentangledAttention::new(&config, &mut rng);
        let rows = 2 * config.relative_span();
        Fixture {
            attn,
            rel: Tensor::new(normal_init(rows * 8, 1.0, &mut rng), vec![rows, 8]),
            x: Tensor::new(normal_init(3 * 8, 1.0, &mut rng), vec![3, 8]),
            probe: Tensor::new(normal_init(3 * 8, 1.0, &mut rng), vec![3, 8]),
        }
    }

    fn objective(f: &Fixture, x: &Tensor, rel: &Tensor, mask: &[f32]) -> f32 {
        let (y, _) = f.attn.forward(x, mask, rel, None);
        y.data.iter().zip(&f.probe.data).map(|(a, b)| a * b).sum()
    }

    fn check_gradients(max_rel: i64) {
        let f = fixture(max_rel);
        let mask = [1.0, 1.0, 1.0];
        let (_, cache) = f.attn.forward(&f.x, &mask, &f.rel, None);
        let mut grads = Gradients::new();
        let (grad_x, rel_grad) = f.attn.backward(&f.probe, &cache, "attention", &mut grads);

        let h = 1e-2;
        for i in 0..f.x.data.len() {
            let mut xp = f.x.clone();
            xp.data[i] += h;
            let mut xm = f.x.clone();
            xm.data[i] -= h;
            let numeric =
                (objective(&f, &xp, &f.rel, &mask) - objective(&f, &xm, &f.rel, &mask)) / (2.0 * h);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 2e-2);
        }

        let mut full_rel_grad = Tensor::zeros(f.rel.shape.clone());
        for (k, v) in rel_grad.grad.data.iter().enumerate() {
            full_rel_grad.data[rel_grad.start * 8 + k] += v;
        }
        for i in 0..f.rel.data.len() {
            let mut rp = f.rel.clone();
            rp.data[i] += h;
            let mut rm = f.rel.clone();
            rm.data[i] -= h;
            let numeric =
                (objective(&f, &f.x, &rp, &mask) - objective(&f, &f.x, &rm, &mask)) / (2.0 * h);
            assert_abs_diff_eq!(full_rel_grad.data[i], numeric, epsilon = 2e-2);
        }

        assert!(grads.get("attention.self.pos_proj.weight").is_some());
        assert!(grads.get("attention.self.pos_q_proj.bias").is_some());
        assert!(grads.get("attention.self.key_proj.bias").is_none());
    }

    #[test]
    fn test_gradients_match_finite_difference() {
        check_gradients(4);
    }

    #[test]
    fn test_gradients_with_clamped_relative_positions() {
        check_gradients(2);
    }

    #[test]
    fn test_padding_is_ignored() {
        let f = fixture(4);
        let short = f.x.slice_rows(0, 2);
        let (y_short, _) = f.attn.forward(&short, &[1.0, 1.0], &f.rel, None);
        let (y_padded, _) = f.attn.forward(&f.x, &[1.0, 1.0, 0.0], &f.rel, None);
        for i in 0..2 {
            for (a, b) in y_short.row(i).iter().zip(y_padded.row(i)) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-5);
            }
        }
    }
}
