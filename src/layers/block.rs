//! Encoder Layer
//!
//! One post-norm transformer encoder layer:
//!
//! ```text
//! x → Attention → (+ x) → LayerNorm → h → FeedForward → (+ h) → LayerNorm → y
//! ```
//!
//! The residual additions and norms live inside the two sub-layers, so the
//! backward pass is simply feed-forward backward followed by attention
//! backward. The attention is either BERT's absolute-position attention or
//! DeBERTa's disentangled attention, which also reads the shared relative
//! position table.

use super::attention::{AttentionCache, TrainableSelfAttention};
use super::disentangled_attention::{
    DisentangledCache, RelativeGradient, TrainableDisentangledAttention,
};
use super::mlp::{FeedForwardCache, TrainableFeedForward};
use crate::encoder::EncoderConfig;
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

#[derive(Clone, Debug)]
pub enum LayerAttention {
    Absolute(TrainableSelfAttention),
    Disentangled(TrainableDisentangledAttention),
}

enum LayerAttentionCache {
    Absolute(AttentionCache),
    Disentangled(DisentangledCache),
}

#[derive(Clone, Debug)]
pub struct TrainableEncoderLayer {
    pub attention: LayerAttention,
    pub feed_forward: TrainableFeedForward,
}

pub struct EncoderLayerCache {
    attention: LayerAttentionCache,
    feed_forward: FeedForwardCache,
}

impl TrainableEncoderLayer {
    pub fn new(config: &EncoderConfig, rng: &mut StdRng) -> Self {
        let attention = if config.relative_attention {
            LayerAttention::Disentangled(TrainableDisentangledAttention::new(config, rng))
        } else {
            LayerAttention::Absolute(TrainableSelfAttention::new(config, rng))
        };
        Self {
            attention,
            feed_forward: TrainableFeedForward::new(
                config.hidden_size,
                config.intermediate_size,
                config.activation(),
                config.layer_norm_eps,
                config.hidden_dropout_prob,
                config.initializer_range,
                rng,
            ),
        }
    }

    /// `rel_embeddings` is required for disentangled attention and ignored otherwise.
    ///
    /// # Panics
    ///
    /// Panics if a disentangled layer is called without a relative table.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &[f32],
        rel_embeddings: Option<&Tensor>,
        mut rng: Option<&mut StdRng>,
    ) -> (Tensor, EncoderLayerCache) {
        let (h, attention) = match &self.attention {
            LayerAttention::Absolute(attn) => {
                let (h, cache) = attn.forward(x, mask, rng.as_deref_mut());
                (h, LayerAttentionCache::Absolute(cache))
            }
            LayerAttention::Disentangled(attn) => {
                let rel = rel_embeddings.expect("disentangled attention needs rel_embeddings");
                let (h, cache) = attn.forward(x, mask, rel, rng.as_deref_mut());
                (h, LayerAttentionCache::Disentangled(cache))
            }
        };
        let (y, feed_forward) = self.feed_forward.forward(&h, rng);
        (
            y,
            EncoderLayerCache {
                attention,
                feed_forward,
            },
        )
    }

    /// Returns the input gradient and, for disentangled attention, the
    /// gradient for the relative embedding rows it used.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &EncoderLayerCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> (Tensor, Option<RelativeGradient>) {
        let grad_h = self
            .feed_forward
            .backward(grad_out, &cache.feed_forward, prefix, grads);
        let attn_prefix = format!("{prefix}.attention");
        match (&self.attention, &cache.attention) {
            (LayerAttention::Absolute(attn), LayerAttentionCache::Absolute(c)) => {
                (attn.backward(&grad_h, c, &attn_prefix, grads), None)
            }
            (LayerAttention::Disentangled(attn), LayerAttentionCache::Disentangled(c)) => {
                let (grad_x, rel) = attn.backward(&grad_h, c, &attn_prefix, grads);
                (grad_x, Some(rel))
            }
            _ => unreachable!("cache produced by a different attention kind"),
        }
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        let attn_prefix = format!("{prefix}.attention");
        match &self.attention {
            LayerAttention::Absolute(attn) => attn.visit_parameters(&attn_prefix, f),
            LayerAttention::Disentangled(attn) => attn.visit_parameters(&attn_prefix, f),
        }
        self.feed_forward.visit_parameters(prefix, f);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        let attn_prefix = format!("{prefix}.attention");
        match &mut self.attention {
            LayerAttention::Absolute(attn) => attn.visit_parameters_mut(&attn_prefix, f),
            LayerAttention::Disentangled(attn) => attn.visit_parameters_mut(&attn_prefix, f),
        }
        self.feed_forward.visit_parameters_mut(prefix, f);
    }
}
