//! Transformer Encoder (BERT / DeBERTa)
//!
//! A stack of post-norm encoder layers on top of the input embeddings,
//! configured from a HuggingFace `config.json`.
//!
//! ## Architecture
//!
//! ```text
//! input_ids, token_type_ids, attention_mask
//!   → Embeddings                     [seq_len, hidden]
//!   → EncoderLayer × num_hidden_layers
//!   → last hidden state              [seq_len, hidden]
//! ```
//!
//! With `relative_attention = true` (DeBERTa) every layer uses disentangled
//! attention over one shared table `encoder.rel_embeddings.weight` of shape
//! `[2·max_relative_positions, hidden]`.
//!
//! ## Parameter Names
//!
//! Parameters are addressed by HuggingFace-style names without the model
//! prefix, e.g. `embeddings.LayerNorm.weight` or
//! `encoder.layer.3.attention.self.query.weight`. The same names key the
//! gradient map, the optimizer state and saved checkpoints.
//!
//! The encoder processes a single sequence; batching happens one level up.

use crate::error::{FinetuneError, Result};
use crate::gradients::{Gradients, Trainable};
use crate::layers::{
    Activation, EmbeddingsCache, EncoderLayerCache, TrainableEmbeddings, TrainableEncoderLayer,
};
use crate::layers::linear::normal_init;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

pub const REL_EMBEDDINGS_NAME: &str = "encoder.rel_embeddings.weight";

/// Encoder hyperparameters, deserialized from HuggingFace `config.json`.
///
/// Missing fields take BERT-base defaults; unknown fields are ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f32,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default)]
    pub relative_attention: bool,
    #[serde(default = "default_max_relative_positions")]
    pub max_relative_positions: i64,
    #[serde(default = "default_true")]
    pub position_biased_input: bool,
    #[serde(default, deserialize_with = "deserialize_pos_att_type")]
    pub pos_att_type: Vec<String>,
    #[serde(default)]
    pub pad_token_id: usize,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f32,
}

fn default_model_type() -> String {
    "bert".to_string()
}
fn default_hidden_act() -> String {
    "gelu".to_string()
}
fn default_dropout() -> f32 {
    0.1
}
fn default_max_position_embeddings() -> usize {
    512
}
fn default_type_vocab_size() -> usize {
    2
}
fn default_layer_norm_eps() -> f32 {
    1e-12
}
fn default_max_relative_positions() -> i64 {
    -1
}
fn default_true() -> bool {
    true
}
fn default_initializer_range() -> f32 {
    0.02
}

/// Older DeBERTa configs spell `pos_att_type` as `"c2p|p2c"`, newer ones as a list.
fn deserialize_pos_att_type<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Repr::Joined(s)) => s
            .split('|')
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(Repr::List(items)) => items.into_iter().map(|t| t.to_lowercase()).collect(),
    })
}

impl EncoderConfig {
    /// Read and validate a `config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EncoderConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// A 2-layer BERT-shaped encoder small enough for tests.
    pub fn tiny_bert(vocab_size: usize) -> Self {
        Self {
            model_type: "bert".to_string(),
            vocab_size,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            hidden_act: "gelu".to_string(),
            hidden_dropout_prob: 0.0,
            attention_probs_dropout_prob: 0.0,
            max_position_embeddings: 32,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            relative_attention: false,
            max_relative_positions: -1,
            position_biased_input: true,
            pos_att_type: Vec::new(),
            pad_token_id: 0,
            initializer_range: 0.02,
        }
    }

    /// A 2-layer DeBERTa-shaped encoder small enough for tests.
    pub fn tiny_deberta(vocab_size: usize) -> Self {
        Self {
            model_type: "deberta".to_string(),
            type_vocab_size: 0,
            layer_norm_eps: 1e-7,
            relative_attention: true,
            max_relative_positions: -1,
            position_biased_input: false,
            pos_att_type: vec!["c2p".to_string(), "p2c".to_string()],
            ..Self::tiny_bert(vocab_size)
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Effective relative distance bound; `max_relative_positions < 1` falls
    /// back to `max_position_embeddings`.
    pub fn relative_span(&self) -> usize {
        if self.max_relative_positions < 1 {
            self.max_position_embeddings
        } else {
            self.max_relative_positions as usize
        }
    }

    pub fn uses_c2p(&self) -> bool {
        self.pos_att_type.iter().any(|t| t == "c2p")
    }

    pub fn uses_p2c(&self) -> bool {
        self.pos_att_type.iter().any(|t| t == "p2c")
    }

    pub fn activation(&self) -> Activation {
        Activation::from_hf_name(&self.hidden_act).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FinetuneError::InvalidConfig(msg));
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return invalid(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            ));
        }
        if self.vocab_size == 0 || self.num_hidden_layers == 0 || self.intermediate_size == 0 {
            return invalid("vocab_size, num_hidden_layers and intermediate_size must be positive".into());
        }
        if Activation::from_hf_name(&self.hidden_act).is_none() {
            return invalid(format!("unsupported hidden_act '{}'", self.hidden_act));
        }
        if let Some(t) = self
            .pos_att_type
            .iter()
            .find(|t| t.as_str() != "c2p" && t.as_str() != "p2c")
        {
            return invalid(format!("unsupported pos_att_type '{t}'"));
        }
        if self.relative_attention && !self.position_biased_input && self.pos_att_type.is_empty() {
            return invalid("relative attention without position inputs has no position signal".into());
        }
        Ok(())
    }
}

/// Embeddings plus the stack of encoder layers.
#[derive(Clone, Debug)]
pub struct TrainableEncoder {
    pub config: EncoderConfig,
    pub embeddings: TrainableEmbeddings,
    pub layers: Vec<TrainableEncoderLayer>,
    /// `[2·relative_span, hidden]`, DeBERTa only
    pub rel_embeddings: Option<Tensor>,
}

pub struct EncoderCache {
    embeddings: EmbeddingsCache,
    layers: Vec<EncoderLayerCache>,
}

impl TrainableEncoder {
    /// Randomly initialized encoder: weights ~ N(0, initializer_range²), zero
    /// biases, unit LayerNorm. Pretrained weights are loaded on top of this.
    pub fn new(config: &EncoderConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let embeddings = TrainableEmbeddings::new(config, &mut rng);
        let layers = (0..config.num_hidden_layers)
            .map(|_| TrainableEncoderLayer::new(config, &mut rng))
            .collect();
        let rel_embeddings = config.relative_attention.then(|| {
            let rows = 2 * config.relative_span();
            Tensor::new(
                normal_init(rows * config.hidden_size, config.initializer_range, &mut rng),
                vec![rows, config.hidden_size],
            )
        });
        Ok(Self {
            config: config.clone(),
            embeddings,
            layers,
            rel_embeddings,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Last hidden state `[seq_len, hidden]` for one sequence.
    ///
    /// # Arguments
    ///
    /// * `input_ids` - token ids, `[CLS]` first
    /// * `token_type_ids` - segment ids (ignored when the model has none)
    /// * `mask` - 1.0 for tokens, 0.0 for padding
    /// * `rng` - dropout RNG, `None` in evaluation
    pub fn forward(
        &self,
        input_ids: &[usize],
        token_type_ids: &[usize],
        mask: &[f32],
        mut rng: Option<&mut StdRng>,
    ) -> (Tensor, EncoderCache) {
        let (mut x, embeddings) =
            self.embeddings
                .forward(input_ids, token_type_ids, mask, rng.as_deref_mut());
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (y, cache) = layer.forward(&x, mask, self.rel_embeddings.as_ref(), rng.as_deref_mut());
            layers.push(cache);
            x = y;
        }
        (x, EncoderCache { embeddings, layers })
    }

    /// Backpropagate `grad_hidden` (gradient of the last hidden state) and
    /// add every parameter gradient into `grads`.
    pub fn backward_into(&self, grad_hidden: &Tensor, cache: &EncoderCache, grads: &mut Gradients) {
        let mut grad = grad_hidden.clone();
        for (i, (layer, layer_cache)) in self.layers.iter().zip(&cache.layers).enumerate().rev() {
            let (grad_x, rel) = layer.backward(&grad, layer_cache, &format!("encoder.layer.{i}"), grads);
            if let (Some(rel), Some(table)) = (rel, &self.rel_embeddings) {
                let indices: Vec<usize> = (rel.start..rel.start + rel.grad.rows()).collect();
                grads.accumulate_rows(REL_EMBEDDINGS_NAME, &table.shape, &indices, &rel.grad);
            }
            grad = grad_x;
        }
        self.embeddings
            .backward(&grad, &cache.embeddings, "embeddings", grads);
    }

    /// Same as [`backward_into`](Self::backward_into) into a fresh map.
    pub fn backward(&self, grad_hidden: &Tensor, cache: &EncoderCache) -> Gradients {
        let mut grads = Gradients::new();
        self.backward_into(grad_hidden, cache, &mut grads);
        grads
    }
}

impl Trainable for TrainableEncoder {
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, &Tensor)) {
        self.embeddings.visit_parameters("embeddings", f);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_parameters(&format!("encoder.layer.{i}"), f);
        }
        if let Some(rel) = &self.rel_embeddings {
            f(REL_EMBEDDINGS_NAME, rel);
        }
    }

    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.embeddings.visit_parameters_mut("embeddings", f);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_parameters_mut(&format!("encoder.layer.{i}"), f);
        }
        if let Some(rel) = &mut self.rel_embeddings {
            f(REL_EMBEDDINGS_NAME, rel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_parses_deberta_config_with_joined_pos_att_type() {
        let json = r#"{
            "model_type": "deberta", "vocab_size": 50265, "hidden_size": 768,
            "num_hidden_layers": 12, "num_attention_heads": 12, "intermediate_size": 3072,
            "hidden_act": "gelu", "layer_norm_eps": 1e-7, "relative_attention": true,
            "max_relative_positions": -1, "position_biased_input": false,
            "pos_att_type": "c2p|p2c", "type_vocab_size": 0, "max_position_embeddings": 512
        }"#;
        let config: EncoderConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert!(config.uses_c2p() && config.uses_p2c());
        assert_eq!(config.relative_span(), 512);
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn test_bert_defaults_and_list_pos_att_type() {
        let json = r#"{"vocab_size": 30522, "hidden_size": 768, "num_hidden_layers": 12,
                       "num_attention_heads": 12, "intermediate_size": 3072,
                       "pos_att_type": ["C2P"], "unknown_field": 1}"#;
        let config: EncoderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.model_type, "bert");
        assert_eq!(config.type_vocab_size, 2);
        assert_abs_diff_eq!(config.layer_norm_eps, 1e-12);
        assert_eq!(config.pos_att_type, vec!["c2p"]);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let mut config = EncoderConfig::tiny_bert(10);
        config.num_attention_heads = 3;
        assert!(matches!(
            TrainableEncoder::new(&config, 0),
            Err(FinetuneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parameter_names_are_unique_and_cover_gradients() {
        for config in [EncoderConfig::tiny_bert(12), EncoderConfig::tiny_deberta(12)] {
            let encoder = TrainableEncoder::new(&config, 3).unwrap();
            let mut names = Vec::new();
            encoder.visit_parameters(&mut |n, _| names.push(n.to_string()));
            let mut unique = names.clone();
            unique.sort();
            unique.dedup();
            assert_eq!(unique.len(), names.len());

            let ids = [1, 4, 7, 2];
            let (h, cache) = encoder.forward(&ids, &[0; 4], &[1.0; 4], None);
            let probe: Vec<f32> = (0..h.data.len()).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
            let grads = encoder.backward(&Tensor::new(probe, h.shape.clone()), &cache);
            for (name, grad) in grads.iter() {
                assert!(names.contains(name), "unexpected gradient {name}");
                let mut shape = None;
                encoder.visit_parameters(&mut |n, t| {
                    if n == name {
                        shape = Some(t.shape.clone());
                    }
                });
                assert_eq!(Some(grad.shape.clone()), shape);
            }
            assert_eq!(grads.len(), names.len());
        }
    }

    #[test]
    fn test_deberta_embedding_gradient_matches_finite_difference() {
        let mut config = EncoderConfig::tiny_deberta(12);
        config.initializer_range = 0.5;
        config.num_hidden_layers = 1;
        let encoder = TrainableEncoder::new(&config, 8).unwrap();
        let ids = [3, 5, 9];
        let mask = [1.0; 3];
        let probe: Vec<f32> = (0..3 * 8).map(|i| ((i * 5) % 9) as f32 * 0.25 - 1.0).collect();
        let probe = Tensor::new(probe, vec![3, 8]);
        let objective = |enc: &TrainableEncoder| -> f32 {
            let (h, _) = enc.forward(&ids, &[0; 3], &mask, None);
            h.data.iter().zip(&probe.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = encoder.forward(&ids, &[0; 3], &mask, None);
        let grads = encoder.backward(&probe, &cache);
        let analytic = grads.get("embeddings.word_embeddings.weight").unwrap();

        let step = 1e-2;
        for idx in [5 * 8, 5 * 8 + 3, 9 * 8 + 7] {
            let mut plus = encoder.clone();
            plus.embeddings.word.data[idx] += step;
            let mut minus = encoder.clone();
            minus.embeddings.word.data[idx] -= step;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * step);
            assert_abs_diff_eq!(analytic.data[idx], numeric, epsilon = 3e-2);
        }
    }
}
