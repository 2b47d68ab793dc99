//! Input Embeddings
//!
//! ```text
//! BERT:    word[id] + position[i] + token_type[type] → LayerNorm → dropout
//! DeBERTa: word[id]                                  → LayerNorm → × mask → dropout
//! ```
//!
//! DeBERTa has no absolute positions (`position_biased_input = false`) and no
//! token types; position information enters through disentangled attention.
//!
//! The backward pass scatter-adds row gradients into the tables, so only
//! rows that were looked up receive gradient.

use super::dropout::{DropoutCache, TrainableDropout};
use super::layer_norm::{LayerNormCache, TrainableLayerNorm};
use super::linear::normal_init;
use crate::encoder::EncoderConfig;
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

#[derive(Clone, Debug)]
pub struct TrainableEmbeddings {
    /// `[vocab_size, hidden]`
    pub word: Tensor,
    /// `[max_position_embeddings, hidden]`, BERT only
    pub position: Option<Tensor>,
    /// `[type_vocab_size, hidden]`, BERT only
    pub token_type: Option<Tensor>,
    pub layer_norm: TrainableLayerNorm,
    pub dropout: TrainableDropout,
    /// Zero padded positions after the norm (DeBERTa)
    pub mask_output: bool,
}

pub struct EmbeddingsCache {
    input_ids: Vec<usize>,
    token_type_ids: Vec<usize>,
    mask: Vec<f32>,
    layer_norm: LayerNormCache,
    dropout: DropoutCache,
}

impl TrainableEmbeddings {
    pub fn new(config: &EncoderConfig, rng: &mut StdRng) -> Self {
        let h = config.hidden_size;
        let std = config.initializer_range;
        let table = |rows: usize, rng: &mut StdRng| {
            Tensor::new(normal_init(rows * h, std, rng), vec![rows, h])
        };

        let mut word = table(config.vocab_size, rng);
        // The padding row starts at zero, as in nn.Embedding(padding_idx=..)
        if config.pad_token_id < config.vocab_size {
            let p = config.pad_token_id;
            word.data[p * h..(p + 1) * h].fill(0.0);
        }
        let position = config
            .position_biased_input
            .then(|| table(config.max_position_embeddings, rng));
        let token_type = (config.type_vocab_size > 0).then(|| table(config.type_vocab_size, rng));

        Self {
            word,
            position,
            token_type,
            layer_norm: TrainableLayerNorm::new(h, config.layer_norm_eps),
            dropout: TrainableDropout::new(config.hidden_dropout_prob),
            mask_output: config.relative_attention,
        }
    }

    /// # Panics
    ///
    /// Panics on an out-of-range id or a sequence longer than the position table.
    pub fn forward(
        &self,
        input_ids: &[usize],
        token_type_ids: &[usize],
        mask: &[f32],
        rng: Option<&mut StdRng>,
    ) -> (Tensor, EmbeddingsCache) {
        let seq_len = input_ids.len();
        let mut x = self.word.gather_rows(input_ids);
        if let Some(position) = &self.position {
            let positions: Vec<usize> = (0..seq_len).collect();
            x.add_assign(&position.gather_rows(&positions));
        }
        if let Some(token_type) = &self.token_type {
            x.add_assign(&token_type.gather_rows(token_type_ids));
        }

        let (mut x, layer_norm) = self.layer_norm.forward(&x);
        if self.mask_output {
            let h = x.cols();
            for (i, &m) in mask.iter().enumerate() {
                x.data[i * h..(i + 1) * h].iter_mut().for_each(|v| *v *= m);
            }
        }
        let (y, dropout) = self.dropout.forward(&x, rng);

        let cache = EmbeddingsCache {
            input_ids: input_ids.to_vec(),
            token_type_ids: token_type_ids.to_vec(),
            mask: mask.to_vec(),
            layer_norm,
            dropout,
        };
        (y, cache)
    }

    /// `prefix` is `embeddings`; tables are named `{prefix}.word_embeddings.weight` etc.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &EmbeddingsCache,
        prefix: &str,
        grads: &mut Gradients,
    ) {
        let mut grad = self.dropout.backward(grad_out, &cache.dropout);
        if self.mask_output {
            let h = grad.cols();
            for (i, &m) in cache.mask.iter().enumerate() {
                grad.data[i * h..(i + 1) * h].iter_mut().for_each(|v| *v *= m);
            }
        }
        let grad_sum = self
            .layer_norm
            .backward(&grad, &cache.layer_norm)
            .accumulate_into(&format!("{prefix}.LayerNorm"), grads);

        grads.accumulate_rows(
            format!("{prefix}.word_embeddings.weight"),
            &self.word.shape,
            &cache.input_ids,
            &grad_sum,
        );
        if let Some(position) = &self.position {
            let positions: Vec<usize> = (0..cache.input_ids.len()).collect();
            grads.accumulate_rows(
                format!("{prefix}.position_embeddings.weight"),
                &position.shape,
                &positions,
                &grad_sum,
            );
        }
        if let Some(token_type) = &self.token_type {
            grads.accumulate_rows(
                format!("{prefix}.token_type_embeddings.weight"),
                &token_type.shape,
                &cache.token_type_ids,
                &grad_sum,
            );
        }
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&format!("{prefix}.word_embeddings.weight"), &self.word);
        if let Some(position) = &self.position {
            f(&format!("{prefix}.position_embeddings.weight"), position);
        }
        if let Some(token_type) = &self.token_type {
            f(&format!("{prefix}.token_type_embeddings.weight"), token_type);
        }
        self.layer_norm
            .visit_parameters(&format!("{prefix}.LayerNorm"), f);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        f(&format!("{prefix}.word_embeddings.weight"), &mut self.word);
        if let Some(position) = &mut self.position {
            f(&format!("{prefix}.position_embeddings.weight"), position);
        }
        if let Some(token_type) = &mut self.token_type {
            f(&format!("{prefix}.token_type_embeddings.weight"), token_type);
        }
        self.layer_norm
            .visit_parameters_mut(&format!("{prefix}.LayerNorm"), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_gradient_only_reaches_used_rows() {
        let config = EncoderConfig::tiny_bert(10);
        let mut rng = StdRng::seed_from_u64(1);
        let emb = TrainableEmbeddings::new(&config, &mut rng);
        let ids = [2, 5, 5];
        let (y, cache) = emb.forward(&ids, &[0, 0, 0], &[1.0; 3], None);
        assert_eq!(y.shape, vec![3, config.hidden_size]);

        let mut grads = Gradients::new();
        let probe: Vec<f32> = (0..y.data.len()).map(|i| (i % 7) as f32 - 3.0).collect();
        let probe = Tensor::new(probe, y.shape.clone());
        emb.backward(&probe, &cache, "embeddings", &mut grads);
        let word = grads.get("embeddings.word_embeddings.weight").unwrap();
        assert_eq!(word.shape, emb.word.shape);
        assert!(word.row(0).iter().all(|&v| v == 0.0));
        assert!(word.row(5).iter().any(|&v| v != 0.0));
        assert!(grads.get("embeddings.position_embeddings.weight").is_some());
    }

    #[test]
    fn test_deberta_embeddings_zero_padding_rows() {
        let config = EncoderConfig::tiny_deberta(10);
        let mut rng = StdRng::seed_from_u64(1);
        let emb = TrainableEmbeddings::new(&config, &mut rng);
        assert!(emb.position.is_none());
        assert!(emb.token_type.is_none());
        let (y, _) = emb.forward(&[3, 4, 0], &[0, 0, 0], &[1.0, 1.0, 0.0], None);
        assert!(y.row(2).iter().all(|&v| v == 0.0));
        assert!(y.row(1).iter().any(|&v| v != 0.0));
    }
}
