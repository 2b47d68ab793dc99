//! Sequence Classifier
//!
//! Pretrained encoder plus a small classification head:
//!
//! ```text
//! Encoding → TrainableEncoder → last hidden state [L, H]
//!          → pool (CLS row or masked mean) → dropout
//!          → feat_shrink (optional Linear H → k)
//!          → classifier Linear → logits [C]
//! ```
//!
//! Examples in a batch are independent, so the forward pass runs them in
//! parallel with Rayon. The backward pass walks them one at a time (each
//! encoder backward is itself parallel) and sums into one [`Gradients`] map,
//! which keeps a single full-size gradient set in memory.

use crate::encoder::{EncoderCache, TrainableEncoder};
use crate::gradients::{Gradients, Trainable};
use crate::layers::{DropoutCache, LinearCache, TrainableDropout, TrainableLinear};
use crate::loss::cross_entropy_label_smoothing;
use crate::tensor::Tensor;
use crate::tokenizer::Encoding;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How a sequence is reduced to one vector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// Hidden state of the first (`[CLS]`) token
    #[default]
    Cls,
    /// Attention-mask weighted mean over tokens
    Mean,
}

/// Head hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub num_classes: usize,
    pub dropout: f32,
    pub feat_shrink: Option<usize>,
    pub pooling: Pooling,
    pub label_smoothing: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            num_classes: 7,
            dropout: 0.0,
            feat_shrink: None,
            pooling: Pooling::Cls,
            label_smoothing: 0.3,
        }
    }
}

pub struct BertClassifier {
    pub encoder: TrainableEncoder,
    pub config: ClassifierConfig,
    pub dropout: TrainableDropout,
    pub feat_shrink_layer: Option<TrainableLinear>,
    pub classifier: TrainableLinear,
}

/// Result of a batched forward pass.
#[derive(Clone, Debug)]
pub struct ClassifierOutput {
    /// Mean loss, when labels were given
    pub loss: Option<f32>,
    /// `[batch, num_classes]`
    pub logits: Tensor,
}

struct ExampleCache {
    encoder: EncoderCache,
    seq_len: usize,
    mask: Vec<f32>,
    dropout: DropoutCache,
    feat_shrink: Option<LinearCache>,
    classifier: LinearCache,
}

/// Per-example state kept between `forward_batch` and `backward`.
pub struct BatchCache {
    examples: Vec<ExampleCache>,
}

impl BertClassifier {
    /// Attach a freshly initialized head (PyTorch Linear init, seeded) to `encoder`.
    pub fn new(encoder: TrainableEncoder, config: ClassifierConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let hidden = encoder.hidden_size();
        let feat_shrink_layer = config
            .feat_shrink
            .map(|k| TrainableLinear::new_uniform(hidden, k, &mut rng));
        let head_in = config.feat_shrink.unwrap_or(hidden);
        let classifier = TrainableLinear::new_uniform(head_in, config.num_classes, &mut rng);
        Self {
            encoder,
            dropout: TrainableDropout::new(config.dropout),
            config,
            feat_shrink_layer,
            classifier,
        }
    }

    fn pool(&self, hidden: &Tensor, mask: &[f32]) -> Tensor {
        match self.config.pooling {
            Pooling::Cls => hidden.slice_rows(0, 1),
            Pooling::Mean => {
                let denom = mask.iter().sum::<f32>().max(1e-9);
                let h = hidden.cols();
                let mut pooled = vec![0.0; h];
                for (i, &m) in mask.iter().enumerate() {
                    for (p, v) in pooled.iter_mut().zip(hidden.row(i)) {
                        *p += m * v / denom;
                    }
                }
                Tensor::new(pooled, vec![1, h])
            }
        }
    }

    fn unpool(&self, grad_pooled: &Tensor, seq_len: usize, mask: &[f32]) -> Tensor {
        let h = grad_pooled.cols();
        let mut grad = Tensor::zeros(vec![seq_len, h]);
        match self.config.pooling {
            Pooling::Cls => grad.data[..h].copy_from_slice(&grad_pooled.data),
            Pooling::Mean => {
                let denom = mask.iter().sum::<f32>().max(1e-9);
                for (i, &m) in mask.iter().enumerate() {
                    for (g, p) in grad.data[i * h..(i + 1) * h].iter_mut().zip(&grad_pooled.data) {
                        *g = m * p / denom;
                    }
                }
            }
        }
        grad
    }

    fn forward_example(&self, encoding: &Encoding, rng: Option<&mut StdRng>) -> (Tensor, ExampleCache) {
        let mask = encoding.mask_f32();
        let mut rng = rng;
        let (hidden, encoder) = self.encoder.forward(
            &encoding.input_ids,
            &encoding.token_type_ids,
            &mask,
            rng.as_deref_mut(),
        );
        let pooled = self.pool(&hidden, &mask);
        let (mut features, dropout) = self.dropout.forward(&pooled, rng);
        let feat_shrink = self.feat_shrink_layer.as_ref().map(|layer| {
            let (y, cache) = layer.forward(&features);
            features = y;
            cache
        });
        let (logits, classifier) = self.classifier.forward(&features);
        (
            logits,
            ExampleCache {
                encoder,
                seq_len: encoding.input_ids.len(),
                mask,
                dropout,
                feat_shrink,
                classifier,
            },
        )
    }

    /// Run a batch of (already padded) encodings.
    ///
    /// `dropout_seeds` holds one seed per example in training mode; `None`
    /// evaluates without dropout. When `labels` are given the output carries
    /// the label-smoothed loss.
    pub fn forward_batch(
        &self,
        batch: &[Encoding],
        labels: Option<&[usize]>,
        dropout_seeds: Option<&[u64]>,
    ) -> (ClassifierOutput, BatchCache) {
        let results: Vec<(Tensor, ExampleCache)> = batch
            .par_iter()
            .enumerate()
            .map(|(i, encoding)| {
                let mut rng = dropout_seeds.map(|seeds| StdRng::seed_from_u64(seeds[i]));
                self.forward_example(encoding, rng.as_mut())
            })
            .collect();

        let num_classes = self.config.num_classes;
        let mut logits = Vec::with_capacity(batch.len() * num_classes);
        let mut examples = Vec::with_capacity(batch.len());
        for (row, cache) in results {
            logits.extend_from_slice(&row.data);
            examples.push(cache);
        }
        let logits = Tensor::new(logits, vec![batch.len(), num_classes]);
        let loss = labels.map(|labels| {
            cross_entropy_label_smoothing(&logits, labels, self.config.label_smoothing).0
        });
        (ClassifierOutput { loss, logits }, BatchCache { examples })
    }

    /// Gradients for every parameter given `∂L/∂logits` (`[batch, C]`).
    pub fn backward(&self, grad_logits: &Tensor, cache: &BatchCache) -> Gradients {
        let mut grads = Gradients::new();
        for (i, example) in cache.examples.iter().enumerate() {
            let grad_row = grad_logits.slice_rows(i, i + 1);
            let mut grad = self
                .classifier
                .backward(&grad_row, &example.classifier)
                .accumulate_into("classifier", &mut grads);
            if let (Some(layer), Some(layer_cache)) = (&self.feat_shrink_layer, &example.feat_shrink) {
                grad = layer
                    .backward(&grad, layer_cache)
                    .accumulate_into("feat_shrink_layer", &mut grads);
            }
            let grad_pooled = self.dropout.backward(&grad, &example.dropout);
            let grad_hidden = self.unpool(&grad_pooled, example.seq_len, &example.mask);
            self.encoder
                .backward_into(&grad_hidden, &example.encoder, &mut grads);
        }
        grads
    }

    /// Forward + loss + backward for one minibatch; returns `(loss, grads)`.
    pub fn loss_and_gradients(
        &self,
        batch: &[Encoding],
        labels: &[usize],
        dropout_seeds: Option<&[u64]>,
    ) -> (f32, Gradients) {
        let (output, cache) = self.forward_batch(batch, None, dropout_seeds);
        let (loss, grad_logits) =
            cross_entropy_label_smoothing(&output.logits, labels, self.config.label_smoothing);
        (loss, self.backward(&grad_logits, &cache))
    }
}

impl Trainable for BertClassifier {
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, &Tensor)) {
        self.encoder.visit_parameters(f);
        if let Some(layer) = &self.feat_shrink_layer {
            layer.visit_parameters("feat_shrink_layer", f);
        }
        self.classifier.visit_parameters("classifier", f);
    }

    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.encoder.visit_parameters_mut(f);
        if let Some(layer) = &mut self.feat_shrink_layer {
            layer.visit_parameters_mut("feat_shrink_layer", f);
        }
        self.classifier.visit_parameters_mut("classifier", f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderConfig;
    use approx::assert_abs_diff_eq;

    fn encoding(ids: &[usize], padded_len: usize) -> Encoding {
        let mut enc = Encoding {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            token_type_ids: vec![0; ids.len()],
        };
        enc.pad_to(padded_len, 0);
        enc
    }

    fn classifier(config: EncoderConfig, pooling: Pooling) -> BertClassifier {
        let encoder = TrainableEncoder::new(&config, 4).unwrap();
        let head = ClassifierConfig {
            num_classes: 3,
            pooling,
            feat_shrink: Some(5),
            ..ClassifierConfig::default()
        };
        BertClassifier::new(encoder, head, 9)
    }

    #[test]
    fn test_padding_does_not_change_logits() {
        for config in [EncoderConfig::tiny_bert(20), EncoderConfig::tiny_deberta(20)] {
            for pooling in [Pooling::Cls, Pooling::Mean] {
                let model = classifier(config.clone(), pooling);
                let short = [encoding(&[1, 5, 6, 2], 4)];
                let padded = [encoding(&[1, 5, 6, 2], 7)];
                let (a, _) = model.forward_batch(&short, None, None);
                let (b, _) = model.forward_batch(&padded, None, None);
                for (x, y) in a.logits.data.iter().zip(&b.logits.data) {
                    assert_abs_diff_eq!(x, y, epsilon = 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_dropout_masks_the_pooled_vector() {
        let encoder = TrainableEncoder::new(&EncoderConfig::tiny_bert(20), 4).unwrap();
        let head = ClassifierConfig {
            num_classes: 3,
            dropout: 0.5,
            pooling: Pooling::Mean,
            feat_shrink: Some(5),
            ..ClassifierConfig::default()
        };
        let model = BertClassifier::new(encoder, head, 9);
        let batch = [encoding(&[1, 5, 6, 2], 6)];
        let (_, cache) = model.forward_batch(&batch, None, Some(&[17u64][..]));

        // The tiny encoder has no internal dropout, so its train output equals eval
        let mask = batch[0].mask_f32();
        let (hidden, _) = model.encoder.forward(&batch[0].input_ids, &batch[0].token_type_ids, &mask, None);
        let pooled = model.pool(&hidden, &mask);

        let example = &cache.examples[0];
        let kept = example.dropout.mask.as_ref().unwrap();
        assert_eq!(kept.len(), model.encoder.hidden_size());
        let features = &example.feat_shrink.as_ref().unwrap().x;
        for (k, &keep) in kept.iter().enumerate() {
            let expected = if keep { pooled.data[k] * example.dropout.scale } else { 0.0 };
            assert_abs_diff_eq!(features.data[k], expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_head_gradient_matches_finite_difference() {
        let model = classifier(EncoderConfig::tiny_bert(20), Pooling::Mean);
        let batch = [encoding(&[1, 3, 2], 4), encoding(&[1, 7, 8, 2], 4)];
        let labels = [2, 0];
        let (_, grads) = model.loss_and_gradients(&batch, &labels, None);
        let analytic = grads.get("classifier.weight").unwrap().clone();

        let loss_of = |m: &BertClassifier| {
            m.forward_batch(&batch, Some(&labels), None).0.loss.unwrap()
        };
        let mut model = model;
        let h = 1e-2;
        for k in [0, 4, 11] {
            model.classifier.weight.data[k] += h;
            let plus = loss_of(&model);
            model.classifier.weight.data[k] -= 2.0 * h;
            let minus = loss_of(&model);
            model.classifier.weight.data[k] += h;
            assert_abs_diff_eq!(analytic.data[k], (plus - minus) / (2.0 * h), epsilon = 1e-3);
        }
        assert!(grads.get("feat_shrink_layer.weight").is_some());
        assert!(grads.get("embeddings.word_embeddings.weight").is_some());
    }

    #[test]
    fn test_loss_reported_only_with_labels() {
        let model = classifier(EncoderConfig::tiny_deberta(20), Pooling::Cls);
        let batch = [encoding(&[1, 4, 2], 3)];
        let (unlabeled, _) = model.forward_batch(&batch, None, None);
        assert!(unlabeled.loss.is_none());
        assert_eq!(unlabeled.logits.shape, vec![1, 3]);
        let (labeled, _) = model.forward_batch(&batch, Some(&[1]), None);
        assert!(labeled.loss.unwrap() > 0.0);
    }
}
