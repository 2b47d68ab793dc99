//! Post-norm residual output: `LayerNorm(dropout(x @ W + b) + residual)`.
//!
//! BERT and DeBERTa close both sub-layers of an encoder layer this way
//! (`attention.output` and `output` in HuggingFace naming).

use crate::gradients::Gradients;
use crate::layers::dropout::{DropoutCache, TrainableDropout};
use crate::layers::layer_norm::{LayerNormCache, TrainableLayerNorm};
use crate::layers::linear::{LinearCache, TrainableLinear};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

#[derive(Clone, Debug)]
pub struct TrainableOutput {
    pub dense: TrainableLinear,
    pub layer_norm: TrainableLayerNorm,
    pub dropout: TrainableDropout,
}

pub struct OutputCache {
    dense: LinearCache,
    dropout: DropoutCache,
    layer_norm: LayerNormCache,
}

impl TrainableOutput {
    pub fn new(
        in_features: usize,
        hidden: usize,
        eps: f32,
        dropout: f32,
        init_std: f32,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            dense: TrainableLinear::new(in_features, hidden, init_std, rng),
            layer_norm: TrainableLayerNorm::new(hidden, eps),
            dropout: TrainableDropout::new(dropout),
        }
    }

    pub fn forward(
        &self,
        x: &Tensor,
        residual: &Tensor,
        rng: Option<&mut StdRng>,
    ) -> (Tensor, OutputCache) {
        let (h, dense) = self.dense.forward(x);
        let (h, dropout) = self.dropout.forward(&h, rng);
        let (y, layer_norm) = self.layer_norm.forward(&h.add(residual));
        (
            y,
            OutputCache {
                dense,
                dropout,
                layer_norm,
            },
        )
    }

    /// Returns `(grad_x, grad_residual)`.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &OutputCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> (Tensor, Tensor) {
        let grad_sum = self
            .layer_norm
            .backward(grad_out, &cache.layer_norm)
            .accumulate_into(&format!("{prefix}.LayerNorm"), grads);
        let grad_h = self.dropout.backward(&grad_sum, &cache.dropout);
        let grad_x = self
            .dense
            .backward(&grad_h, &cache.dense)
            .accumulate_into(&format!("{prefix}.dense"), grads);
        (grad_x, grad_sum)
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.dense.visit_parameters(&format!("{prefix}.dense"), f);
        self.layer_norm
            .visit_parameters(&format!("{prefix}.LayerNorm"), f);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.dense.visit_parameters_mut(&format!("{prefix}.dense"), f);
        self.layer_norm
            .visit_parameters_mut(&format!("{prefix}.LayerNorm"), f);
    }
}
