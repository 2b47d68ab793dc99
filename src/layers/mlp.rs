//! Feed-Forward Sub-Layer
//!
//! The position-wise network that follows attention in every encoder layer:
//!
//! ```text
//! x → intermediate.dense → GELU → output.dense → dropout → (+ x) → LayerNorm
//! ```
//!
//! BERT-base and DeBERTa-base both expand 768 → 3072 → 768.

use super::activation::Activation;
use super::linear::{LinearCache, TrainableLinear};
use super::output::{OutputCache, TrainableOutput};
use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

#[derive(Clone, Debug)]
pub struct TrainableFeedForward {
    pub intermediate: TrainableLinear,
    pub activation: Activation,
    pub output: TrainableOutput,
}

pub struct FeedForwardCache {
    intermediate: LinearCache,
    pre_activation: Tensor,
    output: OutputCache,
}

impl TrainableFeedForward {
    pub fn new(
        hidden: usize,
        intermediate: usize,
        activation: Activation,
        eps: f32,
        dropout: f32,
        init_std: f32,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            intermediate: TrainableLinear::new(hidden, intermediate, init_std, rng),
            activation,
            output: TrainableOutput::new(intermediate, hidden, eps, dropout, init_std, rng),
        }
    }

    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, FeedForwardCache) {
        let (pre_activation, intermediate) = self.intermediate.forward(x);
        let h = self.activation.forward(&pre_activation);
        let (y, output) = self.output.forward(&h, x, rng);
        (
            y,
            FeedForwardCache {
                intermediate,
                pre_activation,
                output,
            },
        )
    }

    /// `prefix` is the encoder layer (`encoder.layer.{i}`); parameters live
    /// under `{prefix}.intermediate.dense` and `{prefix}.output`.
    pub fn backward(
        &self,
        grad_out: &Tensor,
        cache: &FeedForwardCache,
        prefix: &str,
        grads: &mut Gradients,
    ) -> Tensor {
        let (grad_h, grad_residual) =
            self.output
                .backward(grad_out, &cache.output, &format!("{prefix}.output"), grads);
        let grad_pre = self.activation.backward(&grad_h, &cache.pre_activation);
        let mut grad_x = self
            .intermediate
            .backward(&grad_pre, &cache.intermediate)
            .accumulate_into(&format!("{prefix}.intermediate.dense"), grads);
        grad_x.add_assign(&grad_residual);
        grad_x
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        self.intermediate
            .visit_parameters(&format!("{prefix}.intermediate.dense"), f);
        self.output.visit_parameters(&format!("{prefix}.output"), f);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        self.intermediate
            .visit_parameters_mut(&format!("{prefix}.intermediate.dense"), f);
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

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(21);
        let ffn = TrainableFeedForward::new(4, 8, Activation::Gelu, 1e-12, 0.0, 0.4, &mut rng);
        let x = Tensor::new(normal_init(8, 1.0, &mut rng), vec![2, 4]);
        let probe = Tensor::new(normal_init(8, 1.0, &mut rng), vec![2, 4]);
        let objective = |x: &Tensor| -> f32 {
            let (y, _) = ffn.forward(x, None);
            y.data.iter().zip(&probe.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = ffn.forward(&x, None);
        let mut grads = Gradients::new();
        let grad_x = ffn.backward(&probe, &cache, "layer", &mut grads);
        assert_eq!(grads.len(), 6);
        assert!(grads.get("layer.output.LayerNorm.weight").is_some());

        let h = 1e-2;
        for i in 0..x.data.len() {
            let mut xp = x.clone();
            xp.data[i] += h;
            let mut xm = x.clone();
            xm.data[i] -= h;
            let numeric = (objective(&xp) - objective(&xm)) / (2.0 * h);
            assert_abs_diff_eq!(grad_x.data[i], numeric, epsilon = 1e-2);
        }
    }
}
