//! Layer Normalization
//!
//! Normalizes each row to zero mean and unit variance, then applies a learned
//! scale and shift.
//!
//! ## Forward Pass
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ * x_norm + β
//! ```
//!
//! ε differs per family: BERT uses 1e-12, DeBERTa 1e-7.
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ      = sum_rows(grad_y * x_norm)
//! grad_β      = sum_rows(grad_y)
//! grad_x_norm = grad_y * γ
//! grad_x      = (grad_x_norm - mean(grad_x_norm) - x_norm * mean(grad_x_norm * x_norm)) / std
//! ```
//!
//! Parameters are named `weight` (γ) and `bias` (β) to line up with
//! HuggingFace checkpoints.

use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Layer normalization over the last dimension.
#[derive(Clone, Debug)]
pub struct TrainableLayerNorm {
    pub gamma: Tensor, // Scale parameter [hidden]
    pub beta: Tensor,  // Shift parameter [hidden]
    pub eps: f32,
}

impl TrainableLayerNorm {
    /// γ = 1, β = 0.
    pub fn new(normalized_shape: usize, eps: f32) -> Self {
        Self {
            gamma: Tensor::new(vec![1.0; normalized_shape], vec![normalized_shape]),
            beta: Tensor::new(vec![0.0; normalized_shape], vec![normalized_shape]),
            eps,
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n = self.gamma.data.len();
        assert_eq!(x.cols(), n, "LayerNorm width mismatch");
        let rows = x.data.len() / n;

        let mut x_norm = vec![0.0; x.data.len()];
        let mut std = vec![0.0; rows];
        x_norm
            .par_chunks_mut(n)
            .zip(std.par_iter_mut())
            .zip(x.data.par_chunks(n))
            .for_each(|((out, s), row)| {
                let mean = row.iter().sum::<f32>() / n as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                *s = (var + self.eps).sqrt();
                for (o, v) in out.iter_mut().zip(row) {
                    *o = (v - mean) / *s;
                }
            });

        let x_norm = Tensor::new(x_norm, x.shape.clone());
        let y = x_norm.mul(&self.gamma).add(&self.beta);
        let cache = LayerNormCache {
            x_norm,
            std: Tensor::new(std, vec![rows]),
        };
        (y, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let n = self.gamma.data.len();

        let grad_gamma = grad_out.mul(&cache.x_norm).sum_rows();
        let grad_beta = grad_out.sum_rows();

        let grad_x_norm = grad_out.mul(&self.gamma);

        let mut grad_x = vec![0.0; grad_out.data.len()];
        grad_x
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, out)| {
                let g = &grad_x_norm.data[i * n..(i + 1) * n];
                let xn = &cache.x_norm.data[i * n..(i + 1) * n];
                let std_val = cache.std.data[i];

                // Mean dependency and variance dependency terms
                let mean_grad = g.iter().sum::<f32>() / n as f32;
                let mean_grad_x = g.iter().zip(xn).map(|(a, b)| a * b).sum::<f32>() / n as f32;

                for j in 0..n {
                    out[j] = (g[j] - mean_grad - xn[j] * mean_grad_x) / std_val;
                }
            });

        LayerNormGradients {
            gamma: grad_gamma,
            beta: grad_beta,
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&format!("{prefix}.weight"), &self.gamma);
        f(&format!("{prefix}.bias"), &self.beta);
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        f(&format!("{prefix}.weight"), &mut self.gamma);
        f(&format!("{prefix}.bias"), &mut self.beta);
    }
}

/// Cache for layer norm backward pass
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row `√(var + ε)`
    pub std: Tensor,
}

/// Gradients for layer norm
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl LayerNormGradients {
    pub fn accumulate_into(self, prefix: &str, grads: &mut Gradients) -> Tensor {
        grads.accumulate(format!("{prefix}.weight"), self.gamma);
        grads.accumulate(format!("{prefix}.bias"), self.beta);
        self.x
    }
}
