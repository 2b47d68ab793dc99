//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b` over the rows of a sequence.
//!
//! ```text
//! Input:  x [seq_len, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]          (optional)
//! Output: y [seq_len, out_features]
//! ```
//!
//! Backward:
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! HuggingFace stores Linear weights as `[out, in]`; they are transposed once
//! when imported (see `weights`), so the forward pass never transposes.

use crate::gradients::Gradients;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Sample `size` values from N(0, std²).
pub fn normal_init(size: usize, std: f32, rng: &mut StdRng) -> Vec<f32> {
    let Ok(dist) = Normal::new(0.0f32, std) else {
        return vec![0.0; size];
    };
    (0..size).map(|_| dist.sample(rng)).collect()
}

/// Sample `size` values uniformly from `[-bound, bound]`.
pub fn uniform_init(size: usize, bound: f32, rng: &mut StdRng) -> Vec<f32> {
    (0..size).map(|_| rng.gen_range(-bound..=bound)).collect()
}

/// Linear layer (fully connected)
#[derive(Clone, Debug)]
pub struct TrainableLinear {
    /// `[in_features, out_features]`
    pub weight: Tensor,
    /// `[out_features]`, absent for projections like DeBERTa's `in_proj`
    pub bias: Option<Tensor>,
}

impl TrainableLinear {
    /// Encoder-style init: weights ~ N(0, std²), zero bias.
    pub fn new(in_features: usize, out_features: usize, std: f32, rng: &mut StdRng) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, std, rng),
                vec![in_features, out_features],
            ),
            bias: Some(Tensor::zeros(vec![out_features])),
        }
    }

    /// Same as [`new`](Self::new) without a bias term.
    pub fn new_no_bias(in_features: usize, out_features: usize, std: f32, rng: &mut StdRng) -> Self {
        Self {
            bias: None,
            ..Self::new(in_features, out_features, std, rng)
        }
    }

    /// `torch.nn.Linear` default init: weight and bias ~ U(±1/√in_features).
    pub fn new_uniform(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        Self {
            weight: Tensor::new(
                uniform_init(in_features * out_features, bound, rng),
                vec![in_features, out_features],
            ),
            bias: Some(Tensor::new(
                uniform_init(out_features, bound, rng),
                vec![out_features],
            )),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Computes `y = x @ W + b` and caches `x` for the backward pass.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let mut y = x.matmul(&self.weight);
        if let Some(bias) = &self.bias {
            y = y.add(bias);
        }
        (y, LinearCache { x: x.clone() })
    }

    /// Computes gradients for weight, bias and input.
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        LinearGradients {
            weight: cache.x.transpose_matmul(grad_out),
            bias: self.bias.as_ref().map(|_| grad_out.sum_rows()),
            x: grad_out.matmul_transposed(&self.weight),
        }
    }

    pub fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(&str, &Tensor)) {
        f(&format!("{prefix}.weight"), &self.weight);
        if let Some(bias) = &self.bias {
            f(&format!("{prefix}.bias"), bias);
        }
    }

    pub fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Tensor)) {
        f(&format!("{prefix}.weight"), &mut self.weight);
        if let Some(bias) = &mut self.bias {
            f(&format!("{prefix}.bias"), bias);
        }
    }
}

/// Cache for linear layer backward pass
#[derive(Clone, Debug)]
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for linear layer
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    /// Gradient to pass to previous layer
    pub x: Tensor,
}

impl LinearGradients {
    /// Record parameter gradients under `prefix` and hand back `grad_x`.
    pub fn accumulate_into(self, prefix: &str, grads: &mut Gradients) -> Tensor {
        grads.accumulate(format!("{prefix}.weight"), self.weight);
        if let Some(bias) = self.bias {
            grads.accumulate(format!("{prefix}.bias"), bias);
        }
        self.x
    }
}
