//! AdamW Optimizer and Learning-Rate Schedule
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # decoupled weight decay (if applicable)
//! m = β₁ * m + (1 - β₁) * g        # first moment
//! v = β₂ * v + (1 - β₂) * g²       # second moment
//! m_hat = m / (1 - β₁^t)           # bias correction
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! Defaults match `torch.optim.AdamW` as configured by the HuggingFace
//! `Trainer`: β₁ = 0.9, β₂ = 0.999, ε = 1e-8. Weight decay skips biases and
//! LayerNorm parameters.
//!
//! Moment estimates are keyed by parameter name and created the first time a
//! parameter receives a gradient, so the optimizer works with any
//! [`Trainable`] model.
//!
//! ## Schedule
//!
//! [`LinearSchedule`] warms up linearly from 0 to the peak rate over
//! `warmup_steps`, then decays linearly to 0 at `total_steps`
//! (`get_linear_schedule_with_warmup`).
//!
//! ## References
//!
//! - Loshchilov & Hutter (2019): "Decoupled Weight Decay Regularization"
//! - Kingma & Ba (2014): "Adam: A Method for Stochastic Optimization"

use crate::gradients::{Gradients, Trainable};
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::HashMap;

/// AdamW optimizer state.
pub struct AdamW {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    /// Number of updates applied so far (for bias correction)
    pub step: usize,
    moments: HashMap<String, (Tensor, Tensor)>,
}

impl AdamW {
    pub fn new(weight_decay: f32) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            step: 0,
            moments: HashMap::new(),
        }
    }

    /// Whether decoupled weight decay applies to the parameter `name`.
    pub fn applies_decay(name: &str) -> bool {
        !(name.ends_with("bias") || name.contains("LayerNorm"))
    }

    /// Apply one update with learning rate `lr` to every parameter that has a gradient.
    ///
    /// Parameters without a gradient in `grads` are left untouched and do not
    /// get optimizer state.
    pub fn update<M: Trainable + ?Sized>(&mut self, model: &mut M, grads: &Gradients, lr: f32) {
        self.step += 1;
        let t = self.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);
        let (beta1, beta2, epsilon, weight_decay) =
            (self.beta1, self.beta2, self.epsilon, self.weight_decay);
        let moments = &mut self.moments;

        model.visit_parameters_mut(&mut |name, param| {
            let Some(grad) = grads.get(name) else {
                return;
            };
            let (m, v) = moments.entry(name.to_string()).or_insert_with(|| {
                (
                    Tensor::zeros(param.shape.clone()),
                    Tensor::zeros(param.shape.clone()),
                )
            });
            let decay = if Self::applies_decay(name) {
                1.0 - lr * weight_decay
            } else {
                1.0
            };

            let update = |((p, &g), (m, v)): ((&mut f32, &f32), (&mut f32, &mut f32))| {
                *p *= decay;
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            };

            // Parallelize for large tensors, sequential for small ones
            if param.data.len() > 1000 {
                param
                    .data
                    .par_iter_mut()
                    .zip(grad.data.par_iter())
                    .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                    .for_each(update);
            } else {
                param
                    .data
                    .iter_mut()
                    .zip(grad.data.iter())
                    .zip(m.data.iter_mut().zip(v.data.iter_mut()))
                    .for_each(update);
            }
        });
    }

    /// Number of parameters with optimizer state.
    pub fn num_tracked(&self) -> usize {
        self.moments.len()
    }
}

/// Linear warmup then linear decay to zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearSchedule {
    pub peak_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LinearSchedule {
    /// `warmup_steps = ceil(warmup_ratio · total_steps)`.
    pub fn new(peak_lr: f32, total_steps: usize, warmup_ratio: f32) -> Self {
        let warmup_steps = (warmup_ratio.max(0.0) * total_steps as f32).ceil() as usize;
        Self {
            peak_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for the update that follows `step` completed updates.
    pub fn lr_at(&self, step: usize) -> f32 {
        let factor = if step < self.warmup_steps {
            step as f32 / self.warmup_steps.max(1) as f32
        } else {
            let remaining = self.total_steps.saturating_sub(step) as f32;
            let span = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f32;
            (remaining / span).max(0.0)
        };
        self.peak_lr * factor
    }
}
