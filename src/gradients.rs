//! Gradient Utilities
//!
//! Gradients are gathered into a [`Gradients`] map keyed by the same parameter
//! names the models expose through `visit_parameters`. Layers add their
//! contributions with [`Gradients::accumulate`], so a batch processed example
//! by example ends up with summed gradients without keeping per-example copies.
//!
//! ## Clipping
//!
//! ```text
//! norm = √(Σ gradient²)              // over every tensor in the map
//! if norm > max_norm:
//!     gradients *= (max_norm / norm)  // one factor for all tensors
//! ```
//!
//! ## Example
//!
//! ```rust
//! use cora_finetune::{Gradients, Tensor};
//!
//! let mut grads = Gradients::new();
//! grads.accumulate("classifier.weight", Tensor::new(vec![3.0, 4.0], vec![2]));
//! let norm = grads.clip_global_norm(1.0);
//! assert_eq!(norm, 5.0);
//! assert!((grads.global_norm() - 1.0).abs() < 1e-6);
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// A model whose parameters can be walked by name.
///
/// Names are stable across runs; gradients, optimizer state and checkpoints
/// are all keyed by them.
pub trait Trainable {
    fn visit_parameters(&self, f: &mut dyn FnMut(&str, &Tensor));
    fn visit_parameters_mut(&mut self, f: &mut dyn FnMut(&str, &mut Tensor));

    /// Total number of trainable values.
    fn num_parameters(&self) -> usize {
        let mut total = 0;
        self.visit_parameters(&mut |_, t| total += t.numel());
        total
    }
}

/// Named gradient tensors for every trainable parameter touched by a backward pass.
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    tensors: BTreeMap<String, Tensor>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` to the entry for `name`, creating it on first use.
    ///
    /// # Panics
    ///
    /// Panics if an existing entry has a different shape.
    pub fn accumulate(&mut self, name: impl Into<String>, grad: Tensor) {
        let name = name.into();
        match self.tensors.get_mut(&name) {
            Some(existing) => existing.add_assign(&grad),
            None => {
                self.tensors.insert(name, grad);
            }
        }
    }

    /// Scatter-add `rows[k]` into row `indices[k]` of the entry `name`,
    /// creating a zero tensor of `shape` on first use (embedding tables).
    pub fn accumulate_rows(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        indices: &[usize],
        rows: &Tensor,
    ) {
        let entry = self
            .tensors
            .entry(name.into())
            .or_insert_with(|| Tensor::zeros(shape.to_vec()));
        let cols = rows.cols();
        for (k, &idx) in indices.iter().enumerate() {
            let dst = &mut entry.data[idx * cols..(idx + 1) * cols];
            for (d, s) in dst.iter_mut().zip(rows.row(k)) {
                *d += s;
            }
        }
    }

    /// Fold another set of gradients into this one.
    pub fn merge(&mut self, other: Gradients) {
        for (name, grad) in other.tensors {
            self.accumulate(name, grad);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }

    /// Multiply every gradient by `factor` (e.g. `1/grad_accum`).
    pub fn scale(&mut self, factor: f32) {
        for grad in self.tensors.values_mut() {
            grad.data.par_iter_mut().for_each(|v| *v *= factor);
        }
    }

    /// L2 norm over all gradient values: `√(Σ g²)`.
    pub fn global_norm(&self) -> f32 {
        let sum_sq: f32 = self.tensors.values().map(Tensor::sum_squares).sum();
        sum_sq.sqrt()
    }

    /// Scale gradients so their global norm is at most `max_norm`.
    ///
    /// Returns the norm measured before clipping, which is what gets logged.
    /// A non-positive `max_norm` disables clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        if max_norm > 0.0 && norm > max_norm {
            // Same small epsilon torch.nn.utils.clip_grad_norm_ adds
            self.scale(max_norm / (norm + 1e-6));
        }
        norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_accumulate_sums_same_name() {
        let mut grads = Gradients::new();
        grads.accumulate("w", Tensor::new(vec![1.0, 2.0], vec![2]));
        grads.accumulate("w", Tensor::new(vec![0.5, -1.0], vec![2]));
        grads.accumulate("b", Tensor::new(vec![3.0], vec![1]));
        assert_eq!(grads.len(), 2);
        assert_eq!(grads.get("w").unwrap().data, vec![1.5, 1.0]);
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let mut grads = Gradients::new();
        grads.accumulate("w", Tensor::new(vec![0.3, 0.4], vec![2]));
        let norm = grads.clip_global_norm(1.0);
        assert_abs_diff_eq!(norm, 0.5, epsilon = 1e-6);
        assert_eq!(grads.get("w").unwrap().data, vec![0.3, 0.4]);
    }

    #[test]
    fn test_clip_scales_across_all_tensors() {
        let mut grads = Gradients::new();
        grads.accumulate("a", Tensor::new(vec![6.0], vec![1]));
        grads.accumulate("b", Tensor::new(vec![8.0], vec![1]));
        let norm = grads.clip_global_norm(5.0);
        assert_abs_diff_eq!(norm, 10.0, epsilon = 1e-5);
        assert_abs_diff_eq!(grads.global_norm(), 5.0, epsilon = 1e-4);
        assert_abs_diff_eq!(grads.get("a").unwrap().data[0], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn test_merge_and_scale() {
        let mut a = Gradients::new();
        a.accumulate("w", Tensor::new(vec![2.0], vec![1]));
        let mut b = Gradients::new();
        b.accumulate("w", Tensor::new(vec![4.0], vec![1]));
        b.accumulate("v", Tensor::new(vec![1.0], vec![1]));
        a.merge(b);
        a.scale(0.5);
        assert_eq!(a.get("w").unwrap().data, vec![3.0]);
        assert_eq!(a.get("v").unwrap().data, vec![0.5]);
    }
}
