//! Dropout Layer
//!
//! Inverted dropout: during training each activation is zeroed with
//! probability `rate` and survivors are scaled by `1/(1-rate)`. The RNG is
//! passed in by the caller so a run is reproducible from its seed; passing
//! `None` means evaluation mode and the input goes through unchanged.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct TrainableDropout {
    pub rate: f32,
}

impl TrainableDropout {
    /// # Panics
    ///
    /// Panics unless `0.0 <= rate <= 1.0`.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..=1.0).contains(&rate),
            "Dropout rate must be between 0.0 and 1.0"
        );
        Self { rate }
    }

    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, DropoutCache) {
        let rng = match rng {
            Some(rng) if self.rate > 0.0 => rng,
            _ => {
                let cache = DropoutCache {
                    mask: None,
                    scale: 1.0,
                };
                return (x.clone(), cache);
            }
        };

        if self.rate >= 1.0 {
            let cache = DropoutCache {
                mask: Some(vec![false; x.data.len()]),
                scale: 1.0,
            };
            return (Tensor::zeros(x.shape.clone()), cache);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.data.len())
            .map(|_| rng.gen::<f32>() >= self.rate)
            .collect();
        let output = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        let cache = DropoutCache {
            mask: Some(mask),
            scale,
        };
        (Tensor::new(output, x.shape.clone()), cache)
    }

    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
#[derive(Clone, Debug)]
pub struct DropoutCache {
    /// true = kept; `None` if dropout was inactive
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_eval_mode_is_identity() {
        let d = TrainableDropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        let (y, cache) = d.forward(&x, None);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_same_seed_same_mask_and_scaled_gradient() {
        let d = TrainableDropout::new(0.5);
        let x = Tensor::full(vec![64], 1.0);
        let (y1, cache) = d.forward(&x, Some(&mut StdRng::seed_from_u64(9)));
        let (y2, _) = d.forward(&x, Some(&mut StdRng::seed_from_u64(9)));
        assert_eq!(y1, y2);
        assert!(y1.data.iter().all(|&v| v == 0.0 || v == 2.0));

        let g = d.backward(&Tensor::full(vec![64], 1.0), &cache);
        assert_eq!(g, y1);
    }
}
