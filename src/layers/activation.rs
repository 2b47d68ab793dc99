//! Activation Functions
//!
//! GELU in the two flavours HuggingFace configs ask for:
//!
//! ```text
//! "gelu"      exact:  GELU(x) = x × Φ(x) = 0.5 × x × (1 + erf(x / √2))
//! "gelu_new"  tanh:   GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! BERT and DeBERTa checkpoints both ship with `hidden_act = "gelu"`, so the
//! exact form is what pretrained weights expect. `erf` is not in `std`; it is
//! evaluated with the Abramowitz & Stegun 7.1.26 rational approximation
//! (absolute error below 1.5e-7).

use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const FRAC_1_SQRT_2PI: f32 = 0.398_942_3;

/// Which GELU variant a layer applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Exact GELU (`"gelu"` in HF configs)
    #[default]
    Gelu,
    /// tanh approximation (`"gelu_new"`, `"gelu_pytorch_tanh"`)
    GeluTanh,
}

impl Activation {
    /// Map an HF `hidden_act` string; unknown names yield `None`.
    pub fn from_hf_name(name: &str) -> Option<Self> {
        match name {
            "gelu" => Some(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Some(Activation::GeluTanh),
            _ => None,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Gelu => gelu_forward(x),
            Activation::GeluTanh => gelu_tanh_forward(x),
        }
    }

    pub fn backward(&self, grad_out: &Tensor, x: &Tensor) -> Tensor {
        match self {
            Activation::Gelu => gelu_backward(grad_out, x),
            Activation::GeluTanh => gelu_tanh_backward(grad_out, x),
        }
    }
}

/// Error function, Abramowitz & Stegun 7.1.26.
pub fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() as f64;
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp()) as f32
}

/// Exact GELU (forward pass).
pub fn gelu_forward(x: &Tensor) -> Tensor {
    let result = x
        .data
        .par_iter()
        .map(|&val| 0.5 * val * (1.0 + erf(val * std::f32::consts::FRAC_1_SQRT_2)))
        .collect();
    Tensor::new(result, x.shape.clone())
}

/// Exact GELU derivative: `Φ(x) + x·φ(x)`.
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let grad_data: Vec<f32> = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad_val)| {
            let cdf = 0.5 * (1.0 + erf(x_val * std::f32::consts::FRAC_1_SQRT_2));
            let pdf = FRAC_1_SQRT_2PI * (-0.5 * x_val * x_val).exp();
            grad_val * (cdf + x_val * pdf)
        })
        .collect();
    Tensor::new(grad_data, x.shape.clone())
}

/// tanh-approximated GELU (forward pass).
pub fn gelu_tanh_forward(x: &Tensor) -> Tensor {
    let result = x
        .data
        .par_iter()
        .map(|&val| 0.5 * val * (1.0 + (SQRT_2_OVER_PI * (val + 0.044715 * val.powi(3))).tanh()))
        .collect();
    Tensor::new(result, x.shape.clone())
}

/// tanh-approximated GELU derivative.
///
/// Product rule over `0.5·x·(1 + tanh(u))` with `u = √(2/π)(x + 0.044715x³)`.
pub fn gelu_tanh_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let grad_data: Vec<f32> = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad_val)| {
            let inner = SQRT_2_OVER_PI * (x_val + 0.044715 * x_val.powi(3));
            let tanh_inner = inner.tanh();
            let sech_sq = 1.0 - tanh_inner * tanh_inner;

            let grad_gelu = 0.5 * (1.0 + tanh_inner)
                + 0.5 * x_val * sech_sq * SQRT_2_OVER_PI * (1.0 + 3.0 * 0.044715 * x_val.powi(2));

            grad_val * grad_gelu
        })
        .collect();

    Tensor::new(grad_data, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_erf_reference_values() {
        assert_abs_diff_eq!(erf(0.0), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(0.5), 0.520_499_9, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(1.0), 0.842_700_8, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(-2.0), -0.995_322_3, epsilon = 1e-6);
    }

    #[test]
    fn test_gelu_variants_agree_closely() {
        let x = Tensor::new(vec![-3.0, -1.0, -0.1, 0.0, 0.5, 2.0], vec![6]);
        let exact = gelu_forward(&x);
        let approx = gelu_tanh_forward(&x);
        for (a, b) in exact.data.iter().zip(&approx.data) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-3);
        }
        assert_abs_diff_eq!(exact.data[4], 0.345_731, epsilon = 1e-5);
    }

    #[test]
    fn test_gelu_backward_matches_finite_difference() {
        let h = 1e-3;
        for act in [Activation::Gelu, Activation::GeluTanh] {
            for &v in &[-2.0f32, -0.7, 0.0, 0.3, 1.5] {
                let x = Tensor::new(vec![v], vec![1]);
                let g = act.backward(&Tensor::new(vec![1.0], vec![1]), &x).data[0];
                let plus = act.forward(&Tensor::new(vec![v + h], vec![1])).data[0];
                let minus = act.forward(&Tensor::new(vec![v - h], vec![1])).data[0];
                assert_abs_diff_eq!(g, (plus - minus) / (2.0 * h), epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn test_from_hf_name() {
        assert_eq!(Activation::from_hf_name("gelu"), Some(Activation::Gelu));
        assert_eq!(Activation::from_hf_name("gelu_new"), Some(Activation::GeluTanh));
        assert_eq!(Activation::from_hf_name("relu"), None);
    }
}
