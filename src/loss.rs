//! Classification Loss and Metrics
//!
//! ## Label-smoothed cross-entropy
//!
//! With `C` classes and smoothing ε the target distribution is
//! `q = (1 - ε)·onehot(y) + ε/C`, so for one example
//!
//! ```text
//! loss = -Σ_c q_c · log p_c = -(1 - ε)·log p_y - (ε/C)·Σ_c log p_c
//! ```
//!
//! averaged over the batch (`torch.nn.CrossEntropyLoss(label_smoothing=ε)`).
//! The gradient with respect to the logits is `(p - q) / B`.

use crate::tensor::Tensor;

/// Mean label-smoothed cross-entropy and its gradient w.r.t. `logits`.
///
/// # Arguments
///
/// * `logits` - `[batch, classes]`
/// * `labels` - class index per row
/// * `smoothing` - ε in `[0, 1)`
///
/// # Panics
///
/// Panics if a label is out of range or the batch sizes differ.
pub fn cross_entropy_label_smoothing(
    logits: &Tensor,
    labels: &[usize],
    smoothing: f32,
) -> (f32, Tensor) {
    let batch = logits.rows();
    let classes = logits.cols();
    assert_eq!(batch, labels.len(), "one label per logits row");
    if batch == 0 {
        return (0.0, Tensor::zeros(logits.shape.clone()));
    }

    let probs = logits.softmax_rows();
    let off = smoothing / classes as f32;
    let on = 1.0 - smoothing + off;

    let mut total = 0.0;
    let mut grad = vec![0.0; batch * classes];
    for (i, &label) in labels.iter().enumerate() {
        assert!(label < classes, "label {} out of range for {} classes", label, classes);
        let row = logits.row(i);
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;

        for c in 0..classes {
            let log_p = row[c] - log_sum;
            let q = if c == label { on } else { off };
            total -= q * log_p;
            grad[i * classes + c] = (probs.data[i * classes + c] - q) / batch as f32;
        }
    }

    (total / batch as f32, Tensor::new(grad, logits.shape.clone()))
}

/// Index of the largest value in each row (first wins on ties).
pub fn argmax(logits: &Tensor) -> Vec<usize> {
    (0..logits.rows())
        .map(|i| {
            logits
                .row(i)
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (j, &v)| {
                    if v > bv {
                        (j, v)
                    } else {
                        (bi, bv)
                    }
                })
                .0
        })
        .collect()
}

/// Fraction of predictions equal to the labels; 0.0 for an empty set.
pub fn accuracy(predictions: &[usize], labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count();
    correct as f32 / labels.len() as f32
}

/// Mean and population standard deviation (`numpy.std`, ddof = 0).
pub fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_no_smoothing_is_plain_cross_entropy() {
        let logits = Tensor::new(vec![2.0, 1.0, 0.1, 0.5, 0.5, 3.0], vec![2, 3]);
        let (loss, _) = cross_entropy_label_smoothing(&logits, &[0, 2], 0.0);
        let p0 = (2.0f32).exp() / (2.0f32.exp() + 1.0f32.exp() + 0.1f32.exp());
        let p1 = (3.0f32).exp() / (0.5f32.exp() * 2.0 + 3.0f32.exp());
        let expected = -(p0.ln() + p1.ln()) / 2.0;
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_smoothing_matches_definition() {
        let logits = Tensor::new(vec![1.0, -1.0, 0.5, 0.0], vec![1, 4]);
        let eps = 0.3;
        let (loss, _) = cross_entropy_label_smoothing(&logits, &[2], eps);
        let log_z = logits.data.iter().map(|v| v.exp()).sum::<f32>().ln();
        let log_p: Vec<f32> = logits.data.iter().map(|v| v - log_z).collect();
        let expected = -(1.0 - eps) * log_p[2] - eps / 4.0 * log_p.iter().sum::<f32>();
        assert_abs_diff_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn test_gradient_rows_sum_to_zero_and_match_finite_difference() {
        let logits = Tensor::new(vec![0.3, -0.2, 1.1, 0.0, 2.0, -1.0], vec![2, 3]);
        let labels = [1, 0];
        let (_, grad) = cross_entropy_label_smoothing(&logits, &labels, 0.3);
        for i in 0..2 {
            assert_abs_diff_eq!(grad.row(i).iter().sum::<f32>(), 0.0, epsilon = 1e-6);
        }
        let h = 1e-3;
        for k in 0..logits.data.len() {
            let mut plus = logits.clone();
            plus.data[k] += h;
            let mut minus = logits.clone();
            minus.data[k] -= h;
            let numeric = (cross_entropy_label_smoothing(&plus, &labels, 0.3).0
                - cross_entropy_label_smoothing(&minus, &labels, 0.3).0)
                / (2.0 * h);
            assert_abs_diff_eq!(grad.data[k], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_argmax_and_accuracy() {
        let logits = Tensor::new(vec![0.1, 0.9, 0.0, 5.0, 5.0, 1.0], vec![2, 3]);
        let preds = argmax(&logits);
        assert_eq!(preds, vec![1, 0]);
        assert_abs_diff_eq!(accuracy(&preds, &[1, 2]), 0.5);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_mean_std_is_population_std() {
        let (mean, std) = mean_std(&[0.8, 0.82, 0.84, 0.86, 0.88]);
        assert_abs_diff_eq!(mean, 0.84, epsilon = 1e-6);
        assert_abs_diff_eq!(std, 0.028_284_27, epsilon = 1e-6);
    }
}
