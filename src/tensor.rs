//! Tensor Operations for the Encoder
//!
//! A small row-major f32 tensor tuned for what a BERT-style encoder needs when
//! it processes one sequence at a time: activations are `[seq_len, hidden]`
//! matrices, weights are `[in, out]` matrices, biases and norms are vectors.
//!
//! ## Core Concepts
//!
//! - **Data**: flat `Vec<f32>` in row-major order
//! - **Shape**: dimensions, e.g. `[seq_len, hidden]`
//! - **Strides**: step sizes per dimension, derived from the shape
//!
//! ## Example
//!
//! ```rust
//! use cora_finetune::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Performance
//!
//! Matrix products use a cache-blocked kernel parallelised over row blocks
//! with Rayon; element-wise ops and row-wise softmax are parallel as well.
//! Attention heads are handled by slicing columns, so only 2D products are
//! needed.

use rayon::prelude::*;

/// A multi-dimensional array of `f32` values in row-major layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all elements
    pub data: Vec<f32>,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// # Panics
    ///
    /// Panics if the product of the shape doesn't equal the data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`.
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of rows of a 2D tensor (or 1 for a vector).
    pub fn rows(&self) -> usize {
        if self.shape.len() == 2 {
            self.shape[0]
        } else {
            1
        }
    }

    /// Size of the last dimension.
    pub fn cols(&self) -> usize {
        *self.shape.last().unwrap_or(&0)
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Borrow row `i` of a 2D tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    #[inline(always)]
    fn axpy(a_val: f32, b: &[f32], result: &mut [f32]) {
        // Plain zip loop so LLVM can auto-vectorize it
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// 2D matrix multiplication: `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// Small products run sequentially; anything above ~1K multiply-adds goes
    /// through the parallel cache-blocked kernel.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::axpy(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Cache-blocked product parallelised over blocks of output rows.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        // 8x8 blocks of f32 stay resident in L1
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);
                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);
                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::axpy(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// `self @ other^T` for `self: [m, k]`, `other: [n, k]`, without
    /// materialising the transpose. Used for attention scores.
    pub fn matmul_transposed(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul_transposed shapes: {:?} @ {:?}^T",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[1],
            "Inner dimensions must match for matmul_transposed"
        );
        let m = self.shape[0];
        let n = other.shape[0];
        let k = self.shape[1];

        let mut result = vec![0.0; m * n];
        result.par_chunks_mut(n).enumerate().for_each(|(i, out_row)| {
            let a = &self.data[i * k..(i + 1) * k];
            for (j, out) in out_row.iter_mut().enumerate() {
                let b = &other.data[j * k..(j + 1) * k];
                *out = a.iter().zip(b).map(|(x, y)| x * y).sum();
            }
        });
        Tensor::new(result, vec![m, n])
    }

    /// Row-wise softmax of a 2D tensor (numerically stable: subtracts the row max).
    pub fn softmax_rows(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "softmax_rows expects a 2D tensor");
        let cols = self.shape[1];
        let mut result = self.data.clone();
        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        });
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition.
    ///
    /// Supports an exact shape match, and broadcasting a vector over the last
    /// dimension (`[*, n] + [n]`, e.g. bias addition).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.cols();
        if self.shape.len() > other.shape.len() && other.data.len() == last_dim {
            let mut result = self.data.clone();
            result.par_chunks_mut(last_dim).for_each(|row| {
                for (r, b) in row.iter_mut().zip(&other.data) {
                    *r += b;
                }
            });
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// Element-wise multiplication with the same broadcasting rules as [`add`](Self::add).
    pub fn mul(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a * b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = self.cols();
        if self.shape.len() > other.shape.len() && other.data.len() == last_dim {
            let mut result = self.data.clone();
            result.par_chunks_mut(last_dim).for_each(|row| {
                for (r, b) in row.iter_mut().zip(&other.data) {
                    *r *= b;
                }
            });
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for mul: {:?} * {:?}",
            self.shape, other.shape
        );
    }

    /// In-place `self += other` (shapes must match).
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for in-place addition"
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Multiply all elements by scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Transpose a 2D tensor.
    pub fn transpose(&self) -> Tensor {
        assert_eq!(self.shape.len(), 2, "transpose expects a 2D tensor");
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        result.par_chunks_mut(rows).enumerate().for_each(|(j, out)| {
            for (i, o) in out.iter_mut().enumerate() {
                *o = self.data[i * cols + j];
            }
        });
        Tensor::new(result, vec![cols, rows])
    }

    /// `self^T @ other` for `self: [k, m]`, `other: [k, n]` (weight gradients).
    pub fn transpose_matmul(&self, other: &Tensor) -> Tensor {
        self.transpose().matmul(other)
    }

    /// Replace values where `mask` is non-zero with `value`.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        assert_eq!(
            self.shape, mask.shape,
            "Mask shape must match tensor shape"
        );
        let result = self
            .data
            .par_iter()
            .zip(&mask.data)
            .map(|(&x, &m)| if m != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Sum over rows of a 2D tensor: `[rows, cols] -> [cols]` (bias gradients).
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (r, v) in result.iter_mut().zip(row) {
                *r += v;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Gather rows of a 2D table: embedding lookup.
    ///
    /// # Panics
    ///
    /// Panics if an index is out of range.
    pub fn gather_rows(&self, indices: &[usize]) -> Tensor {
        let cols = self.cols();
        let rows = self.rows();
        let mut data = Vec::with_capacity(indices.len() * cols);
        for &idx in indices {
            assert!(idx < rows, "Row index {} out of range for {} rows", idx, rows);
            data.extend_from_slice(&self.data[idx * cols..(idx + 1) * cols]);
        }
        Tensor::new(data, vec![indices.len(), cols])
    }

    /// Columns `[start, end)` of a 2D tensor (one attention head).
    pub fn slice_cols(&self, start: usize, end: usize) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        assert!(start <= end && end <= cols, "Column slice out of range");
        let width = end - start;
        let mut data = Vec::with_capacity(rows * width);
        for i in 0..rows {
            data.extend_from_slice(&self.data[i * cols + start..i * cols + end]);
        }
        Tensor::new(data, vec![rows, width])
    }

    /// Rows `[start, end)` of a 2D tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let cols = self.cols();
        assert!(start <= end && end <= self.rows(), "Row slice out of range");
        Tensor::new(
            self.data[start * cols..end * cols].to_vec(),
            vec![end - start, cols],
        )
    }

    /// Concatenate 2D tensors with the same row count along columns.
    pub fn concat_cols(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_cols needs at least one tensor");
        let rows = parts[0].rows();
        let total: usize = parts.iter().map(|p| p.cols()).sum();
        let mut data = Vec::with_capacity(rows * total);
        for i in 0..rows {
            for part in parts {
                assert_eq!(part.rows(), rows, "Row counts must match for concat_cols");
                data.extend_from_slice(part.row(i));
            }
        }
        Tensor::new(data, vec![rows, total])
    }

    /// Sum of squares of all elements.
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&v| v * v).sum()
    }
}
