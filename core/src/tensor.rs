/// Minimal tensor utilities shared by the attention layer.
///
/// All operations are free functions on flat f32 slices with explicit
/// dimensions. Row-major layout throughout.

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Linear map: out[R,DOUT] = X[R,DIN] @ W^T + b, with W stored [DOUT,DIN].
/// `bias` may be empty, in which case no bias is added.
pub fn linear_f32(x: &[f32], w: &[f32], bias: &[f32], out: &mut [f32],
                  rows: usize, d_in: usize, d_out: usize) {
    debug_assert_eq!(x.len(), rows * d_in);
    debug_assert_eq!(w.len(), d_out * d_in);
    debug_assert!(bias.is_empty() || bias.len() == d_out);
    debug_assert_eq!(out.len(), rows * d_out);

    for r in 0..rows {
        for o in 0..d_out {
            let mut sum = if bias.is_empty() { 0.0f32 } else { bias[o] };
            for i in 0..d_in {
                sum += x[r * d_in + i] * w[o * d_in + i];
            }
            out[r * d_out + o] = sum;
        }
    }
}

/// VJP of `linear_f32`: given d_out[R,DOUT], accumulate
///   d_x[R,DIN]   += d_out @ W
///   d_w[DOUT,DIN] += d_out^T @ X
///   d_b[DOUT]     += column sums of d_out   (skipped when `d_b` is empty)
pub fn linear_backward_f32(x: &[f32], w: &[f32], d_out: &[f32],
                           d_x: &mut [f32], d_w: &mut [f32], d_b: &mut [f32],
                           rows: usize, d_in: usize, d_out_dim: usize) {
    debug_assert_eq!(x.len(), rows * d_in);
    debug_assert_eq!(w.len(), d_out_dim * d_in);
    debug_assert_eq!(d_out.len(), rows * d_out_dim);
    debug_assert_eq!(d_x.len(), rows * d_in);
    debug_assert_eq!(d_w.len(), d_out_dim * d_in);
    debug_assert!(d_b.is_empty() || d_b.len() == d_out_dim);

    for r in 0..rows {
        for o in 0..d_out_dim {
            let g = d_out[r * d_out_dim + o];
            if !d_b.is_empty() {
                d_b[o] += g;
            }
            for i in 0..d_in {
                d_x[r * d_in + i] += g * w[o * d_in + i];
                d_w[o * d_in + i] += g * x[r * d_in + i];
            }
        }
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f32) -> f32 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u as f32 - 1.0) * scale
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f32], scale: f32) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        let a = [1.0, 0.0, 0.0, 1.0f32];
        let b = [1.0, 2.0, 3.0, 4.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 2, 2);
        assert_eq!(out, b);
    }

    #[test]
    fn test_matmul_2x3_3x2() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0f32];
        let mut out = [0.0f32; 4];
        matmul_f32(&a, &b, &mut out, 2, 3, 2);
        assert_eq!(out, [58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_linear_matches_matmul_transpose() {
        // X[2,3] @ W^T with W[2,3] equals matmul against materialized W^T.
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let w = [0.5, -1.0, 2.0, 1.5, 0.0, -0.5f32];
        let mut w_t = [0.0f32; 6];
        transpose_f32(&w, &mut w_t, 2, 3);
        let mut via_matmul = [0.0f32; 4];
        matmul_f32(&x, &w_t, &mut via_matmul, 2, 3, 2);
        let mut via_linear = [0.0f32; 4];
        linear_f32(&x, &w, &[], &mut via_linear, 2, 3, 2);
        for i in 0..4 {
            assert!((via_linear[i] - via_matmul[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_linear_bias() {
        let x = [1.0, 0.0f32];
        let w = [2.0, 3.0, -1.0, 4.0f32]; // [2,2]
        let b = [10.0, 20.0f32];
        let mut out = [0.0f32; 2];
        linear_f32(&x, &w, &b, &mut out, 1, 2, 2);
        assert_eq!(out, [12.0, 19.0]);
    }

    #[test]
    fn test_linear_backward_fd() {
        // FD check of d_w through a scalar loss = sum(linear(x)).
        let x = [0.3, -0.2, 0.5, 1.0f32];
        let mut w = [0.1, -0.4, 0.7, 0.2, 0.05, -0.3f32]; // [3,2]
        let b = [0.0f32; 3];
        let rows = 2;
        let (d_in, d_out_dim) = (2, 3);

        let loss = |w: &[f32]| -> f32 {
            let mut out = [0.0f32; 6];
            linear_f32(&x, w, &b, &mut out, rows, d_in, d_out_dim);
            out.iter().sum()
        };

        let mut d_x = [0.0f32; 4];
        let mut d_w = [0.0f32; 6];
        let mut d_b = [0.0f32; 3];
        let d_out = [1.0f32; 6]; // gradient of sum
        linear_backward_f32(&x, &w, &d_out, &mut d_x, &mut d_w, &mut d_b, rows, d_in, d_out_dim);

        let eps = 1e-2f32;
        for i in 0..w.len() {
            let orig = w[i];
            w[i] = orig + eps;
            let up = loss(&w);
            w[i] = orig - eps;
            let down = loss(&w);
            w[i] = orig;
            let fd = (up - down) / (2.0 * eps);
            assert!((fd - d_w[i]).abs() < 1e-3, "d_w[{i}]: fd={fd} analytic={}", d_w[i]);
        }
        // Bias gradient of a sum loss is the row count.
        for &g in &d_b {
            assert!((g - rows as f32).abs() < 1e-6);
        }
    }

    #[test]
    fn test_transpose() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let mut out = [0.0f32; 6];
        transpose_f32(&a, &mut out, 2, 3);
        assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_softmax_single_row() {
        let scores = [1.0, 2.0, 3.0f32];
        let mut out = [0.0f32; 3];
        softmax_f32(&scores, &mut out, 1, 3);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(out[0] < out[1]);
        assert!(out[1] < out[2]);
    }

    #[test]
    fn test_softmax_two_rows() {
        let scores = [0.0, 1.0, 1.0, 0.0f32];
        let mut out = [0.0f32; 4];
        softmax_f32(&scores, &mut out, 2, 2);
        assert!((out[0] + out[1] - 1.0).abs() < 1e-6);
        assert!((out[2] + out[3] - 1.0).abs() < 1e-6);
        assert!(out[0] < out[1]);
        assert!(out[2] > out[3]);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid_f32(0.0) - 0.5).abs() < 1e-6);
        assert!((sigmoid_f32(100.0) - 1.0).abs() < 1e-6);
        assert!((sigmoid_f32(-100.0) - 0.0).abs() < 1e-6);
        // sigmoid(3.0) ≈ 0.9526
        assert!((sigmoid_f32(3.0) - 0.9526).abs() < 0.001);
    }

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);
        for _ in 0..100 {
            assert_eq!(rng1.next_u64(), rng2.next_u64());
        }
    }

    #[test]
    fn test_rng_fill_range() {
        let mut rng = SimpleRng::new(123);
        let mut buf = vec![0.0f32; 1000];
        rng.fill_uniform(&mut buf, 0.1);
        for &v in &buf {
            assert!(v >= -0.1 && v <= 0.1, "Value {} out of range", v);
        }
    }
}
