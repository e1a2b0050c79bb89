/// Gradient verification.
///
/// Provides:
/// - `alignment_value` / `alignment_grad`: scalar functional of the
///   marginal output and its analytic gradient
/// - `check_alignment_gradient`: sampled FD check for the operator
/// - `check_attention_weight_gradient`: sampled FD check for layer weights
///
/// All checks use central differences and the relative-error convention
/// with denominator = max(|analytical|, |numerical|); entries where both
/// sides fall below an absolute threshold are auto-passed (below FD
/// resolution at f32 precision).

use crate::alignment::{alignment_backward, alignment_forward};
use crate::attention::{attention_forward, MonotonicAttentionConfig, MonotonicAttentionParams};
use crate::dispatch::KernelRegistry;

/// Absolute threshold below which FD cannot resolve a layer-weight
/// gradient in f32.
const ABS_THRESHOLD: f32 = 5e-4;

/// Coarser threshold for the operator check: marginals near the sentinel
/// sit at -1e4 plus an O(1) term, so the f32 quantization step there is
/// three orders of magnitude larger than for O(1) losses.
const ALIGN_ABS_THRESHOLD: f32 = 5e-3;

/// Scalar functional of the forward marginals: sum(prob * weights),
/// accumulated in f64 so the FD difference is not dominated by summation
/// order. `weights` doubles as the upstream gradient in the analytic path.
pub fn alignment_value(
    logits: &[f32],
    weights: &[f32],
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) -> f64 {
    let mut phi = vec![0.0f32; logits.len()];
    let mut prob = vec![0.0f32; logits.len()];
    alignment_forward(logits, &mut phi, &mut prob, batch, src_len, tgt_len);
    prob.iter()
        .zip(weights.iter())
        .map(|(&p, &w)| p as f64 * w as f64)
        .sum()
}

/// Zero the functional weights on cells pinned near the sentinel. Their
/// marginals are -1e4 plus an O(1) term, where the f32 quantization step
/// (~1e-3) swamps a central-difference probe; their true gradients through
/// any reachable path are indistinguishable from zero.
pub fn zero_unreachable_weights(
    logits: &[f32],
    weights: &mut [f32],
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) {
    let mut phi = vec![0.0f32; logits.len()];
    let mut prob = vec![0.0f32; logits.len()];
    alignment_forward(logits, &mut phi, &mut prob, batch, src_len, tgt_len);
    for (w, &p) in weights.iter_mut().zip(prob.iter()) {
        if p < crate::logspace::MIN_LOG_PROB / 2.0 {
            *w = 0.0;
        }
    }
}

/// Analytic gradient of `alignment_value` w.r.t. the logits.
pub fn alignment_grad(
    logits: &[f32],
    weights: &[f32],
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) -> Vec<f32> {
    let mut phi = vec![0.0f32; logits.len()];
    let mut prob = vec![0.0f32; logits.len()];
    alignment_forward(logits, &mut phi, &mut prob, batch, src_len, tgt_len);
    let mut grad = vec![0.0f32; logits.len()];
    alignment_backward(logits, &phi, weights, &mut grad, batch, src_len, tgt_len);
    grad
}

/// Check the operator gradient against central differences on sampled
/// entries. Returns (num_checked, num_passed, max_relative_error).
pub fn check_alignment_gradient(
    logits: &[f32],
    weights: &[f32],
    batch: usize,
    src_len: usize,
    tgt_len: usize,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> (usize, usize, f32) {
    let analytic = alignment_grad(logits, weights, batch, src_len, tgt_len);

    let n = logits.len();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f32;

    let mut perturbed = logits.to_vec();
    for idx in (0..n).step_by(step).take(num_samples) {
        let orig = logits[idx];
        perturbed[idx] = orig + eps;
        let up = alignment_value(&perturbed, weights, batch, src_len, tgt_len);
        perturbed[idx] = orig - eps;
        let down = alignment_value(&perturbed, weights, batch, src_len, tgt_len);
        perturbed[idx] = orig;
        let numerical = ((up - down) / (2.0 * eps as f64)) as f32;

        let analytical = analytic[idx];
        let abs_diff = (analytical - numerical).abs();
        let denom = analytical.abs().max(numerical.abs());

        checked += 1;

        if denom < ALIGN_ABS_THRESHOLD {
            passed += 1;
            continue;
        }

        let rel_err = abs_diff / denom;
        if rel_err > max_rel_err {
            max_rel_err = rel_err;
        }

        if rel_err < tol {
            passed += 1;
        } else {
            eprintln!(
                "  FAIL logits[{idx}]: analytical={analytical:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }

    (checked, passed, max_rel_err)
}

/// Scalar functional of the layer output: sum(out * seed).
#[allow(clippy::too_many_arguments)]
pub fn attention_value(
    registry: &KernelRegistry,
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    query: &[f32],
    key: &[f32],
    value: &[f32],
    seed: &[f32],
    bsz: usize,
    tq: usize,
    tk: usize,
) -> f32 {
    let (out, _cache) = attention_forward(registry, params, cfg, query, key, value, None, bsz, tq, tk);
    out.iter().zip(seed.iter()).map(|(o, s)| o * s).sum()
}

/// Compute finite-difference gradient for a single weight element.
/// Uses central differences: (f(x+eps) - f(x-eps)) / (2*eps).
#[allow(clippy::too_many_arguments)]
fn fd_weight_single(
    registry: &KernelRegistry,
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    query: &[f32],
    key: &[f32],
    value: &[f32],
    seed: &[f32],
    get_weight: impl Fn(&MonotonicAttentionParams) -> &Vec<f32>,
    set_weight: impl Fn(&mut MonotonicAttentionParams, usize, f32),
    idx: usize,
    eps: f32,
    bsz: usize,
    tq: usize,
    tk: usize,
) -> f32 {
    let orig = get_weight(params)[idx];

    let mut p_plus = params.clone();
    set_weight(&mut p_plus, idx, orig + eps);
    let loss_plus = attention_value(registry, &p_plus, cfg, query, key, value, seed, bsz, tq, tk);

    let mut p_minus = params.clone();
    set_weight(&mut p_minus, idx, orig - eps);
    let loss_minus = attention_value(registry, &p_minus, cfg, query, key, value, seed, bsz, tq, tk);

    (loss_plus - loss_minus) / (2.0 * eps)
}

/// Check gradient for a specific weight matrix of the attention layer.
/// Returns (num_checked, num_passed, max_relative_error).
#[allow(clippy::too_many_arguments)]
pub fn check_attention_weight_gradient(
    registry: &KernelRegistry,
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    query: &[f32],
    key: &[f32],
    value: &[f32],
    seed: &[f32],
    grads: &MonotonicAttentionParams,
    name: &str,
    get_weight: impl Fn(&MonotonicAttentionParams) -> &Vec<f32>,
    set_weight: impl Fn(&mut MonotonicAttentionParams, usize, f32),
    get_grad: impl Fn(&MonotonicAttentionParams) -> &Vec<f32>,
    bsz: usize,
    tq: usize,
    tk: usize,
    num_samples: usize,
    eps: f32,
    tol: f32,
) -> (usize, usize, f32) {
    let grad_vec = get_grad(grads);
    let n = get_weight(params).len();

    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f32;

    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grad_vec[idx];
        let numerical = fd_weight_single(
            registry, params, cfg, query, key, value, seed,
            &get_weight, &set_weight, idx, eps, bsz, tq, tk,
        );

        let abs_diff = (analytical - numerical).abs();
        let denom = analytical.abs().max(numerical.abs());

        checked += 1;

        if denom < ABS_THRESHOLD {
            passed += 1;
            continue;
        }

        let rel_err = abs_diff / denom;
        if rel_err > max_rel_err {
            max_rel_err = rel_err;
        }

        if rel_err < tol {
            passed += 1;
        } else {
            eprintln!(
                "  FAIL {name}[{idx}]: analytical={analytical:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }

    (checked, passed, max_rel_err)
}
