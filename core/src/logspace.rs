/// Log-space transition arithmetic for the alignment recurrence.
///
/// Every grid cell carries a binary transition: the "positive" branch keeps
/// the current target column while consuming a source frame, the "negative"
/// branch advances the target column. Both branch log-probabilities and
/// their derivatives are computed here with branch cutoffs so that every
/// function is finite for all finite inputs.

use crate::tensor::sigmoid_f32;

/// Finite stand-in for -inf on unreachable DP cells. Far below any
/// realizable log-probability, and exp(MIN_LOG_PROB) underflows cleanly
/// to 0.0 in f32 (not a subnormal).
pub const MIN_LOG_PROB: f32 = -1e4;

/// log sigmoid(x) = -log(1 + exp(-x)): log-probability of the positive
/// ("stay") branch.
#[inline]
pub fn pos_log_prob_f32(x: f32) -> f32 {
    if x <= -15.0 { return x; }          // -softplus(-x) ≈ x
    if x >= 15.0 { return -(-x).exp(); } // ≈ -exp(-x), tiny but nonzero
    -(1.0 + (-x).exp()).ln()
}

/// log sigmoid(-x) = -log(1 + exp(x)): log-probability of the negative
/// ("advance") branch.
#[inline]
pub fn neg_log_prob_f32(x: f32) -> f32 {
    pos_log_prob_f32(-x)
}

/// d/dx log sigmoid(x) = sigmoid(-x).
#[inline]
pub fn d_pos_log_prob_f32(x: f32) -> f32 {
    sigmoid_f32(-x)
}

/// d/dx log sigmoid(-x) = -sigmoid(x).
#[inline]
pub fn d_neg_log_prob_f32(x: f32) -> f32 {
    -sigmoid_f32(x)
}

/// log(exp(a) + exp(b)) via the max-subtraction trick.
#[inline]
pub fn log_add_exp_f32(a: f32, b: f32) -> f32 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Logit whose sigmoid equals `p`. Requires 0 < p < 1.
#[inline]
pub fn prob_to_logit(p: f32) -> f32 {
    -(1.0 / p - 1.0).ln()
}

/// Inverse of `prob_to_logit`.
#[inline]
pub fn logit_to_prob(x: f32) -> f32 {
    sigmoid_f32(x)
}
