/// Monotonic-alignment marginals — log-space DP kernel pair.
///
/// For a logits tensor of shape [batch, src_len, tgt_len] (row-major flat),
/// the forward pass fills `phi`, the cumulative log-probability of reaching
/// each grid cell along a monotonic path, and `prob`, the marginal
/// log-probability that the path visits the cell and commits to advancing
/// the target index there:
///
///   phi[i, j] = logaddexp(phi[i-1, j]   + pos_log_prob(L[i-1, j]),
///               phi[i-1, j-1] + neg_log_prob(L[i-1, j-1]))     (padded j)
///   prob[i, j] = phi[i, j] + neg_log_prob(L[i, j])
///
/// The target axis carries one implicit zero-valued pad column so the
/// recurrence has a well-defined left neighbor; outputs are unpadded.
/// Unreachable boundary cells hold MIN_LOG_PROB, never -inf, so no NaN can
/// leak through downstream exponentials.
///
/// The backward pass is the exact adjoint, run in reverse source order with
/// a telescoping grad_phi accumulator. Branch posteriors are recovered by
/// exponentiating differences of forward log-quantities, which are bounded
/// above by zero, so every exp argument is safe.
///
/// Both passes are sequential along src_len and independent across batch
/// and target columns. Scratch buffers are owned per call.

use std::sync::Arc;

use crate::logspace::{
    MIN_LOG_PROB, d_neg_log_prob_f32, d_pos_log_prob_f32, log_add_exp_f32, neg_log_prob_f32,
    pos_log_prob_f32,
};

/// Forward DP: fill `phi` and `prob` (both [batch, src_len, tgt_len]).
pub fn alignment_forward(
    logits: &[f32],
    phi: &mut [f32],
    prob: &mut [f32],
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) {
    assert!(src_len >= 1, "alignment requires src_len >= 1, got {src_len}");
    assert!(tgt_len >= 1, "alignment requires tgt_len >= 1, got {tgt_len}");
    let grid = src_len * tgt_len;
    debug_assert_eq!(logits.len(), batch * grid);
    debug_assert_eq!(phi.len(), batch * grid);
    debug_assert_eq!(prob.len(), batch * grid);

    // Padded row width: target column 0 is the pad, real columns are 1..=tgt_len.
    let w = tgt_len + 1;

    for b in 0..batch {
        let l = &logits[b * grid..(b + 1) * grid];
        let ph = &mut phi[b * grid..(b + 1) * grid];
        let pr = &mut prob[b * grid..(b + 1) * grid];

        // Source row 0: the unique valid start is the first real column.
        let mut prev = vec![MIN_LOG_PROB; w];
        prev[1] = 0.0;
        ph[..tgt_len].copy_from_slice(&prev[1..]);

        let mut cur = vec![MIN_LOG_PROB; w];
        for i in 1..src_len {
            let lrow = &l[(i - 1) * tgt_len..i * tgt_len];
            cur[0] = MIN_LOG_PROB;
            for j in 1..=tgt_len {
                // Padded logit column j maps to lrow[j-1]; column 0 is the
                // zero-valued pad.
                let stay = prev[j] + pos_log_prob_f32(lrow[j - 1]);
                let adv_logit = if j == 1 { 0.0 } else { lrow[j - 2] };
                let adv = prev[j - 1] + neg_log_prob_f32(adv_logit);
                cur[j] = log_add_exp_f32(stay, adv);
            }
            ph[i * tgt_len..(i + 1) * tgt_len].copy_from_slice(&cur[1..]);
            std::mem::swap(&mut prev, &mut cur);
        }

        for idx in 0..grid {
            pr[idx] = ph[idx] + neg_log_prob_f32(l[idx]);
        }
    }
}

/// Reverse DP: reconstruct `grad_logits` from the upstream gradient
/// `grad_prob`, the original `logits`, and the forward `phi` table.
///
/// `phi` MUST be the table produced by `alignment_forward` for the same
/// `logits`; any mismatch yields a silently wrong gradient. The per-call
/// grad_phi accumulator is cloned from `grad_prob` and mutated in place as
/// the reverse recurrence telescopes.
pub fn alignment_backward(
    logits: &[f32],
    phi: &[f32],
    grad_prob: &[f32],
    grad_logits: &mut [f32],
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) {
    assert!(src_len >= 1, "alignment requires src_len >= 1, got {src_len}");
    assert!(tgt_len >= 1, "alignment requires tgt_len >= 1, got {tgt_len}");
    let grid = src_len * tgt_len;
    debug_assert_eq!(logits.len(), batch * grid);
    debug_assert_eq!(phi.len(), batch * grid);
    debug_assert_eq!(grad_prob.len(), batch * grid);
    debug_assert_eq!(grad_logits.len(), batch * grid);

    for b in 0..batch {
        let l = &logits[b * grid..(b + 1) * grid];
        let ph = &phi[b * grid..(b + 1) * grid];
        let gp_in = &grad_prob[b * grid..(b + 1) * grid];
        let gl = &mut grad_logits[b * grid..(b + 1) * grid];

        let mut grad_phi = gp_in.to_vec();

        // The last source row receives no successor contribution; only the
        // direct commit term (added at the end) touches it.
        for v in gl[(src_len - 1) * tgt_len..].iter_mut() {
            *v = 0.0;
        }

        for i in (0..src_len - 1).rev() {
            let row = i * tgt_len;
            let next = (i + 1) * tgt_len;

            // Stay branch: posterior that arrival at (i+1, j) came from (i, j).
            for j in 0..tgt_len {
                let a = (ph[row + j] + pos_log_prob_f32(l[row + j]) - ph[next + j]).exp();
                let c = grad_phi[next + j] * a;
                gl[row + j] = c * d_pos_log_prob_f32(l[row + j]);
                grad_phi[row + j] += c;
            }

            // Advance branch: posterior that arrival at (i+1, j+1) came from
            // (i, j), shifted one target column.
            for j in 0..tgt_len - 1 {
                let bb = (ph[row + j] + neg_log_prob_f32(l[row + j]) - ph[next + j + 1]).exp();
                let d = grad_phi[next + j + 1] * bb;
                gl[row + j] += d * d_neg_log_prob_f32(l[row + j]);
                grad_phi[row + j] += d;
            }
        }

        // Direct derivative of the commit term prob = phi + neg_log_prob(L),
        // taken against the unmutated upstream gradient.
        for idx in 0..grid {
            gl[idx] += d_neg_log_prob_f32(l[idx]) * gp_in[idx];
        }
    }
}

/// Forward/backward kernel pair contract. An accelerated implementation
/// must agree with the CPU reference within floating-point tolerance for
/// the same inputs.
pub trait AlignmentKernel: Send + Sync {
    fn forward(
        &self,
        logits: &[f32],
        phi: &mut [f32],
        prob: &mut [f32],
        batch: usize,
        src_len: usize,
        tgt_len: usize,
    );

    fn backward(
        &self,
        logits: &[f32],
        phi: &[f32],
        grad_prob: &[f32],
        grad_logits: &mut [f32],
        batch: usize,
        src_len: usize,
        tgt_len: usize,
    );
}

/// The sequential CPU reference. Always correct; the fallback for every
/// device kind without a registered accelerated kernel.
pub struct CpuKernel;

impl AlignmentKernel for CpuKernel {
    fn forward(
        &self,
        logits: &[f32],
        phi: &mut [f32],
        prob: &mut [f32],
        batch: usize,
        src_len: usize,
        tgt_len: usize,
    ) {
        alignment_forward(logits, phi, prob, batch, src_len, tgt_len);
    }

    fn backward(
        &self,
        logits: &[f32],
        phi: &[f32],
        grad_prob: &[f32],
        grad_logits: &mut [f32],
        batch: usize,
        src_len: usize,
        tgt_len: usize,
    ) {
        alignment_backward(logits, phi, grad_prob, grad_logits, batch, src_len, tgt_len);
    }
}

/// Operator record for one differentiable invocation: owns the input
/// logits and the forward `phi` table, and pairs them with the kernel that
/// produced them so the adjoint runs through the same implementation.
///
/// `backward` consumes the record. A second backward call, or a gradient
/// of the gradient, is therefore a compile error rather than a silently
/// wrong result.
pub struct AlignmentOp {
    kernel: Arc<dyn AlignmentKernel>,
    logits: Vec<f32>,
    phi: Vec<f32>,
    batch: usize,
    src_len: usize,
    tgt_len: usize,
}

impl AlignmentOp {
    /// Run the forward pass, returning the marginal log-probabilities and
    /// the record needed for the backward pass.
    ///
    /// Warns when tgt_len exceeds src_len: a one-to-many alignment cannot
    /// cover every target column, so some marginals saturate near the
    /// sentinel.
    pub fn forward(
        kernel: Arc<dyn AlignmentKernel>,
        logits: Vec<f32>,
        batch: usize,
        src_len: usize,
        tgt_len: usize,
    ) -> (Vec<f32>, AlignmentOp) {
        if tgt_len > src_len {
            eprintln!(
                "monoalign: target length {tgt_len} exceeds source length {src_len}; \
                 monotonic paths cannot cover every target column"
            );
        }
        let mut phi = vec![0.0f32; logits.len()];
        let mut prob = vec![0.0f32; logits.len()];
        kernel.forward(&logits, &mut phi, &mut prob, batch, src_len, tgt_len);
        let op = AlignmentOp { kernel, logits, phi, batch, src_len, tgt_len };
        (prob, op)
    }

    /// Run the adjoint against the cached (logits, phi) pair. Consumes the
    /// record: the pair is valid for exactly one backward invocation.
    pub fn backward(self, grad_prob: &[f32]) -> Vec<f32> {
        debug_assert_eq!(grad_prob.len(), self.logits.len());
        let mut grad_logits = vec![0.0f32; self.logits.len()];
        self.kernel.backward(
            &self.logits,
            &self.phi,
            grad_prob,
            &mut grad_logits,
            self.batch,
            self.src_len,
            self.tgt_len,
        );
        grad_logits
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn src_len(&self) -> usize {
        self.src_len
    }

    pub fn tgt_len(&self) -> usize {
        self.tgt_len
    }
}
