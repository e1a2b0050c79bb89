//! Monotonic-alignment attention core.
//!
//! A differentiable operator that computes, per grid cell of a
//! (source × target) logits tensor, the marginal log-probability that the
//! cell lies on a monotonic alignment path — a two-pass log-space DP with
//! a hand-written adjoint — plus the multi-head attention layer that
//! consumes it in place of softmax attention.

pub mod tensor;
pub mod logspace;
pub mod alignment;
pub mod dispatch;
pub mod attention;
pub mod gradient;
