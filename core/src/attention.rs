/// Multi-head monotonic attention.
///
/// Replaces softmax-over-dot-product attention with alignment-probability
/// weighting: query/key dot products become per-cell transition logits,
/// clamped into a bounded range and normalized through the monotonic
/// alignment marginals before the final softmax over keys.
///
/// Shapes (row-major flat):
///   query [bsz, tq, embed_dim]
///   key   [bsz, tk, kdim]
///   value [bsz, tk, vdim]
///   mask  [bsz, tq, tk]  (additive, optional)
///
/// Grouped-query heads: the `num_heads` query heads are split into
/// `gqa_factor` groups that share `num_heads / gqa_factor` key/value heads.
/// Projected tensors keep the grouped channel order
/// (group, kv_head, head_dim) on the query side and (kv_head, head_dim) on
/// the key/value side.

use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentOp;
use crate::dispatch::{DeviceKind, KernelRegistry};
use crate::logspace::prob_to_logit;
use crate::tensor::{linear_backward_f32, linear_f32, softmax_f32, SimpleRng};

/// Attention direction. Selects which sequence plays the source role of
/// the alignment grid and how the mask is oriented.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttentionMode {
    /// Keys outnumber queries; the alignment grid is (keys × queries).
    ManyKeysOneQuery,
    /// Queries outnumber keys; the alignment grid is (queries × keys).
    OneKeyManyQueries,
}

/// Layer configuration — immutable after construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonotonicAttentionConfig {
    pub mode: AttentionMode,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub bias: bool,
    pub kdim: usize,
    pub vdim: usize,
    pub gqa_factor: usize,
    /// Bound on cached decode timesteps; `None` keeps everything.
    pub max_kv_cache_len: Option<usize>,
    /// Transition probability the clamp saturates at; must lie in (0.5, 1).
    pub clamp_prob: f32,
    /// Soft clamp (tanh-scaled, gradient everywhere) vs hard clip.
    pub soft_clamp: bool,
    pub device: DeviceKind,
}

impl MonotonicAttentionConfig {
    /// Test configuration: tiny layer for fast iteration.
    pub fn test_config(mode: AttentionMode) -> Self {
        MonotonicAttentionConfig {
            mode,
            embed_dim: 16,
            num_heads: 4,
            bias: true,
            kdim: 16,
            vdim: 16,
            gqa_factor: 2,
            max_kv_cache_len: None,
            clamp_prob: 0.98,
            soft_clamp: true,
            device: DeviceKind::Cpu,
        }
    }

    /// Fatal on any indivisible dimension or out-of-range clamp
    /// probability. Nothing is coerced.
    pub fn validate(&self) {
        assert!(self.num_heads >= 1, "num_heads must be >= 1");
        assert!(self.gqa_factor >= 1, "gqa_factor must be >= 1");
        assert!(
            self.embed_dim % self.num_heads == 0,
            "embed_dim ({}) must be divisible by num_heads ({})",
            self.embed_dim,
            self.num_heads
        );
        assert!(
            self.num_heads % self.gqa_factor == 0,
            "num_heads ({}) must be divisible by gqa_factor ({})",
            self.num_heads,
            self.gqa_factor
        );
        assert!(
            self.clamp_prob > 0.5 && self.clamp_prob < 1.0,
            "clamp_prob ({}) must lie strictly between 0.5 and 1.0",
            self.clamp_prob
        );
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn kv_num_heads(&self) -> usize {
        self.num_heads / self.gqa_factor
    }

    pub fn kv_embed_dim(&self) -> usize {
        self.kv_num_heads() * self.head_dim()
    }

    /// Logit bound whose sigmoid equals `clamp_prob`.
    pub fn clamp_bound(&self) -> f32 {
        prob_to_logit(self.clamp_prob)
    }

    pub fn norm_fact(&self) -> f32 {
        (self.head_dim() as f32).sqrt()
    }
}

/// All learnable parameters — flat Vec<f32>, row-major.
///
/// Layout:
///   w_q: [embed_dim, embed_dim]
///   w_k: [kv_embed_dim, kdim]
///   w_v: [kv_embed_dim, vdim]
///   w_o: [embed_dim, embed_dim]
/// Bias vectors are empty when `bias` is off.
#[derive(Clone, Serialize, Deserialize)]
pub struct MonotonicAttentionParams {
    pub w_q: Vec<f32>,
    pub w_k: Vec<f32>,
    pub w_v: Vec<f32>,
    pub w_o: Vec<f32>,
    pub b_q: Vec<f32>,
    pub b_k: Vec<f32>,
    pub b_v: Vec<f32>,
    pub b_o: Vec<f32>,
}

/// One entry of the flat parameter enumeration exposed to optimizers.
pub struct ParamView<'a> {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub requires_grad: bool,
    pub data: &'a [f32],
}

impl MonotonicAttentionParams {
    /// Initialize with Xavier-like scaling from a deterministic seed.
    pub fn init(cfg: &MonotonicAttentionConfig, seed: u64) -> Self {
        cfg.validate();
        let mut rng = SimpleRng::new(seed);
        let e = cfg.embed_dim;
        let ekv = cfg.kv_embed_dim();

        let mat = |rows: usize, cols: usize, rng: &mut SimpleRng| {
            let scale = (2.0 / (rows + cols) as f32).sqrt();
            let mut w = vec![0.0f32; rows * cols];
            rng.fill_uniform(&mut w, scale);
            w
        };

        let w_q = mat(e, e, &mut rng);
        let w_k = mat(ekv, cfg.kdim, &mut rng);
        let w_v = mat(ekv, cfg.vdim, &mut rng);
        let w_o = mat(e, e, &mut rng);

        let (b_q, b_k, b_v, b_o) = if cfg.bias {
            (vec![0.0; e], vec![0.0; ekv], vec![0.0; ekv], vec![0.0; e])
        } else {
            (Vec::new(), Vec::new(), Vec::new(), Vec::new())
        };

        MonotonicAttentionParams { w_q, w_k, w_v, w_o, b_q, b_k, b_v, b_o }
    }

    /// Create a zero-initialized shadow for gradient accumulation.
    pub fn zeros_like(cfg: &MonotonicAttentionConfig) -> Self {
        let e = cfg.embed_dim;
        let ekv = cfg.kv_embed_dim();
        let (b_q, b_k, b_v, b_o) = if cfg.bias {
            (vec![0.0; e], vec![0.0; ekv], vec![0.0; ekv], vec![0.0; e])
        } else {
            (Vec::new(), Vec::new(), Vec::new(), Vec::new())
        };
        MonotonicAttentionParams {
            w_q: vec![0.0; e * e],
            w_k: vec![0.0; ekv * cfg.kdim],
            w_v: vec![0.0; ekv * cfg.vdim],
            w_o: vec![0.0; e * e],
            b_q,
            b_k,
            b_v,
            b_o,
        }
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.w_q.len() + self.w_k.len() + self.w_v.len() + self.w_o.len()
            + self.b_q.len() + self.b_k.len() + self.b_v.len() + self.b_o.len()
    }

    /// Flat enumeration of named parameters with shape and requires-grad
    /// flag — the contract a generic optimizer consumes. Empty (bias-off)
    /// tensors are omitted.
    pub fn named_parameters(&self, cfg: &MonotonicAttentionConfig) -> Vec<ParamView<'_>> {
        let e = cfg.embed_dim;
        let ekv = cfg.kv_embed_dim();
        let mut out = vec![
            ParamView { name: "w_q", shape: vec![e, e], requires_grad: true, data: &self.w_q },
            ParamView { name: "w_k", shape: vec![ekv, cfg.kdim], requires_grad: true, data: &self.w_k },
            ParamView { name: "w_v", shape: vec![ekv, cfg.vdim], requires_grad: true, data: &self.w_v },
            ParamView { name: "w_o", shape: vec![e, e], requires_grad: true, data: &self.w_o },
        ];
        if cfg.bias {
            out.push(ParamView { name: "b_q", shape: vec![e], requires_grad: true, data: &self.b_q });
            out.push(ParamView { name: "b_k", shape: vec![ekv], requires_grad: true, data: &self.b_k });
            out.push(ParamView { name: "b_v", shape: vec![ekv], requires_grad: true, data: &self.b_v });
            out.push(ParamView { name: "b_o", shape: vec![e], requires_grad: true, data: &self.b_o });
        }
        out
    }

    /// Outer-loop weight update: param -= lr * grad.
    pub fn apply_weight_gradients(&mut self, grads: &MonotonicAttentionParams, lr: f32) {
        fn step(param: &mut [f32], grad: &[f32], lr: f32) {
            for i in 0..param.len() {
                param[i] -= lr * grad[i];
            }
        }
        step(&mut self.w_q, &grads.w_q, lr);
        step(&mut self.w_k, &grads.w_k, lr);
        step(&mut self.w_v, &grads.w_v, lr);
        step(&mut self.w_o, &grads.w_o, lr);
        step(&mut self.b_q, &grads.b_q, lr);
        step(&mut self.b_k, &grads.b_k, lr);
        step(&mut self.b_v, &grads.b_v, lr);
        step(&mut self.b_o, &grads.b_o, lr);
    }
}

/// All intermediate activations from a forward pass, needed for backward.
/// Holds the alignment operator record, so one cache supports exactly one
/// backward invocation.
pub struct AttentionCache {
    /// Projected queries: [bsz, tq, embed_dim]
    pub xq: Vec<f32>,
    /// Projected keys: [bsz, tk, kv_embed_dim]
    pub xk: Vec<f32>,
    /// Projected values: [bsz, tk, kv_embed_dim]
    pub xv: Vec<f32>,
    /// Transition scores before clamping, grid-oriented: [bsz·heads, src, tgt]
    pub raw_scores: Vec<f32>,
    /// Alignment operator record (clamped logits + phi table).
    pub op: AlignmentOp,
    /// Softmaxed attention, (query, key)-oriented: [bsz, groups, kv_heads, tq, tk]
    pub attn: Vec<f32>,
    /// Aggregated values before the output projection: [bsz, tq, embed_dim]
    pub attn_out: Vec<f32>,
    /// Cloned inputs, for weight gradients.
    pub query: Vec<f32>,
    pub key: Vec<f32>,
    pub value: Vec<f32>,
    pub bsz: usize,
    pub tq: usize,
    pub tk: usize,
}

/// Alignment-grid extents for a mode: (src_len, tgt_len).
fn grid_dims(mode: AttentionMode, tq: usize, tk: usize) -> (usize, usize) {
    match mode {
        AttentionMode::OneKeyManyQueries => (tq, tk),
        AttentionMode::ManyKeysOneQuery => (tk, tq),
    }
}

/// Reorient per-head grids between alignment orientation and (query, key)
/// orientation. A per-block transpose in ManyKeysOneQuery mode, a copy
/// otherwise. The transform is its own inverse.
fn reorient(mode: AttentionMode, grids: &[f32], nb: usize, rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(grids.len(), nb * rows * cols);
    match mode {
        AttentionMode::OneKeyManyQueries => grids.to_vec(),
        AttentionMode::ManyKeysOneQuery => {
            let mut out = vec![0.0f32; grids.len()];
            for bh in 0..nb {
                let base = bh * rows * cols;
                for r in 0..rows {
                    for c in 0..cols {
                        out[base + c * rows + r] = grids[base + r * cols + c];
                    }
                }
            }
            out
        }
    }
}

/// Project the query sequence: [bsz, t, embed_dim] → [bsz, t, embed_dim].
pub fn project_query(
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    query: &[f32],
    bsz: usize,
    t: usize,
) -> Vec<f32> {
    let e = cfg.embed_dim;
    let mut xq = vec![0.0f32; bsz * t * e];
    linear_f32(query, &params.w_q, &params.b_q, &mut xq, bsz * t, e, e);
    xq
}

/// Project the key sequence: [bsz, t, kdim] → [bsz, t, kv_embed_dim].
pub fn project_key(
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    key: &[f32],
    bsz: usize,
    t: usize,
) -> Vec<f32> {
    let ekv = cfg.kv_embed_dim();
    let mut xk = vec![0.0f32; bsz * t * ekv];
    linear_f32(key, &params.w_k, &params.b_k, &mut xk, bsz * t, cfg.kdim, ekv);
    xk
}

/// Project the value sequence: [bsz, t, vdim] → [bsz, t, kv_embed_dim].
pub fn project_value(
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    value: &[f32],
    bsz: usize,
    t: usize,
) -> Vec<f32> {
    let ekv = cfg.kv_embed_dim();
    let mut xv = vec![0.0f32; bsz * t * ekv];
    linear_f32(value, &params.w_v, &params.b_v, &mut xv, bsz * t, cfg.vdim, ekv);
    xv
}

/// Scaled dot-product transition scores in alignment orientation,
/// with the optional additive mask applied: [bsz·heads, src, tgt].
fn transition_scores(
    cfg: &MonotonicAttentionConfig,
    xq: &[f32],
    xk: &[f32],
    mask: Option<&[f32]>,
    bsz: usize,
    tq: usize,
    tk: usize,
) -> Vec<f32> {
    let e = cfg.embed_dim;
    let ekv = cfg.kv_embed_dim();
    let g = cfg.gqa_factor;
    let hkv = cfg.kv_num_heads();
    let hd = cfg.head_dim();
    let nf = cfg.norm_fact();
    let (src, tgt) = grid_dims(cfg.mode, tq, tk);
    let nb = bsz * g * hkv;

    if let Some(m) = mask {
        debug_assert_eq!(m.len(), bsz * tq * tk);
    }

    let mut raw = vec![0.0f32; nb * src * tgt];
    for b in 0..bsz {
        for gi in 0..g {
            for hi in 0..hkv {
                let bh = (b * g + gi) * hkv + hi;
                let grid = &mut raw[bh * src * tgt..(bh + 1) * src * tgt];
                for q in 0..tq {
                    let qoff = b * tq * e + q * e + (gi * hkv + hi) * hd;
                    for k in 0..tk {
                        let koff = b * tk * ekv + k * ekv + hi * hd;
                        let mut dot = 0.0f32;
                        for d in 0..hd {
                            dot += xq[qoff + d] * xk[koff + d];
                        }
                        let mut s = dot / nf;
                        if let Some(m) = mask {
                            s += m[b * tq * tk + q * tk + k];
                        }
                        let idx = match cfg.mode {
                            AttentionMode::OneKeyManyQueries => q * tgt + k,
                            AttentionMode::ManyKeysOneQuery => k * tgt + q,
                        };
                        grid[idx] = s;
                    }
                }
            }
        }
    }
    raw
}

/// Clamp transition scores into [-c, c]. The soft variant keeps a gradient
/// everywhere; the hard variant zeroes it outside the range.
pub fn clamp_scores(cfg: &MonotonicAttentionConfig, raw: &[f32]) -> Vec<f32> {
    let c = cfg.clamp_bound();
    if cfg.soft_clamp {
        raw.iter().map(|&x| x.tanh() * c).collect()
    } else {
        raw.iter().map(|&x| x.clamp(-c, c)).collect()
    }
}

/// Full forward pass. Returns (output [bsz, tq, embed_dim], cache).
pub fn attention_forward(
    registry: &KernelRegistry,
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    query: &[f32],
    key: &[f32],
    value: &[f32],
    mask: Option<&[f32]>,
    bsz: usize,
    tq: usize,
    tk: usize,
) -> (Vec<f32>, AttentionCache) {
    cfg.validate();
    let e = cfg.embed_dim;
    let ekv = cfg.kv_embed_dim();
    let g = cfg.gqa_factor;
    let hkv = cfg.kv_num_heads();
    let hd = cfg.head_dim();
    debug_assert_eq!(query.len(), bsz * tq * e);
    debug_assert_eq!(key.len(), bsz * tk * cfg.kdim);
    debug_assert_eq!(value.len(), bsz * tk * cfg.vdim);

    // Stage 1: projections.
    let xq = project_query(params, cfg, query, bsz, tq);
    let xk = project_key(params, cfg, key, bsz, tk);
    let xv = project_value(params, cfg, value, bsz, tk);

    // Stage 2: scaled dot-product transition scores (+ mask), then clamp.
    let raw_scores = transition_scores(cfg, &xq, &xk, mask, bsz, tq, tk);
    let clamped = clamp_scores(cfg, &raw_scores);

    // Stage 3: monotonic alignment marginals through the dispatched kernel.
    let (src, tgt) = grid_dims(cfg.mode, tq, tk);
    let nb = bsz * g * hkv;
    let kernel = registry.resolve(cfg.device);
    let (prob, op) = AlignmentOp::forward(kernel, clamped, nb, src, tgt);

    // Stage 4: orient to (query, key) and normalize over keys.
    let prob_qk = reorient(cfg.mode, &prob, nb, src, tgt);
    let mut attn = vec![0.0f32; nb * tq * tk];
    softmax_f32(&prob_qk, &mut attn, nb * tq, tk);

    // Stage 5: weighted value aggregation, heads re-merged.
    let mut attn_out = vec![0.0f32; bsz * tq * e];
    for b in 0..bsz {
        for gi in 0..g {
            for hi in 0..hkv {
                let bh = (b * g + gi) * hkv + hi;
                for q in 0..tq {
                    let ooff = b * tq * e + q * e + (gi * hkv + hi) * hd;
                    for k in 0..tk {
                        let w = attn[bh * tq * tk + q * tk + k];
                        let voff = b * tk * ekv + k * ekv + hi * hd;
                        for d in 0..hd {
                            attn_out[ooff + d] += w * xv[voff + d];
                        }
                    }
                }
            }
        }
    }

    // Stage 6: output projection.
    let mut out = vec![0.0f32; bsz * tq * e];
    linear_f32(&attn_out, &params.w_o, &params.b_o, &mut out, bsz * tq, e, e);

    let cache = AttentionCache {
        xq,
        xk,
        xv,
        raw_scores,
        op,
        attn,
        attn_out,
        query: query.to_vec(),
        key: key.to_vec(),
        value: value.to_vec(),
        bsz,
        tq,
        tk,
    };
    (out, cache)
}

/// Full analytic backward pass. Consumes the cache (the alignment record
/// inside it supports exactly one adjoint run). Returns parameter
/// gradients plus gradients w.r.t. the three input sequences.
pub fn attention_backward(
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    cache: AttentionCache,
    d_out: &[f32],
) -> (MonotonicAttentionParams, Vec<f32>, Vec<f32>, Vec<f32>) {
    let e = cfg.embed_dim;
    let ekv = cfg.kv_embed_dim();
    let g = cfg.gqa_factor;
    let hkv = cfg.kv_num_heads();
    let hd = cfg.head_dim();
    let nf = cfg.norm_fact();
    let (bsz, tq, tk) = (cache.bsz, cache.tq, cache.tk);
    let nb = bsz * g * hkv;
    debug_assert_eq!(d_out.len(), bsz * tq * e);

    let mut grads = MonotonicAttentionParams::zeros_like(cfg);

    // Stage 6 adjoint: output projection.
    let mut d_attn_out = vec![0.0f32; bsz * tq * e];
    linear_backward_f32(
        &cache.attn_out,
        &params.w_o,
        d_out,
        &mut d_attn_out,
        &mut grads.w_o,
        &mut grads.b_o,
        bsz * tq,
        e,
        e,
    );

    // Stage 5 adjoint: value aggregation. xv is shared across query-head
    // groups, so its gradient accumulates over g.
    let mut d_attn = vec![0.0f32; nb * tq * tk];
    let mut d_xv = vec![0.0f32; bsz * tk * ekv];
    for b in 0..bsz {
        for gi in 0..g {
            for hi in 0..hkv {
                let bh = (b * g + gi) * hkv + hi;
                for q in 0..tq {
                    let ooff = b * tq * e + q * e + (gi * hkv + hi) * hd;
                    for k in 0..tk {
                        let voff = b * tk * ekv + k * ekv + hi * hd;
                        let w = cache.attn[bh * tq * tk + q * tk + k];
                        let mut dw = 0.0f32;
                        for d in 0..hd {
                            dw += d_attn_out[ooff + d] * cache.xv[voff + d];
                            d_xv[voff + d] += w * d_attn_out[ooff + d];
                        }
                        d_attn[bh * tq * tk + q * tk + k] = dw;
                    }
                }
            }
        }
    }

    // Stage 4 adjoint: softmax over keys, then back to grid orientation.
    let mut d_prob_qk = vec![0.0f32; nb * tq * tk];
    for row in 0..nb * tq {
        let base = row * tk;
        let mut dot = 0.0f32;
        for k in 0..tk {
            dot += d_attn[base + k] * cache.attn[base + k];
        }
        for k in 0..tk {
            d_prob_qk[base + k] = cache.attn[base + k] * (d_attn[base + k] - dot);
        }
    }
    let (src, tgt) = grid_dims(cfg.mode, tq, tk);
    let d_prob = reorient(cfg.mode, &d_prob_qk, nb, tq, tk);

    // Stage 3 adjoint: the alignment operator record.
    let raw_scores = cache.raw_scores;
    let d_clamped = cache.op.backward(&d_prob);

    // Stage 2 adjoint: clamp.
    let c = cfg.clamp_bound();
    let mut d_raw = vec![0.0f32; nb * src * tgt];
    if cfg.soft_clamp {
        for i in 0..d_raw.len() {
            let t = raw_scores[i].tanh();
            d_raw[i] = d_clamped[i] * c * (1.0 - t * t);
        }
    } else {
        for i in 0..d_raw.len() {
            d_raw[i] = if raw_scores[i].abs() <= c { d_clamped[i] } else { 0.0 };
        }
    }
    // The additive mask is an input, not a parameter; its gradient is
    // not materialized. Reorient score gradients to (query, key).
    let d_score_qk = reorient(cfg.mode, &d_raw, nb, src, tgt);

    // Stage 2 adjoint, continued: scaled dot products. xk shared across
    // groups like xv.
    let mut d_xq = vec![0.0f32; bsz * tq * e];
    let mut d_xk = vec![0.0f32; bsz * tk * ekv];
    for b in 0..bsz {
        for gi in 0..g {
            for hi in 0..hkv {
                let bh = (b * g + gi) * hkv + hi;
                for q in 0..tq {
                    let qoff = b * tq * e + q * e + (gi * hkv + hi) * hd;
                    for k in 0..tk {
                        let koff = b * tk * ekv + k * ekv + hi * hd;
                        let ds = d_score_qk[bh * tq * tk + q * tk + k] / nf;
                        for d in 0..hd {
                            d_xq[qoff + d] += ds * cache.xk[koff + d];
                            d_xk[koff + d] += ds * cache.xq[qoff + d];
                        }
                    }
                }
            }
        }
    }

    // Stage 1 adjoint: projections.
    let mut d_query = vec![0.0f32; bsz * tq * e];
    let mut d_key = vec![0.0f32; bsz * tk * cfg.kdim];
    let mut d_value = vec![0.0f32; bsz * tk * cfg.vdim];
    linear_backward_f32(
        &cache.query, &params.w_q, &d_xq,
        &mut d_query, &mut grads.w_q, &mut grads.b_q,
        bsz * tq, e, e,
    );
    linear_backward_f32(
        &cache.key, &params.w_k, &d_xk,
        &mut d_key, &mut grads.w_k, &mut grads.b_k,
        bsz * tk, cfg.kdim, ekv,
    );
    linear_backward_f32(
        &cache.value, &params.w_v, &d_xv,
        &mut d_value, &mut grads.w_v, &mut grads.b_v,
        bsz * tk, cfg.vdim, ekv,
    );

    (grads, d_query, d_key, d_value)
}

/// Marginal alignment log-probabilities for a (query, key) pair, oriented
/// [bsz, groups, kv_heads, tq, tk]. Inspection entry point for
/// visualization; no record is retained.
pub fn get_attn_matrix(
    registry: &KernelRegistry,
    params: &MonotonicAttentionParams,
    cfg: &MonotonicAttentionConfig,
    query: &[f32],
    key: &[f32],
    mask: Option<&[f32]>,
    bsz: usize,
    tq: usize,
    tk: usize,
) -> Vec<f32> {
    cfg.validate();
    let xq = project_query(params, cfg, query, bsz, tq);
    let xk = project_key(params, cfg, key, bsz, tk);
    let raw = transition_scores(cfg, &xq, &xk, mask, bsz, tq, tk);
    let clamped = clamp_scores(cfg, &raw);
    let (src, tgt) = grid_dims(cfg.mode, tq, tk);
    let nb = bsz * cfg.gqa_factor * cfg.kv_num_heads();
    let kernel = registry.resolve(cfg.device);
    let (prob, _op) = AlignmentOp::forward(kernel, clamped, nb, src, tgt);
    reorient(cfg.mode, &prob, nb, src, tgt)
}

/// Projected key/value state for incremental decoding, bounded by
/// `max_kv_cache_len`. Oldest timesteps are dropped first.
pub struct KvCache {
    bsz: usize,
    kv_dim: usize,
    max_len: Option<usize>,
    steps: usize,
    k: Vec<f32>,
    v: Vec<f32>,
}

impl KvCache {
    pub fn new(cfg: &MonotonicAttentionConfig, bsz: usize) -> Self {
        KvCache {
            bsz,
            kv_dim: cfg.kv_embed_dim(),
            max_len: cfg.max_kv_cache_len,
            steps: 0,
            k: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Append `new_steps` projected timesteps ([bsz, new_steps, kv_dim])
    /// and trim to the configured bound.
    pub fn append(&mut self, xk: &[f32], xv: &[f32], new_steps: usize) {
        debug_assert_eq!(xk.len(), self.bsz * new_steps * self.kv_dim);
        debug_assert_eq!(xv.len(), self.bsz * new_steps * self.kv_dim);

        let total = self.steps + new_steps;
        let keep = match self.max_len {
            Some(m) => total.min(m),
            None => total,
        };
        let drop = total - keep;

        let mut k = vec![0.0f32; self.bsz * keep * self.kv_dim];
        let mut v = vec![0.0f32; self.bsz * keep * self.kv_dim];
        for b in 0..self.bsz {
            for t in 0..keep {
                // Position in the concatenated (old ++ new) sequence.
                let t_src = t + drop;
                let dst = (b * keep + t) * self.kv_dim;
                if t_src < self.steps {
                    let s = (b * self.steps + t_src) * self.kv_dim;
                    k[dst..dst + self.kv_dim].copy_from_slice(&self.k[s..s + self.kv_dim]);
                    v[dst..dst + self.kv_dim].copy_from_slice(&self.v[s..s + self.kv_dim]);
                } else {
                    let s = (b * new_steps + (t_src - self.steps)) * self.kv_dim;
                    k[dst..dst + self.kv_dim].copy_from_slice(&xk[s..s + self.kv_dim]);
                    v[dst..dst + self.kv_dim].copy_from_slice(&xv[s..s + self.kv_dim]);
                }
            }
        }
        self.k = k;
        self.v = v;
        self.steps = keep;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn key(&self) -> &[f32] {
        &self.k
    }

    pub fn value(&self) -> &[f32] {
        &self.v
    }
}
