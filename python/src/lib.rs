//! PyO3 bindings for monoalign core.
//!
//! Stateless functional API — mirrors the Rust core exactly.
//! No Python-side math. All computation happens in Rust.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use monoalign_core::alignment::{alignment_backward, alignment_forward};
use monoalign_core::attention::{
    attention_backward as rust_attention_backward, attention_forward as rust_attention_forward,
    get_attn_matrix as rust_get_attn_matrix, AttentionMode,
    MonotonicAttentionConfig as RustConfig, MonotonicAttentionParams as RustParams,
};
use monoalign_core::dispatch::{DeviceKind, KernelRegistry};

fn parse_mode(mode: &str) -> PyResult<AttentionMode> {
    match mode {
        "many_keys_one_query" => Ok(AttentionMode::ManyKeysOneQuery),
        "one_key_many_queries" => Ok(AttentionMode::OneKeyManyQueries),
        other => Err(PyValueError::new_err(format!(
            "unknown attention mode {other:?}; expected \"many_keys_one_query\" or \
             \"one_key_many_queries\""
        ))),
    }
}

fn check_len(name: &str, buf: &[f32], expected: usize) -> PyResult<()> {
    if buf.len() != expected {
        return Err(PyValueError::new_err(format!(
            "{name} has {} elements, expected {expected}",
            buf.len()
        )));
    }
    Ok(())
}

// ── AttentionConfig ──────────────────────────────────────────────────

#[pyclass(frozen)]
struct AttentionConfig {
    inner: RustConfig,
}

#[pymethods]
impl AttentionConfig {
    #[new]
    #[pyo3(signature = (mode, embed_dim, num_heads=1, bias=true, kdim=None, vdim=None,
                        gqa_factor=1, max_kv_cache_len=None, clamp_prob=0.98, soft_clamp=true))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        mode: &str,
        embed_dim: usize,
        num_heads: usize,
        bias: bool,
        kdim: Option<usize>,
        vdim: Option<usize>,
        gqa_factor: usize,
        max_kv_cache_len: Option<usize>,
        clamp_prob: f32,
        soft_clamp: bool,
    ) -> PyResult<Self> {
        let mode = parse_mode(mode)?;
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(PyValueError::new_err(format!(
                "embed_dim ({embed_dim}) must be divisible by num_heads ({num_heads})"
            )));
        }
        if gqa_factor == 0 || num_heads % gqa_factor != 0 {
            return Err(PyValueError::new_err(format!(
                "num_heads ({num_heads}) must be divisible by gqa_factor ({gqa_factor})"
            )));
        }
        if !(clamp_prob > 0.5 && clamp_prob < 1.0) {
            return Err(PyValueError::new_err(format!(
                "clamp_prob ({clamp_prob}) must lie strictly between 0.5 and 1.0"
            )));
        }
        Ok(AttentionConfig {
            inner: RustConfig {
                mode,
                embed_dim,
                num_heads,
                bias,
                kdim: kdim.unwrap_or(embed_dim),
                vdim: vdim.unwrap_or(embed_dim),
                gqa_factor,
                max_kv_cache_len,
                clamp_prob,
                soft_clamp,
                device: DeviceKind::Cpu,
            },
        })
    }

    #[getter]
    fn embed_dim(&self) -> usize { self.inner.embed_dim }
    #[getter]
    fn num_heads(&self) -> usize { self.inner.num_heads }
    #[getter]
    fn head_dim(&self) -> usize { self.inner.head_dim() }
    #[getter]
    fn kv_num_heads(&self) -> usize { self.inner.kv_num_heads() }
    #[getter]
    fn clamp_bound(&self) -> f32 { self.inner.clamp_bound() }
    #[getter]
    fn soft_clamp(&self) -> bool { self.inner.soft_clamp }
}

// ── AttentionParams ──────────────────────────────────────────────────

#[pyclass]
struct AttentionParams {
    inner: RustParams,
}

#[pymethods]
impl AttentionParams {
    #[staticmethod]
    fn init(config: &AttentionConfig, seed: u64) -> Self {
        AttentionParams { inner: RustParams::init(&config.inner, seed) }
    }

    fn num_params(&self) -> usize {
        self.inner.num_params()
    }

    /// Return all weight tensors as a dict of flat lists.
    fn get_weights<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("w_q", self.inner.w_q.clone())?;
        dict.set_item("w_k", self.inner.w_k.clone())?;
        dict.set_item("w_v", self.inner.w_v.clone())?;
        dict.set_item("w_o", self.inner.w_o.clone())?;
        dict.set_item("b_q", self.inner.b_q.clone())?;
        dict.set_item("b_k", self.inner.b_k.clone())?;
        dict.set_item("b_v", self.inner.b_v.clone())?;
        dict.set_item("b_o", self.inner.b_o.clone())?;
        Ok(dict)
    }

    /// Flat (name, shape, requires_grad) enumeration for optimizers.
    fn named_parameters(&self, config: &AttentionConfig) -> Vec<(String, Vec<usize>, bool)> {
        self.inner
            .named_parameters(&config.inner)
            .into_iter()
            .map(|v| (v.name.to_string(), v.shape, v.requires_grad))
            .collect()
    }
}

// ── Alignment operator ───────────────────────────────────────────────

/// Monotonic-alignment forward pass. Returns (phi, prob), both flat
/// [batch, src_len, tgt_len].
#[pyfunction]
fn monotonic_alignment(
    logits: Vec<f32>,
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) -> PyResult<(Vec<f32>, Vec<f32>)> {
    if src_len == 0 || tgt_len == 0 {
        return Err(PyValueError::new_err("src_len and tgt_len must be >= 1"));
    }
    check_len("logits", &logits, batch * src_len * tgt_len)?;
    let mut phi = vec![0.0f32; logits.len()];
    let mut prob = vec![0.0f32; logits.len()];
    alignment_forward(&logits, &mut phi, &mut prob, batch, src_len, tgt_len);
    Ok((phi, prob))
}

/// Gradient of the marginals w.r.t. the logits, given the upstream
/// gradient. Runs forward and backward in one call (stateless API).
#[pyfunction]
fn monotonic_alignment_grad(
    logits: Vec<f32>,
    grad_prob: Vec<f32>,
    batch: usize,
    src_len: usize,
    tgt_len: usize,
) -> PyResult<Vec<f32>> {
    if src_len == 0 || tgt_len == 0 {
        return Err(PyValueError::new_err("src_len and tgt_len must be >= 1"));
    }
    check_len("logits", &logits, batch * src_len * tgt_len)?;
    check_len("grad_prob", &grad_prob, logits.len())?;
    let mut phi = vec![0.0f32; logits.len()];
    let mut prob = vec![0.0f32; logits.len()];
    alignment_forward(&logits, &mut phi, &mut prob, batch, src_len, tgt_len);
    let mut grad = vec![0.0f32; logits.len()];
    alignment_backward(&logits, &phi, &grad_prob, &mut grad, batch, src_len, tgt_len);
    Ok(grad)
}

// ── Attention layer ──────────────────────────────────────────────────

/// Full attention forward. Returns the output sequence,
/// flat [bsz, tq, embed_dim].
#[pyfunction]
#[pyo3(signature = (config, params, query, key, value, bsz, tq, tk, mask=None))]
#[allow(clippy::too_many_arguments)]
fn attention_forward(
    config: &AttentionConfig,
    params: &AttentionParams,
    query: Vec<f32>,
    key: Vec<f32>,
    value: Vec<f32>,
    bsz: usize,
    tq: usize,
    tk: usize,
    mask: Option<Vec<f32>>,
) -> PyResult<Vec<f32>> {
    let cfg = &config.inner;
    check_len("query", &query, bsz * tq * cfg.embed_dim)?;
    check_len("key", &key, bsz * tk * cfg.kdim)?;
    check_len("value", &value, bsz * tk * cfg.vdim)?;
    if let Some(m) = &mask {
        check_len("mask", m, bsz * tq * tk)?;
    }
    let (out, _cache) = rust_attention_forward(
        KernelRegistry::global(),
        &params.inner,
        cfg,
        &query,
        &key,
        &value,
        mask.as_deref(),
        bsz,
        tq,
        tk,
    );
    Ok(out)
}

/// Forward plus backward. Returns (parameter gradients, d_query, d_key,
/// d_value).
#[pyfunction]
#[pyo3(signature = (config, params, query, key, value, d_out, bsz, tq, tk, mask=None))]
#[allow(clippy::too_many_arguments)]
fn attention_grads(
    config: &AttentionConfig,
    params: &AttentionParams,
    query: Vec<f32>,
    key: Vec<f32>,
    value: Vec<f32>,
    d_out: Vec<f32>,
    bsz: usize,
    tq: usize,
    tk: usize,
    mask: Option<Vec<f32>>,
) -> PyResult<(AttentionParams, Vec<f32>, Vec<f32>, Vec<f32>)> {
    let cfg = &config.inner;
    check_len("query", &query, bsz * tq * cfg.embed_dim)?;
    check_len("key", &key, bsz * tk * cfg.kdim)?;
    check_len("value", &value, bsz * tk * cfg.vdim)?;
    check_len("d_out", &d_out, bsz * tq * cfg.embed_dim)?;
    if let Some(m) = &mask {
        check_len("mask", m, bsz * tq * tk)?;
    }
    let (_out, cache) = rust_attention_forward(
        KernelRegistry::global(),
        &params.inner,
        cfg,
        &query,
        &key,
        &value,
        mask.as_deref(),
        bsz,
        tq,
        tk,
    );
    let (grads, d_query, d_key, d_value) =
        rust_attention_backward(&params.inner, cfg, cache, &d_out);
    Ok((AttentionParams { inner: grads }, d_query, d_key, d_value))
}

/// Marginal alignment log-probabilities for visualization,
/// flat [bsz, groups, kv_heads, tq, tk].
#[pyfunction]
#[pyo3(signature = (config, params, query, key, bsz, tq, tk, mask=None))]
#[allow(clippy::too_many_arguments)]
fn attn_matrix(
    config: &AttentionConfig,
    params: &AttentionParams,
    query: Vec<f32>,
    key: Vec<f32>,
    bsz: usize,
    tq: usize,
    tk: usize,
    mask: Option<Vec<f32>>,
) -> PyResult<Vec<f32>> {
    let cfg = &config.inner;
    check_len("query", &query, bsz * tq * cfg.embed_dim)?;
    check_len("key", &key, bsz * tk * cfg.kdim)?;
    if let Some(m) = &mask {
        check_len("mask", m, bsz * tq * tk)?;
    }
    Ok(rust_get_attn_matrix(
        KernelRegistry::global(),
        &params.inner,
        cfg,
        &query,
        &key,
        mask.as_deref(),
        bsz,
        tq,
        tk,
    ))
}

#[pymodule]
fn monoalign(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<AttentionConfig>()?;
    m.add_class::<AttentionParams>()?;
    m.add_function(wrap_pyfunction!(monotonic_alignment, m)?)?;
    m.add_function(wrap_pyfunction!(monotonic_alignment_grad, m)?)?;
    m.add_function(wrap_pyfunction!(attention_forward, m)?)?;
    m.add_function(wrap_pyfunction!(attention_grads, m)?)?;
    m.add_function(wrap_pyfunction!(attn_matrix, m)?)?;
    Ok(())
}
