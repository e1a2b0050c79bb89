// Attention layer tests: shapes, modes, masking, clamping, GQA handling,
// parameter enumeration, projection-only decoding, and input gradients.

use monoalign_core::attention::{
    attention_backward, attention_forward, clamp_scores, get_attn_matrix, project_key,
    project_query, project_value, AttentionMode, KvCache, MonotonicAttentionConfig,
    MonotonicAttentionParams,
};
use monoalign_core::dispatch::KernelRegistry;
use monoalign_core::tensor::SimpleRng;

fn make_inputs(
    cfg: &MonotonicAttentionConfig,
    bsz: usize,
    tq: usize,
    tk: usize,
    seed: u64,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut rng = SimpleRng::new(seed);
    let mut query = vec![0.0f32; bsz * tq * cfg.embed_dim];
    let mut key = vec![0.0f32; bsz * tk * cfg.kdim];
    let mut value = vec![0.0f32; bsz * tk * cfg.vdim];
    rng.fill_uniform(&mut query, 0.5);
    rng.fill_uniform(&mut key, 0.5);
    rng.fill_uniform(&mut value, 0.5);
    (query, key, value)
}

// ══════════════════════════════════════════════════════════════════════
// Forward behavior
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_output_shape_one_key_many_queries() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 1);
    let (bsz, tq, tk) = (2, 6, 3);
    let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 5);

    let (out, cache) = attention_forward(
        &registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk,
    );
    assert_eq!(out.len(), bsz * tq * cfg.embed_dim);
    assert!(out.iter().all(|v| v.is_finite()));
    assert_eq!(cache.attn.len(), bsz * cfg.num_heads * tq * tk);
}

#[test]
fn test_output_shape_many_keys_one_query() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::ManyKeysOneQuery);
    let params = MonotonicAttentionParams::init(&cfg, 1);
    // Keys outnumber queries in this mode.
    let (bsz, tq, tk) = (2, 3, 6);
    let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 5);

    let (out, _cache) = attention_forward(
        &registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk,
    );
    assert_eq!(out.len(), bsz * tq * cfg.embed_dim);
    assert!(out.iter().all(|v| v.is_finite()));
}

#[test]
fn test_attention_rows_are_distributions() {
    let registry = KernelRegistry::new();
    for mode in [AttentionMode::OneKeyManyQueries, AttentionMode::ManyKeysOneQuery] {
        let cfg = MonotonicAttentionConfig::test_config(mode);
        let params = MonotonicAttentionParams::init(&cfg, 3);
        let (bsz, tq, tk) = match mode {
            AttentionMode::OneKeyManyQueries => (1, 5, 3),
            AttentionMode::ManyKeysOneQuery => (1, 3, 5),
        };
        let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 9);
        let (_out, cache) = attention_forward(
            &registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk,
        );
        for row in 0..bsz * cfg.num_heads * tq {
            let sum: f32 = cache.attn[row * tk..(row + 1) * tk].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "mode {mode:?}: row {row} sums to {sum}");
            assert!(cache.attn[row * tk..(row + 1) * tk].iter().all(|&w| w >= 0.0));
        }
    }
}

#[test]
fn test_forward_deterministic() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 17);
    let (query, key, value) = make_inputs(&cfg, 1, 4, 2, 23);

    let (out1, _) = attention_forward(&registry, &params, &cfg, &query, &key, &value, None, 1, 4, 2);
    let (out2, _) = attention_forward(&registry, &params, &cfg, &query, &key, &value, None, 1, 4, 2);
    assert_eq!(out1, out2);
}

#[test]
fn test_zero_mask_is_identity() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 2);
    let (bsz, tq, tk) = (1, 4, 3);
    let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 8);
    let mask = vec![0.0f32; bsz * tq * tk];

    let (plain, _) =
        attention_forward(&registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk);
    let (masked, _) = attention_forward(
        &registry, &params, &cfg, &query, &key, &value, Some(&mask), bsz, tq, tk,
    );
    assert_eq!(plain, masked);
}

#[test]
fn test_mask_shifts_scores() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 2);
    let (bsz, tq, tk) = (1, 4, 3);
    let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 8);
    let mut mask = vec![0.0f32; bsz * tq * tk];
    for q in 0..tq {
        mask[q * tk] = 2.0; // bias transitions on the first key
    }

    let (plain, _) =
        attention_forward(&registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk);
    let (masked, _) = attention_forward(
        &registry, &params, &cfg, &query, &key, &value, Some(&mask), bsz, tq, tk,
    );
    assert_ne!(plain, masked);
}

// ══════════════════════════════════════════════════════════════════════
// Clamping
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_hard_clamp_is_bit_exact_at_boundary() {
    let mut cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    cfg.soft_clamp = false;
    let c = cfg.clamp_bound();

    let raw = [c + 5.0, -c - 5.0, 0.3, -0.3, c, -c];
    let clamped = clamp_scores(&cfg, &raw);
    assert_eq!(clamped[0].to_bits(), c.to_bits());
    assert_eq!(clamped[1].to_bits(), (-c).to_bits());
    // Inside the range: untouched.
    assert_eq!(clamped[2].to_bits(), raw[2].to_bits());
    assert_eq!(clamped[3].to_bits(), raw[3].to_bits());
    assert_eq!(clamped[4].to_bits(), c.to_bits());
    assert_eq!(clamped[5].to_bits(), (-c).to_bits());
}

#[test]
fn test_soft_clamp_stays_strictly_inside() {
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    assert!(cfg.soft_clamp);
    let c = cfg.clamp_bound();

    // Inputs kept below tanh's f32 saturation point (~9), where the open
    // bound is still representable.
    let raw = [8.0f32, -8.0, 5.0, -5.0, 0.0, 3.0];
    let clamped = clamp_scores(&cfg, &raw);
    for (i, &v) in clamped.iter().enumerate() {
        assert!(v > -c && v < c, "soft clamp [{i}]: {v} not strictly inside ({}, {})", -c, c);
    }
    // Sign and ordering preserved.
    assert!(clamped[0] > 0.0 && clamped[1] < 0.0);
    assert!(clamped[5] < clamped[0]);
}

// ══════════════════════════════════════════════════════════════════════
// Parameter surface
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_named_parameter_enumeration() {
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 4);
    let views = params.named_parameters(&cfg);

    let names: Vec<&str> = views.iter().map(|p| p.name).collect();
    assert_eq!(names, ["w_q", "w_k", "w_v", "w_o", "b_q", "b_k", "b_v", "b_o"]);
    for view in &views {
        assert!(view.requires_grad);
        let numel: usize = view.shape.iter().product();
        assert_eq!(numel, view.data.len(), "{}: shape/data mismatch", view.name);
    }
    let total: usize = views.iter().map(|v| v.data.len()).sum();
    assert_eq!(total, params.num_params());
}

#[test]
fn test_apply_weight_gradients_moves_params() {
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let mut params = MonotonicAttentionParams::init(&cfg, 4);
    let before = params.w_q[0];
    let mut grads = MonotonicAttentionParams::zeros_like(&cfg);
    grads.w_q[0] = 2.0;
    params.apply_weight_gradients(&grads, 0.5);
    assert!((params.w_q[0] - (before - 1.0)).abs() < 1e-6);
}

// ══════════════════════════════════════════════════════════════════════
// Inspection and projection-only entry points
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_attn_matrix_shape_and_mass() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 6);
    let (bsz, tq, tk) = (2, 5, 3);
    let (query, key, _value) = make_inputs(&cfg, bsz, tq, tk, 12);

    let attn = get_attn_matrix(&registry, &params, &cfg, &query, &key, None, bsz, tq, tk);
    assert_eq!(attn.len(), bsz * cfg.num_heads * tq * tk);
    for &p in &attn {
        assert!(p.is_finite());
        assert!(p.exp() <= 1.0 + 1e-5);
    }
}

#[test]
fn test_projection_only_matches_forward_internals() {
    let registry = KernelRegistry::new();
    let cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    let params = MonotonicAttentionParams::init(&cfg, 6);
    let (bsz, tq, tk) = (1, 4, 2);
    let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 14);

    let xq = project_query(&params, &cfg, &query, bsz, tq);
    let xk = project_key(&params, &cfg, &key, bsz, tk);
    let xv = project_value(&params, &cfg, &value, bsz, tk);
    assert_eq!(xq.len(), bsz * tq * cfg.embed_dim);
    assert_eq!(xk.len(), bsz * tk * cfg.kv_embed_dim());
    assert_eq!(xv.len(), bsz * tk * cfg.kv_embed_dim());

    let (_out, cache) = attention_forward(
        &registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk,
    );
    assert_eq!(cache.xq, xq);
    assert_eq!(cache.xk, xk);
    assert_eq!(cache.xv, xv);
}

#[test]
fn test_incremental_decode_kv_state() {
    let mut cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    cfg.max_kv_cache_len = Some(4);
    let params = MonotonicAttentionParams::init(&cfg, 6);
    let bsz = 1;
    let mut cache = KvCache::new(&cfg, bsz);

    // Feed six single-step keys/values; the cache keeps the last four.
    let mut rng = SimpleRng::new(77);
    let mut last_xk = Vec::new();
    for _ in 0..6 {
        let mut key = vec![0.0f32; bsz * cfg.kdim];
        let mut value = vec![0.0f32; bsz * cfg.vdim];
        rng.fill_uniform(&mut key, 0.5);
        rng.fill_uniform(&mut value, 0.5);
        let xk = project_key(&params, &cfg, &key, bsz, 1);
        let xv = project_value(&params, &cfg, &value, bsz, 1);
        last_xk = xk.clone();
        cache.append(&xk, &xv, 1);
    }
    assert_eq!(cache.steps(), 4);
    let ekv = cfg.kv_embed_dim();
    assert_eq!(&cache.key()[3 * ekv..], &last_xk[..]);
}

// ══════════════════════════════════════════════════════════════════════
// Input gradients
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_query_gradient_matches_finite_differences() {
    let registry = KernelRegistry::new();
    let mut cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    cfg.embed_dim = 8;
    cfg.num_heads = 2;
    cfg.kdim = 8;
    cfg.vdim = 8;
    let params = MonotonicAttentionParams::init(&cfg, 42);
    let (bsz, tq, tk) = (1, 4, 2);
    let (query, key, value) = make_inputs(&cfg, bsz, tq, tk, 55);
    let mut seed = vec![0.0f32; bsz * tq * cfg.embed_dim];
    SimpleRng::new(56).fill_uniform(&mut seed, 1.0);

    let loss = |query: &[f32]| -> f32 {
        let (out, _cache) = attention_forward(
            &registry, &params, &cfg, query, &key, &value, None, bsz, tq, tk,
        );
        out.iter().zip(seed.iter()).map(|(o, s)| o * s).sum()
    };

    let (_out, cache) = attention_forward(
        &registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk,
    );
    let (_grads, d_query, _dk, _dv) = attention_backward(&params, &cfg, cache, &seed);

    let eps = 1e-2f32;
    let mut perturbed = query.clone();
    let mut checked = 0;
    let mut passed = 0;
    for idx in (0..query.len()).step_by(3) {
        let orig = query[idx];
        perturbed[idx] = orig + eps;
        let up = loss(&perturbed);
        perturbed[idx] = orig - eps;
        let down = loss(&perturbed);
        perturbed[idx] = orig;
        let fd = (up - down) / (2.0 * eps);

        checked += 1;
        let denom = fd.abs().max(d_query[idx].abs());
        if denom < 5e-4 || (fd - d_query[idx]).abs() / denom < 0.10 {
            passed += 1;
        } else {
            eprintln!("  FAIL d_query[{idx}]: fd={fd:.6e} analytic={:.6e}", d_query[idx]);
        }
    }
    assert_eq!(passed, checked);
}
