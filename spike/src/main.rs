// Standalone gradient-check harness for the monotonic-alignment kernels.
//
// Runs the same central-difference checks the test suite uses, but as a
// plain binary with [PASS]/[FAIL] reporting, so the numerics can be
// eyeballed on a new toolchain or platform without the test harness.
//
// Run with: cargo run --release -p monoalign-spike

use monoalign_core::attention::{
    attention_backward, attention_forward, AttentionMode, MonotonicAttentionConfig,
    MonotonicAttentionParams,
};
use monoalign_core::dispatch::KernelRegistry;
use monoalign_core::gradient::{
    check_alignment_gradient, check_attention_weight_gradient, zero_unreachable_weights,
};
use monoalign_core::tensor::SimpleRng;

const FD_EPS: f32 = 1e-2;

fn random_buf(n: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = SimpleRng::new(seed);
    let mut buf = vec![0.0f32; n];
    rng.fill_uniform(&mut buf, scale);
    buf
}

/// Operator checks across a few grid shapes. Returns (pass, fail).
fn run_operator_checks() -> (usize, usize) {
    let shapes = [(1usize, 1usize, 1usize), (1, 4, 2), (2, 4, 3), (1, 8, 8), (2, 6, 2)];
    let mut pass = 0;
    let mut fail = 0;
    for (i, &(bsz, src, tgt)) in shapes.iter().enumerate() {
        let n = bsz * src * tgt;
        let logits = random_buf(n, 100 + i as u64, 2.5);
        let mut weights = random_buf(n, 200 + i as u64, 1.0);
        zero_unreachable_weights(&logits, &mut weights, bsz, src, tgt);
        let (checked, passed, max_err) =
            check_alignment_gradient(&logits, &weights, bsz, src, tgt, n, FD_EPS, 5e-2);
        let ok = passed == checked;
        println!(
            "  [{}] operator B={bsz} S={src} T={tgt}: {passed}/{checked} (max_rel_err={max_err:.2e})",
            if ok { "PASS" } else { "FAIL" }
        );
        if ok { pass += 1 } else { fail += 1 }
    }
    (pass, fail)
}

/// Layer weight checks for each projection matrix. Returns (pass, fail).
fn run_layer_checks() -> (usize, usize) {
    let registry = KernelRegistry::new();
    let mut cfg = MonotonicAttentionConfig::test_config(AttentionMode::OneKeyManyQueries);
    cfg.embed_dim = 8;
    cfg.num_heads = 2;
    cfg.kdim = 8;
    cfg.vdim = 8;
    let params = MonotonicAttentionParams::init(&cfg, 42);
    let (bsz, tq, tk) = (1usize, 5usize, 3usize);
    let query = random_buf(bsz * tq * cfg.embed_dim, 1, 0.5);
    let key = random_buf(bsz * tk * cfg.kdim, 2, 0.5);
    let value = random_buf(bsz * tk * cfg.vdim, 3, 0.5);
    let seed = random_buf(bsz * tq * cfg.embed_dim, 4, 1.0);

    let (_out, cache) =
        attention_forward(&registry, &params, &cfg, &query, &key, &value, None, bsz, tq, tk);
    let (grads, _dq, _dk, _dv) = attention_backward(&params, &cfg, cache, &seed);

    type Get = fn(&MonotonicAttentionParams) -> &Vec<f32>;
    type Set = fn(&mut MonotonicAttentionParams, usize, f32);
    let weights: [(&str, Get, Set); 4] = [
        ("w_q", |p| &p.w_q, |p, i, v| p.w_q[i] = v),
        ("w_k", |p| &p.w_k, |p, i, v| p.w_k[i] = v),
        ("w_v", |p| &p.w_v, |p, i, v| p.w_v[i] = v),
        ("w_o", |p| &p.w_o, |p, i, v| p.w_o[i] = v),
    ];

    let mut pass = 0;
    let mut fail = 0;
    for (name, get, set) in weights {
        let (checked, passed, max_err) = check_attention_weight_gradient(
            &registry, &params, &cfg, &query, &key, &value, &seed, &grads,
            name, get, set, get,
            bsz, tq, tk, 16, FD_EPS, 0.10,
        );
        let ok = passed == checked;
        println!(
            "  [{}] layer {name}: {passed}/{checked} (max_rel_err={max_err:.2e})",
            if ok { "PASS" } else { "FAIL" }
        );
        if ok { pass += 1 } else { fail += 1 }
    }
    (pass, fail)
}

fn main() {
    println!("monoalign gradient checks");
    println!("=========================");

    println!("\nAlignment operator vs central differences:");
    let (op_pass, op_fail) = run_operator_checks();

    println!("\nAttention layer weights vs central differences:");
    let (layer_pass, layer_fail) = run_layer_checks();

    let pass = op_pass + layer_pass;
    let fail = op_fail + layer_fail;
    println!("\nTotal: {pass}/{} checks passed", pass + fail);
    if fail > 0 {
        println!("OUTCOME: {fail} checks failed — inspect the FAIL lines above.");
    } else {
        println!("OUTCOME: all gradient checks passed.");
    }

    std::process::exit(if fail > 0 { 1 } else { 0 });
}
