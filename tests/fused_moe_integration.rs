//! Integration tests for the fused MoE forward pass.
//!
//! Every test runs the full two-pass pipeline on the CPU and checks it
//! against the naive dense oracle, or against another run of itself.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use fused_moe_core::moe::fused::{renormalize_topk, GatedActivation, TileConfig};
use fused_moe_core::testing::{reference_moe_forward, MoeProblem};
use fused_moe_core::{fused_moe, FusedMoe, FusedMoeConfig, FusedMoeParams, MoeError};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn static_engine(tile: TileConfig) -> FusedMoe {
    FusedMoe::new(FusedMoeConfig::static_tile(tile)).unwrap()
}

fn small_tile() -> TileConfig {
    TileConfig {
        block_m: 16,
        block_n: 16,
        block_k: 8,
        group_size_m: 2,
        ..TileConfig::default()
    }
}

fn forward(engine: &FusedMoe, p: &MoeProblem, params: &FusedMoeParams) -> Tensor {
    engine
        .forward(&p.hidden, &p.w1, &p.w2, &p.topk_weights, &p.topk_ids, params)
        .unwrap()
}

fn reference(p: &MoeProblem) -> Tensor {
    reference_moe_forward(&p.hidden, &p.w1, &p.w2, &p.topk_weights, &p.topk_ids).unwrap()
}

/// Assert `|a - b| <= atol + rtol * |b|` elementwise.
fn assert_close(a: &Tensor, b: &Tensor, atol: f32, rtol: f32) {
    assert_eq!(a.dims(), b.dims());
    let a: Vec<f32> = a.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = b.to_dtype(DType::F32).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    for (i, (x, y)) in a.iter().zip(&b).enumerate() {
        assert!(
            (x - y).abs() <= atol + rtol * y.abs(),
            "element {i}: {x} vs {y}"
        );
    }
}

// ─── Numeric equivalence ─────────────────────────────────────────────────────

#[test]
fn test_small_case_matches_reference() {
    // 4 tokens, top_k = 2, 3 experts, hidden 8
    let p = MoeProblem::random(42, 4, 8, 8, 3, 2).unwrap();
    let out = forward(&static_engine(TileConfig::default()), &p, &FusedMoeParams::new(2));
    assert_close(&out, &reference(&p), 1e-6, 1e-5);
}

#[test]
fn test_every_candidate_tile_matches_reference() {
    let p = MoeProblem::random(43, 37, 24, 20, 5, 3).unwrap();
    let expected = reference(&p);
    for tile in TileConfig::candidates().into_iter().chain([small_tile()]) {
        let out = forward(&static_engine(tile), &p, &FusedMoeParams::new(3));
        assert_close(&out, &expected, 1e-5, 1e-5);
    }
}

#[test]
fn test_multi_tile_segments_with_ragged_edges() {
    // Segments longer than block_m, N not a multiple of block_n, K not a
    // multiple of block_k.
    let p = MoeProblem::random(44, 150, 40, 23, 4, 2).unwrap();
    let out = forward(&static_engine(small_tile()), &p, &FusedMoeParams::new(2));
    assert_close(&out, &reference(&p), 1e-5, 1e-5);
}

#[test]
fn test_boundary_single_token_single_expert() {
    let p = MoeProblem::random(45, 1, 8, 4, 1, 1).unwrap();
    let out = forward(&static_engine(TileConfig::default()), &p, &FusedMoeParams::new(1));
    assert_eq!(out.dims(), &[1, 8]);
    assert_close(&out, &reference(&p), 1e-6, 1e-5);
}

#[test]
fn test_idle_experts_leave_no_trace() {
    // 8 experts, but every token routes to experts 2 and 5 only.
    let p = MoeProblem::random(46, 10, 16, 8, 8, 2).unwrap();
    let ids = Tensor::from_vec(
        (0..20).map(|i| if i % 2 == 0 { 2u32 } else { 5 }).collect::<Vec<_>>(),
        (10, 2),
        &Device::Cpu,
    )
    .unwrap();
    let p = MoeProblem { topk_ids: ids, ..p };
    let out = forward(&static_engine(small_tile()), &p, &FusedMoeParams::new(2));
    let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
    assert_close(&out, &reference(&p), 1e-5, 1e-5);
}

// ─── Reduced precision ───────────────────────────────────────────────────────

#[test]
fn test_f16_within_tolerance() {
    let p = MoeProblem::random(47, 12, 32, 16, 4, 2).unwrap();
    let expected = reference(&p);
    let half = p.to_dtype(DType::F16).unwrap();
    let out = forward(&static_engine(TileConfig::default()), &half, &FusedMoeParams::new(2));
    assert_eq!(out.dtype(), DType::F16);
    assert_close(&out, &expected, 1e-2, 1e-2);
}

#[test]
fn test_bf16_within_tolerance() {
    let p = MoeProblem::random(48, 12, 32, 16, 4, 2).unwrap();
    let expected = reference(&p);
    let bf = p.to_dtype(DType::BF16).unwrap();
    let out = forward(&static_engine(small_tile()), &bf, &FusedMoeParams::new(2));
    assert_eq!(out.dtype(), DType::BF16);
    assert_close(&out, &expected, 5e-2, 5e-2);
}

// ─── Sharding ────────────────────────────────────────────────────────────────

#[test]
fn test_two_shards_sum_to_full() {
    let p = MoeProblem::random(49, 20, 16, 12, 6, 2).unwrap();
    let engine = static_engine(small_tile());
    let full = forward(&engine, &p, &FusedMoeParams::new(2));

    let mut total = Tensor::zeros(full.dims(), DType::F32, &Device::Cpu).unwrap();
    for (offset, count) in [(0, 3), (3, 3)] {
        let (w1, w2) = p.shard(offset, count).unwrap();
        let params = FusedMoeParams::new(2).with_shard(offset, 6);
        let part = engine
            .forward(&p.hidden, &w1, &w2, &p.topk_weights, &p.topk_ids, &params)
            .unwrap();
        total = total.add(&part).unwrap();
    }
    assert_close(&total, &full, 1e-6, 1e-6);
}

#[test]
fn test_uneven_shards_sum_to_full() {
    let p = MoeProblem::random(50, 9, 8, 8, 6, 3).unwrap();
    let engine = static_engine(TileConfig::wide());
    let full = forward(&engine, &p, &FusedMoeParams::new(3));

    let mut total = Tensor::zeros(full.dims(), DType::F32, &Device::Cpu).unwrap();
    for (offset, count) in [(0, 1), (1, 4), (5, 1)] {
        let (w1, w2) = p.shard(offset, count).unwrap();
        let params = FusedMoeParams::new(3).with_shard(offset, 6);
        let part = engine
            .forward(&p.hidden, &w1, &w2, &p.topk_weights, &p.topk_ids, &params)
            .unwrap();
        total = total.add(&part).unwrap();
    }
    assert_close(&total, &full, 1e-6, 1e-6);
}

#[test]
fn test_shard_without_routed_tokens_is_zero() {
    let p = MoeProblem::random(51, 4, 8, 4, 4, 1).unwrap();
    let ids = Tensor::new(&[[0u32], [1], [0], [1]], &Device::Cpu).unwrap();
    let p = MoeProblem { topk_ids: ids, ..p };
    let (w1, w2) = p.shard(2, 2).unwrap();
    let out = static_engine(TileConfig::default())
        .forward(
            &p.hidden,
            &w1,
            &w2,
            &p.topk_weights,
            &p.topk_ids,
            &FusedMoeParams::new(1).with_shard(2, 4),
        )
        .unwrap();
    let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
    assert!(values.iter().all(|&v| v == 0.0));
}

// ─── Strided operands ────────────────────────────────────────────────────────

#[test]
fn test_transposed_weights_match_contiguous() {
    let p = MoeProblem::random(52, 11, 16, 8, 3, 2).unwrap();
    let engine = static_engine(small_tile());
    let expected = forward(&engine, &p, &FusedMoeParams::new(2));

    // Same values, stored as (E, K, N) and viewed back as (E, N, K).
    let w1 = p.w1.transpose(1, 2).unwrap().contiguous().unwrap().transpose(1, 2).unwrap();
    let w2 = p.w2.transpose(1, 2).unwrap().contiguous().unwrap().transpose(1, 2).unwrap();
    assert!(!w1.is_contiguous());
    let out = engine
        .forward(&p.hidden, &w1, &w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(2))
        .unwrap();
    assert_close(&out, &expected, 0.0, 0.0);
}

#[test]
fn test_narrowed_hidden_states() {
    let p = MoeProblem::random(53, 6, 8, 4, 2, 1).unwrap();
    let engine = static_engine(TileConfig::default());
    let expected = forward(&engine, &p, &FusedMoeParams::new(1));

    // Hidden rows embedded in a wider buffer.
    let padding = Tensor::ones((6, 5), DType::F32, &Device::Cpu).unwrap();
    let wide = Tensor::cat(&[&padding, &p.hidden], 1).unwrap();
    let hidden = wide.narrow(1, 5, 8).unwrap();
    let out = engine
        .forward(&hidden, &p.w1, &p.w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(1))
        .unwrap();
    assert_close(&out, &expected, 0.0, 0.0);
}

// ─── Renormalization ─────────────────────────────────────────────────────────

#[test]
fn test_renormalize_is_idempotent() {
    let mut once = vec![0.2f32, 0.6, 1.5, 0.5, 0.0, 0.0];
    renormalize_topk(&mut once, 2);
    let mut twice = once.clone();
    renormalize_topk(&mut twice, 2);
    for (a, b) in once.iter().zip(&twice) {
        assert!((a - b).abs() < 1e-7);
    }
    assert_eq!(&once[4..], &[0.0, 0.0]);
}

#[test]
fn test_renormalize_flag_matches_prenormalized_weights() {
    let p = MoeProblem::random(54, 7, 8, 8, 4, 2).unwrap();
    let engine = static_engine(TileConfig::default());
    let expected = forward(&engine, &p, &FusedMoeParams::new(2));

    // Scale every token's weights by a different factor.
    let scale = Tensor::new(&[[2f32], [0.5], [3.0], [1.0], [4.0], [0.25], [7.0]], &Device::Cpu)
        .unwrap();
    let scaled = p.topk_weights.broadcast_mul(&scale).unwrap();
    let out = engine
        .forward(
            &p.hidden,
            &p.w1,
            &p.w2,
            &scaled,
            &p.topk_ids,
            &FusedMoeParams::new(2).with_renormalize(true),
        )
        .unwrap();
    assert_close(&out, &expected, 1e-6, 1e-5);
}

// ─── Collaborators ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct ZeroActivation;

impl GatedActivation for ZeroActivation {
    fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (rows, width) = x.dims2()?;
        Tensor::zeros((rows, width / 2), x.dtype(), x.device())
    }
}

#[test]
fn test_custom_activation_is_used() {
    let p = MoeProblem::random(55, 5, 8, 4, 2, 2).unwrap();
    let engine = static_engine(TileConfig::default()).with_activation(Arc::new(ZeroActivation));
    let out = forward(&engine, &p, &FusedMoeParams::new(2));
    let values: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
    assert!(values.iter().all(|&v| v == 0.0));
}

#[test]
fn test_free_function_with_process_defaults() {
    let p = MoeProblem::random(56, 3, 8, 4, 2, 1).unwrap();
    let out = fused_moe(
        &p.hidden,
        &p.w1,
        &p.w2,
        &p.topk_weights,
        &p.topk_ids,
        &FusedMoeParams::new(1),
    )
    .unwrap();
    assert_close(&out, &reference(&p), 1e-6, 1e-5);
}

#[test]
fn test_engines_share_an_autotune_cache() {
    let p = MoeProblem::random(57, 8, 16, 8, 2, 1).unwrap();
    let config = FusedMoeConfig {
        warmup: 0,
        rep: 1,
        ..FusedMoeConfig::default()
    };
    let first = FusedMoe::new(config.clone()).unwrap();
    let second = FusedMoe::new(config)
        .unwrap()
        .with_autotuner(first.autotuner().clone());
    forward(&first, &p, &FusedMoeParams::new(1));
    let decisions = first.autotuner().snapshot();
    forward(&second, &p, &FusedMoeParams::new(1));
    assert_eq!(second.autotuner().snapshot(), decisions);
}

// ─── Error surfaces ──────────────────────────────────────────────────────────

#[test]
fn test_expert_count_mismatch_between_weights() {
    let p = MoeProblem::random(58, 2, 8, 4, 3, 1).unwrap();
    let w2 = p.w2.narrow(0, 0, 2).unwrap();
    let err = static_engine(TileConfig::default())
        .forward(&p.hidden, &p.w1, &w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(1))
        .unwrap_err();
    assert!(matches!(err, MoeError::Configuration { .. }));
}

#[test]
fn test_routing_shape_mismatch() {
    let p = MoeProblem::random(59, 4, 8, 4, 3, 2).unwrap();
    let err = static_engine(TileConfig::default())
        .forward(&p.hidden, &p.w1, &p.w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(1))
        .unwrap_err();
    assert!(matches!(err, MoeError::ShapeMismatch { what: "topk_ids", .. }));
}

#[test]
fn test_down_contraction_mismatch() {
    let p = MoeProblem::random(60, 2, 8, 4, 2, 1).unwrap();
    let w2 = Tensor::zeros((2, 8, 3), DType::F32, &Device::Cpu).unwrap();
    let err = static_engine(TileConfig::default())
        .forward(&p.hidden, &p.w1, &w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(1))
        .unwrap_err();
    assert!(matches!(err, MoeError::ShapeMismatch { what: "w2 contraction dim", .. }));
}

#[test]
fn test_odd_gate_up_width_rejected_before_launch() {
    let p = MoeProblem::random(62, 2, 8, 4, 2, 1).unwrap();
    // ffn = 9 / 2 = 4 still matches w2's contraction dim.
    let w1 = Tensor::zeros((2, 9, 8), DType::F32, &Device::Cpu).unwrap();
    let engine = FusedMoe::new(FusedMoeConfig {
        warmup: 0,
        rep: 1,
        ..FusedMoeConfig::default()
    })
    .unwrap();
    let err = engine
        .forward(&p.hidden, &w1, &p.w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(1))
        .unwrap_err();
    assert!(matches!(err, MoeError::ShapeMismatch { what: "w1 gate/up width", .. }));
    // Rejected at entry: nothing was tuned.
    assert!(engine.autotuner().snapshot().is_empty());
}

#[test]
fn test_mixed_dtypes_rejected() {
    let p = MoeProblem::random(61, 2, 8, 4, 2, 1).unwrap();
    let w1 = p.w1.to_dtype(DType::F16).unwrap();
    let err = static_engine(TileConfig::default())
        .forward(&p.hidden, &w1, &p.w2, &p.topk_weights, &p.topk_ids, &FusedMoeParams::new(1))
        .unwrap_err();
    assert!(matches!(err, MoeError::Configuration { .. }));
}
