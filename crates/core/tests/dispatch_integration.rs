//! End-to-end dispatch tests on the CPU device.
//!
//! Numerical checks rely on one property of causal attention: decoding token
//! `t` against a cached history must reproduce row `t` of a single prefill
//! over the same tokens.

use candle_core::{DType, Device, Tensor};
use mixattn_core::config::PositionEmbedding;
use mixattn_core::kernels::ReferenceKernels;
use mixattn_core::kv_cache::{
    BlockPointerTable, KvCacheQuantMode, PagedKvBuffer, QuantizationScales,
};
use mixattn_core::testing::{
    linear_cache, max_abs, mixed_batch, random_activations, tiny_config, tiny_linear_config,
    zero_output, PagedFixture, TINY_HEAD_SIZE,
};
use mixattn_core::workspace::{generation_layout, KernelGeometry};
use mixattn_core::{
    AttentionConfig, AttentionDispatchEngine, AttentionError, BatchDescriptor, BatchInputs,
    BatchOutputs, CacheIndirection, ErrorKind, KvCacheInput, Request, Workspace,
};

const HS: usize = TINY_HEAD_SIZE;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn engine(config: &AttentionConfig, cache_shape: &[usize]) -> AttentionDispatchEngine {
    let mut engine = AttentionDispatchEngine::new(config.clone(), ReferenceKernels::new()).unwrap();
    engine.configure(cache_shape).unwrap();
    engine
}

fn qkv_hidden(config: &AttentionConfig) -> usize {
    config.qkv_hidden(HS)
}

fn out_hidden(config: &AttentionConfig) -> usize {
    config.output_hidden(HS)
}

fn diff(a: &Tensor, b: &Tensor) -> f32 {
    max_abs(&(a.to_dtype(DType::F32).unwrap() - b.to_dtype(DType::F32).unwrap()).unwrap())
}

fn rows(t: &Tensor, start: usize, len: usize) -> Tensor {
    t.narrow(0, start, len).unwrap()
}

/// Prefill `tokens` (`[len, qkv_hidden]`) as one padded request on a linear cache.
fn prefill_linear(
    config: &AttentionConfig,
    cache: &Tensor,
    tokens: &Tensor,
) -> Tensor {
    let len = tokens.dim(0).unwrap();
    let engine = engine(config, cache.dims());
    let qkv = tokens.reshape((1, len, qkv_hidden(config))).unwrap();
    let out = zero_output(config, &[1, len, out_hidden(config)]);
    let mut ws = Workspace::new(engine.workspace_size(1).unwrap());
    let inputs = BatchInputs::new(&qkv, KvCacheInput::Linear(cache));
    engine
        .run(
            &mixed_batch(&[len], &[]),
            &inputs,
            &BatchOutputs::new(&out),
            &mut ws,
        )
        .unwrap();
    out.squeeze(0).unwrap()
}

/// Prefill `tokens` as a single packed request on a fresh paged cache.
fn prefill_paged_alone(config: &AttentionConfig, tokens: &Tensor) -> Tensor {
    let len = tokens.dim(0).unwrap();
    let mut fx = PagedFixture::new(config, 1, 8, 4, 4, HS);
    fx.reserve(0, len).unwrap();
    let table = fx.pointer_table().unwrap();
    let engine = engine(config, fx.pool.storage().dims());
    let out = zero_output(config, &[len, out_hidden(config)]);
    let inputs = BatchInputs::new(
        tokens,
        KvCacheInput::Paged {
            pool: &fx.pool,
            block_pointers: &table,
        },
    );
    let mut ws = Workspace::new(engine.workspace_size(1).unwrap());
    engine
        .run(&mixed_batch(&[len], &[]), &inputs, &BatchOutputs::new(&out), &mut ws)
        .unwrap();
    out
}

// ─── Mixed batches on a paged cache ──────────────────────────────────────────

#[test]
fn mixed_paged_batch_matches_separate_prefills() {
    let config = tiny_config();
    let hidden = qkv_hidden(&config);
    let ctx0 = random_activations(&config, &[5, hidden]);
    let ctx1 = random_activations(&config, &[7, hidden]);
    let hist2 = random_activations(&config, &[5, hidden]);
    let hist3 = random_activations(&config, &[10, hidden]);

    let mut fx = PagedFixture::new(&config, 4, 32, 4, 4, HS);
    let engine = engine(&config, fx.pool.storage().dims());
    let mut ws = Workspace::new(engine.workspace_size(4).unwrap());

    // History of the two decoding sequences.
    fx.reserve(2, 4).unwrap();
    fx.reserve(3, 9).unwrap();
    {
        let table =
            BlockPointerTable::from_block_tables(&[&fx.tables[2], &fx.tables[3]], &fx.pool, 4)
                .unwrap();
        let qkv = Tensor::cat(&[&rows(&hist2, 0, 4), &rows(&hist3, 0, 9)], 0).unwrap();
        let out = zero_output(&config, &[13, out_hidden(&config)]);
        let inputs = BatchInputs::new(
            &qkv,
            KvCacheInput::Paged {
                pool: &fx.pool,
                block_pointers: &table,
            },
        );
        engine
            .run(&mixed_batch(&[4, 9], &[]), &inputs, &BatchOutputs::new(&out), &mut ws)
            .unwrap();
    }

    fx.reserve(0, 5).unwrap();
    fx.reserve(1, 7).unwrap();
    fx.reserve(2, 1).unwrap();
    fx.reserve(3, 1).unwrap();
    let table = fx.pointer_table().unwrap();
    let qkv = Tensor::cat(&[&ctx0, &ctx1, &rows(&hist2, 4, 1), &rows(&hist3, 9, 1)], 0).unwrap();
    let out = zero_output(&config, &[14, out_hidden(&config)]);
    let inputs = BatchInputs::new(
        &qkv,
        KvCacheInput::Paged {
            pool: &fx.pool,
            block_pointers: &table,
        },
    );
    let partition = engine
        .run(&mixed_batch(&[5, 7], &[4, 9]), &inputs, &BatchOutputs::new(&out), &mut ws)
        .unwrap();
    assert_eq!(partition.num_context_requests, 2);
    assert_eq!(partition.context_token_count, 12);
    assert_eq!(partition.num_generation_requests, 2);

    let paged = PagedKvBuffer::new(&fx.pool, &table);
    let expected_blocks = [2, 2, 2, 3];
    for (seq, &blocks) in expected_blocks.iter().enumerate() {
        assert_eq!(paged.valid_blocks(seq).unwrap(), blocks, "sequence {seq}");
    }

    let tol = 1e-4;
    assert!(diff(&rows(&out, 0, 5), &prefill_paged_alone(&config, &ctx0)) < tol);
    assert!(diff(&rows(&out, 5, 7), &prefill_paged_alone(&config, &ctx1)) < tol);
    assert!(diff(&rows(&out, 12, 1), &rows(&prefill_paged_alone(&config, &hist2), 4, 1)) < tol);
    assert!(diff(&rows(&out, 13, 1), &rows(&prefill_paged_alone(&config, &hist3), 9, 1)) < tol);
}

#[test]
fn valid_blocks_track_history_length() {
    let config = tiny_config();
    let mut fx = PagedFixture::new(&config, 3, 16, 4, 4, HS);
    for (seq, len) in [(0, 1), (1, 4), (2, 13)] {
        fx.reserve(seq, len).unwrap();
    }
    let table = fx.pointer_table().unwrap();
    let paged = PagedKvBuffer::new(&fx.pool, &table);
    for (seq, len) in [(0usize, 1usize), (1, 4), (2, 13)] {
        assert_eq!(paged.valid_blocks(seq).unwrap(), len.div_ceil(4));
    }
}

// ─── Linear cache: prefill then decode ───────────────────────────────────────

#[test]
fn decode_reproduces_prefill_for_every_position_embedding() {
    for embedding in [
        PositionEmbedding::LearnedAbsolute,
        PositionEmbedding::RopeGptj,
        PositionEmbedding::RopeGptNeox,
        PositionEmbedding::Alibi,
        PositionEmbedding::AlibiWithScale,
    ] {
        let config = AttentionConfig {
            position_embedding: embedding,
            ..tiny_linear_config()
        };
        let tokens = random_activations(&config, &[6, qkv_hidden(&config)]);

        let full_cache = linear_cache(&config, 1, 16, HS);
        let full = prefill_linear(&config, &full_cache, &tokens);

        let cache = linear_cache(&config, 1, 16, HS);
        let prefix = prefill_linear(&config, &cache, &rows(&tokens, 0, 5));
        assert!(diff(&prefix, &rows(&full, 0, 5)) < 1e-4, "{embedding:?} prefix");

        let engine = engine(&config, cache.dims());
        let qkv = rows(&tokens, 5, 1).reshape((1, 1, qkv_hidden(&config))).unwrap();
        let out = zero_output(&config, &[1, 1, out_hidden(&config)]);
        let mut ws = Workspace::new(engine.workspace_size(1).unwrap());
        let batch = BatchDescriptor::new(vec![Request::generation(5, 5)]);
        engine
            .run(
                &batch,
                &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
                &BatchOutputs::new(&out),
                &mut ws,
            )
            .unwrap();
        let decoded = out.reshape((1, out_hidden(&config))).unwrap();
        assert!(diff(&decoded, &rows(&full, 5, 1)) < 1e-4, "{embedding:?} decode");

        // Both paths leave the same six cache positions behind.
        let written = |c: &Tensor| c.narrow(3, 0, 6).unwrap();
        assert!(diff(&written(&cache), &written(&full_cache)) < 1e-5, "{embedding:?} cache");
    }
}

#[test]
fn padded_context_zeroes_padding_rows() {
    let config = tiny_linear_config();
    let qkv = random_activations(&config, &[2, 5, qkv_hidden(&config)]);
    let cache = linear_cache(&config, 2, 8, HS);
    let out = Tensor::ones((2, 5, out_hidden(&config)), DType::F32, &Device::Cpu).unwrap();
    let engine = engine(&config, cache.dims());
    let mut ws = Workspace::new(engine.workspace_size(2).unwrap());
    let partition = engine
        .run(
            &mixed_batch(&[3, 5], &[]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&out),
            &mut ws,
        )
        .unwrap();
    assert_eq!(partition.context_token_count, 10);
    assert_eq!(max_abs(&out.get(0).unwrap().narrow(0, 3, 2).unwrap()), 0.0);
    assert!(max_abs(&out.get(1).unwrap()) > 0.0);
}

#[test]
fn multi_block_decode_matches_single_pass() {
    let base = AttentionConfig {
        max_context_length: 320,
        max_sequence_length: 512,
        ..tiny_linear_config()
    };
    let tokens = random_activations(&base, &[301, qkv_hidden(&base)]);

    let mut outputs = Vec::new();
    for multi_block_mode in [false, true] {
        let config = AttentionConfig {
            multi_block_mode,
            ..base.clone()
        };
        let cache = linear_cache(&config, 1, 512, HS);
        prefill_linear(&config, &cache, &rows(&tokens, 0, 300));

        let engine = engine(&config, cache.dims());
        let qkv = rows(&tokens, 300, 1).reshape((1, 1, qkv_hidden(&config))).unwrap();
        let out = zero_output(&config, &[1, 1, out_hidden(&config)]);
        let mut ws = Workspace::new(engine.workspace_size(1).unwrap());
        engine
            .run(
                &BatchDescriptor::new(vec![Request::generation(300, 300)]),
                &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
                &BatchOutputs::new(&out),
                &mut ws,
            )
            .unwrap();

        if multi_block_mode {
            let layout = generation_layout(
                &KernelGeometry::new(&config, HS, false),
                config.precision,
                1,
            );
            let mut regions = ws.carve(&layout).unwrap();
            // 301 keys over 256-token tiles
            assert_eq!(
                regions.read_i32s("block_counter", config.num_heads).unwrap(),
                vec![2; config.num_heads]
            );
        }
        outputs.push(out);
    }
    assert!(diff(&outputs[0], &outputs[1]) < 1e-4);
}

// ─── Beam search ─────────────────────────────────────────────────────────────

#[test]
fn beam_indirection_redirects_history() {
    let config = tiny_linear_config();
    let hidden = qkv_hidden(&config);
    let cache = linear_cache(&config, 8, 8, HS);
    let engine = engine(&config, cache.dims());
    let mut ws = Workspace::new(engine.workspace_size(8).unwrap());

    let history = random_activations(&config, &[8, 3, hidden]);
    let prefill_out = zero_output(&config, &[8, 3, out_hidden(&config)]);
    engine
        .run(
            &mixed_batch(&[3; 8], &[]),
            &BatchInputs::new(&history, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&prefill_out),
            &mut ws,
        )
        .unwrap();

    // Beams 0 and 1 of request 0 decode the same token; beam 1 reads beam 0's history.
    let new_tokens = random_activations(&config, &[8, hidden]);
    let shared = rows(&new_tokens, 0, 1);
    let qkv = Tensor::cat(&[&shared, &shared, &rows(&new_tokens, 2, 6)], 0)
        .unwrap()
        .reshape((8, 1, hidden))
        .unwrap();
    let mut indirection = CacheIndirection::identity(2, 4, 8);
    for pos in 0..3 {
        indirection.set(0, 1, pos, 0).unwrap();
    }
    let mut batch = BatchDescriptor::new(vec![Request::generation(3, 3); 8]);
    batch.assign_beams(4);
    let out = zero_output(&config, &[8, 1, out_hidden(&config)]);
    engine
        .run(
            &batch,
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache))
                .with_cache_indirection(&indirection),
            &BatchOutputs::new(&out),
            &mut ws,
        )
        .unwrap();

    let beam0 = out.get(0).unwrap();
    assert!(diff(&beam0, &out.get(1).unwrap()) < 1e-5);
    assert!(diff(&beam0, &out.get(4).unwrap()) > 1e-3);
}

#[test]
fn beam_indices_must_follow_slot_order() {
    let config = tiny_linear_config();
    let hidden = qkv_hidden(&config);
    let cache = linear_cache(&config, 8, 8, HS);
    let engine = engine(&config, cache.dims());
    let mut ws = Workspace::new(engine.workspace_size(8).unwrap());
    let indirection = CacheIndirection::identity(2, 4, 8);

    let qkv = random_activations(&config, &[8, 1, hidden]);
    let out = zero_output(&config, &[8, 1, out_hidden(&config)]);
    // Every request left at beam 0, so slot 1 disagrees with its position.
    let err = engine
        .run(
            &BatchDescriptor::new(vec![Request::generation(3, 3); 8]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache))
                .with_cache_indirection(&indirection),
            &BatchOutputs::new(&out),
            &mut ws,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchContract);
    assert!(err.to_string().contains("slot 1"), "{err}");
    assert_eq!(max_abs(&out), 0.0);
    assert_eq!(max_abs(&cache), 0.0);
}

#[test]
fn beam_width_must_divide_generation_slice() {
    let config = tiny_linear_config();
    let hidden = qkv_hidden(&config);
    let cache = linear_cache(&config, 8, 8, HS);
    let engine = engine(&config, cache.dims());
    let mut ws = Workspace::new(engine.workspace_size(8).unwrap());
    let indirection = CacheIndirection::identity(2, 4, 8);

    let qkv = random_activations(&config, &[7, 1, hidden]);
    let out = zero_output(&config, &[7, 1, out_hidden(&config)]);
    let err = engine
        .run(
            &BatchDescriptor::new(vec![Request::generation(3, 3); 7]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache))
                .with_cache_indirection(&indirection),
            &BatchOutputs::new(&out),
            &mut ws,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AttentionError::BeamWidthMismatch {
            batch_beam: 7,
            beam_width: 4
        }
    ));
    assert_eq!(max_abs(&out), 0.0);
}

// ─── Quantized caches ────────────────────────────────────────────────────────

#[test]
fn quantized_cache_decode_stays_close_to_full_precision() {
    let base = tiny_linear_config();
    let tokens = random_activations(&base, &[6, qkv_hidden(&base)]);
    let full = prefill_linear(&base, &linear_cache(&base, 1, 16, HS), &tokens);

    for (mode, tol) in [(KvCacheQuantMode::Int8, 0.1), (KvCacheQuantMode::Fp8, 0.3)] {
        let config = AttentionConfig {
            kv_cache_quant: mode,
            ..base.clone()
        };
        let cache = linear_cache(&config, 1, 16, HS);
        assert_eq!(cache.dtype(), DType::U8);
        let scales = QuantizationScales::from_amax(6.0, mode);
        let engine = engine(&config, cache.dims());
        let mut ws = Workspace::new(engine.workspace_size(1).unwrap());

        let prefix = rows(&tokens, 0, 5).reshape((1, 5, qkv_hidden(&config))).unwrap();
        let prefix_out = zero_output(&config, &[1, 5, out_hidden(&config)]);
        engine
            .run(
                &mixed_batch(&[5], &[]),
                &BatchInputs::new(&prefix, KvCacheInput::Linear(&cache)).with_scales(scales),
                &BatchOutputs::new(&prefix_out),
                &mut ws,
            )
            .unwrap();

        let qkv = rows(&tokens, 5, 1).reshape((1, 1, qkv_hidden(&config))).unwrap();
        let out = zero_output(&config, &[1, 1, out_hidden(&config)]);
        engine
            .run(
                &BatchDescriptor::new(vec![Request::generation(5, 5)]),
                &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)).with_scales(scales),
                &BatchOutputs::new(&out),
                &mut ws,
            )
            .unwrap();
        let decoded = out.reshape((1, out_hidden(&config))).unwrap();
        let err = diff(&decoded, &rows(&full, 5, 1));
        assert!(err < tol, "{mode:?} decode error {err}");
    }
}

#[test]
fn quantized_cache_without_scales_is_rejected() {
    let config = AttentionConfig {
        kv_cache_quant: KvCacheQuantMode::Int8,
        ..tiny_linear_config()
    };
    let cache = linear_cache(&config, 1, 8, HS);
    let engine = engine(&config, cache.dims());
    let qkv = random_activations(&config, &[1, 4, qkv_hidden(&config)]);
    let out = zero_output(&config, &[1, 4, out_hidden(&config)]);
    let err = engine
        .run(
            &mixed_batch(&[4], &[]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&out),
            &mut Workspace::new(engine.workspace_size(1).unwrap()),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BatchContract);
    assert_eq!(max_abs(&out), 0.0);
}

#[test]
fn degenerate_quantization_scales_are_rejected() {
    let config = AttentionConfig {
        kv_cache_quant: KvCacheQuantMode::Int8,
        ..tiny_linear_config()
    };
    let cache = linear_cache(&config, 1, 8, HS);
    let engine = engine(&config, cache.dims());
    let qkv = random_activations(&config, &[1, 4, qkv_hidden(&config)]);
    let out = zero_output(&config, &[1, 4, out_hidden(&config)]);
    let snapshot = cache.copy().unwrap();
    for scales in [
        QuantizationScales::new(0.0, 1.0),
        QuantizationScales::new(f32::NAN, f32::NAN),
        QuantizationScales::new(1.0, f32::INFINITY),
    ] {
        let err = engine
            .run(
                &mixed_batch(&[4], &[]),
                &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)).with_scales(scales),
                &BatchOutputs::new(&out),
                &mut Workspace::new(engine.workspace_size(1).unwrap()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BatchContract, "{scales:?}");
        assert_eq!(max_abs(&out), 0.0);
        assert_eq!(diff(&cache, &snapshot), 0.0);
    }
}

// ─── Contract violations ─────────────────────────────────────────────────────

#[test]
fn mixed_batch_on_linear_cache_is_rejected_untouched() {
    let config = AttentionConfig {
        cache_layout: mixattn_core::CacheLayout::Linear,
        ..tiny_config()
    };
    let cache = linear_cache(&config, 2, 8, HS);
    let engine = engine(&config, cache.dims());
    let qkv = random_activations(&config, &[4, qkv_hidden(&config)]);
    let out = zero_output(&config, &[4, out_hidden(&config)]);
    let err = engine
        .run(
            &mixed_batch(&[3], &[2]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&out),
            &mut Workspace::new(engine.workspace_size(2).unwrap()),
        )
        .unwrap_err();
    assert!(matches!(err, AttentionError::MixedBatchUnsupported { .. }));
    assert_eq!(max_abs(&out), 0.0);
    assert_eq!(max_abs(&cache), 0.0);
}

#[test]
fn interleaved_phases_are_rejected() {
    let config = tiny_config();
    let mut fx = PagedFixture::new(&config, 3, 16, 4, 4, HS);
    for seq in 0..3 {
        fx.reserve(seq, 4).unwrap();
    }
    let table = fx.pointer_table().unwrap();
    let engine = engine(&config, fx.pool.storage().dims());
    let qkv = random_activations(&config, &[6, qkv_hidden(&config)]);
    let out = zero_output(&config, &[6, out_hidden(&config)]);
    let batch = BatchDescriptor::new(vec![
        Request::context(3),
        Request::generation(2, 2),
        Request::context(2),
    ]);
    let err = engine
        .run(
            &batch,
            &BatchInputs::new(
                &qkv,
                KvCacheInput::Paged {
                    pool: &fx.pool,
                    block_pointers: &table,
                },
            ),
            &BatchOutputs::new(&out),
            &mut Workspace::new(engine.workspace_size(3).unwrap()),
        )
        .unwrap_err();
    assert!(matches!(err, AttentionError::PhaseInterleaved { index: 2, .. }));
}

#[test]
fn packed_row_count_must_match_batch() {
    let config = tiny_config();
    let mut fx = PagedFixture::new(&config, 2, 16, 4, 4, HS);
    fx.reserve(0, 5).unwrap();
    fx.reserve(1, 3).unwrap();
    let table = fx.pointer_table().unwrap();
    let engine = engine(&config, fx.pool.storage().dims());
    let qkv = random_activations(&config, &[7, qkv_hidden(&config)]);
    let out = zero_output(&config, &[7, out_hidden(&config)]);
    let err = engine
        .run(
            &mixed_batch(&[5, 3], &[]),
            &BatchInputs::new(
                &qkv,
                KvCacheInput::Paged {
                    pool: &fx.pool,
                    block_pointers: &table,
                },
            ),
            &BatchOutputs::new(&out),
            &mut Workspace::new(engine.workspace_size(2).unwrap()),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn context_longer_than_configured_maximum_is_rejected() {
    let config = AttentionConfig {
        max_context_length: 4,
        ..tiny_linear_config()
    };
    let cache = linear_cache(&config, 1, 16, HS);
    let engine = engine(&config, cache.dims());
    let qkv = random_activations(&config, &[1, 6, qkv_hidden(&config)]);
    let out = zero_output(&config, &[1, 6, out_hidden(&config)]);
    let err = engine
        .run(
            &mixed_batch(&[6], &[]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&out),
            &mut Workspace::new(1 << 16),
        )
        .unwrap_err();
    assert!(matches!(err, AttentionError::ContextTooLong { length: 6, max: 4 }));
}

#[test]
fn padded_width_beyond_configured_maximum_is_rejected() {
    let config = AttentionConfig {
        max_context_length: 4,
        ..tiny_linear_config()
    };
    let cache = linear_cache(&config, 1, 16, HS);
    let engine = engine(&config, cache.dims());
    // Short prompt, but the padded dimension itself exceeds the maximum.
    let qkv = random_activations(&config, &[1, 12, qkv_hidden(&config)]);
    let out = zero_output(&config, &[1, 12, out_hidden(&config)]);
    let err = engine
        .run(
            &mixed_batch(&[3], &[]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&out),
            &mut Workspace::new(1 << 20),
        )
        .unwrap_err();
    assert!(matches!(err, AttentionError::ContextTooLong { length: 12, max: 4 }));
    assert_eq!(err.kind(), ErrorKind::BatchContract);
    assert_eq!(max_abs(&out), 0.0);
    assert_eq!(max_abs(&cache), 0.0);
}

#[test]
fn undersized_workspace_is_rejected() {
    let config = tiny_linear_config();
    let cache = linear_cache(&config, 1, 8, HS);
    let engine = engine(&config, cache.dims());
    let qkv = random_activations(&config, &[1, 4, qkv_hidden(&config)]);
    let out = zero_output(&config, &[1, 4, out_hidden(&config)]);
    let err = engine
        .run(
            &mixed_batch(&[4], &[]),
            &BatchInputs::new(&qkv, KvCacheInput::Linear(&cache)),
            &BatchOutputs::new(&out),
            &mut Workspace::new(16),
        )
        .unwrap_err();
    assert!(matches!(err, AttentionError::WorkspaceTooSmall { .. }));
}

// ─── Workspace sizing ────────────────────────────────────────────────────────

#[test]
fn workspace_size_grows_with_batch() {
    let config = AttentionConfig {
        multi_block_mode: true,
        ..tiny_config()
    };
    let engine = engine(&config, &[16, 2, 2, 4, HS]);
    let sizes: Vec<usize> = (1..8).map(|b| engine.workspace_size(b).unwrap()).collect();
    assert!(sizes.windows(2).all(|w| w[0] <= w[1]), "{sizes:?}");

    let sizer = engine.workspace_sizer().unwrap();
    let ctx = sizer.context_workspace_size(config.precision, 4, config.max_context_length);
    let gen = sizer.generation_workspace_size(config.precision, 4);
    assert!(gen > 0);
    assert_eq!(engine.workspace_size(4).unwrap(), ctx.max(gen));
}
