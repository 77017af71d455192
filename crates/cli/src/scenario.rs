//! Synthetic batches that drive the engine end to end on the CPU device.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use mixattn_core::config::{CacheLayout, TokenLayout};
use mixattn_core::kv_cache::{BlockPointerTable, BlockPool, BlockTable, KvBlockPool, QuantizationScales};
use mixattn_core::{
    AttentionDispatchEngine, BatchDescriptor, BatchInputs, BatchOutputs, BatchPartition,
    CacheIndirection, KvCacheInput, ReferenceKernels, Request, RequestPhase, Workspace,
};

use crate::config::DriverSettings;

const BEAM_WIDTH: usize = 4;
const MAX_SYNTHETIC_LENGTH: usize = 32;

/// Batch shapes the driver can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// Two prompts followed by two decode steps (paged cache, packed tokens).
    Mixed,
    /// Three prompts.
    Context,
    /// Four decode steps against existing history.
    Generation,
    /// Two requests decoding four beams each through a cache indirection.
    Beam,
}

/// Outcome of one driver run.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub partition: BatchPartition,
    pub workspace_bytes: usize,
    pub output_shape: Vec<usize>,
    pub output_max_abs: f32,
}

/// Sizes reported by `mixattn workspace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceReport {
    pub context_bytes: usize,
    pub generation_bytes: usize,
    pub required_bytes: usize,
}

/// Cache shape the engine is configured with for `sequences` sequences.
fn cache_shape(settings: &DriverSettings, sequences: usize) -> Vec<usize> {
    let kv_heads = settings.engine.num_kv_heads;
    match settings.engine.cache_layout {
        CacheLayout::Linear => vec![sequences, 2, kv_heads, settings.cache_capacity(), settings.head_size],
        CacheLayout::Paged => vec![
            sequences * settings.max_blocks_per_sequence,
            2,
            kv_heads,
            settings.tokens_per_block,
            settings.head_size,
        ],
    }
}

fn configured_engine(settings: &DriverSettings, sequences: usize) -> Result<AttentionDispatchEngine> {
    let mut engine = AttentionDispatchEngine::new(settings.engine.clone(), ReferenceKernels::new())?;
    engine.configure(&cache_shape(settings, sequences))?;
    Ok(engine)
}

pub fn workspace_report(settings: &DriverSettings, batch_size: usize) -> Result<WorkspaceReport> {
    let engine = configured_engine(settings, batch_size.max(1))?;
    let sizer = engine.workspace_sizer()?;
    let precision = settings.engine.precision;
    Ok(WorkspaceReport {
        context_bytes: sizer.context_workspace_size(
            precision,
            batch_size,
            settings.engine.max_context_length,
        ),
        generation_bytes: sizer.generation_workspace_size(precision, batch_size),
        required_bytes: engine.workspace_size(batch_size)?,
    })
}

/// Requests of `scenario` with lengths drawn from `rng`.
fn plan(scenario: Scenario, settings: &DriverSettings, rng: &mut StdRng) -> BatchDescriptor {
    let max_context = settings
        .engine
        .max_context_length
        .min(settings.cache_capacity())
        .min(MAX_SYNTHETIC_LENGTH);
    let max_history = (settings.cache_capacity() - 1).min(MAX_SYNTHETIC_LENGTH);
    let context = |rng: &mut StdRng| Request::context(rng.gen_range(1..=max_context));
    let generation = |rng: &mut StdRng| {
        let past = rng.gen_range(1..=max_history);
        Request::generation(past, past)
    };

    let requests: Vec<Request> = match scenario {
        Scenario::Context => (0..3).map(|_| context(rng)).collect(),
        Scenario::Generation => (0..4).map(|_| generation(rng)).collect(),
        Scenario::Mixed => {
            let mut requests: Vec<Request> = (0..2).map(|_| context(rng)).collect();
            requests.extend((0..2).map(|_| generation(rng)));
            requests
        }
        Scenario::Beam => (0..2)
            .flat_map(|_| {
                let group = generation(rng);
                std::iter::repeat(group).take(BEAM_WIDTH)
            })
            .collect(),
    };
    let mut batch = BatchDescriptor::new(requests);
    if scenario == Scenario::Beam {
        batch.assign_beams(BEAM_WIDTH);
    }
    batch
}

fn uniform(rng: &mut StdRng, shape: &[usize], settings: &DriverSettings) -> Result<Tensor> {
    let len = shape.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?.to_dtype(settings.engine.precision.dtype())?)
}

/// Shape of the fused QKV activations for `batch`.
fn activation_shape(batch: &BatchDescriptor, settings: &DriverSettings, hidden: usize) -> Vec<usize> {
    let requests = batch.requests();
    match settings.engine.token_layout {
        TokenLayout::Packed => {
            let rows = requests
                .iter()
                .map(|r| match r.phase {
                    RequestPhase::Context => r.context_length,
                    RequestPhase::Generation => 1,
                })
                .sum();
            vec![rows, hidden]
        }
        TokenLayout::Padded => {
            let seq = requests
                .iter()
                .filter(|r| r.phase == RequestPhase::Context)
                .map(|r| r.context_length)
                .max()
                .unwrap_or(1);
            vec![requests.len(), seq, hidden]
        }
    }
}

/// Build the scenario's batch, run it once and summarize the result.
pub fn run_scenario(scenario: Scenario, settings: &DriverSettings) -> Result<ScenarioReport> {
    ensure!(
        settings.cache_capacity() >= 2,
        "cache capacity {} cannot hold a decode step",
        settings.cache_capacity()
    );
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let config = &settings.engine;
    let batch = plan(scenario, settings, &mut rng);
    let n = batch.len();
    let hs = settings.head_size;

    let qkv_shape = activation_shape(&batch, settings, config.qkv_hidden(hs));
    let qkv = uniform(&mut rng, &qkv_shape, settings)?;
    let mut out_shape = qkv_shape.clone();
    if let Some(last) = out_shape.last_mut() {
        *last = config.output_hidden(hs);
    }
    let output = Tensor::zeros(out_shape.as_slice(), config.precision.dtype(), &Device::Cpu)?;
    let bias = if config.qkv_bias_enabled {
        Some(uniform(&mut rng, &[config.qkv_hidden(hs)], settings)?)
    } else {
        None
    };

    let indirection = if scenario == Scenario::Beam {
        let groups = n / BEAM_WIDTH;
        let mut indirection = CacheIndirection::identity(groups, BEAM_WIDTH, settings.cache_capacity());
        for (seq, request) in batch.requests().iter().enumerate() {
            for pos in 0..request.past_kv_length {
                if rng.gen_bool(0.25) {
                    indirection.set(seq / BEAM_WIDTH, request.beam, pos, rng.gen_range(0..BEAM_WIDTH))?;
                }
            }
        }
        Some(indirection)
    } else {
        None
    };

    let engine = configured_engine(settings, n)?;
    let workspace_bytes = engine.workspace_size(n)?;
    let mut workspace = Workspace::new(workspace_bytes);

    // Keeps the paged pool and its pointer table alive for the borrowed cache input.
    let paged_storage;
    let linear_storage;
    let kv_cache = match config.cache_layout {
        CacheLayout::Linear => {
            linear_storage = Tensor::zeros(
                cache_shape(settings, n).as_slice(),
                config.cache_dtype(),
                &Device::Cpu,
            )?;
            KvCacheInput::Linear(&linear_storage)
        }
        CacheLayout::Paged => {
            paged_storage = paged_cache(settings, &batch)?;
            KvCacheInput::Paged {
                pool: &paged_storage.0,
                block_pointers: &paged_storage.1,
            }
        }
    };

    let mut inputs = BatchInputs::new(&qkv, kv_cache);
    if let Some(bias) = &bias {
        inputs = inputs.with_qkv_bias(bias);
    }
    if config.kv_cache_quant.is_quantized() {
        inputs = inputs.with_scales(QuantizationScales::from_amax(1.0, config.kv_cache_quant));
    }
    if let Some(indirection) = &indirection {
        inputs = inputs.with_cache_indirection(indirection);
    }

    let partition = engine.run(&batch, &inputs, &BatchOutputs::new(&output), &mut workspace)?;
    let output_max_abs = output
        .to_dtype(candle_core::DType::F32)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_scalar::<f32>()?;

    info!(
        ?scenario,
        dispatch = %config.dispatch_key(),
        context_requests = partition.num_context_requests,
        context_tokens = partition.context_token_count,
        generation_requests = partition.num_generation_requests,
        workspace_bytes,
        "scenario complete"
    );
    Ok(ScenarioReport {
        scenario,
        partition,
        workspace_bytes,
        output_shape: out_shape,
        output_max_abs,
    })
}

/// Block pool plus pointer table with room for every request of `batch`.
fn paged_cache(settings: &DriverSettings, batch: &BatchDescriptor) -> Result<(KvBlockPool, BlockPointerTable)> {
    let config = &settings.engine;
    let num_blocks = batch.len() * settings.max_blocks_per_sequence;
    let pool = KvBlockPool::zeros(
        num_blocks,
        config.num_kv_heads,
        settings.tokens_per_block,
        settings.head_size,
        config.cache_dtype(),
        &Device::Cpu,
    )?;
    let mut blocks = BlockPool::new(num_blocks);
    let mut tables = Vec::with_capacity(batch.len());
    for request in batch.requests() {
        let mut table = BlockTable::new(settings.tokens_per_block);
        table.reserve(&mut blocks, request.sequence_length)?;
        tables.push(table);
    }
    let refs: Vec<&BlockTable> = tables.iter().collect();
    let pointers = BlockPointerTable::from_block_tables(&refs, &pool, settings.max_blocks_per_sequence)?;
    Ok((pool, pointers))
}
