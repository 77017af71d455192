//! Mixed-phase attention dispatch.
//!
//! One invocation of [`AttentionDispatchEngine::run`]:
//!
//! - validates the input and output formats before any buffer is touched
//! - splits the batch into its context prefix and generation suffix
//! - resolves `(precision, cache_layout)` to concrete type parameters once
//! - runs the context executor over `[0, num_context_requests)` and the
//!   generation executor over the remainder
//!
//! The two phases write disjoint row ranges of the same output tensor, so no
//! merge step follows them. The KV cache is mutated in place.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = AttentionDispatchEngine::new(config, ReferenceKernels::new())?;
//! engine.configure(pool.storage().dims())?;
//! let mut workspace = Workspace::new(engine.workspace_size(batch.len())?);
//! engine.run(&batch, &inputs, &outputs, &mut workspace)?;
//! ```

mod context;
mod generation;
mod partition;
mod types;

pub use partition::{BatchPartition, BatchPartitioner};
pub use types::{BatchInputs, BatchOutputs, KvCacheInput};

use candle_core::{Tensor, WithDType};
use half::{bf16, f16};
use tracing::{debug, debug_span, warn};

use crate::beam::CacheIndirection;
use crate::config::{fmha_supported, AttentionConfig, CacheLayout, ContextFmha, DispatchKey, Precision};
use crate::error::{AttentionError, Result};
use crate::kernels::{AttentionKernels, AttentionSettings, ReferenceKernels};
use crate::kv_cache::{KvCacheBuffer, LinearKvBuffer, PagedKvBuffer, QuantizationScales};
use crate::layers::AlibiSlopes;
use crate::request::BatchDescriptor;
use crate::workspace::{Workspace, WorkspaceSizer};

use context::ContextExecutor;
use generation::GenerationExecutor;
use types::{validate_formats, PhaseInputs};

/// State fixed by [`AttentionDispatchEngine::configure`].
#[derive(Debug, Clone)]
struct Configured {
    head_size: usize,
    settings: AttentionSettings,
}

/// Top-level orchestrator over one immutable configuration.
///
/// `run` takes `&self`; all side effects go to caller-owned buffers, so one
/// engine can serve concurrent invocations on disjoint cache slots.
pub struct AttentionDispatchEngine<K = ReferenceKernels> {
    config: AttentionConfig,
    kernels: K,
    configured: Option<Configured>,
}

impl<K: AttentionKernels> AttentionDispatchEngine<K> {
    pub fn new(config: AttentionConfig, kernels: K) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            kernels,
            configured: None,
        })
    }

    /// Fix the head size from the rank-5 KV cache shape
    /// `[slots|blocks, 2, num_kv_heads, max_seq_len|tokens_per_block, head_size]`.
    pub fn configure(&mut self, kv_cache_shape: &[usize]) -> Result<()> {
        let &[_, halves, kv_heads, _, head_size] = kv_cache_shape else {
            return Err(AttentionError::config(
                "kv_cache_shape",
                format!("expected rank 5, got {kv_cache_shape:?}"),
            ));
        };
        if halves != 2 {
            return Err(AttentionError::config(
                "kv_cache_shape",
                format!("dimension 1 must hold K and V, got {halves}"),
            ));
        }
        if kv_heads != self.config.num_kv_heads {
            return Err(AttentionError::config(
                "num_kv_heads",
                format!(
                    "configured {} but the cache holds {kv_heads}",
                    self.config.num_kv_heads
                ),
            ));
        }
        self.config.validate_head_size(head_size)?;

        let fmha_enabled = match self.config.context_fmha {
            ContextFmha::Disabled => false,
            ContextFmha::Enabled | ContextFmha::EnabledWithFp32Acc if fmha_supported(head_size) => true,
            requested => {
                warn!(
                    ?requested,
                    head_size, "fused context attention is not available for this head size, using the unfused path"
                );
                false
            }
        };
        let settings = AttentionSettings::new(&self.config, head_size, fmha_enabled);
        debug!(head_size, fmha_enabled, "attention engine configured");
        self.configured = Some(Configured {
            head_size,
            settings,
        });
        Ok(())
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn kernels(&self) -> &K {
        &self.kernels
    }

    pub fn is_configured(&self) -> bool {
        self.configured.is_some()
    }

    pub fn head_size(&self) -> Option<usize> {
        self.configured.as_ref().map(|c| c.head_size)
    }

    pub fn fmha_enabled(&self) -> Option<bool> {
        self.configured
            .as_ref()
            .map(|c| c.settings.geometry.fmha_enabled)
    }

    fn state(&self) -> Result<&Configured> {
        self.configured.as_ref().ok_or(AttentionError::NotConfigured)
    }

    pub fn workspace_sizer(&self) -> Result<WorkspaceSizer<'_, K>> {
        let state = self.state()?;
        Ok(WorkspaceSizer::new(&self.kernels, state.settings.geometry))
    }

    /// Scratch bytes an invocation of up to `batch_size` sequences needs.
    pub fn workspace_size(&self, batch_size: usize) -> Result<usize> {
        Ok(self.workspace_sizer()?.workspace_size(
            self.config.precision,
            batch_size,
            self.config.max_context_length,
            batch_size,
        ))
    }

    /// Run attention for one batch, writing `outputs` and the KV cache in place.
    pub fn run(
        &self,
        batch: &BatchDescriptor,
        inputs: &BatchInputs<'_>,
        outputs: &BatchOutputs<'_>,
        workspace: &mut Workspace,
    ) -> Result<BatchPartition> {
        let state = self.state()?;
        let rows = validate_formats(&self.config, state.head_size, batch.len(), inputs, outputs)?;
        let partition = BatchPartitioner::new(&self.config)
            .partition(batch, rows.padded_seq_len.unwrap_or(1))?;
        match rows.padded_seq_len {
            None if rows.rows != partition.total_rows() => {
                return Err(AttentionError::shape(
                    "qkv rows",
                    partition.total_rows(),
                    rows.rows,
                ));
            }
            Some(seq) if seq > self.config.max_context_length => {
                return Err(AttentionError::ContextTooLong {
                    length: seq,
                    max: self.config.max_context_length,
                });
            }
            Some(seq) if partition.num_generation_requests > 0 && seq != 1 => {
                return Err(AttentionError::BatchContract(format!(
                    "padded generation batch needs one token per request, got {seq}"
                )));
            }
            _ => {}
        }

        let key = self.config.dispatch_key();
        let span = debug_span!(
            "attention_run",
            %key,
            context_requests = partition.num_context_requests,
            context_tokens = partition.context_token_count,
            generation_requests = partition.num_generation_requests,
        );
        let _enter = span.enter();

        let scales = self.resolve_scales(inputs.scales)?;
        let alibi = self.resolve_alibi(inputs)?;
        let qkv = flatten_rows(inputs.qkv)?;
        let output = flatten_rows(outputs.attention)?;
        let phase = PhaseInputs {
            qkv: &qkv,
            qkv_bias: inputs.qkv_bias,
            scales,
            alibi: alibi.as_ref(),
            output: &output,
        };
        let slice = BatchSlice {
            batch,
            partition: &partition,
            padded_seq_len: rows.padded_seq_len,
            inputs: &phase,
            cache_indirection: inputs.cache_indirection,
        };

        let outcome = match key {
            DispatchKey { precision: Precision::F16, cache: CacheLayout::Linear } => {
                self.run_phases::<f16, _>(state, &slice, &linear_buffer(inputs)?, workspace)
            }
            DispatchKey { precision: Precision::F16, cache: CacheLayout::Paged } => {
                self.run_phases::<f16, _>(state, &slice, &paged_buffer(inputs)?, workspace)
            }
            DispatchKey { precision: Precision::F32, cache: CacheLayout::Linear } => {
                self.run_phases::<f32, _>(state, &slice, &linear_buffer(inputs)?, workspace)
            }
            DispatchKey { precision: Precision::F32, cache: CacheLayout::Paged } => {
                self.run_phases::<f32, _>(state, &slice, &paged_buffer(inputs)?, workspace)
            }
            DispatchKey { precision: Precision::Bf16, cache: CacheLayout::Linear } => {
                self.run_phases::<bf16, _>(state, &slice, &linear_buffer(inputs)?, workspace)
            }
            DispatchKey { precision: Precision::Bf16, cache: CacheLayout::Paged } => {
                self.run_phases::<bf16, _>(state, &slice, &paged_buffer(inputs)?, workspace)
            }
        };
        outcome?;
        Ok(partition)
    }

    fn run_phases<T: WithDType, B: KvCacheBuffer>(
        &self,
        state: &Configured,
        slice: &BatchSlice<'_>,
        cache: &B,
        workspace: &mut Workspace,
    ) -> Result<()> {
        let partition = slice.partition;
        let requests = slice.batch.requests();
        if partition.num_context_requests > 0 {
            let context_cache = cache.slice(0, partition.num_context_requests)?;
            ContextExecutor::new(&self.kernels, &self.config, &state.settings).execute::<T, B>(
                &requests[partition.context_requests()],
                slice.padded_seq_len,
                slice.inputs,
                &context_cache,
                workspace,
            )?;
        }
        if partition.num_generation_requests > 0 {
            let generation_cache =
                cache.slice(partition.num_context_requests, partition.num_generation_requests)?;
            GenerationExecutor::new(&self.kernels, &state.settings).execute::<T, B>(
                &requests[partition.generation_requests()],
                partition.context_token_count,
                slice.inputs,
                slice.cache_indirection,
                &generation_cache,
                workspace,
            )?;
        }
        Ok(())
    }

    fn resolve_scales(&self, scales: Option<QuantizationScales>) -> Result<Option<QuantizationScales>> {
        match (self.config.kv_cache_quant.is_quantized(), scales) {
            (true, None) => Err(AttentionError::BatchContract(format!(
                "{:?} KV cache needs quantization scales",
                self.config.kv_cache_quant
            ))),
            (true, Some(scales)) if !scales.is_valid() => Err(AttentionError::BatchContract(format!(
                "quantization scales must be finite and positive, got {} / {}",
                scales.orig_quant, scales.quant_orig
            ))),
            (true, Some(scales)) => Ok(Some(scales)),
            (false, Some(_)) => {
                debug!("ignoring quantization scales for an unquantized KV cache");
                Ok(None)
            }
            (false, None) => Ok(None),
        }
    }

    fn resolve_alibi(&self, inputs: &BatchInputs<'_>) -> Result<Option<AlibiSlopes>> {
        if !self.config.position_embedding.is_alibi() {
            return Ok(None);
        }
        let slopes = match inputs.alibi_slopes {
            Some(slopes) => AlibiSlopes::from_tensor(slopes)?,
            None => AlibiSlopes::for_rank(
                self.config.num_heads,
                self.config.tp_size,
                self.config.tp_rank,
                inputs.qkv.device(),
            )?,
        };
        Ok(Some(slopes))
    }
}

/// Borrowed view of one invocation handed to the phase executors.
struct BatchSlice<'a> {
    batch: &'a BatchDescriptor,
    partition: &'a BatchPartition,
    padded_seq_len: Option<usize>,
    inputs: &'a PhaseInputs<'a>,
    cache_indirection: Option<&'a CacheIndirection>,
}

/// `[batch, seq, hidden]` -> `[batch * seq, hidden]`; 2-D tensors pass through.
/// Contiguous tensors keep sharing storage with the caller.
fn flatten_rows(t: &Tensor) -> Result<Tensor> {
    Ok(match t.dims() {
        &[batch, seq, hidden] => t.reshape((batch * seq, hidden))?,
        _ => t.clone(),
    })
}

fn linear_buffer(inputs: &BatchInputs<'_>) -> Result<LinearKvBuffer> {
    match inputs.kv_cache {
        KvCacheInput::Linear(cache) => Ok(LinearKvBuffer::new(cache)?),
        other => Err(AttentionError::shape("kv_cache", "linear", other.layout().as_str())),
    }
}

fn paged_buffer<'a>(inputs: &BatchInputs<'a>) -> Result<PagedKvBuffer<'a>> {
    match inputs.kv_cache {
        KvCacheInput::Paged {
            pool,
            block_pointers,
        } => Ok(PagedKvBuffer::new(pool, block_pointers)),
        other => Err(AttentionError::shape("kv_cache", "paged", other.layout().as_str())),
    }
}
