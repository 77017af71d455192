//! Numeric attention kernels.
//!
//! The dispatch engine never does attention math itself: it marshals a
//! [`ContextParams`] or [`GenerationParams`] and hands it to an
//! [`AttentionKernels`] implementation together with the caller's workspace.
//! [`ReferenceKernels`] computes everything with candle ops on whatever device
//! the tensors live on.

mod reference;

pub use reference::ReferenceKernels;

use candle_core::{Tensor, WithDType};

use crate::beam::CacheIndirection;
use crate::config::{AttentionConfig, MaskType, PositionEmbedding, Precision};
use crate::error::Result;
use crate::kv_cache::{KvCacheBuffer, KvCacheQuantMode, QuantizationScales};
use crate::layers::{AlibiSlopes, RotaryEmbedding, RotaryStyle};
use crate::workspace::{self, KernelGeometry, Workspace, WorkspaceLayout};

/// Where the ALiBi bias enters the score computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlibiPlacement {
    /// `softmax(qk * scale + bias)`
    AfterScale,
    /// `softmax((qk + bias) * scale)`
    BeforeScale,
}

/// Configuration-derived constants shared by both phases.
#[derive(Debug, Clone)]
pub struct AttentionSettings {
    pub precision: Precision,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub mask_type: MaskType,
    pub softmax_scale: f32,
    pub alibi: Option<AlibiPlacement>,
    pub rotary: Option<RotaryEmbedding>,
    pub kv_cache_quant: KvCacheQuantMode,
    pub geometry: KernelGeometry,
}

impl AttentionSettings {
    pub fn new(config: &AttentionConfig, head_size: usize, fmha_enabled: bool) -> Self {
        let alibi = match config.position_embedding {
            PositionEmbedding::Alibi => Some(AlibiPlacement::AfterScale),
            PositionEmbedding::AlibiWithScale => Some(AlibiPlacement::BeforeScale),
            _ => None,
        };
        let rotary = RotaryStyle::from_embedding(config.position_embedding)
            .map(|style| RotaryEmbedding::new(&config.rotary, style, head_size));
        Self {
            precision: config.precision,
            num_heads: config.num_heads,
            num_kv_heads: config.num_kv_heads,
            head_size,
            mask_type: config.mask_type,
            softmax_scale: 1.0 / ((head_size as f32).sqrt() * config.q_scaling),
            alibi,
            rotary,
            kv_cache_quant: config.kv_cache_quant,
            geometry: KernelGeometry::new(config, head_size, fmha_enabled),
        }
    }

    pub fn num_kv_groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

/// Prefill over the context slice of a batch.
pub struct ContextParams<'a, B> {
    pub settings: &'a AttentionSettings,
    /// Fused QKV rows of this slice, `[rows, qkv_hidden]`.
    pub qkv: &'a Tensor,
    pub qkv_bias: Option<&'a Tensor>,
    pub context_lengths: &'a [usize],
    /// First row of each request inside `qkv`.
    pub row_offsets: &'a [usize],
    /// Rows reserved per request when tokens are padded.
    pub padded_rows: Option<usize>,
    pub max_context_length: usize,
    pub scales: Option<QuantizationScales>,
    pub alibi: Option<&'a AlibiSlopes>,
    pub cache: &'a B,
    /// Full output, `[total_rows, num_heads * head_size]`.
    pub output: &'a Tensor,
    pub output_row_offset: usize,
}

impl<B> ContextParams<'_, B> {
    pub fn batch_size(&self) -> usize {
        self.context_lengths.len()
    }
}

/// Single-token decode over the generation slice of a batch.
pub struct GenerationParams<'a, B> {
    pub settings: &'a AttentionSettings,
    /// One fused QKV row per sequence, `[batch_beam, qkv_hidden]`.
    pub qkv: &'a Tensor,
    pub qkv_bias: Option<&'a Tensor>,
    /// Length of each sequence including the new token.
    pub sequence_lengths: &'a [usize],
    pub context_lengths: &'a [usize],
    /// Longest history in the slice.
    pub past_kv_length: usize,
    pub beam_width: usize,
    /// Beam of each sequence inside its request group, `slot % beam_width`.
    pub beams: &'a [usize],
    pub num_requests: usize,
    pub cache_indirection: Option<&'a CacheIndirection>,
    pub scales: Option<QuantizationScales>,
    pub alibi: Option<&'a AlibiSlopes>,
    pub cache: &'a B,
    pub output: &'a Tensor,
    pub output_row_offset: usize,
}

impl<B> GenerationParams<'_, B> {
    pub fn batch_beam(&self) -> usize {
        self.sequence_lengths.len()
    }
}

/// Kernel library contract. Sizing functions are pure; the two attention
/// entry points append K/V to the cache and write their output rows in place.
pub trait AttentionKernels: Send + Sync {
    fn context_workspace(
        &self,
        geometry: &KernelGeometry,
        precision: Precision,
        batch_size: usize,
        max_context_length: usize,
    ) -> WorkspaceLayout {
        workspace::context_layout(geometry, precision, batch_size, max_context_length)
    }

    fn generation_workspace(
        &self,
        geometry: &KernelGeometry,
        precision: Precision,
        total_sequences: usize,
    ) -> WorkspaceLayout {
        workspace::generation_layout(geometry, precision, total_sequences)
    }

    fn context_attention<T: WithDType, B: KvCacheBuffer>(
        &self,
        params: &ContextParams<'_, B>,
        workspace: &mut Workspace,
    ) -> Result<()>;

    fn generation_attention<T: WithDType, B: KvCacheBuffer>(
        &self,
        params: &GenerationParams<'_, B>,
        workspace: &mut Workspace,
    ) -> Result<()>;
}
