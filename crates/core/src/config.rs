//! Immutable engine configuration.
//!
//! Each behavioural switch is its own enum axis; the engine resolves the
//! `(precision, cache_layout)` pair into a [`DispatchKey`] once per call.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{AttentionError, Result};
use crate::kv_cache::KvCacheQuantMode;

/// Activation precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    F16,
    F32,
    Bf16,
}

impl Precision {
    pub const ALL: [Precision; 3] = [Precision::F16, Precision::F32, Precision::Bf16];

    pub fn dtype(self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::F32 => DType::F32,
            Precision::Bf16 => DType::BF16,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        self.dtype().size_in_bytes()
    }

    pub fn is_supported(self) -> bool {
        match self {
            Precision::F16 | Precision::F32 => true,
            Precision::Bf16 => cfg!(feature = "bf16"),
        }
    }
}

/// How the KV history is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLayout {
    /// One contiguous region per sequence slot.
    #[default]
    Linear,
    /// Fixed-size token blocks addressed through a block-pointer table.
    Paged,
}

impl CacheLayout {
    pub const ALL: [CacheLayout; 2] = [CacheLayout::Linear, CacheLayout::Paged];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheLayout::Linear => "linear",
            CacheLayout::Paged => "paged",
        }
    }
}

/// How tokens of different requests are laid out in the activation tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLayout {
    /// `[batch, max_seq, hidden]`, each request padded to the same length.
    #[default]
    Padded,
    /// `[total_tokens, hidden]`, requests concatenated without padding.
    Packed,
}

impl TokenLayout {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenLayout::Padded => "padded",
            TokenLayout::Packed => "packed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskType {
    #[default]
    Causal,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbedding {
    /// Added to the embeddings upstream; nothing to do in attention.
    #[default]
    LearnedAbsolute,
    /// Rotary on interleaved pairs `(x0, x1), (x2, x3), ...`.
    RopeGptj,
    /// Rotary on halves `(x0, x_{d/2}), ...`.
    RopeGptNeox,
    Alibi,
    /// ALiBi bias added before the softmax scale is applied.
    AlibiWithScale,
}

impl PositionEmbedding {
    pub fn is_rope(self) -> bool {
        matches!(self, Self::RopeGptj | Self::RopeGptNeox)
    }

    pub fn is_alibi(self) -> bool {
        matches!(self, Self::Alibi | Self::AlibiWithScale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotaryScaling {
    #[default]
    None,
    /// Positions are divided by `scale`.
    Linear,
    /// NTK-aware base stretching once the sequence exceeds `max_positions`.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotaryConfig {
    /// Number of leading head dimensions that are rotated. 0 means the full head.
    pub dim: usize,
    pub base: f32,
    pub scaling: RotaryScaling,
    pub scale: f32,
    pub max_positions: usize,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            dim: 0,
            base: 10000.0,
            scaling: RotaryScaling::None,
            scale: 1.0,
            max_positions: 2048,
        }
    }
}

/// Fused multi-head attention for the context phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFmha {
    #[default]
    Disabled,
    Enabled,
    EnabledWithFp32Acc,
}

/// Head sizes the fused context kernels are built for.
pub const FMHA_HEAD_SIZES: [usize; 9] = [32, 40, 64, 80, 96, 104, 128, 160, 256];

pub fn fmha_supported(head_size: usize) -> bool {
    FMHA_HEAD_SIZES.contains(&head_size)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub mask_type: MaskType,
    pub q_scaling: f32,
    pub position_embedding: PositionEmbedding,
    pub rotary: RotaryConfig,
    pub tp_size: usize,
    pub tp_rank: usize,
    pub context_fmha: ContextFmha,
    pub multi_block_mode: bool,
    pub kv_cache_quant: KvCacheQuantMode,
    pub token_layout: TokenLayout,
    pub cache_layout: CacheLayout,
    pub precision: Precision,
    pub max_context_length: usize,
    pub max_sequence_length: usize,
    pub qkv_bias_enabled: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            num_heads: 8,
            num_kv_heads: 8,
            mask_type: MaskType::Causal,
            q_scaling: 1.0,
            position_embedding: PositionEmbedding::LearnedAbsolute,
            rotary: RotaryConfig::default(),
            tp_size: 1,
            tp_rank: 0,
            context_fmha: ContextFmha::Disabled,
            multi_block_mode: false,
            kv_cache_quant: KvCacheQuantMode::None,
            token_layout: TokenLayout::Packed,
            cache_layout: CacheLayout::Paged,
            precision: Precision::F16,
            max_context_length: 1024,
            max_sequence_length: 2048,
            qkv_bias_enabled: false,
        }
    }
}

impl AttentionConfig {
    /// Reject configurations that can never run, before any invocation.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(AttentionError::config("num_heads", "must be positive"));
        }
        if self.num_kv_heads == 0 {
            return Err(AttentionError::config("num_kv_heads", "must be positive"));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(AttentionError::config(
                "num_kv_heads",
                format!(
                    "{} query heads cannot be grouped over {} kv heads",
                    self.num_heads, self.num_kv_heads
                ),
            ));
        }
        if self.tp_size == 0 || self.tp_rank >= self.tp_size {
            return Err(AttentionError::config(
                "tp_rank",
                format!("rank {} outside tp_size {}", self.tp_rank, self.tp_size),
            ));
        }
        if !(self.q_scaling > 0.0) {
            return Err(AttentionError::config("q_scaling", "must be positive"));
        }
        if !self.precision.is_supported() {
            return Err(AttentionError::config(
                "precision",
                format!("{:?} support is not compiled in", self.precision),
            ));
        }
        if self.max_context_length == 0 {
            return Err(AttentionError::config(
                "max_context_length",
                "must be positive",
            ));
        }
        if self.max_sequence_length < self.max_context_length {
            return Err(AttentionError::config(
                "max_sequence_length",
                format!(
                    "{} is shorter than max_context_length {}",
                    self.max_sequence_length, self.max_context_length
                ),
            ));
        }
        if self.position_embedding.is_rope() {
            let rotary = &self.rotary;
            if rotary.dim % 2 != 0 {
                return Err(AttentionError::config("rotary.dim", "must be even"));
            }
            if !(rotary.base > 0.0) || !(rotary.scale > 0.0) {
                return Err(AttentionError::config(
                    "rotary",
                    "base and scale must be positive",
                ));
            }
            if rotary.scaling == RotaryScaling::Dynamic && rotary.max_positions == 0 {
                return Err(AttentionError::config(
                    "rotary.max_positions",
                    "dynamic scaling needs a positive max_positions",
                ));
            }
        }
        Ok(())
    }

    /// Checks that depend on the head size read from the cache shape.
    pub(crate) fn validate_head_size(&self, head_size: usize) -> Result<()> {
        if head_size == 0 {
            return Err(AttentionError::config("head_size", "must be positive"));
        }
        if self.position_embedding.is_rope() && self.rotary.dim > head_size {
            return Err(AttentionError::config(
                "rotary.dim",
                format!("{} exceeds head size {head_size}", self.rotary.dim),
            ));
        }
        Ok(())
    }

    pub fn num_kv_groups(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    /// Width of the fused QKV activation row.
    pub fn qkv_hidden(&self, head_size: usize) -> usize {
        (self.num_heads + 2 * self.num_kv_heads) * head_size
    }

    pub fn output_hidden(&self, head_size: usize) -> usize {
        self.num_heads * head_size
    }

    /// Element size of KV cache storage.
    pub fn cache_element_size(&self) -> usize {
        self.kv_cache_quant.element_size(self.precision.dtype())
    }

    pub fn cache_dtype(&self) -> DType {
        self.kv_cache_quant.storage_dtype(self.precision.dtype())
    }

    pub fn supports_mixed_batches(&self) -> bool {
        self.cache_layout == CacheLayout::Paged && self.token_layout == TokenLayout::Packed
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey {
            precision: self.precision,
            cache: self.cache_layout,
        }
    }
}

/// One cell of the precision x cache-layout dispatch matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchKey {
    pub precision: Precision,
    pub cache: CacheLayout,
}

impl DispatchKey {
    pub fn all() -> impl Iterator<Item = DispatchKey> {
        Precision::ALL.into_iter().flat_map(|precision| {
            CacheLayout::ALL
                .into_iter()
                .map(move |cache| DispatchKey { precision, cache })
        })
    }
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}", self.precision, self.cache.as_str())
    }
}
