use candle_core::{DType, Tensor};

use crate::beam::CacheIndirection;
use crate::config::{AttentionConfig, CacheLayout, TokenLayout};
use crate::error::{AttentionError, Result};
use crate::kv_cache::{BlockPointerTable, KvBlockPool, QuantizationScales};
use crate::layers::AlibiSlopes;

/// KV cache handed to one invocation.
#[derive(Debug, Clone, Copy)]
pub enum KvCacheInput<'a> {
    /// `[slots, 2, kv_heads, max_seq_len, head_size]`, updated in place.
    Linear(&'a Tensor),
    /// Block pool updated in place through the pointer table.
    Paged {
        pool: &'a KvBlockPool,
        block_pointers: &'a BlockPointerTable,
    },
}

impl KvCacheInput<'_> {
    pub fn layout(&self) -> CacheLayout {
        match self {
            KvCacheInput::Linear(_) => CacheLayout::Linear,
            KvCacheInput::Paged { .. } => CacheLayout::Paged,
        }
    }

    /// Rank-5 shape of the backing tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            KvCacheInput::Linear(cache) => cache.dims(),
            KvCacheInput::Paged { pool, .. } => pool.storage().dims(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            KvCacheInput::Linear(cache) => cache.dtype(),
            KvCacheInput::Paged { pool, .. } => pool.dtype(),
        }
    }

    fn device(&self) -> &candle_core::Device {
        match self {
            KvCacheInput::Linear(cache) => cache.device(),
            KvCacheInput::Paged { pool, .. } => pool.storage().device(),
        }
    }

    /// Sequences this cache can address.
    fn num_sequences(&self) -> usize {
        match self {
            KvCacheInput::Linear(cache) => cache.dims()[0],
            KvCacheInput::Paged { block_pointers, .. } => block_pointers.num_sequences(),
        }
    }
}

/// Everything an invocation reads.
#[derive(Debug, Clone, Copy)]
pub struct BatchInputs<'a> {
    /// Fused QKV activations: `[tokens, qkv_hidden]` packed or
    /// `[batch, seq, qkv_hidden]` padded.
    pub qkv: &'a Tensor,
    pub qkv_bias: Option<&'a Tensor>,
    pub scales: Option<QuantizationScales>,
    /// Per-head ALiBi slopes of this rank; derived from the configuration when absent.
    pub alibi_slopes: Option<&'a Tensor>,
    pub cache_indirection: Option<&'a CacheIndirection>,
    pub kv_cache: KvCacheInput<'a>,
}

impl<'a> BatchInputs<'a> {
    pub fn new(qkv: &'a Tensor, kv_cache: KvCacheInput<'a>) -> Self {
        Self {
            qkv,
            qkv_bias: None,
            scales: None,
            alibi_slopes: None,
            cache_indirection: None,
            kv_cache,
        }
    }

    pub fn with_qkv_bias(mut self, bias: &'a Tensor) -> Self {
        self.qkv_bias = Some(bias);
        self
    }

    pub fn with_scales(mut self, scales: QuantizationScales) -> Self {
        self.scales = Some(scales);
        self
    }

    pub fn with_alibi_slopes(mut self, slopes: &'a Tensor) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_cache_indirection(mut self, indirection: &'a CacheIndirection) -> Self {
        self.cache_indirection = Some(indirection);
        self
    }
}

/// Pre-allocated outputs written in place.
#[derive(Debug, Clone, Copy)]
pub struct BatchOutputs<'a> {
    /// `[tokens, num_heads * head_size]` packed or `[batch, seq, num_heads * head_size]` padded.
    pub attention: &'a Tensor,
}

impl<'a> BatchOutputs<'a> {
    pub fn new(attention: &'a Tensor) -> Self {
        Self { attention }
    }
}

/// Per-invocation inputs shared by both phase executors, with activations
/// and output flattened to two dimensions.
pub(crate) struct PhaseInputs<'a> {
    pub qkv: &'a Tensor,
    pub qkv_bias: Option<&'a Tensor>,
    pub scales: Option<QuantizationScales>,
    pub alibi: Option<&'a AlibiSlopes>,
    pub output: &'a Tensor,
}

/// Row structure of the activations, established by [`validate_formats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowLayout {
    pub rows: usize,
    /// Rows per request when tokens are padded.
    pub padded_seq_len: Option<usize>,
}

fn dims_of(t: &Tensor) -> String {
    format!("{:?}", t.dims())
}

/// Boundary checks run before any buffer is touched.
pub(crate) fn validate_formats(
    config: &AttentionConfig,
    head_size: usize,
    batch_len: usize,
    inputs: &BatchInputs<'_>,
    outputs: &BatchOutputs<'_>,
) -> Result<RowLayout> {
    let qkv_hidden = config.qkv_hidden(head_size);
    let out_hidden = config.output_hidden(head_size);
    let act_dtype = config.precision.dtype();
    let device = inputs.qkv.device();

    let layout = match (config.token_layout, inputs.qkv.dims()) {
        (TokenLayout::Packed, &[rows, hidden]) if hidden == qkv_hidden => RowLayout {
            rows,
            padded_seq_len: None,
        },
        (TokenLayout::Padded, &[batch, seq, hidden]) if hidden == qkv_hidden && batch == batch_len => {
            RowLayout {
                rows: batch * seq,
                padded_seq_len: Some(seq),
            }
        }
        (TokenLayout::Packed, _) => {
            return Err(AttentionError::shape(
                "qkv",
                format!("[tokens, {qkv_hidden}]"),
                dims_of(inputs.qkv),
            ))
        }
        (TokenLayout::Padded, _) => {
            return Err(AttentionError::shape(
                "qkv",
                format!("[{batch_len}, seq, {qkv_hidden}]"),
                dims_of(inputs.qkv),
            ))
        }
    };
    if inputs.qkv.dtype() != act_dtype {
        return Err(AttentionError::DTypeMismatch {
            what: "qkv",
            expected: act_dtype,
            got: inputs.qkv.dtype(),
        });
    }

    let out = outputs.attention;
    let expected_out: Vec<usize> = match layout.padded_seq_len {
        None => vec![layout.rows, out_hidden],
        Some(seq) => vec![batch_len, seq, out_hidden],
    };
    if out.dims() != expected_out.as_slice() {
        return Err(AttentionError::shape(
            "attention output",
            format!("{expected_out:?}"),
            dims_of(out),
        ));
    }
    if out.dtype() != act_dtype {
        return Err(AttentionError::DTypeMismatch {
            what: "attention output",
            expected: act_dtype,
            got: out.dtype(),
        });
    }
    if !out.is_contiguous() {
        return Err(AttentionError::shape(
            "attention output",
            "contiguous tensor",
            "strided view",
        ));
    }
    if !out.device().same_device(device) {
        return Err(AttentionError::shape("attention output", "qkv device", "other device"));
    }

    match (config.qkv_bias_enabled, inputs.qkv_bias) {
        (true, None) => {
            return Err(AttentionError::shape("qkv_bias", format!("[{qkv_hidden}]"), "none"))
        }
        (true, Some(bias)) if bias.dims() != [qkv_hidden] => {
            return Err(AttentionError::shape("qkv_bias", format!("[{qkv_hidden}]"), dims_of(bias)))
        }
        _ => {}
    }

    if let Some(slopes) = inputs.alibi_slopes {
        if slopes.dims() != [config.num_heads] {
            return Err(AttentionError::shape(
                "alibi_slopes",
                format!("[{}]", config.num_heads),
                dims_of(slopes),
            ));
        }
    }

    let cache = &inputs.kv_cache;
    if cache.layout() != config.cache_layout {
        return Err(AttentionError::shape(
            "kv_cache",
            config.cache_layout.as_str(),
            cache.layout().as_str(),
        ));
    }
    let shape = cache.shape();
    if shape.len() != 5 || shape[1] != 2 || shape[2] != config.num_kv_heads || shape[4] != head_size {
        return Err(AttentionError::shape(
            "kv_cache",
            format!("[_, 2, {}, _, {head_size}]", config.num_kv_heads),
            format!("{shape:?}"),
        ));
    }
    if cache.dtype() != config.cache_dtype() {
        return Err(AttentionError::DTypeMismatch {
            what: "kv_cache",
            expected: config.cache_dtype(),
            got: cache.dtype(),
        });
    }
    if !cache.device().same_device(device) {
        return Err(AttentionError::shape("kv_cache", "qkv device", "other device"));
    }
    if cache.num_sequences() < batch_len {
        return Err(AttentionError::shape(
            "kv_cache sequences",
            format!(">= {batch_len}"),
            cache.num_sequences(),
        ));
    }
    Ok(layout)
}
