//! Shared test utilities for mixattn-core.
//!
//! Tiny configurations plus builders for caches, paged block tables and
//! random activations, used by unit tests, integration tests and benches.

use candle_core::{DType, Device, Tensor};

use crate::config::{AttentionConfig, CacheLayout, Precision, TokenLayout};
use crate::error::Result;
use crate::kv_cache::{BlockPointerTable, BlockPool, BlockTable, KvBlockPool};
use crate::request::{BatchDescriptor, Request};

/// Head size paired with [`tiny_config`].
pub const TINY_HEAD_SIZE: usize = 8;

/// 4 query heads over 2 KV heads, f32, packed tokens on a paged cache.
pub fn tiny_config() -> AttentionConfig {
    AttentionConfig {
        num_heads: 4,
        num_kv_heads: 2,
        precision: Precision::F32,
        token_layout: TokenLayout::Packed,
        cache_layout: CacheLayout::Paged,
        max_context_length: 64,
        max_sequence_length: 128,
        ..Default::default()
    }
}

/// [`tiny_config`] on a linear cache with padded tokens.
pub fn tiny_linear_config() -> AttentionConfig {
    AttentionConfig {
        token_layout: TokenLayout::Padded,
        cache_layout: CacheLayout::Linear,
        ..tiny_config()
    }
}

/// Zeroed linear cache `[slots, 2, kv_heads, max_seq_len, head_size]`.
pub fn linear_cache(
    config: &AttentionConfig,
    slots: usize,
    max_seq_len: usize,
    head_size: usize,
) -> Tensor {
    Tensor::zeros(
        (slots, 2, config.num_kv_heads, max_seq_len, head_size),
        config.cache_dtype(),
        &Device::Cpu,
    )
    .expect("allocate linear cache")
}

/// Normally distributed activations of the configured precision.
pub fn random_activations(config: &AttentionConfig, shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 1.0, shape, &Device::Cpu)
        .and_then(|t| t.to_dtype(config.precision.dtype()))
        .expect("random activations")
}

/// Zeroed output tensor of the configured precision.
pub fn zero_output(config: &AttentionConfig, shape: &[usize]) -> Tensor {
    Tensor::zeros(shape, config.precision.dtype(), &Device::Cpu).expect("allocate output")
}

/// Context requests followed by generation requests.
pub fn mixed_batch(context_lengths: &[usize], generation_histories: &[usize]) -> BatchDescriptor {
    let mut requests: Vec<Request> = context_lengths.iter().map(|&l| Request::context(l)).collect();
    requests.extend(
        generation_histories
            .iter()
            .map(|&past| Request::generation(past, past)),
    );
    BatchDescriptor::new(requests)
}

/// Paged cache with host-side block bookkeeping for a fixed set of sequences.
pub struct PagedFixture {
    pub pool: KvBlockPool,
    pub blocks: BlockPool,
    pub tables: Vec<BlockTable>,
    pub max_blocks_per_sequence: usize,
}

impl PagedFixture {
    pub fn new(
        config: &AttentionConfig,
        num_sequences: usize,
        num_blocks: usize,
        tokens_per_block: usize,
        max_blocks_per_sequence: usize,
        head_size: usize,
    ) -> Self {
        let pool = KvBlockPool::zeros(
            num_blocks,
            config.num_kv_heads,
            tokens_per_block,
            head_size,
            config.cache_dtype(),
            &Device::Cpu,
        )
        .expect("allocate block pool");
        Self {
            pool,
            blocks: BlockPool::new(num_blocks),
            tables: (0..num_sequences)
                .map(|_| BlockTable::new(tokens_per_block))
                .collect(),
            max_blocks_per_sequence,
        }
    }

    /// Reserve blocks for `tokens` more tokens of sequence `seq`.
    pub fn reserve(&mut self, seq: usize, tokens: usize) -> Result<()> {
        self.tables[seq].reserve(&mut self.blocks, tokens)?;
        Ok(())
    }

    /// Encode the current block tables against the pool.
    pub fn pointer_table(&self) -> Result<BlockPointerTable> {
        let tables: Vec<&BlockTable> = self.tables.iter().collect();
        Ok(BlockPointerTable::from_block_tables(
            &tables,
            &self.pool,
            self.max_blocks_per_sequence,
        )?)
    }
}

/// Largest absolute element of `t`.
pub fn max_abs(t: &Tensor) -> f32 {
    t.to_dtype(DType::F32)
        .and_then(|t| t.abs())
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.max(0))
        .and_then(|t| t.to_scalar::<f32>())
        .expect("max abs")
}
