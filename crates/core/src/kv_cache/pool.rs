use candle_core::{DType, Device, Tensor};

use super::block_address::BlockAddress;
use super::block_pool::BlockId;
use super::error::CacheError;

/// Backing storage of a paged KV cache.
///
/// `storage` is `[num_blocks, 2, num_kv_heads, tokens_per_block, head_size]`;
/// dimension 1 separates keys from values. Block `n` is addressed as
/// `base + n * block_bytes`, so the null address never names a real block.
#[derive(Debug, Clone)]
pub struct KvBlockPool {
    storage: Tensor,
    base: u64,
    num_blocks: usize,
    num_kv_heads: usize,
    tokens_per_block: usize,
    head_size: usize,
    block_bytes: u64,
    /// One past the last byte of the last block.
    end: u64,
}

impl KvBlockPool {
    pub const DEFAULT_BASE: u64 = 0x1_0000;

    pub fn new(storage: Tensor, base: u64) -> Result<Self, CacheError> {
        let dims = storage.dims();
        if dims.len() != 5 || dims[1] != 2 {
            return Err(CacheError::geometry(format!(
                "block pool must be [blocks, 2, kv_heads, tokens_per_block, head_size], got {dims:?}"
            )));
        }
        let (num_blocks, num_kv_heads, tokens_per_block, head_size) =
            (dims[0], dims[2], dims[3], dims[4]);
        if num_blocks == 0 || num_kv_heads == 0 || tokens_per_block == 0 || head_size == 0 {
            return Err(CacheError::geometry(format!(
                "block pool dimensions must be positive, got {dims:?}"
            )));
        }
        if !storage.is_contiguous() {
            return Err(CacheError::geometry("block pool storage must be contiguous"));
        }
        if base == 0 {
            return Err(CacheError::geometry("block pool base address must be non-zero"));
        }
        let block_bytes = (2 * num_kv_heads * tokens_per_block * head_size) as u64
            * storage.dtype().size_in_bytes() as u64;
        let end = (num_blocks as u64)
            .checked_mul(block_bytes)
            .and_then(|span| base.checked_add(span))
            .ok_or_else(|| {
                CacheError::geometry(format!(
                    "{num_blocks} blocks of {block_bytes} bytes from base {base:#x} overflow the address space"
                ))
            })?;
        Ok(Self {
            storage,
            base,
            num_blocks,
            num_kv_heads,
            tokens_per_block,
            head_size,
            block_bytes,
            end,
        })
    }

    /// Zero-filled pool at [`Self::DEFAULT_BASE`].
    pub fn zeros(
        num_blocks: usize,
        num_kv_heads: usize,
        tokens_per_block: usize,
        head_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, CacheError> {
        let storage = Tensor::zeros(
            (num_blocks, 2, num_kv_heads, tokens_per_block, head_size),
            dtype,
            device,
        )?;
        Self::new(storage, Self::DEFAULT_BASE)
    }

    pub fn storage(&self) -> &Tensor {
        &self.storage
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Bytes spanned by one block (keys and values).
    pub fn block_bytes(&self) -> u64 {
        self.block_bytes
    }

    pub fn address_of(&self, block: BlockId) -> Result<BlockAddress, CacheError> {
        if block >= self.num_blocks {
            return Err(CacheError::BlockNotAllocated { block_id: block });
        }
        // Below `end`, which was range-checked at construction.
        Ok(BlockAddress::new(self.base + block as u64 * self.block_bytes))
    }

    /// Map an address back to its block id.
    pub fn resolve(&self, address: BlockAddress) -> Result<BlockId, CacheError> {
        let raw = address.raw();
        let block_bytes = self.block_bytes;
        if raw < self.base || raw >= self.end {
            return Err(CacheError::AddressOutOfRange { address: raw });
        }
        let offset = raw - self.base;
        if offset % block_bytes != 0 {
            return Err(CacheError::MisalignedAddress {
                address: raw,
                block_bytes,
            });
        }
        Ok((offset / block_bytes) as BlockId)
    }
}
