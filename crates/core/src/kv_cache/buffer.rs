//! Row addressing over linear and paged KV caches.
//!
//! Both cache representations flatten to a `[rows, head_size]` view of their
//! backing tensor. A [`KvCacheBuffer`] maps `(sequence, half, head, position)`
//! to a row of that view; writes go through `scatter_set` so the caller sees
//! them through its own tensor handle, reads through `index_select`.

use candle_core::{DType, Tensor};

use super::block_address::BlockPointerTable;
use super::error::CacheError;
use super::pool::KvBlockPool;

/// Which half of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvHalf {
    Key = 0,
    Value = 1,
}

pub trait KvCacheBuffer {
    /// Sequences addressable through this view.
    fn num_sequences(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn head_size(&self) -> usize;
    /// Token positions addressable per sequence.
    fn capacity(&self) -> usize;
    fn dtype(&self) -> DType;

    /// Row of [`Self::rows`] that holds the given entry.
    fn row_index(
        &self,
        seq: usize,
        half: KvHalf,
        head: usize,
        pos: usize,
    ) -> Result<usize, CacheError>;

    /// Backing storage as `[rows, head_size]`, sharing storage with the cache.
    fn rows(&self) -> Result<Tensor, CacheError>;

    /// View of sequences `first..first + count`, addressed from 0.
    fn slice(&self, first: usize, count: usize) -> Result<Self, CacheError>
    where
        Self: Sized;

    /// Write `values` (`[tokens, kv_heads, head_size]`, cache dtype) at
    /// positions `start_pos..start_pos + tokens` of `seq`.
    fn write(
        &self,
        seq: usize,
        half: KvHalf,
        start_pos: usize,
        values: &Tensor,
    ) -> Result<(), CacheError> {
        let (tokens, heads, head_size) = values.dims3()?;
        if heads != self.num_kv_heads() || head_size != self.head_size() {
            return Err(CacheError::geometry(format!(
                "cache write of [{tokens}, {heads}, {head_size}] into {} heads of size {}",
                self.num_kv_heads(),
                self.head_size()
            )));
        }
        if tokens == 0 {
            return Ok(());
        }
        let mut idx = Vec::with_capacity(tokens * heads * head_size);
        for t in 0..tokens {
            for h in 0..heads {
                let row = self.row_index(seq, half, h, start_pos + t)? as u32;
                idx.extend(std::iter::repeat(row).take(head_size));
            }
        }
        let idx = Tensor::from_vec(idx, (tokens * heads, head_size), values.device())?;
        let src = values
            .to_dtype(self.dtype())?
            .reshape((tokens * heads, head_size))?
            .contiguous()?;
        self.rows()?.scatter_set(&idx, &src, 0)?;
        Ok(())
    }

    /// Gather entries at `(seq, pos)` coordinates as `[coords, kv_heads, head_size]`.
    fn gather(&self, half: KvHalf, coords: &[(usize, usize)]) -> Result<Tensor, CacheError> {
        let heads = self.num_kv_heads();
        let mut idx = Vec::with_capacity(coords.len() * heads);
        for &(seq, pos) in coords {
            for h in 0..heads {
                idx.push(self.row_index(seq, half, h, pos)? as u32);
            }
        }
        let rows = self.rows()?;
        let idx = Tensor::from_vec(idx, coords.len() * heads, rows.device())?;
        Ok(rows
            .index_select(&idx, 0)?
            .reshape((coords.len(), heads, self.head_size()))?)
    }

    /// Positions `0..len` of `seq` as `[len, kv_heads, head_size]`.
    fn read_sequence(&self, seq: usize, half: KvHalf, len: usize) -> Result<Tensor, CacheError> {
        let coords: Vec<_> = (0..len).map(|pos| (seq, pos)).collect();
        self.gather(half, &coords)
    }
}

fn check_position(pos: usize, capacity: usize) -> Result<(), CacheError> {
    if pos >= capacity {
        return Err(CacheError::PositionOutOfRange {
            position: pos,
            capacity,
        });
    }
    Ok(())
}

fn check_sequence(seq: usize, available: usize) -> Result<(), CacheError> {
    if seq >= available {
        return Err(CacheError::SequenceOutOfRange {
            sequence: seq,
            available,
        });
    }
    Ok(())
}

fn check_range(first: usize, count: usize, available: usize) -> Result<(), CacheError> {
    if first + count > available {
        return Err(CacheError::SequenceOutOfRange {
            sequence: first + count,
            available,
        });
    }
    Ok(())
}

/// Contiguous per-slot cache `[slots, 2, kv_heads, max_seq_len, head_size]`.
#[derive(Debug, Clone)]
pub struct LinearKvBuffer {
    cache: Tensor,
    first_slot: usize,
    num_slots: usize,
    num_kv_heads: usize,
    max_seq_len: usize,
    head_size: usize,
}

impl LinearKvBuffer {
    pub fn new(cache: &Tensor) -> Result<Self, CacheError> {
        let dims = cache.dims();
        if dims.len() != 5 || dims[1] != 2 {
            return Err(CacheError::geometry(format!(
                "linear cache must be [slots, 2, kv_heads, max_seq_len, head_size], got {dims:?}"
            )));
        }
        if dims[2..].iter().any(|&d| d == 0) {
            return Err(CacheError::geometry(format!(
                "linear cache dimensions must be positive, got {dims:?}"
            )));
        }
        if !cache.is_contiguous() {
            return Err(CacheError::geometry("linear cache must be contiguous"));
        }
        Ok(Self {
            cache: cache.clone(),
            first_slot: 0,
            num_slots: dims[0],
            num_kv_heads: dims[2],
            max_seq_len: dims[3],
            head_size: dims[4],
        })
    }

    /// Elements between consecutive slots.
    pub fn outer_stride(&self) -> usize {
        2 * self.num_kv_heads * self.max_seq_len * self.head_size
    }

    /// Byte offset of local slot `slot` from the start of the full cache.
    pub fn byte_offset(&self, slot: usize) -> usize {
        self.cache.dtype().size_in_bytes() * self.outer_stride() * (self.first_slot + slot)
    }

    pub fn first_slot(&self) -> usize {
        self.first_slot
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

impl KvCacheBuffer for LinearKvBuffer {
    fn num_sequences(&self) -> usize {
        self.num_slots
    }

    fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    fn head_size(&self) -> usize {
        self.head_size
    }

    fn capacity(&self) -> usize {
        self.max_seq_len
    }

    fn dtype(&self) -> DType {
        self.cache.dtype()
    }

    fn row_index(
        &self,
        seq: usize,
        half: KvHalf,
        head: usize,
        pos: usize,
    ) -> Result<usize, CacheError> {
        check_sequence(seq, self.num_slots)?;
        check_position(pos, self.max_seq_len)?;
        let slot = self.first_slot + seq;
        Ok(((slot * 2 + half as usize) * self.num_kv_heads + head) * self.max_seq_len + pos)
    }

    fn rows(&self) -> Result<Tensor, CacheError> {
        let total = self.cache.elem_count() / self.head_size;
        Ok(self.cache.reshape((total, self.head_size))?)
    }

    fn slice(&self, first: usize, count: usize) -> Result<Self, CacheError> {
        check_range(first, count, self.num_slots)?;
        Ok(Self {
            first_slot: self.first_slot + first,
            num_slots: count,
            ..self.clone()
        })
    }
}

/// Paged cache seen through a block-pointer table.
#[derive(Debug, Clone, Copy)]
pub struct PagedKvBuffer<'a> {
    pool: &'a KvBlockPool,
    table: &'a BlockPointerTable,
    first_seq: usize,
    num_seqs: usize,
}

impl<'a> PagedKvBuffer<'a> {
    pub fn new(pool: &'a KvBlockPool, table: &'a BlockPointerTable) -> Self {
        Self {
            pool,
            table,
            first_seq: 0,
            num_seqs: table.num_sequences(),
        }
    }

    pub fn tokens_per_block(&self) -> usize {
        self.pool.tokens_per_block()
    }

    pub fn max_blocks_per_sequence(&self) -> usize {
        self.table.max_blocks_per_sequence()
    }

    /// Entry offset of local sequence `seq` in the flattened pointer table.
    pub fn table_offset(&self, seq: usize) -> usize {
        self.table.sequence_offset(self.first_seq + seq)
    }

    /// Non-null blocks held by local sequence `seq`.
    pub fn valid_blocks(&self, seq: usize) -> Result<usize, CacheError> {
        check_sequence(seq, self.num_seqs)?;
        self.table.valid_blocks(self.first_seq + seq)
    }
}

impl KvCacheBuffer for PagedKvBuffer<'_> {
    fn num_sequences(&self) -> usize {
        self.num_seqs
    }

    fn num_kv_heads(&self) -> usize {
        self.pool.num_kv_heads()
    }

    fn head_size(&self) -> usize {
        self.pool.head_size()
    }

    fn capacity(&self) -> usize {
        self.table.max_blocks_per_sequence() * self.pool.tokens_per_block()
    }

    fn dtype(&self) -> DType {
        self.pool.dtype()
    }

    fn row_index(
        &self,
        seq: usize,
        half: KvHalf,
        head: usize,
        pos: usize,
    ) -> Result<usize, CacheError> {
        check_sequence(seq, self.num_seqs)?;
        check_position(pos, self.capacity())?;
        let tpb = self.pool.tokens_per_block();
        let logical = pos / tpb;
        let addr = self.table.entry(self.first_seq + seq, logical)?;
        if addr.is_null() {
            return Err(CacheError::NullBlock {
                sequence: self.first_seq + seq,
                block: logical,
            });
        }
        let block = self.pool.resolve(addr)?;
        let heads = self.pool.num_kv_heads();
        Ok(((block * 2 + half as usize) * heads + head) * tpb + pos % tpb)
    }

    fn rows(&self) -> Result<Tensor, CacheError> {
        let storage = self.pool.storage();
        let total = storage.elem_count() / self.pool.head_size();
        Ok(storage.reshape((total, self.pool.head_size()))?)
    }

    fn slice(&self, first: usize, count: usize) -> Result<Self, CacheError> {
        check_range(first, count, self.num_seqs)?;
        Ok(Self {
            first_seq: self.first_seq + first,
            num_seqs: count,
            ..*self
        })
    }
}
