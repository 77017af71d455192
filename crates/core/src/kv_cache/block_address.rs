//! Typed block addresses and the per-sequence block-pointer table.
//!
//! Host runtimes hand the table over as `i32` words: every 64-bit address is
//! stored as two consecutive little-endian words `(lo, hi)`, which is why the
//! declared last dimension is twice `max_blocks_per_sequence`.

use super::block_pool::BlockId;
use super::block_table::BlockTable;
use super::error::CacheError;
use super::pool::KvBlockPool;

/// Address of one KV block. `0` is the null block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BlockAddress(u64);

impl BlockAddress {
    /// Width of an address in `i32` words.
    pub const WORDS: usize = 2;
    pub const NULL: BlockAddress = BlockAddress(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_words(lo: i32, hi: i32) -> Self {
        Self(((hi as u32 as u64) << 32) | lo as u32 as u64)
    }

    pub fn to_words(self) -> [i32; 2] {
        [self.0 as u32 as i32, (self.0 >> 32) as u32 as i32]
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Flattened block-pointer table for a batch of sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPointerTable {
    words: Vec<i32>,
    shape: Vec<usize>,
}

impl BlockPointerTable {
    /// Wrap host words with their declared shape. The shape must have rank
    /// at least 2 and an even, positive last dimension.
    pub fn new(words: Vec<i32>, shape: Vec<usize>) -> Result<Self, CacheError> {
        if shape.len() < 2 {
            return Err(CacheError::geometry(format!(
                "block pointer table needs rank >= 2, got shape {shape:?}"
            )));
        }
        let last = shape[shape.len() - 1];
        if last == 0 || last % BlockAddress::WORDS != 0 {
            return Err(CacheError::geometry(format!(
                "block pointer table width {last} is not a positive multiple of {}",
                BlockAddress::WORDS
            )));
        }
        let expected: usize = shape.iter().product();
        if words.len() != expected {
            return Err(CacheError::geometry(format!(
                "block pointer table holds {} words, shape {shape:?} needs {expected}",
                words.len()
            )));
        }
        Ok(Self { words, shape })
    }

    /// Build a `[sequences, 2 * max_blocks]` table from typed addresses.
    /// Rows shorter than `max_blocks` are padded with null addresses.
    pub fn from_addresses(
        rows: &[Vec<BlockAddress>],
        max_blocks: usize,
    ) -> Result<Self, CacheError> {
        let mut words = Vec::with_capacity(rows.len() * max_blocks * BlockAddress::WORDS);
        for (seq, row) in rows.iter().enumerate() {
            if row.len() > max_blocks {
                return Err(CacheError::geometry(format!(
                    "sequence {seq} uses {} blocks, table holds {max_blocks}",
                    row.len()
                )));
            }
            for addr in row
                .iter()
                .copied()
                .chain(std::iter::repeat(BlockAddress::NULL))
                .take(max_blocks)
            {
                words.extend_from_slice(&addr.to_words());
            }
        }
        Self::new(words, vec![rows.len(), max_blocks * BlockAddress::WORDS])
    }

    /// Encode host-side block tables as addresses into `pool`.
    pub fn from_block_tables(
        tables: &[&BlockTable],
        pool: &KvBlockPool,
        max_blocks: usize,
    ) -> Result<Self, CacheError> {
        let rows = tables
            .iter()
            .map(|table| {
                table
                    .block_ids()
                    .iter()
                    .map(|&id: &BlockId| pool.address_of(id))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_addresses(&rows, max_blocks)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn words(&self) -> &[i32] {
        &self.words
    }

    pub fn num_sequences(&self) -> usize {
        self.shape[0]
    }

    pub fn max_blocks_per_sequence(&self) -> usize {
        self.shape[self.shape.len() - 1] / BlockAddress::WORDS
    }

    /// Entries between the starts of consecutive sequences.
    fn entries_per_sequence(&self) -> usize {
        self.shape[1..].iter().product::<usize>() / BlockAddress::WORDS
    }

    /// Entry offset of sequence `seq` in the flattened table.
    pub fn sequence_offset(&self, seq: usize) -> usize {
        self.entries_per_sequence() * seq
    }

    pub fn entry(&self, seq: usize, block: usize) -> Result<BlockAddress, CacheError> {
        if seq >= self.num_sequences() {
            return Err(CacheError::SequenceOutOfRange {
                sequence: seq,
                available: self.num_sequences(),
            });
        }
        let max_blocks = self.max_blocks_per_sequence();
        if block >= max_blocks {
            return Err(CacheError::geometry(format!(
                "block index {block} exceeds max_blocks_per_sequence {max_blocks}"
            )));
        }
        let word = (self.sequence_offset(seq) + block) * BlockAddress::WORDS;
        Ok(BlockAddress::from_words(
            self.words[word],
            self.words[word + 1],
        ))
    }

    /// Number of non-null entries for `seq`.
    pub fn valid_blocks(&self, seq: usize) -> Result<usize, CacheError> {
        let mut count = 0;
        for block in 0..self.max_blocks_per_sequence() {
            if !self.entry(seq, block)?.is_null() {
                count += 1;
            }
        }
        Ok(count)
    }
}
