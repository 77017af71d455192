use super::block_pool::{BlockId, BlockPool};
use super::error::CacheError;

/// Blocks owned by one sequence, in token order.
///
/// Token position `p` lives in `blocks[p / tokens_per_block]` at in-block
/// offset `p % tokens_per_block`; [`super::BlockPointerTable`] encodes the
/// same ordering for the kernels.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    tokens: usize,
    tokens_per_block: usize,
}

impl BlockTable {
    pub fn new(tokens_per_block: usize) -> Self {
        Self {
            blocks: Vec::new(),
            tokens: 0,
            tokens_per_block: tokens_per_block.max(1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.tokens_per_block
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Token positions the owned blocks can hold.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.tokens_per_block
    }

    /// Block and in-block offset holding `position`, if it is owned.
    pub fn locate(&self, position: usize) -> Option<(BlockId, usize)> {
        let block = *self.blocks.get(position / self.tokens_per_block)?;
        Some((block, position % self.tokens_per_block))
    }

    /// Extra blocks required before `new_tokens` more tokens fit.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        (self.tokens + new_tokens)
            .div_ceil(self.tokens_per_block)
            .saturating_sub(self.blocks.len())
    }

    pub fn append_blocks(&mut self, block_ids: &[BlockId]) {
        self.blocks.extend_from_slice(block_ids);
    }

    pub fn advance(&mut self, n: usize) {
        self.tokens += n;
    }

    /// Grow from `pool` so `new_tokens` more tokens fit, then count them.
    ///
    /// On exhaustion nothing is taken and the token count is unchanged.
    pub fn reserve(&mut self, pool: &mut BlockPool, new_tokens: usize) -> Result<(), CacheError> {
        let grown = pool.allocate(self.blocks_needed(new_tokens))?;
        self.append_blocks(&grown);
        self.advance(new_tokens);
        Ok(())
    }

    /// Hand every block back, leaving an empty table.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.tokens = 0;
        std::mem::take(&mut self.blocks)
    }
}
