use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::error::CacheError;

/// Index of a block inside a [`super::KvBlockPool`].
pub type BlockId = usize;

/// Host-side allocator for the blocks of a [`super::KvBlockPool`].
///
/// Always hands out the lowest free ids, so a fresh pool fills from block 0
/// upward and pointer tables built from it are easy to read in tests.
/// It never touches tensor storage.
#[derive(Debug, Clone)]
pub struct BlockPool {
    free: BinaryHeap<Reverse<BlockId>>,
    in_use: Vec<bool>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            free: (0..num_blocks).map(Reverse).collect(),
            in_use: vec![false; num_blocks],
        }
    }

    /// Take `count` blocks, or none at all when fewer are free.
    pub fn allocate(&mut self, count: usize) -> Result<Vec<BlockId>, CacheError> {
        if count > self.free.len() {
            return Err(CacheError::OutOfBlocks {
                requested: count,
                available: self.free.len(),
            });
        }
        let mut taken = Vec::with_capacity(count);
        while taken.len() < count {
            let Some(Reverse(block)) = self.free.pop() else {
                break;
            };
            self.in_use[block] = true;
            taken.push(block);
        }
        Ok(taken)
    }

    /// Return blocks to the pool. Stops at the first id that is not in use.
    pub fn free(&mut self, blocks: &[BlockId]) -> Result<(), CacheError> {
        for &block in blocks {
            match self.in_use.get_mut(block) {
                Some(slot) if *slot => {
                    *slot = false;
                    self.free.push(Reverse(block));
                }
                _ => return Err(CacheError::BlockNotAllocated { block_id: block }),
            }
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    pub fn num_total(&self) -> usize {
        self.in_use.len()
    }

    pub fn num_used(&self) -> usize {
        self.num_total() - self.num_free()
    }
}
