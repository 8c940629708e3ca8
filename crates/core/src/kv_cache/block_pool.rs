use super::error::CacheError;

pub type BlockId = usize;

/// Manages physical block allocation. Pure bookkeeping, no tensor awareness.
///
/// This is the scheduler side of the slot lifecycle: the attention core only
/// ever consumes slot IDs and block tables produced from allocations made
/// here.
pub struct BlockPool {
    num_blocks: usize,
    free_list: Vec<BlockId>,
    allocated: Vec<bool>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        // LIFO: push 0..num_blocks so that pop gives low IDs first
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            free_list,
            allocated: vec![false; num_blocks],
        }
    }

    /// Allocate n blocks. Returns Err if insufficient free blocks.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, CacheError> {
        if n > self.free_list.len() {
            return Err(CacheError::OutOfBlocks {
                requested: n,
                available: self.free_list.len(),
            });
        }
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let id = self.free_list.pop().expect("checked above");
            self.allocated[id] = true;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Free a set of blocks back to the pool.
    pub fn free(&mut self, blocks: &[BlockId]) -> Result<(), CacheError> {
        for &id in blocks {
            if id >= self.num_blocks || !self.allocated[id] {
                return Err(CacheError::BlockNotAllocated { block_id: id });
            }
            self.allocated[id] = false;
            self.free_list.push(id);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    #[cfg(test)]
    pub fn num_used(&self) -> usize {
        self.num_blocks - self.free_list.len()
    }
}
