use super::block_pool::BlockId;

/// Per-sequence mapping: logical block index → physical BlockId.
///
/// Logical token position `t` lives at `(blocks[t / block_size],
/// t % block_size)`; the flat slot ID for that position is
/// `blocks[t / block_size] * block_size + t % block_size`.
#[derive(Debug, Clone)]
pub struct BlockTable {
    blocks: Vec<BlockId>,
    num_tokens_stored: usize,
    block_size: usize,
}

impl BlockTable {
    pub fn new(block_size: usize) -> Self {
        Self {
            blocks: Vec::new(),
            num_tokens_stored: 0,
            block_size,
        }
    }

    /// Total tokens currently stored.
    pub fn num_tokens(&self) -> usize {
        self.num_tokens_stored
    }

    /// How many new blocks are needed to store `new_tokens` additional tokens.
    pub fn blocks_needed(&self, new_tokens: usize) -> usize {
        if new_tokens == 0 {
            return 0;
        }
        let total_after = self.num_tokens_stored + new_tokens;
        let blocks_required = total_after.div_ceil(self.block_size);
        blocks_required.saturating_sub(self.blocks.len())
    }

    /// Append newly allocated block IDs.
    pub fn append_blocks(&mut self, block_ids: &[BlockId]) {
        self.blocks.extend_from_slice(block_ids);
    }

    /// Advance fill by `n` tokens (after writing to cache).
    pub fn advance(&mut self, n: usize) {
        self.num_tokens_stored += n;
    }

    /// Compute slot IDs for a range of token positions.
    /// Returns physical slot IDs for positions [start_pos..start_pos + n).
    pub fn slot_mapping(&self, start_pos: usize, n: usize) -> Vec<usize> {
        (start_pos..start_pos + n)
            .map(|pos| {
                let block_idx = pos / self.block_size;
                let offset = pos % self.block_size;
                self.blocks[block_idx] * self.block_size + offset
            })
            .collect()
    }

    /// Get the ordered list of physical block IDs.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.blocks
    }

    /// Release all blocks, returning their IDs for freeing.
    pub fn release(&mut self) -> Vec<BlockId> {
        self.num_tokens_stored = 0;
        std::mem::take(&mut self.blocks)
    }

    /// Trim the block table to hold exactly `target_tokens` tokens.
    /// Returns block IDs that are no longer needed (caller must free them).
    /// Panics if `target_tokens > num_tokens_stored`.
    pub fn trim_to(&mut self, target_tokens: usize) -> Vec<BlockId> {
        assert!(
            target_tokens <= self.num_tokens_stored,
            "cannot trim to {target_tokens}, only {} stored",
            self.num_tokens_stored
        );
        let blocks_required = if target_tokens == 0 {
            0
        } else {
            target_tokens.div_ceil(self.block_size)
        };
        self.num_tokens_stored = target_tokens;
        if self.blocks.len() > blocks_required {
            self.blocks.split_off(blocks_required)
        } else {
            Vec::new()
        }
    }
}
