use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("slot {slot} out of range: pool has {capacity} slots")]
    SlotOutOfRange { slot: usize, capacity: usize },

    #[error("block table holds {provided} blocks, {needed} needed for {context_len} tokens")]
    UnderprovisionedBlockTable {
        provided: usize,
        needed: usize,
        context_len: usize,
    },

    #[error("out of blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
