use candle_core::Tensor;
use tracing::debug;

use super::block_pool::BlockId;
use super::config::CacheConfig;
use super::error::CacheError;

/// Owns the pre-allocated K/V pools for one layer's paged cache.
///
/// Cache layout: `[num_blocks, block_size, num_kv_heads, head_dim]`.
/// This layout reshapes to `[total_slots, kv_heads, head_dim]` as a zero-copy
/// view, so writes are a single scatter and reads a single block gather.
///
/// A slot ID names one `(block, offset)` position in the pool:
/// `block = slot / block_size`, `offset = slot % block_size`. Slot IDs are
/// assigned by the surrounding scheduler; the engine only validates ranges.
pub struct CacheEngine {
    k_cache: Tensor,
    v_cache: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl CacheEngine {
    /// Pre-allocate both pools, filled with zeros.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let shape = (
            config.num_blocks,
            config.block_size,
            config.num_kv_heads,
            config.head_dim,
        );
        let k_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        let v_cache = Tensor::zeros(shape, config.dtype, &config.device)?;

        debug!(
            num_blocks = config.num_blocks,
            block_size = config.block_size,
            num_kv_heads = config.num_kv_heads,
            head_dim = config.head_dim,
            "allocated KV cache pools"
        );

        Ok(Self {
            k_cache,
            v_cache,
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
        })
    }

    /// Number of addressable slots in the pool.
    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Raw K pool, `[num_blocks, block_size, num_kv_heads, head_dim]`.
    /// Handed to fused kernels that gather from block tables themselves.
    pub fn k_cache(&self) -> &Tensor {
        &self.k_cache
    }

    /// Raw V pool, same shape as the K pool.
    pub fn v_cache(&self) -> &Tensor {
        &self.v_cache
    }

    /// Write K, V for new tokens into their assigned slots.
    ///
    /// k, v shape: `[new_tokens, num_kv_heads, head_dim]`; `slot_ids` names
    /// the destination of each token row. Slots must be pairwise disjoint
    /// (the caller's contract), so write order across tokens is irrelevant
    /// and rewriting identical data is idempotent.
    pub fn write(&mut self, k: &Tensor, v: &Tensor, slot_ids: &[usize]) -> Result<(), CacheError> {
        if slot_ids.is_empty() {
            return Ok(());
        }
        let capacity = self.num_slots();
        for &slot in slot_ids {
            if slot >= capacity {
                return Err(CacheError::SlotOutOfRange { slot, capacity });
            }
        }

        let new_tokens = slot_ids.len();
        let device = self.k_cache.device().clone();

        // Reshape pools to [total_slots, kv_heads, head_dim]: a view, no copy.
        let flat_shape = (capacity, self.num_kv_heads, self.head_dim);
        let k_flat = self.k_cache.reshape(flat_shape)?;
        let v_flat = self.v_cache.reshape(flat_shape)?;

        // Scatter indices: [new_tokens] expanded to the source shape.
        let indices = Tensor::from_vec(
            slot_ids.iter().map(|&s| s as u32).collect::<Vec<_>>(),
            (new_tokens,),
            &device,
        )?;
        let indices = indices
            .reshape((new_tokens, 1, 1))?
            .expand((new_tokens, self.num_kv_heads, self.head_dim))?
            .contiguous()?;

        k_flat.scatter_set(&indices, &k.contiguous()?, 0)?;
        v_flat.scatter_set(&indices, &v.contiguous()?, 0)?;

        Ok(())
    }

    /// Materialize one sequence's contiguous past from its block table.
    ///
    /// `block_ids` is the sequence's ordered page list; `context_len` the
    /// logical length to read (including the most recently written token).
    /// Returns (k, v), each `[context_len, num_kv_heads, head_dim]`.
    pub fn gather(
        &self,
        block_ids: &[BlockId],
        context_len: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let needed = context_len.div_ceil(self.block_size);
        if block_ids.len() < needed {
            return Err(CacheError::UnderprovisionedBlockTable {
                provided: block_ids.len(),
                needed,
                context_len,
            });
        }
        for &id in block_ids {
            if id >= self.num_blocks {
                return Err(CacheError::BlockNotAllocated { block_id: id });
            }
        }

        let num_blocks_used = block_ids.len();
        let indices = Tensor::from_vec(
            block_ids.iter().map(|&b| b as u32).collect::<Vec<_>>(),
            (num_blocks_used,),
            self.k_cache.device(),
        )?;

        // index_select on dim 0 selects whole blocks
        let k_raw = self.k_cache.index_select(&indices, 0)?;
        let v_raw = self.v_cache.index_select(&indices, 0)?;

        let total_capacity = num_blocks_used * self.block_size;
        let flat_shape = (total_capacity, self.num_kv_heads, self.head_dim);
        let k = k_raw.reshape(flat_shape)?.narrow(0, 0, context_len)?;
        let v = v_raw.reshape(flat_shape)?.narrow(0, 0, context_len)?;

        Ok((k, v))
    }

    /// Gather several sequences' pasts concatenated along the token axis.
    ///
    /// Used by the fused decode path, which attends each single-token query
    /// against its own contiguous segment via cumulative lengths.
    /// Returns (k, v), each `[sum(context_lens), num_kv_heads, head_dim]`.
    pub fn gather_multi(
        &self,
        sequences: &[(&[BlockId], usize)],
    ) -> Result<(Tensor, Tensor), CacheError> {
        let mut k_parts = Vec::with_capacity(sequences.len());
        let mut v_parts = Vec::with_capacity(sequences.len());

        for &(block_ids, context_len) in sequences {
            if context_len == 0 {
                continue;
            }
            let (k, v) = self.gather(block_ids, context_len)?;
            k_parts.push(k);
            v_parts.push(v);
        }

        let k = Tensor::cat(&k_parts, 0)?;
        let v = Tensor::cat(&v_parts, 0)?;
        Ok((k, v))
    }

    /// Reset cache contents to zeros without reallocating.
    pub fn reset(&mut self) -> Result<(), CacheError> {
        self.k_cache = self.k_cache.zeros_like()?;
        self.v_cache = self.v_cache.zeros_like()?;
        Ok(())
    }
}
