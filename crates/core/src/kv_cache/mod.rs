mod block_pool;
mod block_table;
mod cache_engine;
pub mod config;
mod error;
pub mod metrics;

pub use block_pool::BlockId;
pub use block_table::BlockTable;
pub use cache_engine::CacheEngine;
pub use config::CacheConfig;
pub use error::CacheError;
pub use metrics::{KVCacheMetrics, MetricsSnapshot};

use block_pool::BlockPool;
use std::sync::Arc;
use tracing::warn;

/// Top-level coordinator: one BlockPool shared by per-layer CacheEngines.
///
/// Slot IDs and block tables are minted here (the scheduler side); the
/// attention core only consumes them through the per-layer engines.
pub struct KVCacheManager {
    block_pool: BlockPool,
    engines: Vec<CacheEngine>,
    block_size: usize,
    metrics: Arc<KVCacheMetrics>,
}

impl KVCacheManager {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::with_metrics(config, Arc::new(KVCacheMetrics::new()))
    }

    /// Create a KVCacheManager with a shared metrics instance.
    pub fn with_metrics(
        config: &CacheConfig,
        metrics: Arc<KVCacheMetrics>,
    ) -> Result<Self, CacheError> {
        let mut engines = Vec::with_capacity(config.num_layers);
        for _ in 0..config.num_layers {
            engines.push(CacheEngine::new(config)?);
        }
        Ok(Self {
            block_pool: BlockPool::new(config.num_blocks),
            engines,
            block_size: config.block_size,
            metrics,
        })
    }

    /// Allocate blocks needed for `new_tokens` additional tokens.
    pub fn allocate_for_request(
        &mut self,
        block_table: &mut BlockTable,
        new_tokens: usize,
    ) -> Result<(), CacheError> {
        let needed = block_table.blocks_needed(new_tokens);
        if needed > 0 {
            let ids = self.block_pool.allocate(needed).inspect_err(|_| {
                warn!(
                    needed,
                    available = self.block_pool.num_free(),
                    "cache block allocation failed"
                );
            })?;
            self.metrics.record_allocation(ids.len());
            block_table.append_blocks(&ids);
        }
        Ok(())
    }

    /// Free all blocks owned by a request.
    pub fn free_request(&mut self, block_table: &mut BlockTable) -> Result<(), CacheError> {
        let ids = block_table.release();
        if !ids.is_empty() {
            self.metrics.record_free(ids.len());
            self.block_pool.free(&ids)?;
        }
        Ok(())
    }

    /// Free specific blocks back to the pool (e.g. after a trim).
    pub fn free_blocks(&mut self, block_ids: &[BlockId]) -> Result<(), CacheError> {
        if !block_ids.is_empty() {
            self.metrics.record_free(block_ids.len());
            self.block_pool.free(block_ids)?;
        }
        Ok(())
    }

    /// Get the CacheEngine for a specific layer.
    pub fn engine(&self, layer_idx: usize) -> &CacheEngine {
        &self.engines[layer_idx]
    }

    /// Mutable access to a layer's engine (required for cache writes).
    pub fn engine_mut(&mut self, layer_idx: usize) -> &mut CacheEngine {
        &mut self.engines[layer_idx]
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_free_blocks(&self) -> usize {
        self.block_pool.num_free()
    }

    pub fn metrics(&self) -> &Arc<KVCacheMetrics> {
        &self.metrics
    }
}
