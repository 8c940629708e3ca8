//! Allocation counters for the KV cache.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for cache block lifecycle events.
#[derive(Default)]
pub struct KVCacheMetrics {
    /// Total allocation requests
    allocations: AtomicU64,
    /// Total blocks allocated
    blocks_allocated: AtomicU64,
    /// Total blocks freed
    blocks_freed: AtomicU64,
}

impl KVCacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block allocation event.
    pub fn record_allocation(&self, num_blocks: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    /// Record blocks being freed.
    pub fn record_free(&self, num_blocks: usize) {
        self.blocks_freed
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_freed(&self) -> u64 {
        self.blocks_freed.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: self.allocations(),
            blocks_allocated: self.blocks_allocated(),
            blocks_freed: self.blocks_freed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
}
