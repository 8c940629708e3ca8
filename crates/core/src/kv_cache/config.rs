use candle_core::{DType, Device};

/// Construction parameters for the paged KV cache pool.
///
/// All fields are fixed at construction; the pool is allocated once at model
/// load and never resized.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub device: Device,
}

impl CacheConfig {
    /// Compute `num_blocks` from an available memory budget.
    ///
    /// bytes_per_block_per_layer = 2(K+V) * num_kv_heads * block_size * head_dim * elem_size
    /// num_blocks = budget_bytes / (num_layers * bytes_per_block_per_layer)
    pub fn from_memory_budget(
        budget_bytes: usize,
        num_layers: usize,
        num_kv_heads: usize,
        head_dim: usize,
        block_size: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        let elem_size = dtype.size_in_bytes();
        let bytes_per_block_per_layer = 2 * num_kv_heads * block_size * head_dim * elem_size;
        let total_per_block = num_layers * bytes_per_block_per_layer;
        let num_blocks = if total_per_block > 0 {
            budget_bytes / total_per_block
        } else {
            0
        };

        Self {
            block_size,
            num_blocks,
            num_layers,
            num_kv_heads,
            head_dim,
            dtype,
            device,
        }
    }

    /// Memory usage of one block across all layers, in bytes.
    pub fn bytes_per_block(&self) -> usize {
        2 * self.num_kv_heads
            * self.block_size
            * self.head_dim
            * self.num_layers
            * self.dtype.size_in_bytes()
    }

    /// Total KV cache memory usage, in bytes.
    pub fn total_memory_bytes(&self) -> usize {
        self.bytes_per_block() * self.num_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_memory_budget_computes_correct_blocks() {
        // Qwen3-0.6B shape: 28 layers, 8 kv_heads, 128 head_dim, BF16
        // Per block per layer: 2 * 8 * 16 * 128 * 2 = 65536 bytes
        // All layers per block: 28 * 65536 = 1,835,008 bytes
        // 900 MB budget: 900*1024*1024 / 1835008 = 514 blocks
        let budget = 900 * 1024 * 1024;
        let config =
            CacheConfig::from_memory_budget(budget, 28, 8, 128, 16, DType::BF16, Device::Cpu);
        assert_eq!(config.num_blocks, 514);
        assert_eq!(config.block_size, 16);
        assert_eq!(config.num_layers, 28);
    }

    #[test]
    fn f32_halves_blocks_vs_bf16() {
        let budget = 64 * 1024 * 1024;
        let bf16 = CacheConfig::from_memory_budget(budget, 2, 4, 64, 16, DType::BF16, Device::Cpu);
        let f32 = CacheConfig::from_memory_budget(budget, 2, 4, 64, 16, DType::F32, Device::Cpu);
        assert_eq!(bf16.num_blocks, f32.num_blocks * 2);
    }

    #[test]
    fn bytes_per_block_correct() {
        // 1 layer, 2 kv_heads, 4 block_size, 8 head_dim, BF16 (2 bytes)
        // bytes = 2 * 2 * 4 * 8 * 1 * 2 = 256
        let config = CacheConfig {
            block_size: 4,
            num_blocks: 10,
            num_layers: 1,
            num_kv_heads: 2,
            head_dim: 8,
            dtype: DType::BF16,
            device: Device::Cpu,
        };
        assert_eq!(config.bytes_per_block(), 256);
        assert_eq!(config.total_memory_bytes(), 2560);
    }
}
