//! Shared attention tensor operations.

use candle_core::{Result, Tensor};

/// Repeat KV heads for grouped-query attention.
///
/// Input is token-major `[num_tokens, num_kv_heads, head_dim]`; each KV head
/// is repeated `num_kv_groups` times in place along the head axis
/// (equivalent to `repeat_interleave` on dim 1), giving
/// `[num_tokens, num_kv_heads * num_kv_groups, head_dim]`.
pub fn repeat_kv(x: &Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x.clone());
    }
    let (num_tokens, num_kv_heads, head_dim) = x.dims3()?;
    x.unsqueeze(2)?
        .expand((num_tokens, num_kv_heads, num_kv_groups, head_dim))?
        .reshape((num_tokens, num_kv_heads * num_kv_groups, head_dim))
}
