//! Fused accelerator kernels via flash-attention.
//!
//! Prefill maps directly onto the variable-length fused kernel: the packed
//! token axis and `cu_seq_lens` are already in its native layout, with a
//! standard causal window (unbounded past, no future) and no dropout.
//!
//! Decode reuses the same fused kernel: each sequence's paged past is
//! gathered into one contiguous segment, KV heads are fanned out to query
//! heads through the `kv_head_mapping` table, and every query runs with
//! length 1 against its own segment via cumulative lengths.

use candle_core::Tensor;
use candle_flash_attn::{flash_attn_varlen, flash_attn_varlen_alibi};

use super::error::AttentionError;
use crate::kv_cache::{BlockId, CacheEngine};

/// Fused variable-length causal attention over packed prompt subsequences.
///
/// Same contract as the reference `varlen_masked_attention`; results agree
/// within fp16 tolerance.
pub fn varlen_masked_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: Option<&Tensor>,
    cu_seq_lens: &[usize],
    max_seq_len: usize,
    scale: f64,
) -> Result<Tensor, AttentionError> {
    let seqlens = Tensor::from_vec(
        cu_seq_lens.iter().map(|&l| l as u32).collect::<Vec<_>>(),
        (cu_seq_lens.len(),),
        q.device(),
    )?;

    let out = match alibi_slopes {
        Some(slopes) => flash_attn_varlen_alibi(
            q,
            k,
            v,
            slopes,
            &seqlens,
            &seqlens,
            max_seq_len,
            max_seq_len,
            scale as f32,
            true,
        )?,
        None => flash_attn_varlen(
            q,
            k,
            v,
            &seqlens,
            &seqlens,
            max_seq_len,
            max_seq_len,
            scale as f32,
            true,
        )?,
    };
    Ok(out)
}

/// Fused single-query attention against each sequence's cached past.
///
/// Same contract as the reference `single_query_cached_attention`. The
/// gather walks `block_tables`/`context_lens` over the raw pools;
/// `kv_head_mapping` (`[num_heads]`, query head → KV head) performs the GQA
/// fan-out before the kernel call.
#[allow(clippy::too_many_arguments)]
pub fn single_query_cached_attention(
    q: &Tensor,
    cache: &CacheEngine,
    kv_head_mapping: &Tensor,
    block_tables: &[Vec<BlockId>],
    context_lens: &[usize],
    max_context_len: usize,
    alibi_slopes: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor, AttentionError> {
    let device = q.device();
    let num_seqs = q.dim(0)?;

    let sequences: Vec<(&[BlockId], usize)> = block_tables
        .iter()
        .map(|table| table.as_slice())
        .zip(context_lens.iter().copied())
        .collect();
    let (k, v) = cache.gather_multi(&sequences)?;

    let k = k.index_select(kv_head_mapping, 1)?.contiguous()?;
    let v = v.index_select(kv_head_mapping, 1)?.contiguous()?;

    // One query token per sequence
    let cu_q = Tensor::from_vec(
        (0..=num_seqs as u32).collect::<Vec<_>>(),
        (num_seqs + 1,),
        device,
    )?;

    let mut cu_k = Vec::with_capacity(num_seqs + 1);
    cu_k.push(0u32);
    let mut total = 0u32;
    for &len in context_lens {
        total += len as u32;
        cu_k.push(total);
    }
    let cu_k = Tensor::from_vec(cu_k, (num_seqs + 1,), device)?;

    let out = match alibi_slopes {
        Some(slopes) => flash_attn_varlen_alibi(
            q,
            &k,
            &v,
            slopes,
            &cu_q,
            &cu_k,
            1,
            max_context_len,
            scale as f32,
            true,
        )?,
        None => flash_attn_varlen(
            q,
            &k,
            &v,
            &cu_q,
            &cu_k,
            1,
            max_context_len,
            scale as f32,
            true,
        )?,
    };
    Ok(out)
}
