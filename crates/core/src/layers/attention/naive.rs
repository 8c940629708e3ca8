//! Reference attention kernels using standard matrix operations.
//!
//! These are the portable implementations: they run on any device, serve as
//! the correctness baseline for the fused kernels, and are bit-stable in f32.
//! Scores are accumulated in f32 before the softmax regardless of the
//! activation dtype; that cast is part of the numerical contract, not an
//! optimization.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use super::error::AttentionError;
use super::ops::repeat_kv;
use crate::kv_cache::{BlockId, CacheEngine};
use crate::layers::alibi::build_alibi_bias;
use crate::layers::mask::causal_mask;

/// Variable-length causal attention over packed prompt subsequences.
///
/// `q` is `[num_tokens, num_heads, head_dim]`, `k`/`v` are
/// `[num_tokens, num_kv_heads, head_dim]`; subsequence i spans token rows
/// `[cu_seq_lens[i], cu_seq_lens[i + 1])`. Each subsequence attends only to
/// itself, under a causal mask and an optional ALiBi bias.
pub fn varlen_masked_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    alibi_slopes: Option<&Tensor>,
    cu_seq_lens: &[usize],
    scale: f64,
) -> Result<Tensor, AttentionError> {
    let orig_dtype = q.dtype();
    let num_heads = q.dim(1)?;
    let num_kv_heads = k.dim(1)?;
    let num_kv_groups = num_heads / num_kv_heads;

    let k = repeat_kv(k, num_kv_groups)?;
    let v = repeat_kv(v, num_kv_groups)?;

    let mut outputs = Vec::with_capacity(cu_seq_lens.len().saturating_sub(1));
    for window in cu_seq_lens.windows(2) {
        let (start, end) = (window[0], window[1]);
        let seq_len = end - start;
        if seq_len == 0 {
            continue;
        }

        // [seq_len, H, D] → [H, seq_len, D]
        let q_i = q.narrow(0, start, seq_len)?.transpose(0, 1)?.contiguous()?;
        let k_i = k.narrow(0, start, seq_len)?.transpose(0, 1)?.contiguous()?;
        let v_i = v.narrow(0, start, seq_len)?.transpose(0, 1)?.contiguous()?;

        // [H, L, L] scores, f32 accumulation
        let scores = (q_i * scale)?.matmul(&k_i.transpose(1, 2)?.contiguous()?)?;
        let mut scores = scores.to_dtype(DType::F32)?;
        if seq_len > 1 {
            scores = scores.broadcast_add(&causal_mask(seq_len, q.device())?)?;
            if let Some(slopes) = alibi_slopes {
                scores = scores.broadcast_add(&build_alibi_bias(slopes, seq_len, seq_len)?)?;
            }
        }
        let probs = softmax_last_dim(&scores)?.to_dtype(orig_dtype)?;

        // [H, L, D] → [L, H, D]
        outputs.push(probs.matmul(&v_i)?.transpose(0, 1)?);
    }

    Ok(Tensor::cat(&outputs, 0)?)
}

/// Single-query attention against each sequence's cached past.
///
/// `q` is `[num_seqs, num_heads, head_dim]`, one query row per decoding
/// sequence. Row i gathers `context_lens[i]` positions through
/// `block_tables[i]`. No causal mask is applied: the gathered window is by
/// construction exactly the causal past, including the token written earlier
/// in this pass.
pub fn single_query_cached_attention(
    q: &Tensor,
    cache: &CacheEngine,
    block_tables: &[Vec<BlockId>],
    context_lens: &[usize],
    alibi_slopes: Option<&Tensor>,
    scale: f64,
) -> Result<Tensor, AttentionError> {
    let orig_dtype = q.dtype();
    let num_seqs = q.dim(0)?;
    let num_heads = q.dim(1)?;

    let mut outputs = Vec::with_capacity(num_seqs);
    for i in 0..num_seqs {
        let context_len = context_lens[i];
        let (k_i, v_i) = cache.gather(&block_tables[i], context_len)?;

        let num_kv_heads = k_i.dim(1)?;
        let num_kv_groups = num_heads / num_kv_heads;
        // [L, H, D] → [H, L, D]
        let k_i = repeat_kv(&k_i, num_kv_groups)?.transpose(0, 1)?.contiguous()?;
        let v_i = repeat_kv(&v_i, num_kv_groups)?.transpose(0, 1)?.contiguous()?;

        // [1, H, D] → [H, 1, D]
        let q_i = q.narrow(0, i, 1)?.transpose(0, 1)?.contiguous()?;

        // [H, 1, L] scores, f32 accumulation
        let scores = (q_i * scale)?.matmul(&k_i.transpose(1, 2)?.contiguous()?)?;
        let mut scores = scores.to_dtype(DType::F32)?;
        if let Some(slopes) = alibi_slopes {
            scores = scores.broadcast_add(&build_alibi_bias(slopes, 1, context_len)?)?;
        }
        let probs = softmax_last_dim(&scores)?.to_dtype(orig_dtype)?;

        // [H, 1, D] → [1, H, D]
        outputs.push(probs.matmul(&v_i)?.transpose(0, 1)?);
    }

    Ok(Tensor::cat(&outputs, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::CacheConfig;
    use candle_core::{Device, Tensor};

    fn tensor(data: Vec<f32>, tokens: usize, heads: usize, dim: usize) -> Tensor {
        Tensor::from_vec(data, (tokens, heads, dim), &Device::Cpu).unwrap()
    }

    /// Ramp data that breaks symmetry across tokens, heads, and dims.
    fn ramp(tokens: usize, heads: usize, dim: usize, seed: f32) -> Vec<f32> {
        (0..tokens * heads * dim)
            .map(|i| ((i as f32) * 0.37 + seed).sin() * 0.5)
            .collect()
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    /// Scalar attention for one head: softmax(q·k * scale + bias) · v.
    fn oracle_one_head(
        q: &[f32],
        keys: &[Vec<f32>],
        values: &[Vec<f32>],
        bias: &[f32],
        scale: f32,
    ) -> Vec<f32> {
        let scores: Vec<f32> = keys
            .iter()
            .zip(bias)
            .map(|(k, b)| {
                let dot: f32 = q.iter().zip(k.iter()).map(|(a, b)| a * b).sum();
                dot * scale + b
            })
            .collect();
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let dim = values[0].len();
        (0..dim)
            .map(|d| {
                exps.iter()
                    .zip(values)
                    .map(|(e, v)| (e / sum) * v[d])
                    .sum()
            })
            .collect()
    }

    /// Extract head `h` of token `t` from a flat [tokens, heads, dim] vec.
    fn row(data: &[f32], t: usize, h: usize, heads: usize, dim: usize) -> Vec<f32> {
        let base = (t * heads + h) * dim;
        data[base..base + dim].to_vec()
    }

    #[test]
    fn single_token_prompt_attends_itself() {
        let q = tensor(ramp(1, 2, 4, 0.0), 1, 2, 4);
        let k = tensor(ramp(1, 2, 4, 1.0), 1, 2, 4);
        let v_data = ramp(1, 2, 4, 2.0);
        let v = tensor(v_data.clone(), 1, 2, 4);

        let out = varlen_masked_attention(&q, &k, &v, None, &[0, 1], 0.5).unwrap();
        assert_eq!(to_vec(&out), v_data);
    }

    #[test]
    fn first_row_sees_only_first_token() {
        // Causal row 0 is a one-hot on position 0, so output row 0 is V[0]
        let q = tensor(ramp(3, 2, 4, 0.0), 3, 2, 4);
        let k = tensor(ramp(3, 2, 4, 1.0), 3, 2, 4);
        let v_data = ramp(3, 2, 4, 2.0);
        let v = tensor(v_data.clone(), 3, 2, 4);

        let out = varlen_masked_attention(&q, &k, &v, None, &[0, 3], 0.5).unwrap();
        let out = to_vec(&out);
        assert_eq!(out[0..8], v_data[0..8]);
    }

    #[test]
    fn prefill_matches_scalar_oracle() {
        let (heads, dim, len) = (2, 4, 3);
        let scale = 0.5f32;
        let q_data = ramp(len, heads, dim, 0.1);
        let k_data = ramp(len, heads, dim, 1.3);
        let v_data = ramp(len, heads, dim, 2.7);
        let q = tensor(q_data.clone(), len, heads, dim);
        let k = tensor(k_data.clone(), len, heads, dim);
        let v = tensor(v_data.clone(), len, heads, dim);

        let out = varlen_masked_attention(&q, &k, &v, None, &[0, len], scale as f64).unwrap();
        let out = to_vec(&out);

        for h in 0..heads {
            for i in 0..len {
                // Causal: token i attends keys 0..=i
                let keys: Vec<Vec<f32>> = (0..=i).map(|t| row(&k_data, t, h, heads, dim)).collect();
                let values: Vec<Vec<f32>> =
                    (0..=i).map(|t| row(&v_data, t, h, heads, dim)).collect();
                let bias = vec![0.0; i + 1];
                let expected =
                    oracle_one_head(&row(&q_data, i, h, heads, dim), &keys, &values, &bias, scale);
                let actual = row(&out, i, h, heads, dim);
                for (a, e) in actual.iter().zip(&expected) {
                    assert!((a - e).abs() < 1e-5, "token {i} head {h}: {a} vs {e}");
                }
            }
        }
    }

    #[test]
    fn future_tokens_do_not_affect_past_rows() {
        let (heads, dim, len) = (2, 4, 4);
        let q = tensor(ramp(len, heads, dim, 0.0), len, heads, dim);
        let k_data = ramp(len, heads, dim, 1.0);
        let v_data = ramp(len, heads, dim, 2.0);

        // Perturb the last token's K and V
        let mut k_mut = k_data.clone();
        let mut v_mut = v_data.clone();
        for x in k_mut[(len - 1) * heads * dim..].iter_mut() {
            *x += 100.0;
        }
        for x in v_mut[(len - 1) * heads * dim..].iter_mut() {
            *x -= 50.0;
        }

        let out_a = varlen_masked_attention(
            &q,
            &tensor(k_data, len, heads, dim),
            &tensor(v_data, len, heads, dim),
            None,
            &[0, len],
            0.5,
        )
        .unwrap();
        let out_b = varlen_masked_attention(
            &q,
            &tensor(k_mut, len, heads, dim),
            &tensor(v_mut, len, heads, dim),
            None,
            &[0, len],
            0.5,
        )
        .unwrap();

        let a = to_vec(&out_a);
        let b = to_vec(&out_b);
        // Rows 0..len-1 must be bitwise identical; only the last row may move
        let boundary = (len - 1) * heads * dim;
        assert_eq!(a[..boundary], b[..boundary]);
        assert_ne!(a[boundary..], b[boundary..]);
    }

    #[test]
    fn gqa_equals_manual_head_repeat() {
        let (q_heads, kv_heads, dim, len) = (4, 2, 2, 2);
        let q = tensor(ramp(len, q_heads, dim, 0.0), len, q_heads, dim);
        let k = tensor(ramp(len, kv_heads, dim, 1.0), len, kv_heads, dim);
        let v = tensor(ramp(len, kv_heads, dim, 2.0), len, kv_heads, dim);

        let grouped = varlen_masked_attention(&q, &k, &v, None, &[0, len], 0.7).unwrap();

        let k_rep = repeat_kv(&k, 2).unwrap();
        let v_rep = repeat_kv(&v, 2).unwrap();
        let expanded = varlen_masked_attention(&q, &k_rep, &v_rep, None, &[0, len], 0.7).unwrap();

        assert_eq!(to_vec(&grouped), to_vec(&expanded));
    }

    #[test]
    fn packed_subsequences_match_separate_runs() {
        let (heads, dim) = (2, 4);
        let q_data = ramp(5, heads, dim, 0.0);
        let k_data = ramp(5, heads, dim, 1.0);
        let v_data = ramp(5, heads, dim, 2.0);
        let q = tensor(q_data.clone(), 5, heads, dim);
        let k = tensor(k_data.clone(), 5, heads, dim);
        let v = tensor(v_data.clone(), 5, heads, dim);

        // One packed batch: prompts of length 2 and 3
        let packed = varlen_masked_attention(&q, &k, &v, None, &[0, 2, 5], 0.5).unwrap();

        // Each prompt alone
        let first = varlen_masked_attention(
            &q.narrow(0, 0, 2).unwrap(),
            &k.narrow(0, 0, 2).unwrap(),
            &v.narrow(0, 0, 2).unwrap(),
            None,
            &[0, 2],
            0.5,
        )
        .unwrap();
        let second = varlen_masked_attention(
            &q.narrow(0, 2, 3).unwrap(),
            &k.narrow(0, 2, 3).unwrap(),
            &v.narrow(0, 2, 3).unwrap(),
            None,
            &[0, 3],
            0.5,
        )
        .unwrap();

        let mut expected = to_vec(&first);
        expected.extend(to_vec(&second));
        assert_eq!(to_vec(&packed), expected);
    }

    #[test]
    fn alibi_prefill_matches_scalar_oracle() {
        let (heads, dim, len) = (2, 4, 4);
        let scale = 0.5f32;
        let slopes_vec = vec![0.5f32, 1.0];
        let slopes = Tensor::from_vec(slopes_vec.clone(), (heads,), &Device::Cpu).unwrap();

        let q_data = ramp(len, heads, dim, 0.1);
        let k_data = ramp(len, heads, dim, 1.3);
        let v_data = ramp(len, heads, dim, 2.7);
        let q = tensor(q_data.clone(), len, heads, dim);
        let k = tensor(k_data.clone(), len, heads, dim);
        let v = tensor(v_data.clone(), len, heads, dim);

        let out =
            varlen_masked_attention(&q, &k, &v, Some(&slopes), &[0, len], scale as f64).unwrap();
        let out = to_vec(&out);

        for h in 0..heads {
            for i in 0..len {
                let keys: Vec<Vec<f32>> = (0..=i).map(|t| row(&k_data, t, h, heads, dim)).collect();
                let values: Vec<Vec<f32>> =
                    (0..=i).map(|t| row(&v_data, t, h, heads, dim)).collect();
                // Pre-softmax bias: slope[h] * (j - i) for the visible keys
                let bias: Vec<f32> = (0..=i)
                    .map(|j| slopes_vec[h] * (j as i64 - i as i64) as f32)
                    .collect();
                let expected =
                    oracle_one_head(&row(&q_data, i, h, heads, dim), &keys, &values, &bias, scale);
                let actual = row(&out, i, h, heads, dim);
                for (a, e) in actual.iter().zip(&expected) {
                    assert!((a - e).abs() < 1e-5, "token {i} head {h}: {a} vs {e}");
                }
            }
        }
    }

    // ─── Decode ──────────────────────────────────────────────────────────────

    fn decode_cache(kv_heads: usize, dim: usize) -> CacheEngine {
        CacheEngine::new(&CacheConfig {
            block_size: 4,
            num_blocks: 8,
            num_layers: 1,
            num_kv_heads: kv_heads,
            head_dim: dim,
            dtype: candle_core::DType::F32,
            device: Device::Cpu,
        })
        .unwrap()
    }

    #[test]
    fn decode_matches_scalar_oracle() {
        let (heads, dim, context_len) = (2, 4, 5);
        let scale = 0.5f32;
        let mut cache = decode_cache(heads, dim);

        let k_data = ramp(context_len, heads, dim, 1.3);
        let v_data = ramp(context_len, heads, dim, 2.7);
        let k = tensor(k_data.clone(), context_len, heads, dim);
        let v = tensor(v_data.clone(), context_len, heads, dim);
        cache.write(&k, &v, &[0, 1, 2, 3, 4]).unwrap();

        let q_data = ramp(1, heads, dim, 0.1);
        let q = tensor(q_data.clone(), 1, heads, dim);

        let out = single_query_cached_attention(
            &q,
            &cache,
            &[vec![0, 1]],
            &[context_len],
            None,
            scale as f64,
        )
        .unwrap();
        let out = to_vec(&out);

        for h in 0..heads {
            let keys: Vec<Vec<f32>> = (0..context_len)
                .map(|t| row(&k_data, t, h, heads, dim))
                .collect();
            let values: Vec<Vec<f32>> = (0..context_len)
                .map(|t| row(&v_data, t, h, heads, dim))
                .collect();
            let bias = vec![0.0; context_len];
            let expected =
                oracle_one_head(&row(&q_data, 0, h, heads, dim), &keys, &values, &bias, scale);
            let actual = row(&out, 0, h, heads, dim);
            for (a, e) in actual.iter().zip(&expected) {
                assert!((a - e).abs() < 1e-5, "head {h}: {a} vs {e}");
            }
        }
    }

    #[test]
    fn decode_agrees_with_prefill_last_row() {
        let (heads, dim, len) = (2, 4, 4);
        let q_data = ramp(len, heads, dim, 0.0);
        let k_data = ramp(len, heads, dim, 1.0);
        let v_data = ramp(len, heads, dim, 2.0);
        let q = tensor(q_data.clone(), len, heads, dim);
        let k = tensor(k_data.clone(), len, heads, dim);
        let v = tensor(v_data.clone(), len, heads, dim);

        let prefill = varlen_masked_attention(&q, &k, &v, None, &[0, len], 0.5).unwrap();
        let prefill = to_vec(&prefill);

        // Same keys/values in the cache, last token as a decode query
        let mut cache = decode_cache(heads, dim);
        cache.write(&k, &v, &[0, 1, 2, 3]).unwrap();
        let q_last = q.narrow(0, len - 1, 1).unwrap();
        let decode =
            single_query_cached_attention(&q_last, &cache, &[vec![0]], &[len], None, 0.5).unwrap();
        let decode = to_vec(&decode);

        let last = (len - 1) * heads * dim;
        for (a, e) in decode.iter().zip(&prefill[last..]) {
            assert!((a - e).abs() < 1e-6, "{a} vs {e}");
        }
    }

    #[test]
    fn decode_gqa_matches_scalar_oracle() {
        let (q_heads, kv_heads, dim, context_len) = (4, 2, 2, 3);
        let scale = 0.7f32;
        let mut cache = decode_cache(kv_heads, dim);

        let k_data = ramp(context_len, kv_heads, dim, 1.3);
        let v_data = ramp(context_len, kv_heads, dim, 2.7);
        let k = tensor(k_data.clone(), context_len, kv_heads, dim);
        let v = tensor(v_data.clone(), context_len, kv_heads, dim);
        cache.write(&k, &v, &[0, 1, 2]).unwrap();

        let q_data = ramp(1, q_heads, dim, 0.1);
        let q = tensor(q_data.clone(), 1, q_heads, dim);

        let out = single_query_cached_attention(
            &q,
            &cache,
            &[vec![0]],
            &[context_len],
            None,
            scale as f64,
        )
        .unwrap();
        let out = to_vec(&out);

        for h in 0..q_heads {
            let kv_h = h / 2; // group size 2
            let keys: Vec<Vec<f32>> = (0..context_len)
                .map(|t| row(&k_data, t, kv_h, kv_heads, dim))
                .collect();
            let values: Vec<Vec<f32>> = (0..context_len)
                .map(|t| row(&v_data, t, kv_h, kv_heads, dim))
                .collect();
            let bias = vec![0.0; context_len];
            let expected = oracle_one_head(
                &row(&q_data, 0, h, q_heads, dim),
                &keys,
                &values,
                &bias,
                scale,
            );
            let actual = row(&out, 0, h, q_heads, dim);
            for (a, e) in actual.iter().zip(&expected) {
                assert!((a - e).abs() < 1e-5, "head {h}: {a} vs {e}");
            }
        }
    }

    #[test]
    fn decode_alibi_counts_back_from_last_position() {
        let (heads, dim, context_len) = (2, 4, 4);
        let scale = 0.5f32;
        let slopes_vec = vec![0.25f32, 0.75];
        let slopes = Tensor::from_vec(slopes_vec.clone(), (heads,), &Device::Cpu).unwrap();

        let mut cache = decode_cache(heads, dim);
        let k_data = ramp(context_len, heads, dim, 1.3);
        let v_data = ramp(context_len, heads, dim, 2.7);
        let k = tensor(k_data.clone(), context_len, heads, dim);
        let v = tensor(v_data.clone(), context_len, heads, dim);
        cache.write(&k, &v, &[0, 1, 2, 3]).unwrap();

        let q_data = ramp(1, heads, dim, 0.1);
        let q = tensor(q_data.clone(), 1, heads, dim);

        let out = single_query_cached_attention(
            &q,
            &cache,
            &[vec![0]],
            &[context_len],
            Some(&slopes),
            scale as f64,
        )
        .unwrap();
        let out = to_vec(&out);

        for h in 0..heads {
            let keys: Vec<Vec<f32>> = (0..context_len)
                .map(|t| row(&k_data, t, h, heads, dim))
                .collect();
            let values: Vec<Vec<f32>> = (0..context_len)
                .map(|t| row(&v_data, t, h, heads, dim))
                .collect();
            // Query sits at logical position context_len - 1
            let bias: Vec<f32> = (0..context_len)
                .map(|j| slopes_vec[h] * (j as i64 - (context_len as i64 - 1)) as f32)
                .collect();
            let expected =
                oracle_one_head(&row(&q_data, 0, h, heads, dim), &keys, &values, &bias, scale);
            let actual = row(&out, 0, h, heads, dim);
            for (a, e) in actual.iter().zip(&expected) {
                assert!((a - e).abs() < 1e-5, "head {h}: {a} vs {e}");
            }
        }
    }
}
