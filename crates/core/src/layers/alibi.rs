//! ALiBi (Attention with Linear Biases) positional bias.
//!
//! Instead of encoding positions into embeddings, ALiBi adds a linear bias to
//! pre-softmax attention scores: for a query at position i and a key at
//! position j, `bias[h, i, j] = slope[h] * (j - i)`. Under a causal mask the
//! bias is non-positive, penalizing distant past tokens.
//!
//! Slopes form a geometric sequence per the paper ("Train Short, Test Long",
//! <https://arxiv.org/abs/2108.12409>), with a second, tighter sequence
//! appended for non-power-of-two head counts.

use candle_core::{DType, Result, Tensor};

/// Compute ALiBi slopes for the given number of heads.
///
/// Slopes are always positive and decrease geometrically; head 0 carries the
/// largest slope.
pub fn compute_alibi_slopes(num_heads: usize) -> Vec<f32> {
    // Closest power of 2 <= num_heads
    let closest_power_of_2 = 1usize << ((num_heads as f64).log2().floor() as u32);

    // base = 2^(-(2^(-(log2(n) - 3))))
    let exponent = -((closest_power_of_2 as f64).log2() - 3.0);
    let base = 2.0_f64.powf(-(2.0_f64.powf(exponent)));

    let mut slopes: Vec<f32> = (1..=closest_power_of_2)
        .map(|i| base.powi(i as i32) as f32)
        .collect();

    if closest_power_of_2 != num_heads {
        // Extra slopes with a tighter ratio, odd powers only
        let extra_exponent = -((2 * closest_power_of_2) as f64).log2() + 3.0;
        let extra_base = 2.0_f64.powf(-(2.0_f64.powf(extra_exponent)));

        let num_remaining = (num_heads - closest_power_of_2).min(closest_power_of_2);
        slopes.extend((0..num_remaining).map(|i| extra_base.powi((1 + 2 * i) as i32) as f32));
    }

    slopes
}

/// Build the ALiBi bias matrix for one subsequence.
///
/// `slopes` has shape `[num_heads]`. The query span covers the last
/// `seq_len` positions of a `kv_len`-long context, so
/// `bias[h, i, j] = slopes[h] * (j - (kv_len - seq_len + i))`.
/// For decode (`seq_len = 1`) this reduces to `slopes[h] * (j - (L - 1))`.
///
/// Returns `[num_heads, seq_len, kv_len]` in f32, the dtype of the score
/// accumulation.
pub fn build_alibi_bias(slopes: &Tensor, seq_len: usize, kv_len: usize) -> Result<Tensor> {
    let num_heads = slopes.dim(0)?;
    let kv_offset = kv_len - seq_len;

    let distances: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..kv_len).map(move |j| (j as i64 - (kv_offset + i) as i64) as f32))
        .collect();
    let distance_matrix = Tensor::from_vec(distances, (1, seq_len, kv_len), slopes.device())?;

    let slopes = slopes.to_dtype(DType::F32)?.reshape((num_heads, 1, 1))?;
    distance_matrix.broadcast_mul(&slopes)
}
