use candle_core::{Device, Result, Tensor};

/// Causal attention mask for one subsequence of length `seq_len`.
///
/// Returns `[1, seq_len, seq_len]` in f32: zero on and below the diagonal,
/// negative infinity strictly above. Built in f32 because scores are
/// accumulated in f32 before the softmax regardless of activation dtype.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, seq_len, seq_len), device)
}
