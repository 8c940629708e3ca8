use thiserror::Error;

use crate::kv_cache::CacheError;

#[derive(Error, Debug)]
pub enum AttentionError {
    #[error("{tensor} has shape {found:?}, expected {expected}")]
    Shape {
        tensor: &'static str,
        expected: String,
        found: Vec<usize>,
    },

    #[error("{num_heads} query heads not divisible by {num_kv_heads} kv heads")]
    HeadsNotDivisible {
        num_heads: usize,
        num_kv_heads: usize,
    },

    #[error("accelerator backend unavailable: {reason}")]
    BackendUnavailable { reason: &'static str },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
