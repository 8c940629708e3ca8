//! Masked self-attention over a paged KV cache.
//!
//! The `Attention` module orchestrates one forward pass over a heterogeneous
//! batch: a prefill region of packed prompt subsequences followed by any
//! number of single-token decode rows reading their past from the cache.
//! Each region dispatches to either the reference or the fused accelerator
//! kernel (`Backend`), chosen per call from the configured override and
//! tensor residency.

mod backend;
mod error;
#[cfg(feature = "flash-attn")]
mod flash;
mod input;
mod naive;
mod ops;

pub use backend::{accelerator_compiled, resolve, Backend};
pub use error::AttentionError;
pub use input::InputParameters;
pub use ops::repeat_kv;

use candle_core::{Device, Tensor};

use crate::config::AttentionBackendConfig;
use crate::kv_cache::CacheEngine;

/// One attention layer's execution state: head geometry, scale, optional
/// ALiBi slopes, and the query-head → KV-head table for the fused decode
/// path. All of it is fixed at construction and shared by every forward
/// pass on this module.
#[derive(Debug)]
pub struct Attention {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    alibi_slopes: Option<Tensor>,
    kv_head_mapping: Tensor,
    backends: AttentionBackendConfig,
}

impl Attention {
    pub fn new(
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        scale: f64,
        alibi_slopes: Option<Tensor>,
        backends: AttentionBackendConfig,
        device: &Device,
    ) -> Result<Self, AttentionError> {
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(AttentionError::HeadsNotDivisible {
                num_heads,
                num_kv_heads,
            });
        }
        if let Some(slopes) = &alibi_slopes {
            if slopes.dims() != [num_heads] {
                return Err(AttentionError::Shape {
                    tensor: "alibi_slopes",
                    expected: format!("[{num_heads}]"),
                    found: slopes.dims().to_vec(),
                });
            }
        }

        // mapping[h] = h / num_kv_groups, i.e. arange(num_kv_heads)
        // repeat-interleaved by the group size
        let num_kv_groups = num_heads / num_kv_heads;
        let mapping: Vec<u32> = (0..num_kv_heads as u32)
            .flat_map(|h| std::iter::repeat(h).take(num_kv_groups))
            .collect();
        let kv_head_mapping = Tensor::from_vec(mapping, (num_heads,), device)?;

        Ok(Self {
            num_heads,
            num_kv_heads,
            head_dim,
            scale,
            alibi_slopes,
            kv_head_mapping,
            backends,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Query head → KV head table, `[num_heads]` u32.
    pub fn kv_head_mapping(&self) -> &Tensor {
        &self.kv_head_mapping
    }

    /// Run one attention forward pass over a mixed batch.
    ///
    /// `query` is `[T, num_heads * head_dim]`; `key`/`value` are
    /// `[T, num_kv_heads * head_dim]`. Tokens `[0, num_prompt_tokens)` form
    /// the prefill region, the rest are decode rows. K and V are written to
    /// `cache` at `input.slot_ids` before either kernel runs, so decode rows
    /// see their own freshly written token. Either region may be empty; an
    /// empty region contributes nothing to the output.
    ///
    /// Returns `[T, num_heads * head_dim]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        cache: &mut CacheEngine,
        input: &InputParameters,
    ) -> Result<Tensor, AttentionError> {
        let num_tokens = self.validate(query, key, value, input)?;

        let q = query.reshape((num_tokens, self.num_heads, self.head_dim))?;
        let k = key.reshape((num_tokens, self.num_kv_heads, self.head_dim))?;
        let v = value.reshape((num_tokens, self.num_kv_heads, self.head_dim))?;

        // The cache write happens-before both kernel invocations.
        cache.write(&k, &v, &input.slot_ids)?;

        if num_tokens == 0 {
            return Ok(query.clone());
        }

        let on_accelerator = query.device().is_cuda();
        let num_prompt_tokens = input.num_prompt_tokens;
        let mut chunks = Vec::with_capacity(2);

        if num_prompt_tokens > 0 {
            let q_p = q.narrow(0, 0, num_prompt_tokens)?;
            let k_p = k.narrow(0, 0, num_prompt_tokens)?;
            let v_p = v.narrow(0, 0, num_prompt_tokens)?;
            let out = match resolve(self.backends.prefill_backend, on_accelerator)? {
                Backend::Reference => naive::varlen_masked_attention(
                    &q_p,
                    &k_p,
                    &v_p,
                    self.alibi_slopes.as_ref(),
                    &input.cu_seq_lens,
                    self.scale,
                )?,
                Backend::Accelerator => self.prefill_accelerator(&q_p, &k_p, &v_p, input)?,
            };
            chunks.push(out);
        }

        if num_prompt_tokens < num_tokens {
            let num_decode = num_tokens - num_prompt_tokens;
            let q_d = q.narrow(0, num_prompt_tokens, num_decode)?;
            let out = match resolve(self.backends.decode_backend, on_accelerator)? {
                Backend::Reference => naive::single_query_cached_attention(
                    &q_d,
                    cache,
                    &input.block_tables,
                    &input.context_lens,
                    self.alibi_slopes.as_ref(),
                    self.scale,
                )?,
                Backend::Accelerator => self.decode_accelerator(&q_d, cache, input)?,
            };
            chunks.push(out);
        }

        let output = Tensor::cat(&chunks, 0)?;
        Ok(output.reshape((num_tokens, self.num_heads * self.head_dim))?)
    }

    #[cfg(feature = "flash-attn")]
    fn prefill_accelerator(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        input: &InputParameters,
    ) -> Result<Tensor, AttentionError> {
        flash::varlen_masked_attention(
            q,
            k,
            v,
            self.alibi_slopes.as_ref(),
            &input.cu_seq_lens,
            input.max_seq_len,
            self.scale,
        )
    }

    #[cfg(not(feature = "flash-attn"))]
    fn prefill_accelerator(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _input: &InputParameters,
    ) -> Result<Tensor, AttentionError> {
        Err(AttentionError::BackendUnavailable {
            reason: "crate built without the flash-attn feature",
        })
    }

    #[cfg(feature = "flash-attn")]
    fn decode_accelerator(
        &self,
        q: &Tensor,
        cache: &CacheEngine,
        input: &InputParameters,
    ) -> Result<Tensor, AttentionError> {
        flash::single_query_cached_attention(
            q,
            cache,
            &self.kv_head_mapping,
            &input.block_tables,
            &input.context_lens,
            input.max_context_len,
            self.alibi_slopes.as_ref(),
            self.scale,
        )
    }

    #[cfg(not(feature = "flash-attn"))]
    fn decode_accelerator(
        &self,
        _q: &Tensor,
        _cache: &CacheEngine,
        _input: &InputParameters,
    ) -> Result<Tensor, AttentionError> {
        Err(AttentionError::BackendUnavailable {
            reason: "crate built without the flash-attn feature",
        })
    }

    /// Check tensor shapes and descriptor consistency; returns T.
    fn validate(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        input: &InputParameters,
    ) -> Result<usize, AttentionError> {
        let q_width = self.num_heads * self.head_dim;
        let (num_tokens, found_width) = query.dims2().map_err(|_| AttentionError::Shape {
            tensor: "query",
            expected: format!("[num_tokens, {q_width}]"),
            found: query.dims().to_vec(),
        })?;
        if found_width != q_width {
            return Err(AttentionError::Shape {
                tensor: "query",
                expected: format!("[num_tokens, {q_width}]"),
                found: query.dims().to_vec(),
            });
        }

        let kv_width = self.num_kv_heads * self.head_dim;
        for (name, tensor) in [("key", key), ("value", value)] {
            match tensor.dims2() {
                Ok((tokens, width)) if tokens == num_tokens && width == kv_width => {}
                _ => {
                    return Err(AttentionError::Shape {
                        tensor: name,
                        expected: format!("[{num_tokens}, {kv_width}]"),
                        found: tensor.dims().to_vec(),
                    })
                }
            }
        }

        if input.slot_ids.len() != num_tokens {
            return Err(AttentionError::Shape {
                tensor: "slot_ids",
                expected: format!("[{num_tokens}]"),
                found: vec![input.slot_ids.len()],
            });
        }

        let num_prompt_tokens = input.num_prompt_tokens;
        if num_prompt_tokens > num_tokens {
            return Err(AttentionError::Shape {
                tensor: "num_prompt_tokens",
                expected: format!("<= {num_tokens}"),
                found: vec![num_prompt_tokens],
            });
        }
        if num_prompt_tokens > 0 {
            let cu = &input.cu_seq_lens;
            let valid = cu.first() == Some(&0)
                && cu.last() == Some(&num_prompt_tokens)
                && cu.windows(2).all(|w| w[0] <= w[1]);
            if !valid {
                return Err(AttentionError::Shape {
                    tensor: "cu_seq_lens",
                    expected: format!("cumulative lengths from 0 to {num_prompt_tokens}"),
                    found: cu.clone(),
                });
            }
        }

        let num_decode = num_tokens - num_prompt_tokens;
        if input.block_tables.len() != num_decode || input.context_lens.len() != num_decode {
            return Err(AttentionError::Shape {
                tensor: "block_tables/context_lens",
                expected: format!("[{num_decode}] each"),
                found: vec![input.block_tables.len(), input.context_lens.len()],
            });
        }

        Ok(num_tokens)
    }
}
