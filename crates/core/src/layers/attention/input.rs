use crate::kv_cache::BlockId;

/// Batch descriptor for one attention forward pass.
///
/// The token axis is flat: positions `[0, num_prompt_tokens)` are prefill
/// tokens belonging to one or more prompt subsequences, positions
/// `[num_prompt_tokens, T)` are decode tokens, one per running sequence.
/// Either region may be empty.
#[derive(Debug, Clone, Default)]
pub struct InputParameters {
    /// Destination slot for each token's K and V, length T.
    pub slot_ids: Vec<usize>,
    /// Boundary between the prefill and decode regions.
    pub num_prompt_tokens: usize,

    /// Cumulative prompt lengths, length S + 1; prompt i spans tokens
    /// `[cu_seq_lens[i], cu_seq_lens[i + 1])`. Prefill only.
    pub cu_seq_lens: Vec<usize>,
    /// Upper bound on the longest prompt length. Prefill only.
    pub max_seq_len: usize,

    /// Per-decode-row page list into the cache pool. Decode only.
    pub block_tables: Vec<Vec<BlockId>>,
    /// Current logical length of each decoding sequence, including the token
    /// written this pass. Decode only.
    pub context_lens: Vec<usize>,
    /// Longest context across decode rows. Decode only.
    pub max_context_len: usize,
}

impl InputParameters {
    /// Descriptor for a pure-prefill batch.
    ///
    /// `num_prompt_tokens` and `max_seq_len` are derived from `cu_seq_lens`.
    pub fn prefill(slot_ids: Vec<usize>, cu_seq_lens: Vec<usize>) -> Self {
        let num_prompt_tokens = cu_seq_lens.last().copied().unwrap_or(0);
        let max_seq_len = cu_seq_lens
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0);
        Self {
            slot_ids,
            num_prompt_tokens,
            cu_seq_lens,
            max_seq_len,
            ..Self::default()
        }
    }

    /// Descriptor for a pure-decode batch, one token per sequence.
    pub fn decode(
        slot_ids: Vec<usize>,
        block_tables: Vec<Vec<BlockId>>,
        context_lens: Vec<usize>,
    ) -> Self {
        let max_context_len = context_lens.iter().copied().max().unwrap_or(0);
        Self {
            slot_ids,
            num_prompt_tokens: 0,
            block_tables,
            context_lens,
            max_context_len,
            ..Self::default()
        }
    }

    /// Mixed batch: prefill region followed by decode rows.
    pub fn mixed(prefill: InputParameters, decode: InputParameters) -> Self {
        let mut slot_ids = prefill.slot_ids;
        slot_ids.extend(decode.slot_ids);
        Self {
            slot_ids,
            num_prompt_tokens: prefill.num_prompt_tokens,
            cu_seq_lens: prefill.cu_seq_lens,
            max_seq_len: prefill.max_seq_len,
            block_tables: decode.block_tables,
            context_lens: decode.context_lens,
            max_context_len: decode.max_context_len,
        }
    }

    /// Total tokens on the flat axis.
    pub fn num_tokens(&self) -> usize {
        self.slot_ids.len()
    }

    /// Number of single-token decode rows.
    pub fn num_decode_tokens(&self) -> usize {
        self.num_tokens() - self.num_prompt_tokens
    }
}
