use std::collections::BTreeMap;

use crate::error::TensorError;
use crate::tensor::{DType, Tensor};

/// Per-micro-batch record that flows stage to stage. `cu_seqlens` and
/// `max_seqlen` are configuration: they must be identical on every stage for
/// the same micro-batch. The stage module consumes `pp_input` and leaves its
/// result in `pp_output`.
#[derive(Debug, Clone, Default)]
pub struct TransferData {
    pub cu_seqlens: Vec<i32>,
    pub max_seqlen: usize,
    pub store_kv_cache: bool,
    pub pp_input: Option<Tensor>,
    pub pp_output: Option<Tensor>,
}

/// The configuration part of [`TransferData`], cached per micro-batch so that
/// received activations can be rehydrated without re-deriving it.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub cu_seqlens: Vec<i32>,
    pub max_seqlen: usize,
    pub store_kv_cache: bool,
}

impl TransferInfo {
    pub fn with_input(&self, pp_input: Tensor) -> TransferData {
        TransferData {
            cu_seqlens: self.cu_seqlens.clone(),
            max_seqlen: self.max_seqlen,
            store_kv_cache: self.store_kv_cache,
            pp_input: Some(pp_input),
            pp_output: None,
        }
    }
}

/// Per-layer state that stays on its stage. Created lazily; `k_cache` and
/// `v_cache` are filled on the first generation step and mutated in place on
/// every step after that.
#[derive(Debug, Clone, Default)]
pub struct CacheData {
    pub input_ids: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub k_cache: Option<Tensor>,
    pub v_cache: Option<Tensor>,
    pub cache_seqlens: Option<Vec<i32>>,
}

/// Data-layout class of a transferable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// One scalar per sequence, shape `(1,)`.
    PerSeq,
    /// Cumulative lengths of a single sequence, shape `(2,)`.
    CuSeqlens,
    /// One value per token, shape `(s,)`.
    Tokens,
    /// One value per token transition, shape `(s - 1,)`.
    TokensMinusOne,
}

/// Layout of a known packed-data key. Unknown keys are a hard error: the
/// transfer path never negotiates metadata.
pub fn key_layout(key: &str) -> Result<KeyLayout, TensorError> {
    match key {
        "input_lens" | "prompt_lens" | "seq_no_eos_mask" | "rewards" | "reward_score"
        | "group_factor" => Ok(KeyLayout::PerSeq),
        "cu_seqlens" | "prompt_cu_seqlens" => Ok(KeyLayout::CuSeqlens),
        "packed_seq" | "prompt_mask" | "packed_input_ids" | "values" | "packed_prompts" => {
            Ok(KeyLayout::Tokens)
        }
        "packed_logprobs" | "packed_ref_logprobs" | "old_logp" | "ref_logp" | "advantages"
        | "ppo_loss_mask" | "kl_rewards" | "returns" => Ok(KeyLayout::TokensMinusOne),
        _ => Err(TensorError::UnknownKey {
            key: key.to_string(),
        }),
    }
}

/// Dtype of a known packed-data key.
pub fn key_dtype(key: &str) -> Result<DType, TensorError> {
    match key {
        "seq_no_eos_mask" | "ppo_loss_mask" | "prompt_mask" => Ok(DType::Bool),
        "reward_score" | "packed_ref_logprobs" | "old_logp" | "ref_logp" | "advantages"
        | "kl_rewards" | "returns" | "values" => Ok(DType::F16),
        "input_lens" | "prompt_lens" | "cu_seqlens" | "prompt_cu_seqlens" => Ok(DType::I32),
        "packed_seq" | "packed_input_ids" | "packed_prompts" => Ok(DType::I64),
        "rewards" | "packed_logprobs" | "group_factor" => Ok(DType::F32),
        _ => Err(TensorError::UnknownKey {
            key: key.to_string(),
        }),
    }
}

/// Shape of a known key for a single sequence of length `seqlen`.
pub fn key_shape(key: &str, seqlen: usize) -> Result<Vec<usize>, TensorError> {
    Ok(match key_layout(key)? {
        KeyLayout::PerSeq => vec![1],
        KeyLayout::CuSeqlens => vec![2],
        KeyLayout::Tokens => vec![seqlen],
        KeyLayout::TokensMinusOne => vec![seqlen - 1],
    })
}

/// A packed named-array: a set of tensors describing the same batch of
/// variable-length sequences, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedBatch {
    entries: BTreeMap<String, Tensor>,
}

impl NamedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I: IntoIterator<Item = (String, Tensor)>>(entries: I) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> BTreeMap<String, Tensor> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rename keys according to `remap`, leaving unmapped keys untouched.
    pub fn remap_keys(self, remap: &BTreeMap<String, String>) -> Self {
        Self {
            entries: self
                .entries
                .into_iter()
                .map(|(k, v)| match remap.get(&k) {
                    Some(nk) => (nk.clone(), v),
                    None => (k, v),
                })
                .collect(),
        }
    }

    /// Per-sequence lengths of this batch. Tried in priority order:
    /// `input_lens`, `cu_seqlens` differences, `prompt_lens`,
    /// `prompt_cu_seqlens` differences. The generated-text length wins over
    /// the prompt length when both are present.
    pub fn seqlens(&self) -> Option<Vec<i32>> {
        if let Some(t) = self.get("input_lens") {
            return t.as_i32().ok().map(|v| v.to_vec());
        }
        if let Some(t) = self.get("cu_seqlens") {
            return t.as_i32().ok().map(|cu| diffs(cu));
        }
        if let Some(t) = self.get("prompt_lens") {
            return t.as_i32().ok().map(|v| v.to_vec());
        }
        if let Some(t) = self.get("prompt_cu_seqlens") {
            return t.as_i32().ok().map(|cu| diffs(cu));
        }
        None
    }

    /// Number of sequences in the batch.
    pub fn batch_size(&self) -> Option<usize> {
        self.seqlens().map(|l| l.len())
    }

    /// Split a packed batch into `n` contiguous groups of sequences with
    /// roughly balanced token counts. Every key is sliced according to its
    /// layout; `cu_seqlens`-style keys are rebuilt per group.
    pub fn scatter(&self, n: usize) -> Result<Vec<NamedBatch>, TensorError> {
        let lens = self.seqlens().ok_or_else(|| TensorError::UnknownKey {
            key: "input_lens/cu_seqlens".into(),
        })?;
        let parts = partition_balanced(&lens, n);
        self.split_by(&parts, &lens)
    }

    /// Split a packed batch into one sub-batch per sequence.
    pub fn split_into_seqs(&self) -> Result<Vec<NamedBatch>, TensorError> {
        let lens = self.seqlens().ok_or_else(|| TensorError::UnknownKey {
            key: "input_lens/cu_seqlens".into(),
        })?;
        let parts: Vec<std::ops::Range<usize>> = (0..lens.len()).map(|i| i..i + 1).collect();
        self.split_by(&parts, &lens)
    }

    fn split_by(
        &self,
        parts: &[std::ops::Range<usize>],
        lens: &[i32],
    ) -> Result<Vec<NamedBatch>, TensorError> {
        let tok_offsets = cumsum(lens);
        let trans_lens: Vec<i32> = lens.iter().map(|&l| l - 1).collect();
        let trans_offsets = cumsum(&trans_lens);

        let mut out = Vec::with_capacity(parts.len());
        for part in parts {
            let mut batch = NamedBatch::new();
            for (key, tensor) in &self.entries {
                let sliced = match key_layout(key)? {
                    KeyLayout::PerSeq => tensor.slice_rows(part.start, part.end)?,
                    KeyLayout::CuSeqlens => {
                        let part_lens = &lens[part.clone()];
                        let cu = cumsum(part_lens);
                        Tensor::from_i32(vec![cu.len()], cu)?
                    }
                    KeyLayout::Tokens => tensor.slice_rows(
                        tok_offsets[part.start] as usize,
                        tok_offsets[part.end] as usize,
                    )?,
                    KeyLayout::TokensMinusOne => tensor.slice_rows(
                        trans_offsets[part.start] as usize,
                        trans_offsets[part.end] as usize,
                    )?,
                };
                batch.insert(key.clone(), sliced);
            }
            out.push(batch);
        }
        Ok(out)
    }

    /// Concatenate sub-batches back into one packed batch, rebuilding
    /// cumulative-length keys.
    pub fn gather(batches: &[NamedBatch]) -> Result<NamedBatch, TensorError> {
        let first = batches.first().ok_or_else(|| TensorError::UnknownKey {
            key: "<empty gather>".into(),
        })?;
        let mut out = NamedBatch::new();
        for key in first.entries.keys() {
            let parts: Vec<&Tensor> = batches
                .iter()
                .filter_map(|b| b.get(key))
                .collect();
            if parts.len() != batches.len() {
                return Err(TensorError::UnknownKey { key: key.clone() });
            }
            let merged = match key_layout(key)? {
                KeyLayout::CuSeqlens => {
                    let mut lens: Vec<i32> = Vec::new();
                    for p in &parts {
                        lens.extend(diffs(p.as_i32()?));
                    }
                    let cu = cumsum(&lens);
                    Tensor::from_i32(vec![cu.len()], cu)?
                }
                _ => {
                    let owned: Vec<Tensor> = parts.into_iter().cloned().collect();
                    Tensor::cat(&owned)?
                }
            };
            out.insert(key.clone(), merged);
        }
        Ok(out)
    }
}

/// Contiguous partition of sequences into `n` groups with roughly equal token
/// counts. Panics never; groups may be empty only when there are fewer
/// sequences than groups, which callers reject earlier.
pub fn partition_balanced(lens: &[i32], n: usize) -> Vec<std::ops::Range<usize>> {
    let total: i64 = lens.iter().map(|&l| l as i64).sum();
    let mut parts = Vec::with_capacity(n);
    let mut start = 0usize;
    let mut acc: i64 = 0;
    for k in 0..n {
        let target = (total * (k as i64 + 1)) / n as i64;
        let mut end = start;
        // leave at least one sequence for each remaining group
        let reserve = n - k - 1;
        while end < lens.len().saturating_sub(reserve) && (acc < target || end == start) {
            acc += lens[end] as i64;
            end += 1;
        }
        parts.push(start..end);
        start = end;
    }
    if let Some(last) = parts.last_mut() {
        last.end = lens.len();
    }
    parts
}

/// Pad a packed input so its token count divides the tensor-parallel degree.
/// The pad is appended as one extra sequence of zero tokens; returns the new
/// ids, cu_seqlens, max_seqlen and the pad size to strip from outputs.
pub fn pad_sequence_parallel_input(
    packed_input_ids: &[i64],
    cu_seqlens: &[i32],
    max_seqlen: usize,
    tp_size: usize,
) -> (Vec<i64>, Vec<i32>, usize, usize) {
    let total = packed_input_ids.len();
    let pad_size = (tp_size - total % tp_size) % tp_size;
    if pad_size == 0 {
        return (
            packed_input_ids.to_vec(),
            cu_seqlens.to_vec(),
            max_seqlen,
            0,
        );
    }
    let mut ids = packed_input_ids.to_vec();
    ids.extend(std::iter::repeat(0).take(pad_size));
    let mut cu = cu_seqlens.to_vec();
    cu.push(total as i32 + pad_size as i32);
    (ids, cu, max_seqlen.max(pad_size), pad_size)
}

/// Generation-mode variant: pads whole sequences so the batch size divides
/// the tensor-parallel degree (decoding emits one token per sequence per
/// step). Returns `(ids, cu_seqlens, max_seqlen, pad_size, pad_seq_size)`.
pub fn pad_sequence_parallel_generate_input(
    packed_input_ids: &[i64],
    cu_seqlens: &[i32],
    max_seqlen: usize,
    tp_size: usize,
) -> (Vec<i64>, Vec<i32>, usize, usize, usize) {
    let bs = cu_seqlens.len() - 1;
    let pad_seq_size = (tp_size - bs % tp_size) % tp_size;
    let mut ids = packed_input_ids.to_vec();
    let mut cu = cu_seqlens.to_vec();
    for _ in 0..pad_seq_size {
        ids.push(0);
        cu.push(*cu.last().unwrap_or(&0) + 1);
    }
    let pad_size = pad_seq_size;
    (ids, cu, max_seqlen.max(1), pad_size, pad_seq_size)
}

fn diffs(cu: &[i32]) -> Vec<i32> {
    cu.windows(2).map(|w| w[1] - w[0]).collect()
}

fn cumsum(lens: &[i32]) -> Vec<i32> {
    let mut out = Vec::with_capacity(lens.len() + 1);
    let mut acc = 0;
    out.push(0);
    for &l in lens {
        acc += l;
        out.push(acc);
    }
    out
}
