use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::tensor::Tensor;

/// Decoding parameters for one generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Before this many tokens the EOS logit is masked to -inf.
    pub min_new_tokens: usize,
    /// Hard cap on generated tokens. The engine internally adds
    /// `num_stages - 1` for termination draining.
    pub max_new_tokens: usize,
    /// Divides logits before top-k/top-p.
    pub temperature: f32,
    /// Argmax decoding when true; categorical sampling otherwise.
    pub greedy: bool,
    /// Nucleus cutoff; 1.0 disables.
    pub top_p: f32,
    /// Top-k cutoff; 0 disables.
    pub top_k: usize,
    /// Samples per prompt.
    pub num_samples: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_new_tokens: 1,
            max_new_tokens: 10,
            temperature: 1.0,
            greedy: true,
            top_p: 1.0,
            top_k: 0,
            num_samples: 1,
        }
    }
}

/// The token ids the engine needs from a tokenizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokenizer {
    pub vocab_size: usize,
    pub eos_token_id: Option<i64>,
    pub pad_token_id: Option<i64>,
}

impl Tokenizer {
    pub fn new(vocab_size: usize, eos_token_id: Option<i64>, pad_token_id: Option<i64>) -> Self {
        Self {
            vocab_size,
            eos_token_id,
            pad_token_id,
        }
    }
}

/// Result of one decoding step on the last stage.
#[derive(Debug)]
pub struct GenStep {
    /// Sampled token per row, `[bs]` i64. Finished rows carry the pad token.
    pub next_tokens: Tensor,
    /// Log-probability of the chosen token per row, `[bs]` f32.
    pub logprob: Tensor,
    /// Rows x vocab mask of logits that survived filtering; `None` when
    /// nothing was filtered.
    pub logits_mask: Option<Tensor>,
    /// Whether generation for this micro-batch is done.
    pub terminate: bool,
    /// Updated per-row unfinished flags.
    pub unfinished: Vec<bool>,
}

/// One decoding step: mask EOS during the minimum-length window, apply
/// temperature and top-k/top-p filtering, pick a token per row, and decide
/// termination. `generated_idx` is the number of tokens produced so far for
/// this micro-batch.
pub fn genstep<R: Rng>(
    next_token_logits: &Tensor,
    tokenizer: &Tokenizer,
    unfinished: &[bool],
    generated_idx: usize,
    gconfig: &GenerationConfig,
    rng: &mut R,
) -> Result<GenStep> {
    let shape = next_token_logits.shape();
    if shape.len() != 2 {
        return Err(PipelineError::Protocol(format!(
            "genstep expects [batch, vocab] logits, got {shape:?}"
        )));
    }
    let (bs, vocab) = (shape[0], shape[1]);
    if unfinished.len() != bs {
        return Err(PipelineError::Protocol(format!(
            "unfinished flags {} != batch {bs}",
            unfinished.len()
        )));
    }
    let mut logits = next_token_logits.to_f32_vec().map_err(PipelineError::Tensor)?;

    if generated_idx < gconfig.min_new_tokens {
        if let Some(eos) = tokenizer.eos_token_id {
            let eos = eos as usize;
            for row in 0..bs {
                logits[row * vocab + eos] = f32::NEG_INFINITY;
            }
        }
    }

    let mut filtered = false;
    if !gconfig.greedy {
        if gconfig.temperature != 1.0 {
            for v in logits.iter_mut() {
                *v /= gconfig.temperature;
            }
        }
        for row in 0..bs {
            let row_logits = &mut logits[row * vocab..(row + 1) * vocab];
            filtered |= top_k_top_p_filter(row_logits, gconfig.top_k, gconfig.top_p);
        }
    }

    let mut next_tokens = vec![0i64; bs];
    let mut logprobs = vec![0f32; bs];
    for row in 0..bs {
        let row_logits = &logits[row * vocab..(row + 1) * vocab];
        let chosen = if gconfig.greedy {
            argmax(row_logits)
        } else {
            sample_categorical(row_logits, rng)?
        };
        logprobs[row] = log_softmax_at(row_logits, chosen);
        next_tokens[row] = chosen as i64;
    }

    // finished rows emit the pad token
    if let Some(pad) = tokenizer.pad_token_id {
        for row in 0..bs {
            if !unfinished[row] {
                next_tokens[row] = pad;
            }
        }
    }

    let unfinished: Vec<bool> = unfinished
        .iter()
        .zip(&next_tokens)
        .map(|(&u, &t)| u && Some(t) != tokenizer.eos_token_id)
        .collect();

    let terminate =
        generated_idx >= gconfig.max_new_tokens.saturating_sub(1) || unfinished.iter().all(|&u| !u);

    let logits_mask = if filtered {
        let mask: Vec<bool> = logits.iter().map(|&v| v != f32::MIN).collect();
        if mask.iter().all(|&b| b) {
            None
        } else {
            Some(Tensor::from_bool(vec![bs, vocab], mask).map_err(PipelineError::Tensor)?)
        }
    } else {
        None
    };

    Ok(GenStep {
        next_tokens: Tensor::from_i64(vec![bs], next_tokens).map_err(PipelineError::Tensor)?,
        logprob: Tensor::from_f32(vec![bs], logprobs).map_err(PipelineError::Tensor)?,
        logits_mask,
        terminate,
        unfinished,
    })
}

/// In-place, unordered top-k then top-p filtering. Filtered positions are set
/// to `f32::MIN`. Returns whether anything was filtered.
fn top_k_top_p_filter(logits: &mut [f32], top_k: usize, top_p: f32) -> bool {
    let mut any = false;

    if top_k > 0 && top_k < logits.len() {
        let mut sorted: Vec<f32> = logits.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let threshold = sorted[top_k - 1];
        for v in logits.iter_mut() {
            if *v < threshold {
                *v = f32::MIN;
                any = true;
            }
        }
    }

    if top_p < 1.0 {
        let mut order: Vec<usize> = (0..logits.len()).collect();
        order.sort_by(|&a, &b| {
            logits[b]
                .partial_cmp(&logits[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let probs = softmax(logits);
        let mut cumulative = 0f32;
        let mut cut = false;
        for &idx in &order {
            if cut {
                logits[idx] = f32::MIN;
                any = true;
                continue;
            }
            cumulative += probs[idx];
            if cumulative >= top_p {
                // keep the token that crosses the threshold, drop the rest
                cut = true;
            }
        }
    }

    any
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn log_softmax_at(logits: &[f32], idx: usize) -> f32 {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|&v| (v - max).exp()).sum();
    logits[idx] - max - sum.ln()
}

fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    best
}

fn sample_categorical<R: Rng>(logits: &[f32], rng: &mut R) -> Result<usize> {
    let probs = softmax(logits);
    let dist = WeightedIndex::new(&probs)
        .map_err(|e| PipelineError::Protocol(format!("degenerate sampling distribution: {e}")))?;
    Ok(dist.sample(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn eos_peaked_logits(bs: usize, vocab: usize, eos: usize) -> Tensor {
        let mut data = vec![0f32; bs * vocab];
        for row in 0..bs {
            for v in 0..vocab {
                data[row * vocab + v] = if v == eos { 10.0 } else { v as f32 * 0.1 };
            }
        }
        Tensor::from_f32(vec![bs, vocab], data).unwrap()
    }

    fn tok(vocab: usize) -> Tokenizer {
        Tokenizer::new(vocab, Some((vocab - 1) as i64), Some(0))
    }

    #[test]
    fn min_new_tokens_blocks_eos() {
        let vocab = 8;
        let tokenizer = tok(vocab);
        let logits = eos_peaked_logits(2, vocab, vocab - 1);
        let gconfig = GenerationConfig {
            min_new_tokens: 3,
            max_new_tokens: 10,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mut unfinished = vec![true, true];
        for step in 0..3 {
            let out = genstep(&logits, &tokenizer, &unfinished, step, &gconfig, &mut rng).unwrap();
            for &t in out.next_tokens.as_i64().unwrap() {
                assert_ne!(t, tokenizer.eos_token_id.unwrap(), "step {step}");
            }
            assert!(!out.terminate);
            unfinished = out.unfinished;
        }
        // step 3: EOS allowed again, argmax picks it, everything finishes
        let out = genstep(&logits, &tokenizer, &unfinished, 3, &gconfig, &mut rng).unwrap();
        assert!(out
            .next_tokens
            .as_i64()
            .unwrap()
            .iter()
            .all(|&t| t == tokenizer.eos_token_id.unwrap()));
        assert!(out.terminate);
        assert!(out.unfinished.iter().all(|&u| !u));
    }

    #[test]
    fn terminate_at_max_new_tokens() {
        let vocab = 8;
        let tokenizer = tok(vocab);
        // argmax at a non-EOS token
        let logits =
            Tensor::from_f32(vec![1, vocab], vec![0.0, 9.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let gconfig = GenerationConfig {
            max_new_tokens: 4,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        for idx in 0..3 {
            let out = genstep(&logits, &tokenizer, &[true], idx, &gconfig, &mut rng).unwrap();
            assert!(!out.terminate, "idx {idx}");
        }
        let out = genstep(&logits, &tokenizer, &[true], 3, &gconfig, &mut rng).unwrap();
        assert!(out.terminate);
    }

    #[test]
    fn greedy_is_deterministic() {
        let vocab = 16;
        let tokenizer = tok(vocab);
        let data: Vec<f32> = (0..2 * vocab).map(|i| ((i * 37) % 13) as f32).collect();
        let logits = Tensor::from_f32(vec![2, vocab], data).unwrap();
        let gconfig = GenerationConfig::default();
        let mut r1 = StdRng::seed_from_u64(1);
        let mut r2 = StdRng::seed_from_u64(999);
        let a = genstep(&logits, &tokenizer, &[true, true], 1, &gconfig, &mut r1).unwrap();
        let b = genstep(&logits, &tokenizer, &[true, true], 1, &gconfig, &mut r2).unwrap();
        assert_eq!(a.next_tokens, b.next_tokens);
        assert!(a.logits_mask.is_none(), "greedy path filters nothing");
    }

    #[test]
    fn finished_rows_emit_pad() {
        let vocab = 8;
        let tokenizer = tok(vocab);
        let logits = eos_peaked_logits(2, vocab, 3);
        let gconfig = GenerationConfig {
            min_new_tokens: 0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let out = genstep(&logits, &tokenizer, &[false, true], 2, &gconfig, &mut rng).unwrap();
        let toks = out.next_tokens.as_i64().unwrap();
        assert_eq!(toks[0], tokenizer.pad_token_id.unwrap());
        assert_eq!(toks[1], 3);
    }

    #[test]
    fn top_k_masks_low_logits() {
        let mut row = vec![1.0, 5.0, 3.0, 2.0, 4.0];
        let any = top_k_top_p_filter(&mut row, 2, 1.0);
        assert!(any);
        assert_eq!(row[1], 5.0);
        assert_eq!(row[4], 4.0);
        assert_eq!(row[0], f32::MIN);
        assert_eq!(row[2], f32::MIN);
        assert_eq!(row[3], f32::MIN);
    }

    #[test]
    fn top_p_keeps_nucleus() {
        // probs ~ [0.64, 0.24, 0.09, 0.03]; top_p = 0.7 keeps the first two
        let mut row = vec![4.0, 3.0, 2.0, 1.0];
        let any = top_k_top_p_filter(&mut row, 0, 0.7);
        assert!(any);
        assert_eq!(row[0], 4.0);
        assert_eq!(row[1], 3.0);
        assert_eq!(row[2], f32::MIN);
        assert_eq!(row[3], f32::MIN);
    }

    #[test]
    fn sampling_respects_filter_mask() {
        let vocab = 6;
        let tokenizer = tok(vocab);
        let logits =
            Tensor::from_f32(vec![1, vocab], vec![5.0, 4.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        let gconfig = GenerationConfig {
            greedy: false,
            top_k: 2,
            min_new_tokens: 0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let out = genstep(&logits, &tokenizer, &[true], 1, &gconfig, &mut rng).unwrap();
            let t = out.next_tokens.as_i64().unwrap()[0];
            assert!(t == 0 || t == 1, "sampled outside top-k: {t}");
            let mask = out.logits_mask.expect("filtering produced a mask");
            let m = mask.as_bool().unwrap();
            assert_eq!(&m[..2], &[true, true]);
            assert!(m[2..].iter().all(|&b| !b));
        }
    }

    #[test]
    fn logprob_matches_distribution() {
        let row = vec![1.0f32, 2.0, 3.0];
        let lp = log_softmax_at(&row, 2);
        let probs = softmax(&row);
        assert!((lp - probs[2].ln()).abs() < 1e-6);
    }
}
