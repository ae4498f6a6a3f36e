mod common;

use common::*;
use hybrid_ml_pipeline::{GenerateOutput, GenerationConfig, PipelineEngine, Tensor};
use std::sync::atomic::Ordering;

fn gen_config(max_new_tokens: usize) -> GenerationConfig {
    GenerationConfig {
        max_new_tokens,
        greedy: true,
        ..Default::default()
    }
}

async fn run_generate(
    engines: Vec<PipelineEngine>,
    ids: Tensor,
    cu: Vec<i32>,
    eos: Option<i64>,
    gconfig: GenerationConfig,
    n_mb: usize,
) -> (Option<GenerateOutput>, Vec<PipelineEngine>) {
    let mut tasks = Vec::new();
    for e in engines {
        let (ids, cu, gconfig) = (ids.clone(), cu.clone(), gconfig.clone());
        tasks.push(tokio::spawn(async move {
            let mut e = e;
            e.initialize_comm().await.unwrap();
            let out = e
                .generate(ids, cu, toy_tokenizer(eos), gconfig, Some(n_mb))
                .await
                .unwrap();
            (out, e)
        }));
    }
    let mut result = None;
    let mut engines = Vec::new();
    for t in tasks {
        let (out, e) = t.await.unwrap();
        if out.is_some() {
            result = out;
        }
        engines.push(e);
    }
    (result, engines)
}

/// Greedy decoding through a 2-stage ring follows the toy recurrence
/// `next = prev + total_bias` for the full (internally extended) length.
#[tokio::test]
async fn two_stage_greedy_generation() {
    let (engines, _, arenas) = build_engines(2, 1.0, 7);
    let b = total_bias(2, 1.0) as i64; // 2

    let ids = Tensor::from_i64(vec![3], vec![1, 2, 3]).unwrap();
    let cu = vec![0, 2, 3];
    // user asks 3 tokens; the engine extends by num_stages - 1 internally
    let (out, engines) = run_generate(engines, ids, cu, None, gen_config(3), 2).await;
    let out = out.expect("last stage output");

    // seq0 ends at id 2, seq1 at id 3
    let expect_rows = [
        vec![2 + b, 2 + 2 * b, 2 + 3 * b, 2 + 4 * b],
        vec![3 + b, 3 + 2 * b, 3 + 3 * b, 3 + 4 * b],
    ];
    assert_eq!(out.gen_tokens.shape(), &[2, 4]);
    let toks = out.gen_tokens.as_i64().unwrap();
    assert_eq!(&toks[..4], expect_rows[0].as_slice());
    assert_eq!(&toks[4..], expect_rows[1].as_slice());

    // log-probs are finite and negative (peak logit is 0, distribution > 1 token)
    for &lp in out.log_probs.as_f32().unwrap() {
        assert!(lp.is_finite() && lp < 0.0);
    }
    // greedy path filters nothing
    assert!(out.logits_mask.is_none());

    // prompt logits cover all prompt tokens
    assert_eq!(out.prompt_logits.shape(), &[3, VOCAB]);

    // buffers clean, every KV lease returned
    for e in &engines {
        assert!(e.buffer_is_empty(), "buffer retained entries after generate");
    }
    for a in &arenas {
        assert_eq!(a.leased_count(), 0, "KV slots retained after generate");
    }
}

/// Identical inputs and parameters give bitwise-identical greedy outputs,
/// and the same engines can generate again.
#[tokio::test]
async fn greedy_generation_is_deterministic() {
    let ids = Tensor::from_i64(vec![2], vec![4, 6]).unwrap();
    let cu = vec![0, 1, 2];

    let (engines, _, _) = build_engines(2, 1.0, 1);
    let (out1, engines) = run_generate(
        engines,
        ids.clone(),
        cu.clone(),
        None,
        gen_config(4),
        2,
    )
    .await;
    // second run on the same engines
    let (out2, _) = run_generate(engines, ids.clone(), cu.clone(), None, gen_config(4), 2).await;

    // fresh engines, same seed
    let (fresh, _, _) = build_engines(2, 1.0, 1);
    let (out3, _) = run_generate(fresh, ids, cu, None, gen_config(4), 2).await;

    let t1 = out1.unwrap().gen_tokens;
    let t2 = out2.unwrap().gen_tokens;
    let t3 = out3.unwrap().gen_tokens;
    assert_eq!(t1, t2);
    assert_eq!(t1, t3);
}

/// EOS stops a micro-batch early; the engine drains the ring, pads the short
/// micro-batch, and no stage runs a forward pass during burn-out.
#[tokio::test]
async fn eos_early_termination_and_burn_out() {
    let (engines, counters, arenas) = build_engines(2, 1.0, 3);
    let b = total_bias(2, 1.0) as i64; // 2

    // seq0 walks 4, 6, 8, ...; seq1 walks 6, 8, ...; eos = 8
    let ids = Tensor::from_i64(vec![2], vec![2, 4]).unwrap();
    let cu = vec![0, 1, 2];
    let eos = Some(2 + 3 * b); // 8

    let (out, engines) = run_generate(engines, ids, cu, eos, gen_config(10), 2).await;
    let out = out.expect("last stage output");

    // mb0 generated 3 tokens (ends at eos), mb1 generated 2 and is padded
    assert_eq!(out.gen_tokens.shape(), &[2, 3]);
    let toks = out.gen_tokens.as_i64().unwrap();
    assert_eq!(&toks[..3], &[4, 6, 8]);
    assert_eq!(&toks[3..], &[6, 8, 0], "pad token fills the short row");

    // padded steps carry zero log-prob
    let lps = out.log_probs.as_f32().unwrap();
    assert_eq!(lps[5], 0.0);

    // last stage: 3 decode rounds for mb0 + 2 for mb1, nothing during
    // burn-out; first stage additionally ran one extra round for mb0
    assert_eq!(counters[1].load(Ordering::SeqCst), 5);
    assert_eq!(counters[0].load(Ordering::SeqCst), 7);

    for e in &engines {
        assert!(e.buffer_is_empty());
    }
    for a in &arenas {
        assert_eq!(a.leased_count(), 0);
    }
}

/// A four-stage ring also reproduces the recurrence.
#[tokio::test]
async fn four_stage_generation() {
    let (engines, _, _) = build_engines(4, 1.0, 5);
    let b = total_bias(4, 1.0) as i64; // 6

    // walks stay below the vocab ceiling: 1 + 5*6 = 31 < 32
    let ids = Tensor::from_i64(vec![2], vec![0, 1]).unwrap();
    let cu = vec![0, 1, 2];
    let (out, _) = run_generate(engines, ids, cu, None, gen_config(2), 2).await;
    let out = out.expect("last stage output");

    // user max 2 + (stages - 1) = 5 tokens per sequence
    assert_eq!(out.gen_tokens.shape(), &[2, 5]);
    let toks = out.gen_tokens.as_i64().unwrap();
    let row0: Vec<i64> = (1..=5).map(|k| k * b).collect();
    let row1: Vec<i64> = (1..=5).map(|k| 1 + k * b).collect();
    assert_eq!(&toks[..5], row0.as_slice());
    assert_eq!(&toks[5..], row1.as_slice());
}
