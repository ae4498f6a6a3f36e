mod common;

use common::*;
use hybrid_ml_pipeline::{
    CommWorld, DType, EngineConfig, MemoryArena, ModelContext, ModelDims, ModelName, NamedBatch,
    ParallelGrid, PipelineEngine, Tensor, Topology,
};
use std::sync::Arc;

fn batch_parts(batch: &NamedBatch) -> (Tensor, Vec<i32>) {
    (
        batch.get("packed_input_ids").unwrap().clone(),
        batch.get("cu_seqlens").unwrap().as_i32().unwrap().to_vec(),
    )
}

/// Forward through a 2-stage pipeline and compare the packed logits against
/// the single-process reference.
#[tokio::test]
async fn two_stage_forward_matches_reference() {
    let (mut engines, _, _) = build_engines(2, 1.0, 0);
    let batch = packed_batch(&[&[1, 2, 3], &[4, 5], &[6, 7, 8, 9]]);
    let (ids, cu) = batch_parts(&batch);
    let expected = reference_logits(ids.as_i64().unwrap(), total_bias(2, 1.0));

    let last = engines.pop().unwrap();
    let first = engines.pop().unwrap();

    let t0 = tokio::spawn(async move {
        let mut e = first;
        e.initialize_comm().await.unwrap();
        let ids = ids;
        let out = e.forward(ids, cu, None, Some(2)).await.unwrap();
        assert!(out.is_none(), "only the last stage emits logits");
        assert!(e.buffer_is_empty(), "buffer must be clean after forward");
    });
    let (ids2, cu2) = batch_parts(&batch);
    let t1 = tokio::spawn(async move {
        let mut e = last;
        e.initialize_comm().await.unwrap();
        let out = e.forward(ids2, cu2, None, Some(2)).await.unwrap();
        assert!(e.buffer_is_empty(), "buffer must be clean after forward");
        out.expect("last stage emits logits")
    });

    t0.await.unwrap();
    let logits = t1.await.unwrap();
    assert_eq!(logits.shape(), &[9, VOCAB]);
    let got = logits.as_f32().unwrap();
    for (i, (&g, &e)) in got.iter().zip(&expected).enumerate() {
        assert!((g - e).abs() < 1e-5, "logit {i}: {g} vs {e}");
    }
}

/// Four stages, two back-to-back forward calls on the same engines.
#[tokio::test]
async fn four_stage_repeated_forward() {
    let (engines, _, _) = build_engines(4, 1.0, 0);
    let batch = packed_batch(&[&[1, 2], &[3, 4, 5], &[6], &[7, 8]]);
    let (ids, cu) = batch_parts(&batch);
    let expected = reference_logits(ids.as_i64().unwrap(), total_bias(4, 1.0));

    let mut tasks = Vec::new();
    for e in engines {
        let (ids, cu) = (ids.clone(), cu.clone());
        tasks.push(tokio::spawn(async move {
            let mut e = e;
            e.initialize_comm().await.unwrap();
            let mut last = None;
            for _ in 0..2 {
                last = e
                    .forward(ids.clone(), cu.clone(), None, Some(2))
                    .await
                    .unwrap();
                assert!(e.buffer_is_empty());
            }
            last
        }));
    }

    let mut outputs = Vec::new();
    for t in tasks {
        outputs.push(t.await.unwrap());
    }
    // only the last stage produced logits
    assert!(outputs[..3].iter().all(Option::is_none));
    let logits = outputs[3].as_ref().unwrap();
    let got = logits.as_f32().unwrap();
    for (i, (&g, &e)) in got.iter().zip(&expected).enumerate() {
        assert!((g - e).abs() < 1e-5, "logit {i}: {g} vs {e}");
    }
}

/// eval_batch returns the batch-average SFT loss on the last stage.
#[tokio::test]
async fn two_stage_eval_batch_loss() {
    let (mut engines, _, _) = build_engines(2, 1.0, 0);
    // equal-length sequences so micro-batch averaging equals the global mean
    let batch = packed_batch(&[&[1, 2, 3], &[4, 5, 6]]);
    let (ids, cu) = batch_parts(&batch);

    // reference loss from the reference logits
    let expected_logits = Tensor::from_f32(
        vec![6, VOCAB],
        reference_logits(ids.as_i64().unwrap(), total_bias(2, 1.0)),
    )
    .unwrap();
    let mut extras = NamedBatch::new();
    extras.insert("prompt_mask", batch.get("prompt_mask").unwrap().clone());
    let (expected_loss, _) = hybrid_ml_pipeline::compute_packed_sft_loss(
        &expected_logits,
        &ids,
        &cu,
        &extras,
    )
    .unwrap();

    let mut loss_inputs = NamedBatch::new();
    loss_inputs.insert("prompt_mask", batch.get("prompt_mask").unwrap().clone());
    loss_inputs.insert("input_lens", Tensor::from_i32(vec![2], vec![3, 3]).unwrap());

    let last = engines.pop().unwrap();
    let first = engines.pop().unwrap();
    let (ids0, cu0) = (ids.clone(), cu.clone());
    let li0 = loss_inputs.clone();
    let t0 = tokio::spawn(async move {
        let mut e = first;
        e.initialize_comm().await.unwrap();
        let r = e
            .eval_batch(
                ids0,
                cu0,
                Box::new(hybrid_ml_pipeline::compute_packed_sft_loss),
                li0,
                None,
                Some(2),
            )
            .await
            .unwrap();
        assert!(r.is_none());
        assert!(e.buffer_is_empty());
    });
    let t1 = tokio::spawn(async move {
        let mut e = last;
        e.initialize_comm().await.unwrap();
        let r = e
            .eval_batch(
                ids,
                cu,
                Box::new(hybrid_ml_pipeline::compute_packed_sft_loss),
                loss_inputs,
                None,
                Some(2),
            )
            .await
            .unwrap();
        assert!(e.buffer_is_empty());
        r.expect("last stage returns the loss")
    });

    t0.await.unwrap();
    let (loss, stats) = t1.await.unwrap();
    assert!((loss - expected_loss).abs() < 1e-5, "{loss} vs {expected_loss}");
    assert!((stats["loss"] - expected_loss).abs() < 1e-5);
}

/// Async point-to-point (buffer-held handles) produces identical results.
#[tokio::test]
async fn async_p2p_forward_matches_reference() {
    let (engines, _, _) = build_engines_with(2, 1.0, 0, true);
    let batch = packed_batch(&[&[1, 2, 3], &[4, 5], &[6, 7, 8, 9]]);
    let (ids, cu) = batch_parts(&batch);
    let expected = reference_logits(ids.as_i64().unwrap(), total_bias(2, 1.0));

    let mut tasks = Vec::new();
    for e in engines {
        let (ids, cu) = (ids.clone(), cu.clone());
        tasks.push(tokio::spawn(async move {
            let mut e = e;
            e.initialize_comm().await.unwrap();
            let out = e.forward(ids, cu, None, Some(2)).await.unwrap();
            assert!(e.buffer_is_empty());
            out
        }));
    }
    let mut logits = None;
    for t in tasks {
        if let Some(l) = t.await.unwrap() {
            logits = Some(l);
        }
    }
    let got = logits.expect("last stage logits");
    for (i, (&g, &e)) in got.as_f32().unwrap().iter().zip(&expected).enumerate() {
        assert!((g - e).abs() < 1e-5, "logit {i}: {g} vs {e}");
    }
}

/// Async handles also drive a full training step.
#[tokio::test]
async fn async_p2p_train_step() {
    let (engines, _, _) = build_engines_with(2, 1.0, 0, true);
    let batch = packed_batch(&[&[1, 2, 3], &[4, 5, 6]]);
    let (ids, cu) = batch_parts(&batch);
    let mut loss_inputs = NamedBatch::new();
    loss_inputs.insert("prompt_mask", batch.get("prompt_mask").unwrap().clone());
    loss_inputs.insert("input_lens", Tensor::from_i32(vec![2], vec![3, 3]).unwrap());

    let mut tasks = Vec::new();
    for e in engines {
        let (ids, cu, li) = (ids.clone(), cu.clone(), loss_inputs.clone());
        tasks.push(tokio::spawn(async move {
            let mut e = e;
            e.initialize_comm().await.unwrap();
            let out = e
                .train_batch(
                    ids,
                    cu,
                    Box::new(hybrid_ml_pipeline::compute_packed_sft_loss),
                    li,
                    None,
                    Some(2),
                )
                .await
                .unwrap();
            assert!(e.buffer_is_empty());
            out
        }));
    }
    let mut result = None;
    for t in tasks {
        if let Some(r) = t.await.unwrap() {
            result = Some(r);
        }
    }
    let (loss, _) = result.expect("last stage loss");
    assert!(loss.is_finite() && loss > 0.0);
}

/// Configuration errors are fatal at construction.
#[tokio::test]
async fn invalid_configurations_rejected() {
    let topo = Topology::new(1, 1, 2);
    let grids = ParallelGrid::build_all(topo, vec![0, 1]).unwrap();
    let mut endpoints = CommWorld::endpoints(2);

    // sequence parallel without tensor parallelism
    let grid = grids.into_iter().next().unwrap();
    let ctx = ModelContext {
        model_name: ModelName::new("toy", 0),
        grid,
        dims: ModelDims {
            hidden_dim: HIDDEN,
            head_dim: HEAD_DIM,
            n_kv_heads: N_KV,
        },
    };
    let cfg = EngineConfig {
        sequence_parallel: true,
        act_dtype: DType::F32,
        ..Default::default()
    };
    let module = ToyStageModule::new(0, 2, 4, 0.0);
    let err = PipelineEngine::new(
        ctx,
        Box::new(module),
        endpoints.remove(0),
        Arc::new(MemoryArena::new()),
        cfg,
    );
    assert!(err.is_err());
}
