//! Shared harness for the integration tests: a deterministic toy stage
//! module plus builders that wire engines over an in-process mesh.
#![allow(dead_code)]
//!
//! The toy model computes, for every token, a scalar "state" equal to the
//! token id plus the sum of all per-layer biases crossed so far; the head
//! turns the state into `vocab` logits peaked at the nearest integer. With
//! integer biases, greedy decoding follows the exact recurrence
//! `next = prev + total_bias`, which the tests assert against.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use hybrid_ml_pipeline::{
    CacheData, DType, EngineConfig, MemoryArena, Model, ModelConfig, ModelContext, ModelDims,
    ModelName, ParallelGrid, PipelineEngine, PipelineError, Precision, Result, StageModule,
    Tensor, Tokenizer, Topology, TransferData, ZeroStage, CommWorld,
};

pub const HIDDEN: usize = 4;
pub const HEAD_DIM: usize = 2;
pub const N_KV: usize = 1;
pub const VOCAB: usize = 32;

/// Per-stage toy module: `[embed?, plain..., head?]` layers. Plain layers add
/// a trainable scalar bias; embed maps ids to states; head emits logits
/// peaked at the state value.
pub struct ToyStageModule {
    layer_start: usize,
    layer_stop: usize,
    total_layers: usize,
    /// one bias per local plain layer
    pub biases: Vec<f32>,
    loss_scale: f32,
    grad_accum: Vec<f32>,
    last_forward_rows: usize,
    pub forward_count: Arc<AtomicUsize>,
}

impl ToyStageModule {
    pub fn new(layer_start: usize, layer_stop: usize, total_layers: usize, bias: f32) -> Self {
        let n_plain = (layer_start..layer_stop)
            .filter(|&l| l != 0 && l != total_layers - 1)
            .count();
        Self {
            layer_start,
            layer_stop,
            total_layers,
            biases: vec![bias; n_plain],
            loss_scale: 65536.0,
            grad_accum: vec![0.0; n_plain],
            last_forward_rows: 0,
            forward_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn has_embed(&self) -> bool {
        self.layer_start == 0
    }

    fn has_head(&self) -> bool {
        self.layer_stop == self.total_layers
    }

    fn bias_sum(&self) -> f32 {
        self.biases.iter().sum()
    }

    fn head_logits(&self, states: &[f32], rows: usize) -> Vec<f32> {
        let mut out = vec![0f32; rows * VOCAB];
        for r in 0..rows {
            let h = states[r * HIDDEN];
            for v in 0..VOCAB {
                out[r * VOCAB + v] = -(h - v as f32).abs();
            }
        }
        out
    }
}

#[async_trait]
impl StageModule for ToyStageModule {
    fn num_layers(&self) -> usize {
        self.layer_stop - self.layer_start
    }

    fn layer_indices(&self) -> std::ops::Range<usize> {
        self.layer_start..self.layer_stop
    }

    fn precision(&self) -> Precision {
        Precision::Fp16
    }

    fn zero_stage(&self) -> ZeroStage {
        ZeroStage::OptimizerStates
    }

    async fn forward(&mut self, x: &mut TransferData, ys: &mut [CacheData]) -> Result<()> {
        self.forward_count.fetch_add(1, Ordering::SeqCst);

        // stage input as flat per-row states
        let (mut states, rows, decode) = if self.has_embed() {
            let ids_tensor = ys[0]
                .input_ids
                .as_ref()
                .ok_or_else(|| PipelineError::Module("first stage without input ids".into()))?;
            let ids = ids_tensor.as_i64().map_err(PipelineError::Tensor)?;
            // decode steps carry one token per sequence and a reserved cache
            let decode = ys.len() > 1 && ys[1].k_cache.is_some();
            let rows = ids.len();
            let mut states = vec![0f32; rows * HIDDEN];
            for (r, &id) in ids.iter().enumerate() {
                for j in 0..HIDDEN {
                    states[r * HIDDEN + j] = id as f32;
                }
            }
            (states, rows, decode)
        } else {
            let input = x
                .pp_input
                .as_ref()
                .ok_or_else(|| PipelineError::Module("no activation input".into()))?;
            let decode = input.shape().len() == 3;
            let rows = input.numel() / HIDDEN;
            (
                input.to_f32_vec().map_err(PipelineError::Tensor)?,
                rows,
                decode,
            )
        };
        self.last_forward_rows = rows;

        for b in &self.biases {
            for s in states.iter_mut() {
                *s += b;
            }
        }

        // fill fresh KV for plain layers on the prompt pass
        if x.store_kv_cache && !decode {
            for (y, layer) in ys.iter_mut().zip(self.layer_indices()) {
                if layer == 0 || layer == self.total_layers - 1 {
                    continue;
                }
                if y.k_cache.is_none() {
                    y.k_cache =
                        Some(Tensor::zeros(vec![rows, N_KV, HEAD_DIM], DType::F32));
                    y.v_cache =
                        Some(Tensor::zeros(vec![rows, N_KV, HEAD_DIM], DType::F32));
                }
            }
        }

        let output = if self.has_head() {
            let logits = self.head_logits(&states, rows);
            if decode {
                Tensor::from_f32(vec![rows, 1, VOCAB], logits)
            } else {
                Tensor::from_f32(vec![rows, VOCAB], logits)
            }
            .map_err(PipelineError::Tensor)?
        } else if decode {
            Tensor::from_f32(vec![rows, 1, HIDDEN], states).map_err(PipelineError::Tensor)?
        } else {
            Tensor::from_f32(vec![rows, HIDDEN], states).map_err(PipelineError::Tensor)?
        };
        x.pp_output = Some(output);
        Ok(())
    }

    fn backward_from_loss(&mut self, _micro_batch: usize, loss: f64) -> Result<Option<Tensor>> {
        for g in self.grad_accum.iter_mut() {
            *g += loss as f32;
        }
        if self.layer_start == 0 {
            return Ok(None);
        }
        // the last stage alternates forward/backward strictly, so the most
        // recent forward is the micro-batch being backpropagated
        Ok(Some(Tensor::zeros(
            vec![self.last_forward_rows, HIDDEN],
            DType::F32,
        )))
    }

    fn backward_from_output_grad(
        &mut self,
        _micro_batch: usize,
        output: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Option<Tensor>> {
        if output.shape() != grad_output.shape() {
            return Err(PipelineError::Module(format!(
                "gradient shape {:?} does not match output {:?}",
                grad_output.shape(),
                output.shape()
            )));
        }
        for g in self.grad_accum.iter_mut() {
            *g += 1.0;
        }
        if self.layer_start == 0 {
            return Ok(None);
        }
        Ok(Some(Tensor::zeros(output.shape().to_vec(), DType::F32)))
    }

    fn grads_for_reduction(&mut self) -> Result<Vec<f32>> {
        Ok(self.grad_accum.clone())
    }

    fn install_reduced_grads(&mut self, grads: Vec<f32>) -> Result<()> {
        self.grad_accum = grads;
        Ok(())
    }

    fn optimizer_step(&mut self, _version_steps: Option<i64>) -> Result<()> {
        // integral update keeps decode states on integer grid points
        for b in self.biases.iter_mut() {
            *b += 0.5;
        }
        for g in self.grad_accum.iter_mut() {
            *g = 0.0;
        }
        Ok(())
    }

    fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    fn set_loss_scale(&mut self, scale: f32) {
        self.loss_scale = scale;
    }

    fn state_dict(&self) -> Vec<(String, Tensor)> {
        vec![(
            "stage_bias".to_string(),
            Tensor::from_f32(vec![self.biases.len()], self.biases.clone())
                .expect("bias tensor"),
        )]
    }

    fn load_state_dict(&mut self, state: Vec<(String, Tensor)>) -> Result<()> {
        for (name, t) in state {
            if name == "stage_bias" {
                self.biases = t.as_f32().map_err(PipelineError::Tensor)?.to_vec();
            }
        }
        Ok(())
    }
}

pub fn toy_dims() -> ModelDims {
    ModelDims {
        hidden_dim: HIDDEN,
        head_dim: HEAD_DIM,
        n_kv_heads: N_KV,
    }
}

pub fn toy_model_config(total_layers: usize) -> ModelConfig {
    ModelConfig {
        n_layers: total_layers,
        hidden_dim: HIDDEN,
        head_dim: HEAD_DIM,
        n_kv_heads: N_KV,
        vocab_size: VOCAB,
    }
}

pub fn toy_tokenizer(eos: Option<i64>) -> Tokenizer {
    Tokenizer::new(VOCAB, eos, Some(0))
}

/// Sum of plain-layer biases across a whole pipeline built with
/// [`build_engines`] (every plain layer starts at `bias`).
pub fn total_bias(num_stages: usize, bias: f32) -> f32 {
    let total_layers = 2 * num_stages;
    let plain = total_layers - 2;
    plain as f32 * bias
}

/// Build one engine per stage over a fresh in-process mesh. Returns the
/// engines, each stage's forward counter, and each stage's KV arena.
pub fn build_engines(
    num_stages: usize,
    bias: f32,
    seed: u64,
) -> (
    Vec<PipelineEngine>,
    Vec<Arc<AtomicUsize>>,
    Vec<Arc<MemoryArena>>,
) {
    build_engines_with(num_stages, bias, seed, false)
}

/// Like [`build_engines`], optionally with async point-to-point handles.
pub fn build_engines_with(
    num_stages: usize,
    bias: f32,
    seed: u64,
    async_p2p: bool,
) -> (
    Vec<PipelineEngine>,
    Vec<Arc<AtomicUsize>>,
    Vec<Arc<MemoryArena>>,
) {
    let topo = Topology::new(1, 1, num_stages);
    let grids = ParallelGrid::build_all(topo, (0..num_stages).collect()).expect("grid");
    let endpoints = CommWorld::endpoints(num_stages);
    let total_layers = 2 * num_stages;

    let mut engines = Vec::with_capacity(num_stages);
    let mut counters = Vec::with_capacity(num_stages);
    let mut arenas = Vec::with_capacity(num_stages);
    for (s, (grid, p2p)) in grids.into_iter().zip(endpoints).enumerate() {
        let (a, b) = (2 * s, 2 * s + 2);
        let module = ToyStageModule::new(a, b, total_layers, bias);
        counters.push(module.forward_count.clone());
        let ctx = ModelContext {
            model_name: ModelName::new("toy", 0),
            grid,
            dims: toy_dims(),
        };
        let cfg = EngineConfig {
            act_dtype: DType::F32,
            sample_seed: Some(seed),
            async_p2p,
            // test batches are small; interface-level calls use this default
            default_num_micro_batches: Some(2),
            ..Default::default()
        };
        let arena = Arc::new(MemoryArena::new());
        arenas.push(arena.clone());
        let engine =
            PipelineEngine::new(ctx, Box::new(module), p2p, arena, cfg).expect("engine");
        engines.push(engine);
    }
    (engines, counters, arenas)
}

/// Build full [`Model`]s (engine + config + tokenizer), one per stage.
pub fn build_models(num_stages: usize, bias: f32, seed: u64, eos: Option<i64>) -> Vec<Model> {
    let (engines, _, _) = build_engines(num_stages, bias, seed);
    engines
        .into_iter()
        .map(|engine| {
            Model::new(
                ModelName::new("toy", 0),
                toy_model_config(2 * num_stages),
                toy_tokenizer(eos),
                engine,
            )
        })
        .collect()
}

/// A packed batch `{packed_input_ids, cu_seqlens, prompt_mask}` where the
/// first token of every sequence is prompt.
pub fn packed_batch(seqs: &[&[i64]]) -> hybrid_ml_pipeline::NamedBatch {
    let mut ids = Vec::new();
    let mut cu = vec![0i32];
    let mut mask = Vec::new();
    for s in seqs {
        ids.extend_from_slice(s);
        cu.push(*cu.last().unwrap() + s.len() as i32);
        mask.push(true);
        mask.extend(std::iter::repeat(false).take(s.len() - 1));
    }
    let n = ids.len();
    let mut batch = hybrid_ml_pipeline::NamedBatch::new();
    batch.insert("packed_input_ids", Tensor::from_i64(vec![n], ids).unwrap());
    batch.insert(
        "cu_seqlens",
        Tensor::from_i32(vec![cu.len()], cu).unwrap(),
    );
    batch.insert("prompt_mask", Tensor::from_bool(vec![n], mask).unwrap());
    batch
}

/// Reference logits for a packed input under the toy pipeline.
pub fn reference_logits(ids: &[i64], total_bias: f32) -> Vec<f32> {
    let mut out = vec![0f32; ids.len() * VOCAB];
    for (t, &id) in ids.iter().enumerate() {
        let h = id as f32 + total_bias;
        for v in 0..VOCAB {
            out[t * VOCAB + v] = -(h - v as f32).abs();
        }
    }
    out
}
