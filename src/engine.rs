use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info};

use crate::arena::MemoryArena;
use crate::buffer::{Entry, TensorBuffer};
use crate::comm::P2p;
use crate::data::{
    pad_sequence_parallel_generate_input, pad_sequence_parallel_input, CacheData, NamedBatch,
    TransferData, TransferInfo,
};
use crate::error::{PipelineError, Result};
use crate::generate::{genstep, GenerationConfig, Tokenizer};
use crate::module::{Precision, StageModule, ZeroStage};
use crate::schedule::{
    GenerateSchedule, InferenceSchedule, PipeInstruction, PipeSchedule, TrainSchedule,
};
use crate::tensor::{DType, Tensor, TensorMeta};
use crate::topology::{ModelName, ParallelGrid};

/// Gradient all-reduce bucket threshold, in bytes.
const GRAD_REDUCE_BUCKET_BYTES: usize = 500_000_000;

/// Hard upper bound on the dynamic loss scale after the cross-stage min-sync.
const LOSS_SCALE_CAP: f32 = 8192.0;

/// Loss function contract: `(stage_output, packed_input_ids, cu_seqlens,
/// extras) -> (scalar_loss, stats)`. The engine divides each micro-batch's
/// loss by the micro-batch count before storing it.
pub type LossFn = Box<
    dyn Fn(&Tensor, &Tensor, &[i32], &NamedBatch) -> Result<(f64, BTreeMap<String, f64>)>
        + Send
        + Sync,
>;

/// Model dimension constants the engine needs for receive-buffer shapes and
/// KV-cache sizing.
#[derive(Debug, Clone, Copy)]
pub struct ModelDims {
    pub hidden_dim: usize,
    pub head_dim: usize,
    pub n_kv_heads: usize,
}

/// Everything ambient a stage engine needs about the model it drives: which
/// model, its grid (topology + process groups + neighbors), and its
/// dimensions. Passed in explicitly; there is no process-global model scope.
pub struct ModelContext {
    pub model_name: ModelName,
    pub grid: ParallelGrid,
    pub dims: ModelDims,
}

/// Static engine knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pad micro-batches so sequence dimensions divide the tensor-parallel
    /// degree. Requires tensor parallelism.
    pub sequence_parallel: bool,
    /// Use async point-to-point with buffer-held handles where the schedule
    /// allows it.
    pub async_p2p: bool,
    /// Micro-batch count per call; defaults to `2 * pipe_size`.
    pub default_num_micro_batches: Option<usize>,
    /// Dtype of inter-stage activations and gradients.
    pub act_dtype: DType,
    /// Seed for the sampling RNG; `None` draws from entropy.
    pub sample_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sequence_parallel: false,
            async_p2p: false,
            default_num_micro_batches: None,
            act_dtype: DType::F16,
            sample_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineMode {
    Train,
    Inference,
    Generate,
}

/// Outputs of a generate call on the last stage.
#[derive(Debug)]
pub struct GenerateOutput {
    /// `[bs, new_tokens]` i64.
    pub gen_tokens: Tensor,
    /// `[bs, new_tokens]` f32 log-probabilities of the chosen tokens.
    pub log_probs: Tensor,
    /// `[bs, new_tokens, vocab]` bool, present only when filtering fired.
    pub logits_mask: Option<Tensor>,
    /// Packed `[prompt_tokens, vocab]` logits of the prompt forward.
    pub prompt_logits: Tensor,
}

/// Per-stage pipeline execution engine.
///
/// Consumes a static schedule and drives each instruction against the stage
/// module, the tensor buffer, and the point-to-point links to the stage
/// neighbors. One engine lives on each worker holding a pipeline shard.
pub struct PipelineEngine {
    ctx: ModelContext,
    module: Box<dyn StageModule>,
    p2p: P2p,
    buffer: TensorBuffer,
    arena: Arc<MemoryArena>,
    cfg: EngineConfig,

    mode: EngineMode,
    compute_loss: bool,
    loss_fn: Option<LossFn>,
    gconfig: Option<GenerationConfig>,
    tokenizer: Option<Tokenizer>,
    version_steps: Option<i64>,
    num_micro_batches: usize,
    rng: StdRng,

    step_count: usize,
    sched_count: usize,
}

impl PipelineEngine {
    pub fn new(
        ctx: ModelContext,
        module: Box<dyn StageModule>,
        p2p: P2p,
        arena: Arc<MemoryArena>,
        cfg: EngineConfig,
    ) -> Result<Self> {
        let num_stages = ctx.grid.get_pipe_parallel_world_size();
        if num_stages < 2 {
            return Err(PipelineError::Config(
                "pipeline engine requires at least 2 stages".into(),
            ));
        }
        if module.zero_stage() > ZeroStage::OptimizerStates {
            return Err(PipelineError::Config(
                "ZeRO-2 and ZeRO-3 are incompatible with pipeline parallelism".into(),
            ));
        }
        if cfg.sequence_parallel && ctx.grid.get_tensor_parallel_world_size() < 2 {
            return Err(PipelineError::Config(
                "sequence parallelism requires tensor parallelism".into(),
            ));
        }
        let rng = match cfg.sample_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let engine = Self {
            module,
            p2p,
            buffer: TensorBuffer::new(),
            arena,
            cfg,
            mode: EngineMode::Inference,
            compute_loss: false,
            loss_fn: None,
            gconfig: None,
            tokenizer: None,
            version_steps: None,
            num_micro_batches: 0,
            rng,
            step_count: 0,
            sched_count: 0,
            ctx,
        };
        if engine.ctx.grid.get_data_parallel_id() == 0 {
            info!(
                model = %engine.ctx.model_name,
                stage = engine.stage_id(),
                pp_size = engine.num_stages(),
                dp_size = engine.ctx.grid.get_data_parallel_world_size(),
                tp_size = engine.ctx.grid.get_tensor_parallel_world_size(),
                layers = engine.module.num_layers(),
                "pipeline engine constructed"
            );
        }
        Ok(engine)
    }

    /// Run the boot-time ring connectivity check. Must complete on every
    /// stage before the first schedule.
    pub async fn initialize_comm(&self) -> Result<()> {
        crate::comm::check_pipeline_ring(
            &self.p2p,
            self.stage_id(),
            self.num_stages(),
            self.ctx.grid.prev_stage(),
            self.ctx.grid.next_stage(),
        )
        .await
        .map_err(PipelineError::Comm)
    }

    pub fn set_version_steps(&mut self, version_steps: Option<i64>) {
        self.version_steps = version_steps;
    }

    pub fn model_name(&self) -> &ModelName {
        &self.ctx.model_name
    }

    pub fn module(&self) -> &dyn StageModule {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn StageModule {
        self.module.as_mut()
    }

    pub fn grid(&self) -> &ParallelGrid {
        &self.ctx.grid
    }

    /// Buffer emptiness, observable for lifecycle checks.
    pub fn buffer_is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage_id() == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage_id() == self.num_stages() - 1
    }

    fn stage_id(&self) -> usize {
        self.ctx.grid.get_stage_id()
    }

    fn num_stages(&self) -> usize {
        self.ctx.grid.get_pipe_parallel_world_size()
    }

    fn global_rank(&self) -> usize {
        self.ctx.grid.get_global_rank()
    }

    fn tp_size(&self) -> usize {
        self.ctx.grid.get_tensor_parallel_world_size()
    }

    fn resolve_num_micro_batches(&self, requested: Option<usize>) -> usize {
        requested
            .or(self.cfg.default_num_micro_batches)
            .unwrap_or(2 * self.num_stages())
    }

    // ------------------------------------------------------------------
    // entry points
    // ------------------------------------------------------------------

    /// Forward-only pass; returns packed logits on the last stage.
    pub async fn forward(
        &mut self,
        packed_input_ids: Tensor,
        cu_seqlens: Vec<i32>,
        input_lens_for_partition: Option<Vec<i32>>,
        num_micro_batches: Option<usize>,
    ) -> Result<Option<Tensor>> {
        self.num_micro_batches = self.resolve_num_micro_batches(num_micro_batches);
        self.mode = EngineMode::Inference;
        self.compute_loss = false;
        self.module.set_train_mode(false);
        self.prepare_input(&packed_input_ids, &cu_seqlens, input_lens_for_partition.as_deref())?;

        let sched = InferenceSchedule::new(
            self.num_micro_batches,
            self.num_stages(),
            self.stage_id(),
        )?;
        self.exec_schedule(sched, false).await?;

        let logits = if self.is_last_stage() {
            let mut parts = Vec::with_capacity(self.num_micro_batches);
            for mb in 0..self.num_micro_batches {
                let mut logits = self.buffer.take_tensor("logits", mb)?;
                if self.cfg.sequence_parallel {
                    logits = self.strip_pad_rows(logits, mb)?;
                }
                parts.push(logits);
            }
            Some(Tensor::cat(&parts).map_err(PipelineError::Tensor)?)
        } else {
            None
        };

        self.post_forward();
        Ok(logits)
    }

    /// Forward plus loss on every micro-batch; no parameter update. Returns
    /// `(avg_loss, avg_stats)` on the last stage.
    pub async fn eval_batch(
        &mut self,
        packed_input_ids: Tensor,
        cu_seqlens: Vec<i32>,
        loss_fn: LossFn,
        loss_inputs: NamedBatch,
        input_lens_for_partition: Option<Vec<i32>>,
        num_micro_batches: Option<usize>,
    ) -> Result<Option<(f64, BTreeMap<String, f64>)>> {
        self.num_micro_batches = self.resolve_num_micro_batches(num_micro_batches);
        self.mode = EngineMode::Inference;
        self.compute_loss = true;
        self.module.set_train_mode(false);
        self.prepare_input(&packed_input_ids, &cu_seqlens, input_lens_for_partition.as_deref())?;
        self.loss_fn = Some(loss_fn);
        self.prepare_loss_input(&loss_inputs)?;

        let sched = InferenceSchedule::new(
            self.num_micro_batches,
            self.num_stages(),
            self.stage_id(),
        )?;
        self.exec_schedule(sched, false).await?;

        let result = self.gather_loss_outputs()?;
        self.post_eval_batch();
        Ok(result)
    }

    /// One full 1F1B training step: forwards, backwards, gradient reduction,
    /// optimizer step. Returns `(avg_loss, avg_stats)` on the last stage.
    pub async fn train_batch(
        &mut self,
        packed_input_ids: Tensor,
        cu_seqlens: Vec<i32>,
        loss_fn: LossFn,
        loss_inputs: NamedBatch,
        input_lens_for_partition: Option<Vec<i32>>,
        num_micro_batches: Option<usize>,
    ) -> Result<Option<(f64, BTreeMap<String, f64>)>> {
        self.num_micro_batches = self.resolve_num_micro_batches(num_micro_batches);
        self.mode = EngineMode::Train;
        self.compute_loss = true;
        self.module.set_train_mode(true);
        self.prepare_input(&packed_input_ids, &cu_seqlens, input_lens_for_partition.as_deref())?;
        self.loss_fn = Some(loss_fn);
        self.prepare_loss_input(&loss_inputs)?;

        let sched = TrainSchedule::new(
            self.num_micro_batches,
            self.num_stages(),
            self.stage_id(),
        )?;
        self.exec_schedule(sched, false).await?;

        let result = self.gather_loss_outputs()?;
        self.post_train_batch();
        Ok(result)
    }

    /// Autoregressive decoding with KV caches. Returns generated tokens,
    /// per-token log-probs, the optional logits mask, and the prompt logits
    /// on the last stage.
    pub async fn generate(
        &mut self,
        packed_input_ids: Tensor,
        cu_seqlens: Vec<i32>,
        tokenizer: Tokenizer,
        gconfig: GenerationConfig,
        num_micro_batches: Option<usize>,
    ) -> Result<Option<GenerateOutput>> {
        self.num_micro_batches = self.resolve_num_micro_batches(num_micro_batches);
        self.mode = EngineMode::Generate;
        self.compute_loss = false;
        self.module.set_train_mode(false);
        self.prepare_input(&packed_input_ids, &cu_seqlens, None)?;

        // slack for elegant generation termination
        let mut gconfig = gconfig;
        gconfig.max_new_tokens += self.num_stages() - 1;
        self.gconfig = Some(gconfig.clone());
        self.tokenizer = Some(tokenizer);
        self.pre_generate();

        let sched = GenerateSchedule::new(
            self.num_micro_batches,
            self.num_stages(),
            self.stage_id(),
            gconfig.max_new_tokens,
        )?;
        self.exec_schedule(sched, true).await?;

        let out = self.gather_generate_outputs()?;
        self.post_generate();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // input preparation and post phases
    // ------------------------------------------------------------------

    fn prepare_input(
        &mut self,
        packed_input_ids: &Tensor,
        cu_seqlens: &[i32],
        input_lens_for_partition: Option<&[i32]>,
    ) -> Result<()> {
        let n_mb = self.num_micro_batches;
        let part_lens: Vec<i32> = match input_lens_for_partition {
            Some(lens) => lens.to_vec(),
            None => cu_seqlens.windows(2).map(|w| w[1] - w[0]).collect(),
        };
        if part_lens.len() < n_mb {
            return Err(PipelineError::Config(format!(
                "cannot split {} sequences into {} micro-batches",
                part_lens.len(),
                n_mb
            )));
        }
        let parts = crate::data::partition_balanced(&part_lens, n_mb);

        // token offset of each partition unit
        let mut unit_tok = Vec::with_capacity(part_lens.len() + 1);
        let mut acc = 0i32;
        unit_tok.push(0);
        for &l in &part_lens {
            acc += l;
            unit_tok.push(acc);
        }

        for (mbid, range) in parts.iter().enumerate() {
            let tok_a = unit_tok[range.start];
            let tok_b = unit_tok[range.end];
            let ids = packed_input_ids
                .slice_rows(tok_a as usize, tok_b as usize)
                .map_err(PipelineError::Tensor)?;

            // original sequence boundaries inside this span
            let mut local_cu: Vec<i32> = vec![0];
            for &b in cu_seqlens.iter() {
                if b > tok_a && b <= tok_b {
                    local_cu.push(b - tok_a);
                }
            }
            if *local_cu.last().unwrap_or(&0) != tok_b - tok_a {
                return Err(PipelineError::Config(
                    "partition lengths do not align with sequence boundaries".into(),
                ));
            }

            let mut ids_vec = ids.as_i64().map_err(PipelineError::Tensor)?.to_vec();
            let mut cu = local_cu;
            let mut max_seqlen = cu
                .windows(2)
                .map(|w| (w[1] - w[0]) as usize)
                .max()
                .unwrap_or(0);

            if self.cfg.sequence_parallel {
                if self.mode != EngineMode::Generate {
                    let (i, c, m, pad) =
                        pad_sequence_parallel_input(&ids_vec, &cu, max_seqlen, self.tp_size());
                    ids_vec = i;
                    cu = c;
                    max_seqlen = m;
                    self.buffer.put("pad_size", mbid, Entry::Count(pad));
                } else {
                    let (i, c, m, pad, pad_seq) = pad_sequence_parallel_generate_input(
                        &ids_vec,
                        &cu,
                        max_seqlen,
                        self.tp_size(),
                    );
                    ids_vec = i;
                    cu = c;
                    max_seqlen = m;
                    self.buffer.put("pad_size", mbid, Entry::Count(pad));
                    self.buffer.put("pad_seq_size", mbid, Entry::Count(pad_seq));
                }
            }

            let total_len = ids_vec.len();
            let ids = Tensor::from_i64(vec![total_len], ids_vec).map_err(PipelineError::Tensor)?;

            if self.compute_loss {
                let mut cache = NamedBatch::new();
                cache.insert("packed_input_ids", ids.clone());
                cache.insert(
                    "cu_seqlens",
                    Tensor::from_i32(vec![cu.len()], cu.clone()).map_err(PipelineError::Tensor)?,
                );
                self.buffer.put("input_cache", mbid, Entry::Batch(cache));
            }

            let store_kv_cache = self.mode == EngineMode::Generate;
            let x = TransferData {
                cu_seqlens: cu.clone(),
                max_seqlen,
                store_kv_cache,
                pp_input: None,
                pp_output: None,
            };
            let mut ys = vec![CacheData::default(); self.module.num_layers()];
            if self.is_first_stage() {
                ys[0].input_ids = Some(ids);
            }

            let batch_length = cu.len() - 1;
            let mb_seq_len = if self.cfg.sequence_parallel {
                total_len / self.tp_size()
            } else {
                total_len
            };

            self.buffer.put(
                "pipe_transfer_infos",
                mbid,
                Entry::Info(TransferInfo {
                    cu_seqlens: cu,
                    max_seqlen,
                    store_kv_cache,
                }),
            );
            self.buffer.put("batch_input_x", mbid, Entry::Transfer(x));
            self.buffer.put("batch_input_ys", mbid, Entry::Caches(ys));
            self.buffer
                .put("batch_lengths", mbid, Entry::Count(batch_length));
            self.buffer
                .put("mb_seq_lens", mbid, Entry::Count(mb_seq_len));
        }
        Ok(())
    }

    fn prepare_loss_input(&mut self, loss_inputs: &NamedBatch) -> Result<()> {
        let splitted = loss_inputs
            .scatter(self.num_micro_batches)
            .map_err(PipelineError::Tensor)?;
        for (mbid, x) in splitted.into_iter().enumerate() {
            self.buffer.put("loss_inputs", mbid, Entry::Batch(x));
        }
        Ok(())
    }

    fn pre_generate(&mut self) {
        for mbid in 0..self.num_micro_batches {
            let batch_length = self.buffer.get_count("batch_lengths", mbid).unwrap_or(0);
            self.buffer
                .put("kv_cache_reserved", mbid, Entry::Flag(false));
            self.buffer.put("terminate", mbid, Entry::Flag(false));
            self.buffer.put("generated_idx", mbid, Entry::Count(0));
            self.buffer.put(
                "unfinished_sequences",
                mbid,
                Entry::BoolVec(vec![true; batch_length]),
            );
            self.buffer
                .put("gen_token_ph", mbid, Entry::TensorList(Vec::new()));
            self.buffer
                .put("gen_logprob_ph", mbid, Entry::TensorList(Vec::new()));
            self.buffer
                .put("gen_logits_mask_ph", mbid, Entry::MaskList(Vec::new()));
            self.buffer.put("first_token", mbid, Entry::Flag(true));
        }
    }

    fn clear_p2p_caches(&mut self) {
        for tag in [
            "recv_next_tokens_buf",
            "recv_act_buf",
            "recv_next_tokens_handle",
            "recv_act_handle",
            "recv_grad_handle",
            "send_act_handle",
            "send_next_tokens_handle",
            "send_grad_handle",
        ] {
            self.buffer.remove_tag(tag);
        }
    }

    fn post_eval_batch(&mut self) {
        for tag in [
            "batch_input_x",
            "batch_input_ys",
            "batch_output_x",
            "batch_lengths",
            "mb_seq_lens",
            "pipe_transfer_infos",
            "loss_inputs",
            "input_cache",
            "losses",
            "stats",
            "activation",
            "activation_grad",
            "grad",
            "pad_size",
            "pad_seq_size",
        ] {
            self.buffer.remove_tag(tag);
        }
        self.clear_p2p_caches();
        self.loss_fn = None;
    }

    fn post_forward(&mut self) {
        self.post_eval_batch();
        self.buffer.remove_tag("logits");
        self.clear_p2p_caches();
    }

    fn post_train_batch(&mut self) {
        self.post_eval_batch();
    }

    fn post_generate(&mut self) {
        // return every reserved KV slot to the arena
        for mbid in 0..self.num_micro_batches {
            if let Some(Entry::Caches(mut ys)) = self.buffer.try_take("batch_input_ys", mbid) {
                let layers = self.module.layer_indices();
                for (y, layer_idx) in ys.iter_mut().zip(layers) {
                    if let Some(k) = y.k_cache.take() {
                        self.arena
                            .release(&format!("kv_cache_{layer_idx}_{mbid}_k"), k);
                    }
                    if let Some(v) = y.v_cache.take() {
                        self.arena
                            .release(&format!("kv_cache_{layer_idx}_{mbid}_v"), v);
                    }
                }
            }
        }
        for tag in [
            "next_tokens_cache",
            "next_tokens_to_send",
            "generated_idx",
            "terminate",
            "unfinished_sequences",
            "gen_token_ph",
            "gen_logprob_ph",
            "gen_logits_mask_ph",
            "batch_lengths",
            "prompt_logits",
            "kv_cache_reserved",
            "batch_input_x",
            "batch_input_ys",
            "batch_output_x",
            "input_cache",
            "first_token",
            "mb_seq_lens",
            "pipe_transfer_infos",
            "pad_size",
            "pad_seq_size",
        ] {
            self.buffer.remove_tag(tag);
        }
        self.clear_p2p_caches();
        self.gconfig = None;
    }

    // ------------------------------------------------------------------
    // schedule execution
    // ------------------------------------------------------------------

    fn terminate_condition(&self) -> bool {
        (0..self.num_micro_batches)
            .all(|mb| self.buffer.get_flag("terminate", mb).unwrap_or(false))
    }

    async fn exec_schedule<S: PipeSchedule>(
        &mut self,
        mut sched: S,
        check_terminate: bool,
    ) -> Result<()> {
        self.step_count = 0;
        let is_last = self.is_last_stage();
        let mut will_break = false;
        let mut burn_out_steps = burn_out_budget(self.stage_id(), self.num_stages());

        while let Some(step) = sched.next() {
            for cmd in &step.cmds {
                if will_break {
                    if !burnout_allows(is_last, cmd) {
                        debug!(
                            rank = self.global_rank(),
                            cmd = cmd.name(),
                            "skipping instruction during burn-out"
                        );
                        continue;
                    }
                    // burn-out flushes only activations that are actually in
                    // flight; a skipped forward leaves nothing to send
                    if matches!(cmd, PipeInstruction::SendActivation { .. })
                        && !self.buffer.contains("batch_output_x", cmd.micro_batch_id())
                    {
                        continue;
                    }
                }
                debug!(
                    rank = self.global_rank(),
                    stage = self.stage_id(),
                    mb = cmd.micro_batch_id(),
                    step = step.step_id,
                    cmd = cmd.name(),
                    "executing instruction"
                );
                if let Err(e) = self.exec_instruction(cmd).await {
                    error!(
                        rank = self.global_rank(),
                        step_count = self.step_count,
                        cmd = cmd.name(),
                        error = %e,
                        "instruction failed"
                    );
                    return Err(e);
                }
            }
            self.step_count += 1;

            if will_break {
                burn_out_steps = burn_out_steps.saturating_sub(1);
            }
            if check_terminate && self.terminate_condition() {
                will_break = true;
            }
            if will_break && burn_out_steps == 0 {
                break;
            }
        }
        self.sched_count += 1;
        Ok(())
    }

    async fn exec_instruction(&mut self, cmd: &PipeInstruction) -> Result<bool> {
        let r = match *cmd {
            PipeInstruction::ForwardPass { micro_batch_id, .. } => {
                self.exec_forward_pass(micro_batch_id).await
            }
            PipeInstruction::BackwardPass { micro_batch_id, .. } => {
                self.exec_backward_pass(micro_batch_id).await
            }
            PipeInstruction::SendActivation { micro_batch_id, .. } => {
                self.exec_send_activations(micro_batch_id).await
            }
            PipeInstruction::RecvActivation { micro_batch_id, .. } => {
                self.exec_recv_activations(micro_batch_id).await
            }
            PipeInstruction::SendGrad { micro_batch_id, .. } => {
                self.exec_send_grads(micro_batch_id).await
            }
            PipeInstruction::RecvGrad { micro_batch_id, .. } => {
                self.exec_recv_grads(micro_batch_id).await
            }
            PipeInstruction::SendNextTokens { micro_batch_id, .. } => {
                self.exec_send_next_tokens(micro_batch_id).await
            }
            PipeInstruction::RecvNextTokens { micro_batch_id, .. } => {
                self.exec_recv_next_tokens(micro_batch_id).await
            }
            PipeInstruction::ReduceGrads { .. } => self.exec_reduce_grads().await,
            PipeInstruction::OptimizerStep { .. } => self.exec_optimizer_step().await,
            PipeInstruction::EndSchedule { .. } => Ok(true),
        };
        r.map_err(|e| match e {
            e @ PipelineError::InstructionFailed { .. } => e,
            e => PipelineError::InstructionFailed {
                instruction: cmd.name(),
                stage_id: self.stage_id(),
                micro_batch: cmd.micro_batch_id(),
                step_id: cmd.step_id(),
                reason: e.to_string(),
            },
        })
    }

    // ------------------------------------------------------------------
    // instruction handlers
    // ------------------------------------------------------------------

    async fn exec_forward_pass(&mut self, mb: usize) -> Result<bool> {
        let generate_first = self.mode == EngineMode::Generate && self.is_first_stage();
        let (mut buf, handle) = if generate_first {
            (
                self.buffer
                    .try_take("recv_next_tokens_buf", mb)
                    .and_then(entry_tensor),
                self.buffer.take_handle("recv_next_tokens_handle", mb),
            )
        } else {
            (
                self.buffer.try_take("recv_act_buf", mb).and_then(entry_tensor),
                self.buffer.take_handle("recv_act_handle", mb),
            )
        };
        if let Some(handle) = handle {
            buf = handle.wait().await.map_err(PipelineError::Comm)?;
        }

        let mut ys = self.buffer.take_caches("batch_input_ys", mb)?;
        let mut x = match buf {
            Some(buf) => {
                if generate_first {
                    let mut x = self.buffer.take_transfer("batch_input_x", mb)?;
                    ys[0].input_ids = Some(buf);
                    ys[0].position_ids = None;
                    x.pp_input = None;
                    x
                } else {
                    let info = self.buffer.get_info("pipe_transfer_infos", mb)?;
                    info.with_input(buf)
                }
            }
            None => self.buffer.take_transfer("batch_input_x", mb)?,
        };

        self.module.forward(&mut x, &mut ys).await?;

        let is_first_step = self.maybe_init_kv_cache(&mut x, &mut ys, mb)?;
        self.maybe_increase_cache_seqlens(&mut ys, is_first_step);
        let end = self.maybe_genstep(&x, mb, is_first_step)?;
        self.maybe_calculate_loss(&x, mb)?;
        self.maybe_store_logits(&x, mb);

        self.buffer.put("batch_input_ys", mb, Entry::Caches(ys));
        self.buffer.put("batch_output_x", mb, Entry::Transfer(x));
        Ok(end)
    }

    /// First generation step for a micro-batch: lease persistent KV caches
    /// from the arena, copy the prompt keys/values in, and stash the prompt
    /// logits. Returns whether this was the first step.
    fn maybe_init_kv_cache(
        &mut self,
        x: &mut TransferData,
        ys: &mut [CacheData],
        mb: usize,
    ) -> Result<bool> {
        if self.mode != EngineMode::Generate {
            return Ok(false);
        }
        if self.buffer.get_flag("kv_cache_reserved", mb)? {
            return Ok(false);
        }

        let output = x
            .pp_output
            .as_ref()
            .ok_or_else(|| PipelineError::Module("forward produced no output".into()))?;
        self.buffer
            .put("prompt_logits", mb, Entry::Tensor(output.clone()));

        let max_seq_len = self.buffer.get_info("pipe_transfer_infos", mb)?.max_seqlen;
        let input_lens: Vec<i32> = x.cu_seqlens.windows(2).map(|w| w[1] - w[0]).collect();
        let bs = input_lens.len();
        let gconfig = self
            .gconfig
            .as_ref()
            .ok_or_else(|| PipelineError::Config("generate without config".into()))?;
        let kvcache_seqlen = (max_seq_len + gconfig.max_new_tokens)
            .max(self.ctx.dims.hidden_dim / self.ctx.dims.head_dim + 10);

        let mut layer_iter: Vec<usize> = self.module.layer_indices().collect();
        let mut ys_view: Vec<&mut CacheData> = ys.iter_mut().collect();
        if self.is_first_stage() {
            // the embedding layer keeps only its cache lengths
            if let Some(first) = ys_view.first_mut() {
                first.cache_seqlens = Some(input_lens.clone());
            }
            ys_view.remove(0);
            layer_iter.remove(0);
        }
        if self.is_last_stage() {
            // the head layer holds no KV
            ys_view.pop();
            layer_iter.pop();
        }

        for (y, layer_idx) in ys_view.into_iter().zip(layer_iter) {
            let (k_small, v_small) = match (y.k_cache.take(), y.v_cache.take()) {
                (Some(k), Some(v)) => (k, v),
                _ => {
                    return Err(PipelineError::Module(format!(
                        "layer {layer_idx} produced no prompt KV for cache reservation"
                    )))
                }
            };
            let tail: Vec<usize> = k_small.shape()[1..].to_vec();
            let row: usize = tail.iter().product();
            let mut shape = vec![bs, kvcache_seqlen];
            shape.extend(&tail);

            let mut k_cache = self.arena.acquire(
                &format!("kv_cache_{layer_idx}_{mb}_k"),
                shape.clone(),
                k_small.dtype(),
                true,
            );
            let mut v_cache = self.arena.acquire(
                &format!("kv_cache_{layer_idx}_{mb}_v"),
                shape,
                v_small.dtype(),
                true,
            );

            let mut src_row = 0usize;
            for (i, &len) in input_lens.iter().enumerate() {
                let len = len as usize;
                k_cache
                    .copy_elems_from(&k_small, src_row * row, i * kvcache_seqlen * row, len * row)
                    .map_err(PipelineError::Tensor)?;
                v_cache
                    .copy_elems_from(&v_small, src_row * row, i * kvcache_seqlen * row, len * row)
                    .map_err(PipelineError::Tensor)?;
                src_row += len;
            }

            y.k_cache = Some(k_cache);
            y.v_cache = Some(v_cache);
            y.cache_seqlens = Some(input_lens.clone());
        }

        self.buffer.put("kv_cache_reserved", mb, Entry::Flag(true));
        Ok(true)
    }

    fn maybe_increase_cache_seqlens(&mut self, ys: &mut [CacheData], is_first_step: bool) {
        if self.mode != EngineMode::Generate || is_first_step {
            return;
        }
        let n = ys.len();
        let upto = if self.is_last_stage() { n.saturating_sub(1) } else { n };
        for y in ys[..upto].iter_mut() {
            if let Some(lens) = y.cache_seqlens.as_mut() {
                for l in lens.iter_mut() {
                    *l += 1;
                }
            }
        }
    }

    fn maybe_genstep(&mut self, x: &TransferData, mb: usize, is_first_step: bool) -> Result<bool> {
        if !(self.mode == EngineMode::Generate && self.is_last_stage()) {
            return Ok(false);
        }
        let output = x
            .pp_output
            .as_ref()
            .ok_or_else(|| PipelineError::Module("forward produced no output".into()))?;

        // [bs, vocab] logits for the next token of every sequence
        let logits = if is_first_step {
            let vocab = *output.shape().last().unwrap_or(&0);
            let bs = x.cu_seqlens.len() - 1;
            let mut t = Tensor::zeros(vec![bs, vocab], output.dtype());
            for (i, w) in x.cu_seqlens.windows(2).enumerate() {
                let last_row = (w[1] - 1) as usize;
                t.copy_elems_from(output, last_row * vocab, i * vocab, vocab)
                    .map_err(PipelineError::Tensor)?;
            }
            t
        } else {
            // decode step output is [bs, 1, vocab] or already [bs, vocab]
            let shape = output.shape();
            let (bs, vocab) = (shape[0], *shape.last().unwrap_or(&0));
            let mut t = output.clone();
            if shape.len() == 3 {
                t = Tensor::new(vec![bs, vocab], t.data().clone())
                    .map_err(PipelineError::Tensor)?;
            }
            t
        };

        let unfinished = self.buffer.get_bool_vec("unfinished_sequences", mb)?.clone();
        let generated_idx = self.buffer.get_count("generated_idx", mb)?;
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or_else(|| PipelineError::Config("generate without tokenizer".into()))?
            .clone();
        let gconfig = self
            .gconfig
            .as_ref()
            .ok_or_else(|| PipelineError::Config("generate without config".into()))?
            .clone();

        let step = genstep(
            &logits,
            &tokenizer,
            &unfinished,
            generated_idx,
            &gconfig,
            &mut self.rng,
        )?;

        self.buffer.put("terminate", mb, Entry::Flag(step.terminate));
        self.buffer
            .put("unfinished_sequences", mb, Entry::BoolVec(step.unfinished));
        self.buffer
            .put("generated_idx", mb, Entry::Count(generated_idx + 1));
        self.buffer
            .tensor_list_mut("gen_token_ph", mb)?
            .push(step.next_tokens.clone());
        self.buffer
            .tensor_list_mut("gen_logprob_ph", mb)?
            .push(step.logprob);
        self.buffer
            .mask_list_mut("gen_logits_mask_ph", mb)?
            .push(step.logits_mask);
        self.buffer
            .put("next_tokens_to_send", mb, Entry::Tensor(step.next_tokens));

        Ok(self.terminate_condition())
    }

    fn maybe_calculate_loss(&mut self, x: &TransferData, mb: usize) -> Result<()> {
        if !(self.is_last_stage() && self.compute_loss) {
            return Ok(());
        }
        let mut model_output = x
            .pp_output
            .clone()
            .ok_or_else(|| PipelineError::Module("forward produced no output".into()))?;
        if self.cfg.sequence_parallel {
            model_output = self.strip_pad_rows(model_output, mb)?;
        }
        let loss_inputs = self.buffer.take_batch("loss_inputs", mb)?;
        let input_cache = self.buffer.take_batch("input_cache", mb)?;
        let packed_input_ids = input_cache
            .get("packed_input_ids")
            .ok_or_else(|| PipelineError::Loss("input cache lost packed_input_ids".into()))?;
        let cu_seqlens = input_cache
            .get("cu_seqlens")
            .ok_or_else(|| PipelineError::Loss("input cache lost cu_seqlens".into()))?
            .as_i32()
            .map_err(PipelineError::Tensor)?
            .to_vec();
        let loss_fn = self
            .loss_fn
            .as_ref()
            .ok_or_else(|| PipelineError::Loss("loss function is not set".into()))?;
        let (loss, stats) = loss_fn(&model_output, packed_input_ids, &cu_seqlens, &loss_inputs)?;
        let loss = loss / self.num_micro_batches as f64;
        self.buffer.put("losses", mb, Entry::Scalar(loss));
        self.buffer.put("stats", mb, Entry::Stats(stats));
        Ok(())
    }

    fn maybe_store_logits(&mut self, x: &TransferData, mb: usize) {
        if self.is_last_stage() && !self.compute_loss && self.mode == EngineMode::Inference {
            if let Some(out) = x.pp_output.clone() {
                self.buffer.put("logits", mb, Entry::Tensor(out));
            }
        }
    }

    async fn exec_backward_pass(&mut self, mb: usize) -> Result<bool> {
        let output_x = self.buffer.take_transfer("batch_output_x", mb)?;

        if self.is_last_stage() {
            let loss = self.buffer.take_scalar("losses", mb)?;
            let grad_in = self.module.backward_from_loss(mb, loss)?;
            // keep the detached value for the caller's averaging
            self.buffer.put("losses", mb, Entry::Scalar(loss));
            if let Some(grad) = grad_in {
                self.buffer.put("activation_grad", mb, Entry::Tensor(grad));
            }
            return Ok(false);
        }

        let handle = self.buffer.take_handle("recv_grad_handle", mb);
        let grad = match handle {
            Some(h) => h
                .wait()
                .await
                .map_err(PipelineError::Comm)?
                .ok_or_else(|| PipelineError::Protocol("grad handle carried no tensor".into()))?,
            None => self.buffer.take_tensor("grad", mb)?,
        };
        let output = output_x
            .pp_output
            .as_ref()
            .ok_or_else(|| PipelineError::Module("no stage output saved for backward".into()))?;
        let grad_in = self.module.backward_from_output_grad(mb, output, &grad)?;
        if !self.is_first_stage() {
            let grad = grad_in.ok_or_else(|| {
                PipelineError::Module("backward produced no input gradient to send".into())
            })?;
            self.buffer.put("activation_grad", mb, Entry::Tensor(grad));
        }
        Ok(false)
    }

    async fn exec_send_activations(&mut self, mb: usize) -> Result<bool> {
        debug_assert!(!self.is_last_stage());
        let next = self.ctx.grid.next_stage();
        let x = if self.mode == EngineMode::Train {
            match self.buffer.get("batch_output_x", mb)? {
                Entry::Transfer(x) => x.clone(),
                _ => {
                    return Err(PipelineError::Protocol(
                        "batch_output_x holds a non-transfer entry".into(),
                    ))
                }
            }
        } else {
            self.buffer.take_transfer("batch_output_x", mb)?
        };
        let out = x
            .pp_output
            .ok_or_else(|| PipelineError::Module("no stage output to send".into()))?;

        if self.mode == EngineMode::Generate {
            // the terminate scalar always rides right behind the activation
            self.p2p.send(out, next).map_err(PipelineError::Comm)?;
            let terminate = self.buffer.get_flag("terminate", mb)?;
            self.p2p.send_flag(terminate, next).map_err(PipelineError::Comm)?;
        } else if self.cfg.async_p2p {
            let handle = self.p2p.send_async(out, next);
            self.buffer.put("send_act_handle", mb, Entry::Handle(handle));
        } else {
            self.p2p.send(out, next).map_err(PipelineError::Comm)?;
        }
        Ok(false)
    }

    async fn exec_recv_activations(&mut self, mb: usize) -> Result<bool> {
        debug_assert!(!self.is_first_stage());
        let prev = self.ctx.grid.prev_stage();
        let hidden = self.ctx.dims.hidden_dim;
        let mb_seq_len = self.buffer.get_count("mb_seq_lens", mb)?;

        let meta = match self.mode {
            EngineMode::Train => self
                .buffer
                .alloc("activation", mb, vec![mb_seq_len, hidden], self.cfg.act_dtype),
            EngineMode::Inference => TensorMeta {
                shape: vec![mb_seq_len, hidden],
                dtype: self.cfg.act_dtype,
            },
            EngineMode::Generate => {
                let first = self.buffer.get_flag("first_token", mb)?;
                if first {
                    self.buffer.put("first_token", mb, Entry::Flag(false));
                    TensorMeta {
                        shape: vec![mb_seq_len, hidden],
                        dtype: self.cfg.act_dtype,
                    }
                } else {
                    let mut batch_length = self.buffer.get_count("batch_lengths", mb)?;
                    if self.cfg.sequence_parallel {
                        batch_length /= self.tp_size();
                    }
                    TensorMeta {
                        shape: vec![batch_length, 1, hidden],
                        dtype: self.cfg.act_dtype,
                    }
                }
            }
        };

        if self.mode == EngineMode::Generate {
            // synchronous pair: activation then its terminate flag
            let tensor = self.p2p.recv(&meta, prev).await.map_err(PipelineError::Comm)?;
            self.buffer.put("recv_act_buf", mb, Entry::Tensor(tensor));
            let terminate = self.p2p.recv_flag(prev).await.map_err(PipelineError::Comm)?;
            self.buffer.put("terminate", mb, Entry::Flag(terminate));
        } else if self.cfg.async_p2p {
            let handle = self.p2p.recv_async(&meta, prev);
            self.buffer.put("recv_act_handle", mb, Entry::Handle(handle));
        } else {
            let tensor = self.p2p.recv(&meta, prev).await.map_err(PipelineError::Comm)?;
            self.buffer.put("recv_act_buf", mb, Entry::Tensor(tensor));
        }
        Ok(false)
    }

    async fn exec_send_grads(&mut self, mb: usize) -> Result<bool> {
        if self.mode != EngineMode::Train {
            return Err(PipelineError::Protocol(
                "SendGrad outside of train mode".into(),
            ));
        }
        debug_assert!(!self.is_first_stage());
        let prev = self.ctx.grid.prev_stage();
        // the received activation is spent once its gradient leaves
        let _ = self.buffer.try_take("activation", mb);
        let grad = self.buffer.take_tensor("activation_grad", mb)?;
        if self.cfg.async_p2p {
            let handle = self.p2p.send_async(grad, prev);
            self.buffer.put("send_grad_handle", mb, Entry::Handle(handle));
        } else {
            self.p2p.send(grad, prev).map_err(PipelineError::Comm)?;
        }
        Ok(false)
    }

    async fn exec_recv_grads(&mut self, mb: usize) -> Result<bool> {
        if self.mode != EngineMode::Train {
            return Err(PipelineError::Protocol(
                "RecvGrad outside of train mode".into(),
            ));
        }
        debug_assert!(!self.is_last_stage());
        let next = self.ctx.grid.next_stage();
        let hidden = self.ctx.dims.hidden_dim;
        let mb_seq_len = self.buffer.get_count("mb_seq_lens", mb)?;
        let meta = self
            .buffer
            .alloc("grad", mb, vec![mb_seq_len, hidden], self.cfg.act_dtype);
        if self.cfg.async_p2p {
            let handle = self.p2p.recv_async(&meta, next);
            self.buffer.put("recv_grad_handle", mb, Entry::Handle(handle));
        } else {
            let tensor = self.p2p.recv(&meta, next).await.map_err(PipelineError::Comm)?;
            self.buffer.put("grad", mb, Entry::Tensor(tensor));
        }
        Ok(false)
    }

    async fn exec_send_next_tokens(&mut self, mb: usize) -> Result<bool> {
        if self.mode != EngineMode::Generate || !self.is_last_stage() {
            return Err(PipelineError::Protocol(
                "SendNextTokens outside of generate mode on the last stage".into(),
            ));
        }
        let next = self.ctx.grid.next_stage(); // ring wrap to stage 0
        let tokens = self.buffer.take_tensor("next_tokens_to_send", mb)?;
        self.p2p.send(tokens, next).map_err(PipelineError::Comm)?;
        let terminate = self.buffer.get_flag("terminate", mb)?;
        self.p2p.send_flag(terminate, next).map_err(PipelineError::Comm)?;
        Ok(false)
    }

    async fn exec_recv_next_tokens(&mut self, mb: usize) -> Result<bool> {
        if self.mode != EngineMode::Generate || !self.is_first_stage() {
            return Err(PipelineError::Protocol(
                "RecvNextTokens outside of generate mode on the first stage".into(),
            ));
        }
        let prev = self.ctx.grid.prev_stage(); // ring wrap to the last stage
        let batch_length = self.buffer.get_count("batch_lengths", mb)?;
        let meta = TensorMeta {
            shape: vec![batch_length],
            dtype: DType::I64,
        };
        let tokens = self.p2p.recv(&meta, prev).await.map_err(PipelineError::Comm)?;
        self.buffer
            .put("recv_next_tokens_buf", mb, Entry::Tensor(tokens));
        let terminate = self.p2p.recv_flag(prev).await.map_err(PipelineError::Comm)?;
        self.buffer.put("terminate", mb, Entry::Flag(terminate));

        // fresh transfer record for the decode step
        let info = self.buffer.get_info("pipe_transfer_infos", mb)?;
        let x = TransferData {
            cu_seqlens: info.cu_seqlens.clone(),
            max_seqlen: info.max_seqlen,
            store_kv_cache: true,
            pp_input: None,
            pp_output: None,
        };
        self.buffer.put("batch_input_x", mb, Entry::Transfer(x));
        Ok(false)
    }

    async fn exec_reduce_grads(&mut self) -> Result<bool> {
        if self.mode != EngineMode::Train {
            return Err(PipelineError::Protocol(
                "ReduceGrads outside of train mode".into(),
            ));
        }
        if self.module.precision() == Precision::Bf16
            && self.module.zero_stage() > ZeroStage::OptimizerStates
        {
            return Err(PipelineError::Config(
                "bf16 pipeline training only works with ZeRO stage 1".into(),
            ));
        }
        let grads = self.module.grads_for_reduction()?;
        let dp_size = self.ctx.grid.get_data_parallel_world_size() as f32;
        let bucket_elems = (GRAD_REDUCE_BUCKET_BYTES / std::mem::size_of::<f32>()).max(1);

        let mut reduced = Vec::with_capacity(grads.len());
        for bucket in grads.chunks(bucket_elems) {
            let mut summed = self
                .ctx
                .grid
                .get_data_parallel_group()
                .all_reduce(bucket.to_vec(), crate::comm::ReduceOp::Sum)
                .await
                .map_err(PipelineError::Comm)?;
            for g in summed.iter_mut() {
                *g /= dp_size;
            }
            reduced.extend(summed);
        }
        self.module.install_reduced_grads(reduced)?;
        Ok(false)
    }

    async fn exec_optimizer_step(&mut self) -> Result<bool> {
        if self.mode != EngineMode::Train {
            return Err(PipelineError::Protocol(
                "OptimizerStep outside of train mode".into(),
            ));
        }
        self.module.optimizer_step(self.version_steps)?;

        // min-sync the dynamic loss scale across the tensor-parallel group
        if self.module.precision() != Precision::Bf16 {
            let scale = self.module.loss_scale();
            let reduced = self
                .ctx
                .grid
                .get_tensor_parallel_group()
                .all_reduce(vec![scale], crate::comm::ReduceOp::Min)
                .await
                .map_err(PipelineError::Comm)?;
            let synced = reduced[0].min(LOSS_SCALE_CAP);
            debug!(
                rank = self.global_rank(),
                loss_scale = synced,
                "loss scale synchronized"
            );
            self.module.set_loss_scale(synced);
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // output gathering
    // ------------------------------------------------------------------

    fn strip_pad_rows(&mut self, tensor: Tensor, mb: usize) -> Result<Tensor> {
        let pad = match self.buffer.try_take("pad_size", mb) {
            Some(Entry::Count(p)) => p,
            _ => 0,
        };
        if pad == 0 {
            return Ok(tensor);
        }
        let rows = tensor.shape()[0];
        tensor
            .slice_rows(0, rows - pad)
            .map_err(PipelineError::Tensor)
    }

    fn gather_loss_outputs(&mut self) -> Result<Option<(f64, BTreeMap<String, f64>)>> {
        if !self.is_last_stage() {
            return Ok(None);
        }
        let mut total_loss = 0.0;
        let mut stat_acc: BTreeMap<String, f64> = BTreeMap::new();
        for mb in 0..self.num_micro_batches {
            // per-mb losses were divided by the micro-batch count, so the sum
            // is the batch average
            total_loss += self.buffer.take_scalar("losses", mb)?;
            let stats = self.buffer.take_stats("stats", mb)?;
            for (k, v) in stats {
                *stat_acc.entry(k).or_insert(0.0) += v;
            }
        }
        for v in stat_acc.values_mut() {
            *v /= self.num_micro_batches as f64;
        }
        Ok(Some((total_loss, stat_acc)))
    }

    fn gather_generate_outputs(&mut self) -> Result<Option<GenerateOutput>> {
        if !self.is_last_stage() {
            return Ok(None);
        }
        let tokenizer = self
            .tokenizer
            .as_ref()
            .ok_or_else(|| PipelineError::Config("generate without tokenizer".into()))?
            .clone();

        let mut all_tokens = Vec::new();
        let mut all_logprobs = Vec::new();
        let mut all_masks: Vec<Option<Tensor>> = Vec::new();
        let mut vocab = 0usize;

        for mb in 0..self.num_micro_batches {
            let token_ph = self.buffer.take_tensor_list("gen_token_ph", mb)?;
            let logprob_ph = self.buffer.take_tensor_list("gen_logprob_ph", mb)?;
            let mask_ph = self.buffer.take_mask_list("gen_logits_mask_ph", mb)?;

            if token_ph.is_empty() {
                return Err(PipelineError::Protocol(format!(
                    "micro-batch {mb} generated no tokens"
                )));
            }
            let mut tokens = Tensor::stack_last(&token_ph).map_err(PipelineError::Tensor)?;
            let mut logprobs = Tensor::stack_last(&logprob_ph).map_err(PipelineError::Tensor)?;

            let mask = if mask_ph.iter().all(|m| m.is_none()) {
                None
            } else {
                let template = mask_ph
                    .iter()
                    .flatten()
                    .next()
                    .expect("some mask exists")
                    .clone();
                vocab = *template.shape().last().unwrap_or(&0);
                let bs = template.shape()[0];
                let filled: Vec<Tensor> = mask_ph
                    .into_iter()
                    .map(|m| m.unwrap_or_else(|| {
                        Tensor::from_bool(vec![bs, vocab], vec![true; bs * vocab])
                            .expect("shape consistent")
                    }))
                    .collect();
                Some(Tensor::stack_mid(&filled).map_err(PipelineError::Tensor)?)
            };

            if self.cfg.sequence_parallel {
                let pad_seq = match self.buffer.try_take("pad_seq_size", mb) {
                    Some(Entry::Count(p)) => p,
                    _ => 0,
                };
                if pad_seq > 0 {
                    let rows = tokens.shape()[0];
                    tokens = tokens
                        .slice_rows(0, rows - pad_seq)
                        .map_err(PipelineError::Tensor)?;
                    logprobs = logprobs
                        .slice_rows(0, rows - pad_seq)
                        .map_err(PipelineError::Tensor)?;
                }
            }

            all_tokens.push(tokens);
            all_logprobs.push(logprobs);
            all_masks.push(mask);
        }

        // early termination can leave micro-batches with different lengths;
        // right-pad the short ones
        let max_len = all_tokens.iter().map(|t| t.shape()[1]).max().unwrap_or(0);
        let pad_token = tokenizer.pad_token_id.unwrap_or(0);
        for i in 0..all_tokens.len() {
            let (bs, len) = (all_tokens[i].shape()[0], all_tokens[i].shape()[1]);
            if len < max_len {
                all_tokens[i] =
                    pad_cols_i64(&all_tokens[i], max_len, pad_token).map_err(PipelineError::Tensor)?;
                all_logprobs[i] =
                    pad_cols_f32(&all_logprobs[i], max_len, 0.0).map_err(PipelineError::Tensor)?;
                if let Some(mask) = &all_masks[i] {
                    // pad steps with all-true rows, row-major [bs, max_len, vocab]
                    let mut out = vec![true; bs * max_len * vocab];
                    let old = mask.as_bool().map_err(PipelineError::Tensor)?;
                    for b in 0..bs {
                        out[b * max_len * vocab..b * max_len * vocab + len * vocab]
                            .copy_from_slice(&old[b * len * vocab..(b + 1) * len * vocab]);
                    }
                    all_masks[i] = Some(
                        Tensor::from_bool(vec![bs, max_len, vocab], out)
                            .map_err(PipelineError::Tensor)?,
                    );
                }
            }
        }

        let gen_tokens = Tensor::cat(&all_tokens).map_err(PipelineError::Tensor)?;
        let log_probs = Tensor::cat(&all_logprobs).map_err(PipelineError::Tensor)?;
        let logits_mask = if all_masks.iter().all(|m| m.is_none()) {
            None
        } else {
            let filled: Result<Vec<Tensor>> = all_masks
                .iter()
                .zip(&all_tokens)
                .map(|(m, t)| match m {
                    Some(m) => Ok(m.clone()),
                    None => {
                        let (bs, len) = (t.shape()[0], t.shape()[1]);
                        Tensor::from_bool(vec![bs, len, vocab], vec![true; bs * len * vocab])
                            .map_err(PipelineError::Tensor)
                    }
                })
                .collect();
            Some(Tensor::cat(&filled?).map_err(PipelineError::Tensor)?)
        };

        let mut prompt_parts = Vec::with_capacity(self.num_micro_batches);
        for mb in 0..self.num_micro_batches {
            prompt_parts.push(self.buffer.get_tensor("prompt_logits", mb)?.clone());
        }
        let prompt_logits = Tensor::cat(&prompt_parts).map_err(PipelineError::Tensor)?;

        Ok(Some(GenerateOutput {
            gen_tokens,
            log_probs,
            logits_mask,
            prompt_logits,
        }))
    }
}

fn entry_tensor(entry: Entry) -> Option<Tensor> {
    match entry {
        Entry::Tensor(t) => Some(t),
        _ => None,
    }
}

fn pad_cols_i64(t: &Tensor, new_len: usize, pad: i64) -> std::result::Result<Tensor, crate::error::TensorError> {
    let (bs, len) = (t.shape()[0], t.shape()[1]);
    let src = t.as_i64()?;
    let mut out = vec![pad; bs * new_len];
    for b in 0..bs {
        out[b * new_len..b * new_len + len].copy_from_slice(&src[b * len..(b + 1) * len]);
    }
    Tensor::from_i64(vec![bs, new_len], out)
}

fn pad_cols_f32(t: &Tensor, new_len: usize, pad: f32) -> std::result::Result<Tensor, crate::error::TensorError> {
    let (bs, len) = (t.shape()[0], t.shape()[1]);
    let src = t.as_f32()?;
    let mut out = vec![pad; bs * new_len];
    for b in 0..bs {
        out[b * new_len..b * new_len + len].copy_from_slice(&src[b * len..(b + 1) * len]);
    }
    Tensor::from_f32(vec![bs, new_len], out)
}

/// Burn-out step budget once termination is observed: the last stage drains
/// `num_stages - 1` steps, its predecessor exits immediately, every other
/// stage takes one step.
pub(crate) fn burn_out_budget(stage_id: usize, num_stages: usize) -> usize {
    if stage_id == num_stages - 1 {
        num_stages - 1
    } else if stage_id == num_stages - 2 {
        0
    } else {
        1
    }
}

/// During burn-out the last stage only drains receives and every other stage
/// only flushes sends; nothing else runs.
pub(crate) fn burnout_allows(is_last_stage: bool, cmd: &PipeInstruction) -> bool {
    if is_last_stage {
        matches!(cmd, PipeInstruction::RecvActivation { .. })
    } else {
        matches!(cmd, PipeInstruction::SendActivation { .. })
    }
}
