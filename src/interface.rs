use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::NamedBatch;
use crate::engine::{GenerateOutput, PipelineEngine};
use crate::error::{PipelineError, Result};
use crate::generate::{GenerationConfig, Tokenizer};
use crate::tensor::Tensor;
use crate::topology::ModelName;

/// Training progress of a model instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub epoch: u64,
    pub epoch_step: u64,
    pub global_step: u64,
}

/// Fine-tuning run description, filled by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneSpec {
    pub total_train_epochs: i64,
    pub total_train_steps: i64,
    pub steps_per_epoch: i64,
    pub batch_size_per_device: i64,
    pub max_seqlen: usize,
}

/// Architecture constants shared by every shard of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub n_layers: usize,
    pub hidden_dim: usize,
    pub head_dim: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
}

/// A model instance on one worker: configuration, tokenizer, version
/// counters, and the pipeline engine driving its stage shard.
pub struct Model {
    pub name: ModelName,
    pub config: ModelConfig,
    pub tokenizer: Tokenizer,
    pub version: ModelVersion,
    pub ft_spec: Option<FinetuneSpec>,
    pub engine: PipelineEngine,
}

impl Model {
    pub fn new(
        name: ModelName,
        config: ModelConfig,
        tokenizer: Tokenizer,
        engine: PipelineEngine,
    ) -> Self {
        Self {
            name,
            config,
            tokenizer,
            version: ModelVersion::default(),
            ft_spec: None,
            engine,
        }
    }

    /// Bind the fine-tuning spec; called by the dispatcher's initialize
    /// operation.
    pub fn initialize(&mut self, spec: FinetuneSpec) {
        info!(model = %self.name, ?spec, "model initialized");
        self.ft_spec = Some(spec);
    }

    /// Advance the model version after a train step. Epoch boundaries come
    /// from the fine-tuning spec when present.
    pub fn inc_version(&mut self) {
        self.version.global_step += 1;
        self.version.epoch_step += 1;
        if let Some(spec) = &self.ft_spec {
            if spec.steps_per_epoch > 0 && self.version.epoch_step >= spec.steps_per_epoch as u64 {
                self.version.epoch += 1;
                self.version.epoch_step = 0;
            }
        }
    }

    fn checkpoint_dir(&self, save_dir: &Path) -> PathBuf {
        save_dir.join(format!(
            "epoch{}epochstep{}globalstep{}",
            self.version.epoch, self.version.epoch_step, self.version.global_step
        ))
    }

    fn shard_file_name(&self) -> String {
        let coord = self.engine.grid().coord();
        format!(
            "pytorch_model-pp-{:02}-mp-{:02}-s-{:02}.bin",
            coord.pp, coord.tp, 0
        )
    }

    /// Persist this shard's parameters. Only dp-rank 0 writes; the layout is
    /// one config json plus one parameter file per (pp, tp) shard.
    pub fn save_checkpoint(&self, save_dir: &Path) -> Result<PathBuf> {
        let dir = self.checkpoint_dir(save_dir);
        if self.engine.grid().get_data_parallel_id() != 0 {
            return Ok(dir);
        }
        std::fs::create_dir_all(&dir)?;
        let config_path = dir.join("flash_mqat_config.json");
        std::fs::write(&config_path, serde_json::to_string_pretty(&self.config)?)?;

        let state = self.engine.module().state_dict();
        let bytes = bincode::serialize(&state)
            .map_err(|e| PipelineError::Protocol(format!("checkpoint encode: {e}")))?;
        std::fs::write(dir.join(self.shard_file_name()), bytes)?;
        info!(model = %self.name, dir = %dir.display(), "checkpoint written");
        Ok(dir)
    }

    /// Restore this shard's parameters from a checkpoint directory produced
    /// by [`save_checkpoint`](Self::save_checkpoint).
    pub fn load_checkpoint(&mut self, checkpoint_dir: &Path) -> Result<()> {
        let config_path = checkpoint_dir.join("flash_mqat_config.json");
        let config: ModelConfig = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        if config != self.config {
            return Err(PipelineError::Config(
                "checkpoint config does not match this model".into(),
            ));
        }
        let bytes = std::fs::read(checkpoint_dir.join(self.shard_file_name()))?;
        let state: Vec<(String, Tensor)> = bincode::deserialize(&bytes)
            .map_err(|e| PipelineError::Protocol(format!("checkpoint decode: {e}")))?;
        self.engine.module_mut().load_state_dict(state)?;
        info!(model = %self.name, dir = %checkpoint_dir.display(), "checkpoint loaded");
        Ok(())
    }
}

/// High-level operations the dispatcher routes to a model. Implementations
/// translate packed named-arrays into engine entry points.
#[async_trait]
pub trait ModelInterface: Send {
    async fn train_step(
        &mut self,
        model: &mut Model,
        data: NamedBatch,
    ) -> Result<BTreeMap<String, f64>>;

    async fn evaluate(
        &mut self,
        model: &mut Model,
        eval_batches: &[NamedBatch],
    ) -> Result<BTreeMap<String, f64>>;

    async fn inference(&mut self, model: &mut Model, data: NamedBatch)
        -> Result<Option<NamedBatch>>;

    async fn generate(&mut self, model: &mut Model, data: NamedBatch)
        -> Result<Option<NamedBatch>>;

    async fn save(&mut self, model: &mut Model, save_dir: &Path) -> Result<()>;
}

/// Packed-sequence supervised fine-tuning interface: cross-entropy over
/// non-prompt tokens, perplexity evaluation, log-prob inference, and greedy
/// or sampled generation.
pub struct PackedSftInterface {
    pub gconfig: GenerationConfig,
}

impl PackedSftInterface {
    pub fn new(gconfig: GenerationConfig) -> Self {
        Self { gconfig }
    }
}

/// Prompt-masked cross-entropy over a packed batch. `prompt_mask` marks
/// tokens that do not contribute to the loss; the mask is read at target
/// positions (shifted one token ahead).
pub fn compute_packed_sft_loss(
    logits: &Tensor,
    packed_input_ids: &Tensor,
    cu_seqlens: &[i32],
    extras: &NamedBatch,
) -> Result<(f64, BTreeMap<String, f64>)> {
    let prompt_mask = extras
        .get("prompt_mask")
        .ok_or_else(|| PipelineError::Loss("missing prompt_mask".into()))?
        .as_bool()
        .map_err(PipelineError::Tensor)?;
    let ids = packed_input_ids.as_i64().map_err(PipelineError::Tensor)?;
    let vocab = *logits
        .shape()
        .last()
        .ok_or_else(|| PipelineError::Loss("scalar logits".into()))?;
    let lp = logits.to_f32_vec().map_err(PipelineError::Tensor)?;

    let mut total = 0f64;
    let mut count = 0usize;
    for w in cu_seqlens.windows(2) {
        let (start, end) = (w[0] as usize, w[1] as usize);
        for pos in start..end.saturating_sub(1) {
            let target = ids[pos + 1];
            if prompt_mask[pos + 1] {
                continue;
            }
            let row = &lp[pos * vocab..(pos + 1) * vocab];
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let lse: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
            total += f64::from(row[target as usize] - lse);
            count += 1;
        }
    }
    if count == 0 {
        return Err(PipelineError::Loss(
            "no supervised tokens in batch (all prompt)".into(),
        ));
    }
    let loss = -total / count as f64;
    let mut stats = BTreeMap::new();
    stats.insert("loss".to_string(), loss);
    Ok((loss, stats))
}

fn required_tensor<'a>(data: &'a NamedBatch, key: &str) -> Result<&'a Tensor> {
    data.get(key)
        .ok_or_else(|| PipelineError::Protocol(format!("interface input missing {key:?}")))
}

fn cu_seqlens_of(data: &NamedBatch) -> Result<Vec<i32>> {
    Ok(required_tensor(data, "cu_seqlens")?
        .as_i32()
        .map_err(PipelineError::Tensor)?
        .to_vec())
}

fn input_lens(cu_seqlens: &[i32]) -> Vec<i32> {
    cu_seqlens.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Tile every sequence of a packed batch `n` times, for multi-sample
/// generation.
fn tile_sequences(
    packed_input_ids: &Tensor,
    cu_seqlens: &[i32],
    n: usize,
) -> Result<(Tensor, Vec<i32>)> {
    if n <= 1 {
        return Ok((packed_input_ids.clone(), cu_seqlens.to_vec()));
    }
    let ids = packed_input_ids.as_i64().map_err(PipelineError::Tensor)?;
    let mut out_ids = Vec::with_capacity(ids.len() * n);
    let mut out_cu = vec![0i32];
    for w in cu_seqlens.windows(2) {
        let (a, b) = (w[0] as usize, w[1] as usize);
        for _ in 0..n {
            out_ids.extend_from_slice(&ids[a..b]);
            out_cu.push(out_cu.last().unwrap() + (b - a) as i32);
        }
    }
    let t = Tensor::from_i64(vec![out_ids.len()], out_ids).map_err(PipelineError::Tensor)?;
    Ok((t, out_cu))
}

#[async_trait]
impl ModelInterface for PackedSftInterface {
    async fn train_step(
        &mut self,
        model: &mut Model,
        data: NamedBatch,
    ) -> Result<BTreeMap<String, f64>> {
        let packed_input_ids = required_tensor(&data, "packed_input_ids")?.clone();
        let cu_seqlens = cu_seqlens_of(&data)?;
        let prompt_mask = required_tensor(&data, "prompt_mask")?.clone();

        let lens = input_lens(&cu_seqlens);
        let mut loss_inputs = NamedBatch::new();
        loss_inputs.insert("prompt_mask", prompt_mask);
        loss_inputs.insert(
            "input_lens",
            Tensor::from_i32(vec![lens.len()], lens).map_err(PipelineError::Tensor)?,
        );

        model
            .engine
            .set_version_steps(Some(model.version.global_step as i64));
        let result = model
            .engine
            .train_batch(
                packed_input_ids,
                cu_seqlens,
                Box::new(compute_packed_sft_loss),
                loss_inputs,
                None,
                None,
            )
            .await?;

        model.inc_version();

        let mut res = BTreeMap::new();
        if let Some((loss, _)) = result {
            res.insert("loss".to_string(), loss);
        }
        Ok(res)
    }

    async fn evaluate(
        &mut self,
        model: &mut Model,
        eval_batches: &[NamedBatch],
    ) -> Result<BTreeMap<String, f64>> {
        let mut weighted_loss = 0f64;
        let mut n_seqs = 0usize;

        for data in eval_batches {
            let packed_input_ids = required_tensor(data, "packed_input_ids")?.clone();
            let cu_seqlens = cu_seqlens_of(data)?;
            let prompt_mask = required_tensor(data, "prompt_mask")?.clone();
            let lens = input_lens(&cu_seqlens);
            let batch_seqs = lens.len();

            let mut loss_inputs = NamedBatch::new();
            loss_inputs.insert("prompt_mask", prompt_mask);
            loss_inputs.insert(
                "input_lens",
                Tensor::from_i32(vec![lens.len()], lens).map_err(PipelineError::Tensor)?,
            );

            let result = model
                .engine
                .eval_batch(
                    packed_input_ids,
                    cu_seqlens,
                    Box::new(compute_packed_sft_loss),
                    loss_inputs,
                    None,
                    None,
                )
                .await?;

            if let Some((loss, _)) = result {
                weighted_loss += loss * batch_seqs as f64;
                n_seqs += batch_seqs;
            }
        }

        let mut res = BTreeMap::new();
        if n_seqs > 0 {
            let avg = weighted_loss / n_seqs as f64;
            let ppl = avg.exp();
            res.insert(
                "ppl".to_string(),
                if ppl.is_finite() { ppl } else { f64::INFINITY },
            );
        }
        Ok(res)
    }

    async fn inference(
        &mut self,
        model: &mut Model,
        data: NamedBatch,
    ) -> Result<Option<NamedBatch>> {
        let packed_input_ids = required_tensor(&data, "packed_input_ids")?.clone();
        let cu_seqlens = cu_seqlens_of(&data)?;

        let logits = model
            .engine
            .forward(packed_input_ids.clone(), cu_seqlens.clone(), None, None)
            .await?;

        let Some(logits) = logits else {
            return Ok(None);
        };

        // packed per-transition log-probs of the observed tokens
        let ids = packed_input_ids.as_i64().map_err(PipelineError::Tensor)?;
        let vocab = *logits.shape().last().unwrap_or(&0);
        let lp = logits.to_f32_vec().map_err(PipelineError::Tensor)?;
        let mut packed_logprobs = Vec::new();
        for w in cu_seqlens.windows(2) {
            let (start, end) = (w[0] as usize, w[1] as usize);
            for pos in start..end.saturating_sub(1) {
                let row = &lp[pos * vocab..(pos + 1) * vocab];
                let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let lse: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
                packed_logprobs.push(row[ids[pos + 1] as usize] - lse);
            }
        }

        let mut out = NamedBatch::new();
        out.insert(
            "packed_logprobs",
            Tensor::from_f32(vec![packed_logprobs.len()], packed_logprobs)
                .map_err(PipelineError::Tensor)?,
        );
        Ok(Some(out))
    }

    async fn generate(
        &mut self,
        model: &mut Model,
        data: NamedBatch,
    ) -> Result<Option<NamedBatch>> {
        let packed_input_ids = required_tensor(&data, "packed_input_ids")?.clone();
        let cu_seqlens = cu_seqlens_of(&data)?;
        let (packed_input_ids, cu_seqlens) =
            tile_sequences(&packed_input_ids, &cu_seqlens, self.gconfig.num_samples)?;

        let out: Option<GenerateOutput> = model
            .engine
            .generate(
                packed_input_ids,
                cu_seqlens,
                model.tokenizer.clone(),
                self.gconfig.clone(),
                None,
            )
            .await?;

        let Some(out) = out else {
            return Ok(None);
        };
        debug!(
            tokens = ?out.gen_tokens.shape(),
            "generation finished"
        );

        let mut res = NamedBatch::new();
        res.insert("gen_tokens", out.gen_tokens);
        res.insert("log_probs", out.log_probs);
        if let Some(mask) = out.logits_mask {
            res.insert("logits_mask", mask);
        }
        Ok(Some(res))
    }

    async fn save(&mut self, model: &mut Model, save_dir: &Path) -> Result<()> {
        model.save_checkpoint(save_dir)?;
        Ok(())
    }
}
