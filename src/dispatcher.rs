use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::NamedBatch;
use crate::error::{PipelineError, Result};
use crate::interface::{FinetuneSpec, Model, ModelConfig, ModelInterface};
use crate::reshard::{run_reshard, ParamStorage, ReshardRequest};
use crate::tensor::Tensor;
use crate::topology::{ModelName, ModelShardId, Topology};
use crate::transfer::{
    repartition_strategy, DataOwnerStorage, DataTransferPair, DataTransferPlan, DpMapping,
};

/// Request/response operations with recorded wall-time on the dp head.
const TIME_RECORD_RPCS: [&str; 6] = [
    "generate",
    "inference",
    "train_step",
    "save",
    "evaluate",
    "initialize",
];

/// Addressee of a request: a model shard, a dataset endpoint, or the master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HandlerId {
    Shard { shard: ModelShardId },
    Data { dp_rank: usize },
    Master,
}

/// Payload of a data-transfer pre-hook: which keys move, between which
/// models, and how the slots are laid out on each side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTransferHook {
    pub keys: Vec<String>,
    pub target: ModelName,
    pub producer_names: BTreeMap<String, ModelName>,
    pub producer_mappings: BTreeMap<String, DpMapping>,
    pub target_mapping: DpMapping,
    pub buffer_indices: Vec<u64>,
    pub seqlens: Vec<usize>,
    /// Which compute input queue receives the gathered batch.
    pub handle_name: String,
    /// Dataflow node this transfer feeds, for the send record.
    pub rpc_name: String,
    pub input_key_remap: BTreeMap<String, String>,
    pub output_key_remap: BTreeMap<String, String>,
}

/// A pre- or post-hook riding on a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "hook")]
pub enum HookCall {
    DataTransfer(DataTransferHook),
    ParamSync(ReshardRequest),
    Offload { model: ModelName },
}

/// Data carried by requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload")]
pub enum MessageData {
    Empty,
    Spec(FinetuneSpec),
    Config(ModelConfig),
    BufferIndices(Vec<u64>),
    SaveDir(PathBuf),
    Stats(BTreeMap<String, f64>),
    Fetched {
        n_seqs: usize,
        seqlens: Vec<usize>,
        epoch: i64,
        epoch_step: i64,
        global_step: i64,
    },
    OutputMeta {
        keys: Vec<String>,
        seqlens: Vec<usize>,
        buffer_indices: Vec<u64>,
    },
    Error(String),
}

/// One message on the master-worker stream. Requests, SYN/ACK control
/// messages, and responses all share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub handler: HandlerId,
    pub request_id: u64,
    pub ack_reply_id: Option<u64>,
    pub syn_reply_id: Option<u64>,
    pub handle_name: String,
    pub data: MessageData,
    pub pre_hooks: Vec<HookCall>,
    pub post_hooks: Vec<HookCall>,
}

impl Payload {
    pub fn request(
        handler: HandlerId,
        request_id: u64,
        handle_name: impl Into<String>,
        data: MessageData,
    ) -> Self {
        Self {
            handler,
            request_id,
            ack_reply_id: None,
            syn_reply_id: None,
            handle_name: handle_name.into(),
            data,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    fn control(request_id: u64, handle_name: &str) -> Self {
        Self::request(HandlerId::Master, request_id, handle_name, MessageData::Empty)
    }
}

/// The master-worker message stream. `poll` never blocks; an empty stream
/// returns `None`.
pub trait RequestStream: Send {
    fn poll(&mut self) -> Option<Payload>;
    fn post(&mut self, payload: Payload) -> Result<()>;
}

/// In-process stream endpoint over unbounded channels.
pub struct InprocStream {
    tx: mpsc::UnboundedSender<Payload>,
    rx: mpsc::UnboundedReceiver<Payload>,
}

/// Build a connected (master-side, worker-side) stream pair.
pub fn inproc_stream_pair() -> (InprocStream, InprocStream) {
    let (m2w_tx, m2w_rx) = mpsc::unbounded_channel();
    let (w2m_tx, w2m_rx) = mpsc::unbounded_channel();
    (
        InprocStream {
            tx: m2w_tx,
            rx: w2m_rx,
        },
        InprocStream {
            tx: w2m_tx,
            rx: m2w_rx,
        },
    )
}

impl RequestStream for InprocStream {
    fn poll(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    fn post(&mut self, payload: Payload) -> Result<()> {
        self.tx
            .send(payload)
            .map_err(|_| PipelineError::Protocol("stream peer disconnected".into()))
    }
}

/// Work accounting of one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollResult {
    pub sample_count: usize,
    pub batch_count: usize,
}

/// Environment knobs consumed at worker start.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEnv {
    pub package_path: Option<PathBuf>,
    pub remote_mode: bool,
    pub trace: bool,
    pub recover: bool,
    pub save_recover: bool,
}

impl RuntimeEnv {
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).map(|v| v == "1").unwrap_or(false);
        Self {
            package_path: std::env::var("HMP_PACKAGE_PATH").ok().map(PathBuf::from),
            remote_mode: std::env::var("HMP_MODE")
                .map(|v| v == "remote")
                .unwrap_or(false),
            trace: flag("HMP_TRACE"),
            recover: flag("HMP_RECOVER"),
            save_recover: flag("HMP_SAVE_RECOVER"),
        }
    }
}

/// An in-memory training dataset shard with epoch bookkeeping.
pub struct WorkerDataset {
    batches: Vec<NamedBatch>,
    pub max_seqlen: usize,
    cursor: usize,
    epoch: i64,
    epoch_step: i64,
    global_step: i64,
    current: Option<NamedBatch>,
}

impl WorkerDataset {
    pub fn new(batches: Vec<NamedBatch>, max_seqlen: usize) -> Self {
        Self {
            batches,
            max_seqlen,
            cursor: 0,
            epoch: -1,
            epoch_step: 0,
            global_step: 0,
            current: None,
        }
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.batches.len()
    }

    fn prefetch(&mut self) {
        if self.current.is_none() && !self.batches.is_empty() {
            if self.cursor == 0 {
                self.epoch += 1;
            }
            self.epoch_step = self.cursor as i64;
            self.current = Some(self.batches[self.cursor].clone());
            self.cursor = (self.cursor + 1) % self.batches.len();
        }
    }
}

struct ComputeInput {
    data: NamedBatch,
    buffer_indices: Vec<u64>,
    seqlens: Vec<usize>,
    output_key_remap: BTreeMap<String, String>,
}

enum OpResult {
    Msg(MessageData),
    Output {
        batch: NamedBatch,
        buffer_indices: Vec<u64>,
        seqlens: Vec<usize>,
    },
}

type QueueItem = (Payload, bool, Option<OpResult>);

/// Static configuration of one model worker.
pub struct WorkerConfig {
    pub worker_index: usize,
    /// Worker rank inside the communication world; roots of transfer lanes
    /// are identified by this rank.
    pub comm_rank: usize,
    pub shards: Vec<ModelShardId>,
    pub topologies: HashMap<ModelName, Topology>,
    pub src_rpc_model_name: ModelName,
    pub data2required_rpc_names: BTreeMap<String, BTreeSet<String>>,
    /// Which dataset dp rank this worker serves, if any.
    pub dataset_dp_rank: Option<usize>,
}

/// One worker process: receives requests from the master, orders them via
/// the SYN/ACK handshake, runs pre-hooks, computation, and post-hooks, and
/// posts responses. Owns produced tensors until every consumer has them.
pub struct ModelWorker {
    cfg: WorkerConfig,
    env: RuntimeEnv,
    stream: Box<dyn RequestStream>,

    models: HashMap<ModelName, Model>,
    interfaces: HashMap<ModelName, Box<dyn ModelInterface>>,
    model_is_handle: HashMap<ModelName, bool>,
    param_storages: HashMap<ModelName, HashMap<(usize, usize), ParamStorage>>,
    eval_data: HashMap<ModelName, Vec<NamedBatch>>,
    dataset: Option<WorkerDataset>,
    fetched_data: Option<Vec<NamedBatch>>,

    data_storage: DataOwnerStorage,
    transfer_plan: DataTransferPlan,
    compute_input_queues: HashMap<&'static str, VecDeque<ComputeInput>>,

    request_cache: VecDeque<Payload>,
    ack_cache: HashMap<u64, Payload>,
    request_queue: VecDeque<QueueItem>,
    reply_queue: VecDeque<(Payload, OpResult)>,
    request_sample_size: HashMap<u64, usize>,

    util_sampler: Option<JoinHandle<()>>,
}

impl ModelWorker {
    pub fn new(
        cfg: WorkerConfig,
        stream: Box<dyn RequestStream>,
        models: HashMap<ModelName, Model>,
        interfaces: HashMap<ModelName, Box<dyn ModelInterface>>,
        transfer_plan: DataTransferPlan,
        dataset: Option<WorkerDataset>,
    ) -> Self {
        let env = RuntimeEnv::from_env();
        let model_is_handle = models
            .keys()
            .map(|name| (name.clone(), name.replica_id != 0))
            .collect();
        let data_storage = DataOwnerStorage::new(cfg.data2required_rpc_names.clone());
        let compute_input_queues = ["train_step", "inference", "generate", "evaluate"]
            .into_iter()
            .map(|op| (op, VecDeque::new()))
            .collect();

        let util_sampler = Some(spawn_util_sampler(cfg.worker_index));
        info!(
            worker = cfg.worker_index,
            shards = cfg.shards.len(),
            remote = env.remote_mode,
            "model worker starting"
        );

        Self {
            cfg,
            env,
            stream,
            models,
            interfaces,
            model_is_handle,
            param_storages: HashMap::new(),
            eval_data: HashMap::new(),
            dataset,
            fetched_data: None,
            data_storage,
            transfer_plan,
            compute_input_queues,
            request_cache: VecDeque::new(),
            ack_cache: HashMap::new(),
            request_queue: VecDeque::new(),
            reply_queue: VecDeque::new(),
            request_sample_size: HashMap::new(),
            util_sampler,
        }
    }

    pub fn set_eval_data(&mut self, model: ModelName, batches: Vec<NamedBatch>) {
        self.eval_data.insert(model, batches);
    }

    pub fn register_param_storage(
        &mut self,
        model: ModelName,
        shard: (usize, usize),
        storage: ParamStorage,
    ) {
        self.param_storages
            .entry(model)
            .or_default()
            .insert(shard, storage);
    }

    pub fn model(&self, name: &ModelName) -> Option<&Model> {
        self.models.get(name)
    }

    pub fn model_is_handle(&self, name: &ModelName) -> Option<bool> {
        self.model_is_handle.get(name).copied()
    }

    pub fn owned_data_len(&self) -> usize {
        self.data_storage.len()
    }

    pub fn param_storage_is_owned(&self, model: &ModelName, shard: (usize, usize)) -> Option<bool> {
        self.param_storages
            .get(model)
            .and_then(|m| m.get(&shard))
            .map(ParamStorage::is_owned)
    }

    pub fn runtime_env(&self) -> &RuntimeEnv {
        &self.env
    }

    fn dp_rank_of(&self, model: &ModelName) -> Option<usize> {
        self.cfg
            .shards
            .iter()
            .find(|s| &s.model == model)
            .map(|s| s.dp)
    }

    fn is_dp_head_of(&self, model: &ModelName) -> bool {
        match (self.cfg.topologies.get(model), self.shard_of(model)) {
            (Some(topo), Some(shard)) => topo.is_dp_head(&shard.coord()),
            _ => false,
        }
    }

    fn shard_of(&self, model: &ModelName) -> Option<&ModelShardId> {
        self.cfg.shards.iter().find(|s| &s.model == model)
    }

    fn handler_model_name(&self, handler: &HandlerId) -> Result<ModelName> {
        match handler {
            HandlerId::Shard { shard } => Ok(shard.model.clone()),
            HandlerId::Data { dp_rank } => {
                if Some(*dp_rank) != self.cfg.dataset_dp_rank {
                    return Err(PipelineError::Protocol(format!(
                        "dataset request for dp rank {dp_rank} on the wrong worker"
                    )));
                }
                Ok(self.cfg.src_rpc_model_name.clone())
            }
            HandlerId::Master => Err(PipelineError::Protocol(
                "worker received a master-addressed payload".into(),
            )),
        }
    }

    /// One cooperative tick: drain the stream, promote acknowledged
    /// requests, step a bounded number of queue items, post ready responses.
    pub async fn poll(&mut self) -> Result<PollResult> {
        if let Some(ds) = self.dataset.as_mut() {
            ds.prefetch();
        }

        self.maybe_receive_requests()?;

        for _ in 0..16 {
            match self.request_queue.pop_front() {
                Some((payload, handled, res)) => {
                    self.model_poll_step(payload, handled, res).await?;
                }
                None => break,
            }
        }

        Ok(self.maybe_post_responses()?)
    }

    fn maybe_receive_one_request(&mut self) -> Result<()> {
        let Some(payload) = self.stream.poll() else {
            return Ok(());
        };
        if payload.handle_name == "ack" {
            self.ack_cache.insert(payload.request_id, payload);
        } else {
            if let Some(syn_id) = payload.syn_reply_id {
                self.stream.post(Payload::control(syn_id, "syn"))?;
            }
            self.request_cache.push_back(payload);
        }
        Ok(())
    }

    fn maybe_receive_requests(&mut self) -> Result<()> {
        for _ in 0..8 {
            self.maybe_receive_one_request()?;
        }
        // promote requests whose ACK has arrived; an un-acknowledged request
        // stays cached and is retried on the next tick
        while let Some(front) = self.request_cache.front() {
            let ready = front
                .ack_reply_id
                .map_or(true, |id| self.ack_cache.contains_key(&id));
            if !ready {
                break;
            }
            let request = self.request_cache.pop_front().expect("front exists");
            if let Some(id) = request.ack_reply_id {
                self.ack_cache.remove(&id);
            }
            self.request_queue.push_back((request, false, None));
        }
        Ok(())
    }

    async fn model_poll_step(
        &mut self,
        mut payload: Payload,
        handled: bool,
        res: Option<OpResult>,
    ) -> Result<()> {
        if !payload.pre_hooks.is_empty() {
            debug_assert!(!handled && res.is_none());
            let hook = payload.pre_hooks.remove(0);
            self.run_rpc_hook(hook).await?;
            self.request_queue.push_back((payload, false, None));
            return Ok(());
        }
        if handled && !payload.post_hooks.is_empty() {
            let hook = payload.post_hooks.remove(0);
            self.run_rpc_hook(hook).await?;
            self.request_queue.push_back((payload, true, res));
            return Ok(());
        }
        if handled {
            let res = res.unwrap_or(OpResult::Msg(MessageData::Empty));
            let samples = match &res {
                OpResult::Output { seqlens, .. } => seqlens.len().max(1),
                OpResult::Msg(_) => 1,
            };
            self.request_sample_size.insert(payload.request_id, samples);
            self.reply_queue.push_back((payload, res));
            return Ok(());
        }

        let started = std::time::Instant::now();
        let model_name = self.handler_model_name(&payload.handler)?;
        let res = self.execute_operation(&model_name, &payload).await?;

        if TIME_RECORD_RPCS.contains(&payload.handle_name.as_str())
            && self.is_dp_head_of(&model_name)
            && self.dp_rank_of(&model_name) == Some(0)
        {
            info!(
                model = %model_name,
                op = %payload.handle_name,
                elapsed_s = started.elapsed().as_secs_f64(),
                "operation handled"
            );
        }

        self.request_queue.push_back((payload, true, Some(res)));
        Ok(())
    }

    async fn execute_operation(
        &mut self,
        model_name: &ModelName,
        payload: &Payload,
    ) -> Result<OpResult> {
        let op = payload.handle_name.as_str();
        let res = match op {
            // hook-only carrier
            "empty" => OpResult::Msg(MessageData::Empty),
            "initialize" => {
                self.ensure_materialized(model_name)?;
                let MessageData::Spec(spec) = &payload.data else {
                    return Err(PipelineError::Protocol(
                        "initialize without a fine-tune spec".into(),
                    ));
                };
                let model = self.model_mut(model_name)?;
                model.initialize(spec.clone());
                OpResult::Msg(MessageData::Empty)
            }
            "model_config" => {
                let model = self.model_mut(model_name)?;
                OpResult::Msg(MessageData::Config(model.config.clone()))
            }
            "fetch" => {
                if self.fetched_data.is_some() {
                    return Err(PipelineError::Protocol(
                        "fetch before the previous batch was stored".into(),
                    ));
                }
                let ds = self.dataset.as_mut().ok_or_else(|| {
                    PipelineError::Protocol("fetch on a worker without a dataset".into())
                })?;
                let sample = ds.current.take().ok_or_else(|| {
                    PipelineError::Protocol("no prefetched sample available".into())
                })?;
                let seqlens: Vec<usize> = sample
                    .seqlens()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|l| l as usize)
                    .collect();
                let msg = MessageData::Fetched {
                    n_seqs: seqlens.len(),
                    seqlens,
                    epoch: ds.epoch,
                    epoch_step: ds.epoch_step,
                    global_step: ds.global_step,
                };
                ds.global_step += 1;
                self.fetched_data = Some(
                    sample
                        .split_into_seqs()
                        .map_err(PipelineError::Tensor)?,
                );
                OpResult::Msg(msg)
            }
            "store" => {
                let MessageData::BufferIndices(buffer_indices) = &payload.data else {
                    return Err(PipelineError::Protocol(
                        "store without buffer indices".into(),
                    ));
                };
                let fetched = self.fetched_data.take().ok_or_else(|| {
                    PipelineError::Protocol("store without a fetched batch".into())
                })?;
                if buffer_indices.len() != fetched.len() {
                    return Err(PipelineError::Protocol(format!(
                        "{} buffer indices for {} fetched sequences",
                        buffer_indices.len(),
                        fetched.len()
                    )));
                }
                for (&buf_idx, sample) in buffer_indices.iter().zip(fetched) {
                    for (k, v) in sample.into_entries() {
                        self.data_storage.put(buf_idx, k, v);
                    }
                }
                OpResult::Msg(MessageData::Empty)
            }
            "spec" => {
                let ds = self.dataset.as_ref().ok_or_else(|| {
                    PipelineError::Protocol("spec on a worker without a dataset".into())
                })?;
                OpResult::Msg(MessageData::Spec(FinetuneSpec {
                    total_train_epochs: -1, // filled by the master
                    total_train_steps: -1,
                    steps_per_epoch: ds.steps_per_epoch() as i64,
                    batch_size_per_device: ds
                        .batches
                        .first()
                        .and_then(NamedBatch::batch_size)
                        .unwrap_or(0) as i64,
                    max_seqlen: ds.max_seqlen,
                }))
            }
            "inference" | "generate" => {
                self.ensure_materialized(model_name)?;
                let input = self.pop_compute_input(op)?;
                let outcome = {
                    let model = self
                        .models
                        .get_mut(model_name)
                        .ok_or_else(|| unknown_model(model_name))?;
                    let interface = self
                        .interfaces
                        .get_mut(model_name)
                        .ok_or_else(|| unknown_model(model_name))?;
                    if op == "inference" {
                        interface.inference(model, input.data).await
                    } else {
                        interface.generate(model, input.data).await
                    }
                };
                match outcome {
                    Ok(Some(batch)) => {
                        let batch = batch.remap_keys(&input.output_key_remap);
                        OpResult::Output {
                            batch,
                            buffer_indices: input.buffer_indices,
                            seqlens: input.seqlens,
                        }
                    }
                    Ok(None) => OpResult::Msg(MessageData::Empty),
                    // user-code failures ride back in the response payload
                    Err(e @ (PipelineError::Loss(_) | PipelineError::Module(_))) => {
                        OpResult::Msg(MessageData::Error(e.to_string()))
                    }
                    Err(e) => return Err(e),
                }
            }
            "train_step" => {
                self.ensure_materialized(model_name)?;
                let input = self.pop_compute_input(op)?;
                let outcome = {
                    let model = self
                        .models
                        .get_mut(model_name)
                        .ok_or_else(|| unknown_model(model_name))?;
                    let interface = self
                        .interfaces
                        .get_mut(model_name)
                        .ok_or_else(|| unknown_model(model_name))?;
                    interface.train_step(model, input.data).await
                };
                match outcome {
                    Ok(stats) => OpResult::Msg(MessageData::Stats(stats)),
                    Err(e @ (PipelineError::Loss(_) | PipelineError::Module(_))) => {
                        OpResult::Msg(MessageData::Error(e.to_string()))
                    }
                    Err(e) => return Err(e),
                }
            }
            "evaluate" => {
                self.ensure_materialized(model_name)?;
                let batches = self.eval_data.remove(model_name).unwrap_or_default();
                let outcome = {
                    let model = self
                        .models
                        .get_mut(model_name)
                        .ok_or_else(|| unknown_model(model_name))?;
                    let interface = self
                        .interfaces
                        .get_mut(model_name)
                        .ok_or_else(|| unknown_model(model_name))?;
                    interface.evaluate(model, &batches).await
                };
                self.eval_data.insert(model_name.clone(), batches);
                match outcome {
                    Ok(stats) => OpResult::Msg(MessageData::Stats(stats)),
                    Err(e @ (PipelineError::Loss(_) | PipelineError::Module(_))) => {
                        OpResult::Msg(MessageData::Error(e.to_string()))
                    }
                    Err(e) => return Err(e),
                }
            }
            "save" => {
                self.ensure_materialized(model_name)?;
                let MessageData::SaveDir(dir) = &payload.data else {
                    return Err(PipelineError::Protocol("save without a directory".into()));
                };
                let dir = dir.clone();
                let model = self
                    .models
                    .get_mut(model_name)
                    .ok_or_else(|| unknown_model(model_name))?;
                let interface = self
                    .interfaces
                    .get_mut(model_name)
                    .ok_or_else(|| unknown_model(model_name))?;
                interface.save(model, &dir).await?;
                OpResult::Msg(MessageData::Empty)
            }
            other => {
                return Err(PipelineError::Protocol(format!(
                    "unknown request type {other:?}"
                )))
            }
        };
        Ok(res)
    }

    fn model_mut(&mut self, name: &ModelName) -> Result<&mut Model> {
        self.models.get_mut(name).ok_or_else(|| unknown_model(name))
    }

    fn ensure_materialized(&self, name: &ModelName) -> Result<()> {
        if self.model_is_handle.get(name).copied().unwrap_or(false) {
            return Err(PipelineError::ParamsNotOwned {
                model: name.to_string(),
            });
        }
        Ok(())
    }

    fn pop_compute_input(&mut self, op: &str) -> Result<ComputeInput> {
        self.compute_input_queues
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                PipelineError::Protocol(format!(
                    "compute operation {op:?} has no staged input; was the data-transfer pre-hook skipped?"
                ))
            })
    }

    async fn run_rpc_hook(&mut self, hook: HookCall) -> Result<()> {
        match hook {
            HookCall::DataTransfer(hook) => self.data_transfer_among_workers(&hook).await,
            HookCall::ParamSync(req) => self.param_sync(&req),
            HookCall::Offload { model } => {
                debug!(model = %model, "offload requested");
                Ok(())
            }
        }
    }

    fn param_sync(&mut self, req: &ReshardRequest) -> Result<()> {
        let to_shards: Vec<(usize, usize)> = self
            .cfg
            .shards
            .iter()
            .filter(|s| s.model == req.to_model)
            .map(|s| (s.tp, s.pp))
            .collect();

        let mut from_storage = self
            .param_storages
            .remove(&req.from_model)
            .unwrap_or_default();
        let mut to_storage = self
            .param_storages
            .remove(&req.to_model)
            .unwrap_or_default();

        run_reshard(req, &mut from_storage, &mut to_storage, &to_shards)?;

        if self.models.contains_key(&req.from_model) {
            self.model_is_handle.insert(req.from_model.clone(), true);
        }
        if self.models.contains_key(&req.to_model) {
            self.model_is_handle.insert(req.to_model.clone(), false);
        }
        self.param_storages
            .insert(req.from_model.clone(), from_storage);
        self.param_storages.insert(req.to_model.clone(), to_storage);
        Ok(())
    }

    /// Move produced slots between model instances: for every
    /// (producer_dp, consumer_dp) lane with traffic, the producer's dp-head
    /// broadcasts each slot to the consumer group, then records the send so
    /// storage can be freed once every required consumer has the key.
    async fn data_transfer_among_workers(&mut self, hook: &DataTransferHook) -> Result<()> {
        // received values keyed by global slot position, so keys with
        // different producer layouts still line up sample-wise
        let mut gathered: BTreeMap<String, BTreeMap<usize, Tensor>> = BTreeMap::new();

        let target_dp = self.dp_rank_of(&hook.target);

        for key in &hook.keys {
            let producer = hook
                .producer_names
                .get(key)
                .ok_or_else(|| PipelineError::Protocol(format!("no producer for key {key:?}")))?;
            let producer_mapping = hook
                .producer_mappings
                .get(key)
                .ok_or_else(|| PipelineError::Protocol(format!("no mapping for key {key:?}")))?;
            if !self.models.contains_key(producer) && !self.models.contains_key(&hook.target) {
                continue;
            }

            let strategy = repartition_strategy(producer_mapping, &hook.target_mapping);
            let producer_dp = self.dp_rank_of(producer);
            let producer_is_head = self.is_dp_head_of(producer);

            for ((dp_i, dp_j), slots) in &strategy {
                if slots.is_empty() {
                    continue;
                }
                let pair = DataTransferPair {
                    src: producer.clone(),
                    src_dp: *dp_i,
                    dst: hook.target.clone(),
                    dst_dp: *dp_j,
                };
                let i_receive = target_dp == Some(*dp_j);
                let i_send = producer_dp == Some(*dp_i) && producer_is_head;
                if !i_receive && !i_send {
                    continue;
                }

                let root = *self.transfer_plan.src_ranks.get(&pair).ok_or_else(|| {
                    PipelineError::Protocol(format!("no transfer lane for {pair:?}"))
                })?;
                let is_root = root == self.cfg.comm_rank;

                for &pos in slots {
                    let buf_idx = hook.buffer_indices[pos];
                    let seqlen = hook.seqlens[pos];

                    let contribution = if is_root {
                        let v = self.data_storage.get(buf_idx, key)?.clone();
                        let expect_shape = crate::data::key_shape(key, seqlen)
                            .map_err(PipelineError::Tensor)?;
                        let expect_dtype =
                            crate::data::key_dtype(key).map_err(PipelineError::Tensor)?;
                        if v.shape() != expect_shape.as_slice() || v.dtype() != expect_dtype {
                            return Err(PipelineError::Protocol(format!(
                                "stored {key:?} for slot {buf_idx} violates the shape table"
                            )));
                        }
                        Some(v)
                    } else {
                        None
                    };

                    let group = self.transfer_plan.groups.get_mut(&pair).ok_or_else(|| {
                        PipelineError::Protocol(format!("no group endpoint for {pair:?}"))
                    })?;
                    let value = group
                        .broadcast(root, contribution)
                        .await
                        .map_err(PipelineError::Comm)?;

                    if i_receive {
                        gathered.entry(key.clone()).or_default().insert(pos, value);
                    }
                    if i_send {
                        self.data_storage.mark_sent(buf_idx, key, &hook.rpc_name);
                    }
                }
            }
        }

        if !gathered.is_empty() {
            let positions: Vec<usize> = gathered
                .values()
                .next()
                .map(|m| m.keys().copied().collect())
                .unwrap_or_default();
            let mut samples = Vec::with_capacity(positions.len());
            for &pos in &positions {
                let mut sample = NamedBatch::new();
                for (k, vs) in &gathered {
                    let v = vs.get(&pos).ok_or_else(|| {
                        PipelineError::Protocol(format!(
                            "key {k:?} missing slot position {pos} after transfer"
                        ))
                    })?;
                    let key = hook.input_key_remap.get(k).unwrap_or(k);
                    sample.insert(key.clone(), v.clone());
                }
                samples.push(sample);
            }
            let local_buffer_indices: Vec<u64> = positions
                .iter()
                .map(|&p| hook.buffer_indices[p])
                .collect();
            let local_seqlens: Vec<usize> =
                positions.iter().map(|&p| hook.seqlens[p]).collect();
            let data = NamedBatch::gather(&samples).map_err(PipelineError::Tensor)?;
            let queue = self
                .compute_input_queues
                .get_mut(hook.handle_name.as_str())
                .ok_or_else(|| {
                    PipelineError::Protocol(format!(
                        "unknown compute queue {:?}",
                        hook.handle_name
                    ))
                })?;
            queue.push_back(ComputeInput {
                data,
                buffer_indices: local_buffer_indices,
                seqlens: local_seqlens,
                output_key_remap: hook.output_key_remap.clone(),
            });
        }
        Ok(())
    }

    fn post_one_response(&mut self, request: &Payload, res: OpResult) -> Result<()> {
        let model_name = self.handler_model_name(&request.handler)?;
        match res {
            OpResult::Msg(data) => {
                self.stream.post(Payload::request(
                    HandlerId::Master,
                    request.request_id,
                    request.handle_name.clone(),
                    data,
                ))?;
            }
            OpResult::Output {
                batch,
                buffer_indices,
                seqlens,
            } => {
                let out_seqlens: Vec<usize> = batch
                    .seqlens()
                    .map(|lens| lens.into_iter().map(|l| l as usize).collect())
                    .unwrap_or(seqlens);
                self.stream.post(Payload::request(
                    HandlerId::Master,
                    request.request_id,
                    request.handle_name.clone(),
                    MessageData::OutputMeta {
                        keys: batch.keys().cloned().collect(),
                        seqlens: out_seqlens.clone(),
                        buffer_indices: buffer_indices.clone(),
                    },
                ))?;

                // dp-heads keep the produced tensors until every consumer
                // has pulled them
                if matches!(request.handler, HandlerId::Shard { .. })
                    && self.is_dp_head_of(&model_name)
                {
                    self.store_output_batch(&batch, &buffer_indices, &out_seqlens)?;
                }
            }
        }
        Ok(())
    }

    /// Split a produced batch per sequence by the key layout tables and move
    /// the pieces into owner storage. Keys outside the tables (raw
    /// generation outputs) are not transferable and are skipped.
    fn store_output_batch(
        &mut self,
        batch: &NamedBatch,
        buffer_indices: &[u64],
        seqlens: &[usize],
    ) -> Result<()> {
        if seqlens.len() != buffer_indices.len() {
            return Err(PipelineError::Protocol(format!(
                "{} sequence lengths for {} buffer indices",
                seqlens.len(),
                buffer_indices.len()
            )));
        }
        for (key, tensor) in batch.iter() {
            let layout = match crate::data::key_layout(key) {
                Ok(l) => l,
                Err(_) => {
                    debug!(key = %key, "non-transferable response key; not stored");
                    continue;
                }
            };
            let mut offset = 0usize;
            for (i, (&buf_idx, &s)) in buffer_indices.iter().zip(seqlens).enumerate() {
                let piece = match layout {
                    crate::data::KeyLayout::PerSeq => tensor.slice_rows(i, i + 1),
                    crate::data::KeyLayout::CuSeqlens => {
                        Tensor::from_i32(vec![2], vec![0, s as i32])
                    }
                    crate::data::KeyLayout::Tokens => {
                        let p = tensor.slice_rows(offset, offset + s);
                        offset += s;
                        p
                    }
                    crate::data::KeyLayout::TokensMinusOne => {
                        let p = tensor.slice_rows(offset, offset + s - 1);
                        offset += s - 1;
                        p
                    }
                }
                .map_err(PipelineError::Tensor)?;
                self.data_storage.put(buf_idx, key.clone(), piece);
            }
        }
        Ok(())
    }

    fn maybe_post_responses(&mut self) -> Result<PollResult> {
        let mut result = PollResult::default();
        if let Some((request, res)) = self.reply_queue.pop_front() {
            self.post_one_response(&request, res)?;
            result.sample_count += self
                .request_sample_size
                .remove(&request.request_id)
                .unwrap_or(1);
            result.batch_count += 1;
        }
        Ok(result)
    }
}

impl Drop for ModelWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.util_sampler.take() {
            handle.abort();
        }
    }
}

fn unknown_model(name: &ModelName) -> PipelineError {
    PipelineError::Protocol(format!("no model {name} on this worker"))
}

/// Background device-utilization sampler; the only thread a worker runs
/// besides its cooperative loop.
fn spawn_util_sampler(worker_index: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(20));
        loop {
            ticker.tick().await;
            debug!(worker = worker_index, "device utilization sample");
        }
    })
}

/// Master-side helper over per-worker streams: posts requests with the
/// three-way handshake and collects responses.
pub struct MasterClient {
    streams: Vec<InprocStream>,
    next_id: u64,
}

/// Ids of an in-flight handshaked request.
#[derive(Debug, Clone, Copy)]
pub struct RequestIds {
    pub request_id: u64,
    pub syn_reply_id: u64,
    pub ack_reply_id: u64,
}

impl MasterClient {
    pub fn new(streams: Vec<InprocStream>) -> Self {
        Self {
            streams,
            next_id: 1,
        }
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Post a request to one worker with SYN/ACK ids attached.
    pub fn post_request(&mut self, worker: usize, mut payload: Payload) -> Result<RequestIds> {
        let ids = RequestIds {
            request_id: self.fresh_id(),
            syn_reply_id: self.fresh_id(),
            ack_reply_id: self.fresh_id(),
        };
        payload.request_id = ids.request_id;
        payload.syn_reply_id = Some(ids.syn_reply_id);
        payload.ack_reply_id = Some(ids.ack_reply_id);
        self.streams[worker].post(payload)?;
        Ok(ids)
    }

    /// Wait for the SYN of a posted request, then acknowledge it. Workers
    /// start processing only after the ACK, so a fan-out acknowledged
    /// together starts together.
    pub async fn complete_handshake(&mut self, worker: usize, ids: RequestIds) -> Result<()> {
        loop {
            if let Some(p) = self.streams[worker].poll() {
                if p.handle_name == "syn" && p.request_id == ids.syn_reply_id {
                    let mut ack = Payload::control(ids.ack_reply_id, "ack");
                    ack.handler = HandlerId::Master;
                    self.streams[worker].post(ack)?;
                    return Ok(());
                }
                warn!(
                    handle = %p.handle_name,
                    "unexpected message while waiting for syn"
                );
                continue;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    /// Wait for the response of a request.
    pub async fn await_response(&mut self, worker: usize, ids: RequestIds) -> Result<MessageData> {
        loop {
            if let Some(p) = self.streams[worker].poll() {
                if p.request_id == ids.request_id && p.handle_name != "syn" {
                    return Ok(p.data);
                }
                continue;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_serde() {
        let shard = ModelShardId::new(ModelName::new("actor", 0), 0, 0, 1);
        let p = Payload {
            handler: HandlerId::Shard { shard },
            request_id: 7,
            ack_reply_id: Some(9),
            syn_reply_id: Some(8),
            handle_name: "train_step".into(),
            data: MessageData::BufferIndices(vec![1, 2, 3]),
            pre_hooks: vec![HookCall::Offload {
                model: ModelName::new("actor", 0),
            }],
            post_hooks: vec![],
        };
        let s = serde_json::to_string(&p).unwrap();
        let q: Payload = serde_json::from_str(&s).unwrap();
        assert_eq!(q.request_id, 7);
        assert_eq!(q.handle_name, "train_step");
        assert!(matches!(q.data, MessageData::BufferIndices(ref v) if v == &vec![1, 2, 3]));
        assert_eq!(q.pre_hooks.len(), 1);
    }

    #[test]
    fn inproc_stream_is_nonblocking() {
        let (mut master, mut worker) = inproc_stream_pair();
        assert!(worker.poll().is_none());
        master
            .post(Payload::control(1, "ack"))
            .unwrap();
        let got = worker.poll().unwrap();
        assert_eq!(got.request_id, 1);
        assert!(worker.poll().is_none());
    }

    #[test]
    fn dataset_cycles_epochs() {
        let mut batch = NamedBatch::new();
        batch.insert(
            "cu_seqlens",
            Tensor::from_i32(vec![2], vec![0, 4]).unwrap(),
        );
        batch.insert(
            "packed_input_ids",
            Tensor::from_i64(vec![4], vec![1, 2, 3, 4]).unwrap(),
        );
        let mut ds = WorkerDataset::new(vec![batch.clone(), batch], 4);
        ds.prefetch();
        assert_eq!(ds.epoch, 0);
        assert!(ds.current.is_some());
        ds.current = None;
        ds.prefetch();
        assert_eq!(ds.epoch_step, 1);
        ds.current = None;
        ds.prefetch();
        // wrapped around into the next epoch
        assert_eq!(ds.epoch, 1);
        assert_eq!(ds.epoch_step, 0);
    }
}
