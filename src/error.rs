/// Errors from the tensor buffer.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("no entry for tag {tag:?}, micro-batch {micro_batch}")]
    Missing { tag: String, micro_batch: usize },
    #[error("entry for tag {tag:?}, micro-batch {micro_batch} is not a {expected}")]
    WrongKind {
        tag: String,
        micro_batch: usize,
        expected: &'static str,
    },
}

/// Errors from the schedule generators.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("zero stages")]
    ZeroStages,
    #[error("zero micro-batches")]
    ZeroMicroBatches,
    #[error("zero new tokens requested")]
    ZeroNewTokens,
    #[error("stage_id {stage_id} out of range for {num_stages} stages")]
    StageOutOfRange { stage_id: usize, num_stages: usize },
}

/// Errors from point-to-point and collective communication.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("no channel to peer {peer}")]
    NoSuchPeer { peer: usize },
    #[error("peer {peer} disconnected")]
    Disconnected { peer: usize },
    #[error("shape mismatch from peer {peer}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        peer: usize,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("dtype mismatch from peer {peer}: expected {expected}, got {got}")]
    DtypeMismatch {
        peer: usize,
        expected: &'static str,
        got: &'static str,
    },
    #[error("expected {expected} on the wire, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
    #[error("rank {rank} is not a member of the group")]
    NotInGroup { rank: usize },
    #[error("ring connectivity check failed at rank {rank}: {reason}")]
    RingCheckFailed { rank: usize, reason: String },
}

/// Errors from topology construction and rank mapping.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topology {data}x{tensor}x{pipe} covers {product} ranks but {world} shards exist")]
    SizeMismatch {
        data: usize,
        tensor: usize,
        pipe: usize,
        product: usize,
        world: usize,
    },
    #[error("coordinate ({dp}, {tp}, {pp}) out of range for topology {data}x{tensor}x{pipe}")]
    CoordOutOfRange {
        dp: usize,
        tp: usize,
        pp: usize,
        data: usize,
        tensor: usize,
        pipe: usize,
    },
    #[error("shard {shard} has no worker assignment")]
    UnmappedShard { shard: String },
}

/// Errors from tensor construction and access.
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    #[error("shape {shape:?} does not hold {len} elements")]
    ShapeLenMismatch { shape: Vec<usize>, len: usize },
    #[error("tensor is {got}, expected {expected}")]
    DtypeMismatch {
        expected: &'static str,
        got: &'static str,
    },
    #[error("unknown data key {key:?}")]
    UnknownKey { key: String },
}

/// Top-level pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("communication error: {0}")]
    Comm(#[from] CommError),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("instruction {instruction} on stage {stage_id}, micro-batch {micro_batch}, step {step_id}: {reason}")]
    InstructionFailed {
        instruction: &'static str,
        stage_id: usize,
        micro_batch: usize,
        step_id: usize,
        reason: String,
    },
    #[error("stage module error: {0}")]
    Module(String),
    #[error("loss function error: {0}")]
    Loss(String),
    #[error("parameters of {model} are a handle on this worker; reads are forbidden")]
    ParamsNotOwned { model: String },
    #[error("request {request_id} failed: {reason}")]
    RequestFailed { request_id: u64, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker shutting down")]
    Shutdown,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, PipelineError>;
