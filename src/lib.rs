pub mod arena;
pub mod buffer;
pub mod comm;
pub mod data;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod generate;
pub mod interface;
pub mod module;
pub mod reshard;
pub mod schedule;
pub mod tensor;
pub mod topology;
pub mod transfer;

pub use arena::MemoryArena;
pub use buffer::{Entry, TensorBuffer};
pub use comm::{check_pipeline_ring, CommWorld, P2p, P2pHandle, ProcessGroup, ReduceOp};
pub use data::{
    key_dtype, key_layout, key_shape, CacheData, KeyLayout, NamedBatch, TransferData, TransferInfo,
};
pub use dispatcher::{
    inproc_stream_pair, DataTransferHook, HandlerId, HookCall, InprocStream, MasterClient,
    MessageData, ModelWorker, Payload, PollResult, RequestIds, RequestStream, RuntimeEnv,
    WorkerConfig, WorkerDataset,
};
pub use engine::{EngineConfig, GenerateOutput, LossFn, ModelContext, ModelDims, PipelineEngine};
pub use error::{
    BufferError, CommError, PipelineError, Result, ScheduleError, TensorError, TopologyError,
};
pub use generate::{genstep, GenStep, GenerationConfig, Tokenizer};
pub use interface::{
    compute_packed_sft_loss, FinetuneSpec, Model, ModelConfig, ModelInterface, ModelVersion,
    PackedSftInterface,
};
pub use module::{Precision, StageModule, ZeroStage};
pub use reshard::{
    reshard_plan, run_reshard, CopyInstr, ParamArena, ParamStorage, ReshardRequest,
};
pub use schedule::{
    GenerateSchedule, InferenceSchedule, PipeInstruction, PipeSchedule, StepCmds, TrainSchedule,
};
pub use tensor::{DType, Tensor, TensorData, TensorMeta};
pub use topology::{ModelName, ModelShardId, ParallelCoord, ParallelGrid, ShardPlacement, Topology};
pub use transfer::{
    build_transfer_plan, even_partition_mapping, repartition_strategy, DataOwnerStorage,
    DataTransferPair, DataTransferPlan,
};
