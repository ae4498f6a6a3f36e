use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::comm::ProcessGroup;
use crate::data::{key_dtype, key_shape};
use crate::error::{Result, TensorError, TopologyError};
use crate::tensor::Tensor;
use crate::topology::{ModelName, ModelShardId, ShardPlacement, Topology};

/// A data-parallel layout of buffer slots: dp rank -> positions (indices into
/// the global slot list) that rank owns.
pub type DpMapping = BTreeMap<usize, Vec<usize>>;

/// Contiguous, balanced assignment of `n_slots` positions to `dp` ranks.
pub fn even_partition_mapping(n_slots: usize, dp: usize) -> DpMapping {
    let mut mapping = DpMapping::new();
    let base = n_slots / dp;
    let rem = n_slots % dp;
    let mut pos = 0;
    for rank in 0..dp {
        let take = base + usize::from(rank < rem);
        mapping.insert(rank, (pos..pos + take).collect());
        pos += take;
    }
    mapping
}

/// The pipeline repartition strategy between two dp layouts: for every
/// `(producer_dp, consumer_dp)` pair, the slot positions that must move from
/// the producer rank to the consumer rank.
pub fn repartition_strategy(
    producer: &DpMapping,
    consumer: &DpMapping,
) -> BTreeMap<(usize, usize), Vec<usize>> {
    let mut strategy = BTreeMap::new();
    for (&dp_i, src_slots) in producer {
        let src: BTreeSet<usize> = src_slots.iter().copied().collect();
        for (&dp_j, dst_slots) in consumer {
            let common: Vec<usize> = dst_slots
                .iter()
                .copied()
                .filter(|p| src.contains(p))
                .collect();
            strategy.insert((dp_i, dp_j), common);
        }
    }
    strategy
}

/// Identifies one producer-dp -> consumer-dp broadcast lane between two
/// model instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataTransferPair {
    pub src: ModelName,
    pub src_dp: usize,
    pub dst: ModelName,
    pub dst_dp: usize,
}

/// This worker's endpoints for the transfer lanes it participates in, plus
/// the broadcast root (worker rank) of each lane.
#[derive(Default)]
pub struct DataTransferPlan {
    pub groups: HashMap<DataTransferPair, ProcessGroup>,
    pub src_ranks: HashMap<DataTransferPair, usize>,
}

/// Pre-build one process group per (producer_dp, consumer_dp) lane. The root
/// of a lane is the producer's dp-head; members are the root plus every
/// shard of the consumer at that dp rank. Returns one plan per worker.
pub fn build_transfer_plan(
    src_model: &ModelName,
    src_topo: Topology,
    dst_model: &ModelName,
    dst_topo: Topology,
    placement: &ShardPlacement,
    n_workers: usize,
) -> std::result::Result<Vec<DataTransferPlan>, TopologyError> {
    let mut plans: Vec<DataTransferPlan> = (0..n_workers).map(|_| DataTransferPlan::default()).collect();

    for src_dp in 0..src_topo.data {
        // dp-head of the producer: tp = 0, pp = last
        let root_shard = ModelShardId::new(src_model.clone(), src_dp, 0, src_topo.pipe - 1);
        let root = placement.worker_of(&root_shard)?;
        for dst_dp in 0..dst_topo.data {
            let pair = DataTransferPair {
                src: src_model.clone(),
                src_dp,
                dst: dst_model.clone(),
                dst_dp,
            };
            let mut members = BTreeSet::new();
            members.insert(root);
            for pp in 0..dst_topo.pipe {
                for tp in 0..dst_topo.tensor {
                    let shard = ModelShardId::new(dst_model.clone(), dst_dp, tp, pp);
                    members.insert(placement.worker_of(&shard)?);
                }
            }
            let ranks: Vec<usize> = members.into_iter().collect();
            let endpoints = ProcessGroup::create(&ranks);
            for (rank, ep) in ranks.iter().zip(endpoints) {
                plans[*rank].groups.insert(pair.clone(), ep);
                plans[*rank].src_ranks.insert(pair.clone(), root);
            }
        }
    }
    Ok(plans)
}

/// Receive-side scratch tensor for a key at a given per-sequence length.
/// Shape and dtype come from the fixed tables; unknown keys are a hard error.
pub fn alloc_recv_buffer(key: &str, seqlen: usize) -> std::result::Result<Tensor, TensorError> {
    Ok(Tensor::zeros(key_shape(key, seqlen)?, key_dtype(key)?))
}

/// Producer-side storage of computed outputs, keyed by
/// `(buffer_index, key)`. An entry is owned by this worker until every
/// consumer that the dataflow graph names for the key has received it, then
/// it is dropped.
pub struct DataOwnerStorage {
    storage: HashMap<(u64, String), Tensor>,
    send_record: HashMap<(u64, String), BTreeSet<String>>,
    required: BTreeMap<String, BTreeSet<String>>,
}

impl DataOwnerStorage {
    pub fn new(data2required_rpc_names: BTreeMap<String, BTreeSet<String>>) -> Self {
        Self {
            storage: HashMap::new(),
            send_record: HashMap::new(),
            required: data2required_rpc_names,
        }
    }

    pub fn put(&mut self, buffer_index: u64, key: impl Into<String>, value: Tensor) {
        self.storage.insert((buffer_index, key.into()), value);
    }

    pub fn get(&self, buffer_index: u64, key: &str) -> Result<&Tensor> {
        self.storage
            .get(&(buffer_index, key.to_string()))
            .ok_or_else(|| {
                crate::error::PipelineError::Protocol(format!(
                    "no owned data for buffer index {buffer_index}, key {key:?}"
                ))
            })
    }

    pub fn contains(&self, buffer_index: u64, key: &str) -> bool {
        self.storage.contains_key(&(buffer_index, key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Record that `rpc_name` has received `(buffer_index, key)`. Once the
    /// record covers every required consumer of the key, the entry is
    /// dropped; returns whether that happened.
    pub fn mark_sent(&mut self, buffer_index: u64, key: &str, rpc_name: &str) -> bool {
        let slot = (buffer_index, key.to_string());
        let record = self.send_record.entry(slot.clone()).or_default();
        record.insert(rpc_name.to_string());
        let required = match self.required.get(key) {
            Some(r) => r,
            None => return false,
        };
        if required.is_subset(record) {
            self.storage.remove(&slot);
            self.send_record.remove(&slot);
            true
        } else {
            false
        }
    }
}
