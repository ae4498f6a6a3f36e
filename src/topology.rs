use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::comm::ProcessGroup;
use crate::error::TopologyError;

/// A model instance: a symbolic role plus a replica index. Replica 0 owns the
/// real parameters at construction; other replicas are handles until a
/// parameter-sync hook populates them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelName {
    pub role: String,
    pub replica_id: usize,
}

impl ModelName {
    pub fn new(role: impl Into<String>, replica_id: usize) -> Self {
        Self {
            role: role.into(),
            replica_id,
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.replica_id)
    }
}

/// The 3-D parallel layout of one model: data x tensor x pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub data: usize,
    pub tensor: usize,
    pub pipe: usize,
}

/// One shard's coordinate inside a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelCoord {
    pub dp: usize,
    pub tp: usize,
    pub pp: usize,
}

impl Topology {
    pub fn new(data: usize, tensor: usize, pipe: usize) -> Self {
        Self { data, tensor, pipe }
    }

    pub fn world_size(&self) -> usize {
        self.data * self.tensor * self.pipe
    }

    /// D*T*P must equal the number of shards of the model.
    pub fn validate(&self, num_shards: usize) -> Result<(), TopologyError> {
        if self.world_size() != num_shards {
            return Err(TopologyError::SizeMismatch {
                data: self.data,
                tensor: self.tensor,
                pipe: self.pipe,
                product: self.world_size(),
                world: num_shards,
            });
        }
        Ok(())
    }

    /// Model-local rank of a coordinate. Data-parallel peers are adjacent,
    /// then tensor, then pipeline.
    pub fn rank(&self, dp: usize, tp: usize, pp: usize) -> Result<usize, TopologyError> {
        if dp >= self.data || tp >= self.tensor || pp >= self.pipe {
            return Err(TopologyError::CoordOutOfRange {
                dp,
                tp,
                pp,
                data: self.data,
                tensor: self.tensor,
                pipe: self.pipe,
            });
        }
        Ok((pp * self.tensor + tp) * self.data + dp)
    }

    pub fn coord(&self, rank: usize) -> ParallelCoord {
        let dp = rank % self.data;
        let tp = (rank / self.data) % self.tensor;
        let pp = rank / (self.data * self.tensor);
        ParallelCoord { dp, tp, pp }
    }

    /// The dp-head of a data-parallel rank is the shard with tp = 0 and
    /// pp = P - 1; only dp-heads emit externally visible outputs.
    pub fn is_dp_head(&self, coord: &ParallelCoord) -> bool {
        coord.tp == 0 && coord.pp == self.pipe - 1
    }
}

/// Globally unique shard identifier: model instance plus coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelShardId {
    pub model: ModelName,
    pub dp: usize,
    pub tp: usize,
    pub pp: usize,
}

impl ModelShardId {
    pub fn new(model: ModelName, dp: usize, tp: usize, pp: usize) -> Self {
        Self { model, dp, tp, pp }
    }

    pub fn coord(&self) -> ParallelCoord {
        ParallelCoord {
            dp: self.dp,
            tp: self.tp,
            pp: self.pp,
        }
    }
}

impl fmt::Display for ModelShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@d{}t{}p{}", self.model, self.dp, self.tp, self.pp)
    }
}

/// Injective shard -> worker assignment for one experiment.
#[derive(Debug, Clone, Default)]
pub struct ShardPlacement {
    map: HashMap<ModelShardId, usize>,
}

impl ShardPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, shard: ModelShardId, worker: usize) {
        self.map.insert(shard, worker);
    }

    pub fn worker_of(&self, shard: &ModelShardId) -> Result<usize, TopologyError> {
        self.map
            .get(shard)
            .copied()
            .ok_or_else(|| TopologyError::UnmappedShard {
                shard: shard.to_string(),
            })
    }

    pub fn shards_on(&self, worker: usize) -> Vec<&ModelShardId> {
        let mut v: Vec<&ModelShardId> = self
            .map
            .iter()
            .filter(|(_, &w)| w == worker)
            .map(|(s, _)| s)
            .collect();
        v.sort();
        v
    }
}

/// One shard's view of its model's 3-D grid: its coordinate, the worker ranks
/// of every peer, its neighbors along the pipeline ring, and live process
/// groups for the data- and tensor-parallel dimensions.
pub struct ParallelGrid {
    topo: Topology,
    coord: ParallelCoord,
    /// worker rank of every model-local rank
    rank_of: Vec<usize>,
    dp_group: ProcessGroup,
    tp_group: ProcessGroup,
}

impl ParallelGrid {
    /// Build grids for every shard of a model. `rank_of[model_rank]` is the
    /// worker rank hosting that shard; grids are returned in model-rank order.
    pub fn build_all(topo: Topology, rank_of: Vec<usize>) -> Result<Vec<ParallelGrid>, TopologyError> {
        topo.validate(rank_of.len())?;

        // data-parallel groups: one per (tp, pp)
        let mut dp_groups: HashMap<(usize, usize), Vec<ProcessGroup>> = HashMap::new();
        for pp in 0..topo.pipe {
            for tp in 0..topo.tensor {
                let ranks: Vec<usize> = (0..topo.data)
                    .map(|dp| rank_of[topo.rank(dp, tp, pp).expect("validated")])
                    .collect();
                dp_groups.insert((tp, pp), ProcessGroup::create(&ranks));
            }
        }
        // tensor-parallel groups: one per (dp, pp)
        let mut tp_groups: HashMap<(usize, usize), Vec<ProcessGroup>> = HashMap::new();
        for pp in 0..topo.pipe {
            for dp in 0..topo.data {
                let ranks: Vec<usize> = (0..topo.tensor)
                    .map(|tp| rank_of[topo.rank(dp, tp, pp).expect("validated")])
                    .collect();
                tp_groups.insert((dp, pp), ProcessGroup::create(&ranks));
            }
        }

        // model ranks visit each dimension in increasing order, so handing out
        // group endpoints front-to-front matches coordinates to members
        let mut grids = Vec::with_capacity(rank_of.len());
        for model_rank in 0..rank_of.len() {
            let coord = topo.coord(model_rank);
            let dp_group = dp_groups
                .get_mut(&(coord.tp, coord.pp))
                .and_then(|v| (!v.is_empty()).then(|| v.remove(0)))
                .expect("validated");
            let tp_group = tp_groups
                .get_mut(&(coord.dp, coord.pp))
                .and_then(|v| (!v.is_empty()).then(|| v.remove(0)))
                .expect("validated");
            grids.push(ParallelGrid {
                topo,
                coord,
                rank_of: rank_of.clone(),
                dp_group,
                tp_group,
            });
        }
        Ok(grids)
    }

    pub fn topology(&self) -> Topology {
        self.topo
    }

    pub fn coord(&self) -> ParallelCoord {
        self.coord
    }

    /// Worker rank of the shard at a coordinate of this model.
    pub fn get_rank(&self, dp: usize, tp: usize, pp: usize) -> Result<usize, TopologyError> {
        Ok(self.rank_of[self.topo.rank(dp, tp, pp)?])
    }

    pub fn get_global_rank(&self) -> usize {
        self.rank_of[self
            .topo
            .rank(self.coord.dp, self.coord.tp, self.coord.pp)
            .expect("own coordinate is valid")]
    }

    pub fn get_stage_id(&self) -> usize {
        self.coord.pp
    }

    pub fn get_pipe_parallel_world_size(&self) -> usize {
        self.topo.pipe
    }

    pub fn get_data_parallel_world_size(&self) -> usize {
        self.topo.data
    }

    pub fn get_tensor_parallel_world_size(&self) -> usize {
        self.topo.tensor
    }

    pub fn get_data_parallel_id(&self) -> usize {
        self.coord.dp
    }

    pub fn is_dp_head(&self) -> bool {
        self.topo.is_dp_head(&self.coord)
    }

    /// Worker rank of the previous stage in the pipeline ring.
    pub fn prev_stage(&self) -> usize {
        let pp = (self.coord.pp + self.topo.pipe - 1) % self.topo.pipe;
        self.get_rank(self.coord.dp, self.coord.tp, pp)
            .expect("own coordinate is valid")
    }

    /// Worker rank of the next stage in the pipeline ring.
    pub fn next_stage(&self) -> usize {
        let pp = (self.coord.pp + 1) % self.topo.pipe;
        self.get_rank(self.coord.dp, self.coord.tp, pp)
            .expect("own coordinate is valid")
    }

    pub fn get_data_parallel_group(&mut self) -> &mut ProcessGroup {
        &mut self.dp_group
    }

    pub fn get_tensor_parallel_group(&mut self) -> &mut ProcessGroup {
        &mut self.tp_group
    }
}
