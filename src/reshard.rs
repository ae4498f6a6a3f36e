use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::topology::{ModelName, Topology};

/// One locally held slice of a layer's flat parameter vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerShardSpec {
    /// Global layer index.
    pub layer: usize,
    /// Interval `[start, end)` within the layer's flat parameters.
    pub start: usize,
    pub end: usize,
    /// Offset of this slice inside the arena.
    pub offset: usize,
}

impl LayerShardSpec {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Contiguous parameter storage of one model shard plus its layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamArena {
    pub data: Vec<f32>,
    pub layout: Vec<LayerShardSpec>,
}

impl ParamArena {
    /// Zero-initialized arena for a shard layout.
    pub fn empty(layout: Vec<LayerShardSpec>) -> Self {
        let total = layout.iter().map(LayerShardSpec::len).sum();
        Self {
            data: vec![0.0; total],
            layout,
        }
    }

    fn slice_for(&self, layer: usize) -> Option<&LayerShardSpec> {
        self.layout.iter().find(|s| s.layer == layer)
    }
}

/// Parameter ownership state of a model on one worker. Replicas start as
/// handles; the parameter-sync hook materializes them. Reads through a
/// handle are a hard error.
#[derive(Debug)]
pub enum ParamStorage {
    Owned(ParamArena),
    Handle,
}

impl ParamStorage {
    pub fn is_owned(&self) -> bool {
        matches!(self, ParamStorage::Owned(_))
    }

    pub fn arena(&self, model: &ModelName) -> Result<&ParamArena> {
        match self {
            ParamStorage::Owned(a) => Ok(a),
            ParamStorage::Handle => Err(PipelineError::ParamsNotOwned {
                model: model.to_string(),
            }),
        }
    }

    pub fn arena_mut(&mut self, model: &ModelName) -> Result<&mut ParamArena> {
        match self {
            ParamStorage::Owned(a) => Ok(a),
            ParamStorage::Handle => Err(PipelineError::ParamsNotOwned {
                model: model.to_string(),
            }),
        }
    }

    /// Release the parameters, leaving a handle behind.
    pub fn release(&mut self) -> Option<ParamArena> {
        match std::mem::replace(self, ParamStorage::Handle) {
            ParamStorage::Owned(a) => Some(a),
            ParamStorage::Handle => None,
        }
    }
}

/// Global layer range of pipeline stage `pp` when `n_layers` layers are split
/// contiguously across `pipe` stages (front stages take the remainder).
pub fn stage_layer_range(n_layers: usize, pipe: usize, pp: usize) -> std::ops::Range<usize> {
    let base = n_layers / pipe;
    let rem = n_layers % pipe;
    let start = pp * base + pp.min(rem);
    let len = base + usize::from(pp < rem);
    start..start + len
}

/// Interval of a layer's flat parameters owned by tensor rank `tp` of
/// `tensor` ranks.
pub fn tensor_interval(layer_numel: usize, tensor: usize, tp: usize) -> (usize, usize) {
    let base = layer_numel / tensor;
    let rem = layer_numel % tensor;
    let start = tp * base + tp.min(rem);
    let len = base + usize::from(tp < rem);
    (start, start + len)
}

/// Arena layout of the `(tp, pp)` shard of a model under a topology.
pub fn shard_layout(
    n_layers: usize,
    layer_numel: usize,
    topo: Topology,
    tp: usize,
    pp: usize,
) -> Vec<LayerShardSpec> {
    let mut layout = Vec::new();
    let mut offset = 0;
    for layer in stage_layer_range(n_layers, topo.pipe, pp) {
        let (start, end) = tensor_interval(layer_numel, topo.tensor, tp);
        layout.push(LayerShardSpec {
            layer,
            start,
            end,
            offset,
        });
        offset += end - start;
    }
    layout
}

/// One interval copy of the re-sharding plan: which source shard provides
/// which slice of which layer to which destination shard. Intervals are in
/// within-layer coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyInstr {
    pub layer: usize,
    /// `(tp, pp)` under the source topology.
    pub src_shard: (usize, usize),
    /// `(tp, pp)` under the destination topology.
    pub dst_shard: (usize, usize),
    pub start: usize,
    pub end: usize,
}

/// Shard-to-shard plan for rebuilding a model's parameters under a new
/// topology: every destination interval is covered exactly once by
/// intersecting source intervals.
pub fn reshard_plan(
    n_layers: usize,
    layer_numel: usize,
    from_topo: Topology,
    to_topo: Topology,
) -> Vec<CopyInstr> {
    let mut plan = Vec::new();
    for layer in 0..n_layers {
        let src_pp = (0..from_topo.pipe)
            .find(|&pp| stage_layer_range(n_layers, from_topo.pipe, pp).contains(&layer))
            .unwrap_or(0);
        let dst_pp = (0..to_topo.pipe)
            .find(|&pp| stage_layer_range(n_layers, to_topo.pipe, pp).contains(&layer))
            .unwrap_or(0);
        for dst_tp in 0..to_topo.tensor {
            let (d0, d1) = tensor_interval(layer_numel, to_topo.tensor, dst_tp);
            for src_tp in 0..from_topo.tensor {
                let (s0, s1) = tensor_interval(layer_numel, from_topo.tensor, src_tp);
                let (a, b) = (d0.max(s0), d1.min(s1));
                if a < b {
                    plan.push(CopyInstr {
                        layer,
                        src_shard: (src_tp, src_pp),
                        dst_shard: (dst_tp, dst_pp),
                        start: a,
                        end: b,
                    });
                }
            }
        }
    }
    plan
}

/// Rebuild the arena of one destination shard from locally available source
/// arenas. `src_arenas` maps `(tp, pp)` under the source topology to the
/// arena held on this worker; every instruction targeting `dst_shard` must
/// be satisfiable locally.
pub fn apply_reshard_local(
    plan: &[CopyInstr],
    src_arenas: &HashMap<(usize, usize), &ParamArena>,
    dst_shard: (usize, usize),
    dst_layout: Vec<LayerShardSpec>,
) -> Result<ParamArena> {
    let mut dst = ParamArena::empty(dst_layout);
    for instr in plan.iter().filter(|i| i.dst_shard == dst_shard) {
        let src = src_arenas.get(&instr.src_shard).ok_or_else(|| {
            PipelineError::Protocol(format!(
                "source shard (tp {}, pp {}) for layer {} not present on this worker",
                instr.src_shard.0, instr.src_shard.1, instr.layer
            ))
        })?;
        let src_spec = src.slice_for(instr.layer).ok_or_else(|| {
            PipelineError::Protocol(format!(
                "source arena missing layer {} slice",
                instr.layer
            ))
        })?;
        let dst_spec = dst.slice_for(instr.layer).cloned().ok_or_else(|| {
            PipelineError::Protocol(format!(
                "destination layout missing layer {} slice",
                instr.layer
            ))
        })?;
        let n = instr.end - instr.start;
        let src_off = src_spec.offset + (instr.start - src_spec.start);
        let dst_off = dst_spec.offset + (instr.start - dst_spec.start);
        let (src_off_end, dst_off_end) = (src_off + n, dst_off + n);
        dst.data[dst_off..dst_off_end].copy_from_slice(&src.data[src_off..src_off_end]);
    }
    Ok(dst)
}

/// Parameter-sync hook payload: rebuild `to_model`'s shards from
/// `from_model`'s current parameters under a new topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardRequest {
    pub from_model: ModelName,
    pub to_model: ModelName,
    pub from_topo: Topology,
    pub to_topo: Topology,
    pub n_layers: usize,
    pub layer_numel: usize,
}

/// Execute a re-sharding request against this worker's parameter registry.
/// Post-condition: every from-model entry is a handle, every to-model shard
/// listed in `to_shards` is materialized.
pub fn run_reshard(
    req: &ReshardRequest,
    from_storage: &mut HashMap<(usize, usize), ParamStorage>,
    to_storage: &mut HashMap<(usize, usize), ParamStorage>,
    to_shards: &[(usize, usize)],
) -> Result<()> {
    let plan = reshard_plan(req.n_layers, req.layer_numel, req.from_topo, req.to_topo);

    // collect the sources while they are still owned
    let src_arenas: HashMap<(usize, usize), &ParamArena> = from_storage
        .iter()
        .filter_map(|(k, v)| match v {
            ParamStorage::Owned(a) => Some((*k, a)),
            ParamStorage::Handle => None,
        })
        .collect();

    let mut rebuilt = Vec::with_capacity(to_shards.len());
    for &(tp, pp) in to_shards {
        let layout = shard_layout(req.n_layers, req.layer_numel, req.to_topo, tp, pp);
        let arena = apply_reshard_local(&plan, &src_arenas, (tp, pp), layout)?;
        rebuilt.push(((tp, pp), arena));
    }
    drop(src_arenas);

    for storage in from_storage.values_mut() {
        storage.release();
    }
    for (shard, arena) in rebuilt {
        to_storage.insert(shard, ParamStorage::Owned(arena));
    }
    info!(
        from = %req.from_model,
        to = %req.to_model,
        shards = to_shards.len(),
        "parameters re-sharded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ranges_are_contiguous_and_cover() {
        let n = 10;
        let p = 4;
        let mut next = 0;
        for pp in 0..p {
            let r = stage_layer_range(n, p, pp);
            assert_eq!(r.start, next);
            next = r.end;
        }
        assert_eq!(next, n);
    }

    #[test]
    fn tensor_intervals_partition_layer() {
        let numel = 11;
        let t = 3;
        let mut next = 0;
        for tp in 0..t {
            let (a, b) = tensor_interval(numel, t, tp);
            assert_eq!(a, next);
            next = b;
        }
        assert_eq!(next, numel);
    }

    #[test]
    fn plan_covers_every_destination_element_once() {
        let (n_layers, numel) = (4, 12);
        let from = Topology::new(1, 2, 2);
        let to = Topology::new(1, 3, 1);
        let plan = reshard_plan(n_layers, numel, from, to);

        for layer in 0..n_layers {
            let mut covered = vec![0u8; numel];
            for i in plan.iter().filter(|i| i.layer == layer) {
                for c in covered[i.start..i.end].iter_mut() {
                    *c += 1;
                }
            }
            assert!(covered.iter().all(|&c| c == 1), "layer {layer}: {covered:?}");
        }
    }

    fn filled_arena(layout: Vec<LayerShardSpec>) -> ParamArena {
        let mut arena = ParamArena::empty(layout);
        for spec in arena.layout.clone() {
            for i in 0..spec.len() {
                // value encodes (layer, within-layer position)
                arena.data[spec.offset + i] = (spec.layer * 1000 + spec.start + i) as f32;
            }
        }
        arena
    }

    #[test]
    fn local_reshard_preserves_values() {
        let (n_layers, numel) = (2, 8);
        let from = Topology::new(1, 2, 1);
        let to = Topology::new(1, 1, 2);
        let plan = reshard_plan(n_layers, numel, from, to);

        let a0 = filled_arena(shard_layout(n_layers, numel, from, 0, 0));
        let a1 = filled_arena(shard_layout(n_layers, numel, from, 1, 0));
        let mut src = HashMap::new();
        src.insert((0, 0), &a0);
        src.insert((1, 0), &a1);

        // destination stage 0 holds layer 0 fully
        let dst = apply_reshard_local(
            &plan,
            &src,
            (0, 0),
            shard_layout(n_layers, numel, to, 0, 0),
        )
        .unwrap();
        let expect: Vec<f32> = (0..numel).map(|i| i as f32).collect();
        assert_eq!(dst.data, expect);

        // destination stage 1 holds layer 1 fully
        let dst = apply_reshard_local(
            &plan,
            &src,
            (0, 1),
            shard_layout(n_layers, numel, to, 0, 1),
        )
        .unwrap();
        let expect: Vec<f32> = (0..numel).map(|i| (1000 + i) as f32).collect();
        assert_eq!(dst.data, expect);
    }

    #[test]
    fn run_reshard_flips_ownership() {
        let req = ReshardRequest {
            from_model: ModelName::new("actor", 0),
            to_model: ModelName::new("actor", 1),
            from_topo: Topology::new(1, 1, 1),
            to_topo: Topology::new(1, 1, 1),
            n_layers: 2,
            layer_numel: 4,
        };
        let mut from = HashMap::new();
        from.insert(
            (0usize, 0usize),
            ParamStorage::Owned(filled_arena(shard_layout(2, 4, req.from_topo, 0, 0))),
        );
        let mut to = HashMap::new();
        to.insert((0usize, 0usize), ParamStorage::Handle);

        run_reshard(&req, &mut from, &mut to, &[(0, 0)]).unwrap();

        assert!(!from[&(0, 0)].is_owned());
        assert!(to[&(0, 0)].is_owned());
        assert!(from[&(0, 0)].arena(&req.from_model).is_err());
        let arena = to[&(0, 0)].arena(&req.to_model).unwrap();
        assert_eq!(arena.data.len(), 8);
        assert_eq!(arena.data[4], 1000.0);
    }

    #[test]
    fn reads_through_handle_are_rejected() {
        let name = ModelName::new("ref", 0);
        let mut s = ParamStorage::Handle;
        assert!(s.arena(&name).is_err());
        assert!(s.arena_mut(&name).is_err());
    }
}
