use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::debug;

use crate::error::CommError;
use crate::tensor::{Tensor, TensorMeta};

/// What travels on a point-to-point link. The payload carries no metadata:
/// for any matched send/recv pair the shapes and dtypes must agree
/// bit-for-bit, and the receiver checks its own expectation.
#[derive(Debug, Clone)]
enum WireMsg {
    Tensor(Tensor),
    Flag(bool),
    Check(i32),
}

impl WireMsg {
    fn kind(&self) -> &'static str {
        match self {
            WireMsg::Tensor(_) => "tensor",
            WireMsg::Flag(_) => "flag",
            WireMsg::Check(_) => "check",
        }
    }
}

type WireTx = mpsc::UnboundedSender<WireMsg>;
type WireRx = Arc<Mutex<mpsc::UnboundedReceiver<WireMsg>>>;

/// Opaque token for an asynchronous point-to-point operation. `wait` blocks
/// until the transfer completes; for receives it yields the validated tensor.
#[derive(Debug)]
pub struct P2pHandle {
    rx: oneshot::Receiver<Result<Option<Tensor>, CommError>>,
}

impl P2pHandle {
    fn ready(result: Result<Option<Tensor>, CommError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    pub async fn wait(self) -> Result<Option<Tensor>, CommError> {
        match self.rx.await {
            Ok(r) => r,
            Err(_) => Err(CommError::Disconnected { peer: usize::MAX }),
        }
    }
}

/// Point-to-point endpoint of one worker: typed send/recv towards any peer it
/// has a link to. Links are created by [`CommWorld`].
pub struct P2p {
    rank: usize,
    senders: HashMap<usize, WireTx>,
    receivers: HashMap<usize, WireRx>,
}

impl P2p {
    pub fn rank(&self) -> usize {
        self.rank
    }

    fn sender(&self, peer: usize) -> Result<&WireTx, CommError> {
        self.senders
            .get(&peer)
            .ok_or(CommError::NoSuchPeer { peer })
    }

    fn receiver(&self, peer: usize) -> Result<WireRx, CommError> {
        self.receivers
            .get(&peer)
            .cloned()
            .ok_or(CommError::NoSuchPeer { peer })
    }

    /// Synchronous tensor send. Completes once the payload is on the link.
    pub fn send(&self, tensor: Tensor, peer: usize) -> Result<(), CommError> {
        self.sender(peer)?
            .send(WireMsg::Tensor(tensor))
            .map_err(|_| CommError::Disconnected { peer })
    }

    /// Asynchronous tensor send; the returned handle resolves when the
    /// payload is on the link.
    pub fn send_async(&self, tensor: Tensor, peer: usize) -> P2pHandle {
        P2pHandle::ready(self.send(tensor, peer).map(|_| None))
    }

    /// Synchronous receive of a tensor matching `expect`.
    pub async fn recv(&self, expect: &TensorMeta, peer: usize) -> Result<Tensor, CommError> {
        let rx = self.receiver(peer)?;
        recv_validated(rx, expect.clone(), peer).await
    }

    /// Asynchronous receive; the handle resolves to the validated tensor.
    pub fn recv_async(&self, expect: &TensorMeta, peer: usize) -> P2pHandle {
        let rx = match self.receiver(peer) {
            Ok(rx) => rx,
            Err(e) => return P2pHandle::ready(Err(e)),
        };
        let expect = expect.clone();
        let (tx, hrx) = oneshot::channel();
        tokio::spawn(async move {
            let r = recv_validated(rx, expect, peer).await.map(Some);
            let _ = tx.send(r);
        });
        P2pHandle { rx: hrx }
    }

    /// Send a per-micro-batch control scalar (the generation terminate flag).
    pub fn send_flag(&self, flag: bool, peer: usize) -> Result<(), CommError> {
        self.sender(peer)?
            .send(WireMsg::Flag(flag))
            .map_err(|_| CommError::Disconnected { peer })
    }

    pub async fn recv_flag(&self, peer: usize) -> Result<bool, CommError> {
        let rx = self.receiver(peer)?;
        let msg = next_msg(rx, peer).await?;
        match msg {
            WireMsg::Flag(f) => Ok(f),
            other => Err(CommError::UnexpectedMessage {
                expected: "flag",
                got: other.kind(),
            }),
        }
    }

    fn send_check(&self, value: i32, peer: usize) -> Result<(), CommError> {
        self.sender(peer)?
            .send(WireMsg::Check(value))
            .map_err(|_| CommError::Disconnected { peer })
    }

    async fn recv_check(&self, peer: usize) -> Result<i32, CommError> {
        let rx = self.receiver(peer)?;
        let msg = next_msg(rx, peer).await?;
        match msg {
            WireMsg::Check(v) => Ok(v),
            other => Err(CommError::UnexpectedMessage {
                expected: "check",
                got: other.kind(),
            }),
        }
    }
}

async fn next_msg(rx: WireRx, peer: usize) -> Result<WireMsg, CommError> {
    let mut guard = rx.lock().await;
    guard
        .recv()
        .await
        .ok_or(CommError::Disconnected { peer })
}

async fn recv_validated(
    rx: WireRx,
    expect: TensorMeta,
    peer: usize,
) -> Result<Tensor, CommError> {
    let msg = next_msg(rx, peer).await?;
    let tensor = match msg {
        WireMsg::Tensor(t) => t,
        other => {
            return Err(CommError::UnexpectedMessage {
                expected: "tensor",
                got: other.kind(),
            })
        }
    };
    if tensor.shape() != expect.shape.as_slice() {
        return Err(CommError::ShapeMismatch {
            peer,
            expected: expect.shape,
            got: tensor.shape().to_vec(),
        });
    }
    if tensor.dtype() != expect.dtype {
        return Err(CommError::DtypeMismatch {
            peer,
            expected: expect.dtype.name(),
            got: tensor.dtype().name(),
        });
    }
    Ok(tensor)
}

/// Boot-time connectivity check over the pipeline ring: even and odd stages
/// exchange a dummy integer with both neighbors, and the first/last stages
/// close the ring. Must run on every stage before any real traffic.
pub async fn check_pipeline_ring(
    p2p: &P2p,
    stage_id: usize,
    num_stages: usize,
    prev_stage_rank: usize,
    next_stage_rank: usize,
) -> Result<(), CommError> {
    let is_first = stage_id == 0;
    let is_last = stage_id == num_stages - 1;
    let probe = stage_id as i32;

    let fail = |reason: String| CommError::RingCheckFailed {
        rank: p2p.rank(),
        reason,
    };

    if stage_id % 2 == 0 {
        if !is_last {
            p2p.send_check(probe, next_stage_rank)?;
        }
        if !is_first {
            p2p.recv_check(prev_stage_rank)
                .await
                .map_err(|e| fail(format!("recv from prev: {e}")))?;
        }
    } else {
        if !is_first {
            p2p.recv_check(prev_stage_rank)
                .await
                .map_err(|e| fail(format!("recv from prev: {e}")))?;
        }
        if !is_last {
            p2p.send_check(probe, next_stage_rank)?;
        }
    }

    // Close the ring: last sends to its ring successor, first receives from
    // its ring predecessor.
    if is_last {
        p2p.send_check(probe, next_stage_rank)?;
    }
    if is_first {
        p2p.recv_check(prev_stage_rank)
            .await
            .map_err(|e| fail(format!("ring close: {e}")))?;
    }

    debug!(rank = p2p.rank(), stage_id, "pipeline ring check passed");
    Ok(())
}

/// Reduction operator for collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone)]
enum GroupMsg {
    Floats(Vec<f32>),
    Tensor(Tensor),
}

/// A static process group over a fixed set of global ranks, supporting
/// broadcast and all-reduce. Members must issue collectives in the same
/// order; calls are matched positionally, like rank-structured collectives.
pub struct ProcessGroup {
    ranks: Vec<usize>,
    me: usize,
    to_coord: mpsc::UnboundedSender<(usize, GroupMsg)>,
    from_members: Option<Arc<Mutex<mpsc::UnboundedReceiver<(usize, GroupMsg)>>>>,
    fanout_tx: broadcast::Sender<(usize, GroupMsg)>,
    fanout_rx: broadcast::Receiver<(usize, GroupMsg)>,
}

impl ProcessGroup {
    /// Build one endpoint per member, in rank order. `ranks` must be sorted
    /// and non-empty; the lowest rank coordinates reductions.
    pub fn create(ranks: &[usize]) -> Vec<ProcessGroup> {
        let (to_coord, from_members) = mpsc::unbounded_channel();
        let from_members = Arc::new(Mutex::new(from_members));
        let (fanout_tx, _) = broadcast::channel(1024);
        ranks
            .iter()
            .enumerate()
            .map(|(i, &r)| ProcessGroup {
                ranks: ranks.to_vec(),
                me: r,
                to_coord: to_coord.clone(),
                from_members: (i == 0).then(|| from_members.clone()),
                fanout_rx: fanout_tx.subscribe(),
                fanout_tx: fanout_tx.clone(),
            })
            .collect()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn rank(&self) -> usize {
        self.me
    }

    fn coordinator(&self) -> usize {
        self.ranks[0]
    }

    async fn fanout_recv(&mut self, root: usize) -> Result<GroupMsg, CommError> {
        loop {
            match self.fanout_rx.recv().await {
                Ok((src, msg)) if src == root => return Ok(msg),
                Ok(_) => continue,
                Err(_) => {
                    return Err(CommError::Disconnected { peer: root });
                }
            }
        }
    }

    /// Broadcast a tensor from `root` to every member. The root passes
    /// `Some(tensor)`, everyone else `None`; all members receive the value.
    pub async fn broadcast(
        &mut self,
        root: usize,
        tensor: Option<Tensor>,
    ) -> Result<Tensor, CommError> {
        if !self.ranks.contains(&root) {
            return Err(CommError::NotInGroup { rank: root });
        }
        if self.size() == 1 {
            return tensor.ok_or(CommError::NotInGroup { rank: self.me });
        }
        if self.me == root {
            let t = tensor.ok_or(CommError::NotInGroup { rank: root })?;
            self.fanout_tx
                .send((root, GroupMsg::Tensor(t.clone())))
                .map_err(|_| CommError::Disconnected { peer: root })?;
            // consume our own fan-out copy to stay in lockstep
            self.fanout_recv(root).await?;
            Ok(t)
        } else {
            match self.fanout_recv(root).await? {
                GroupMsg::Tensor(t) => Ok(t),
                GroupMsg::Floats(_) => Err(CommError::UnexpectedMessage {
                    expected: "tensor",
                    got: "floats",
                }),
            }
        }
    }

    /// All-reduce a float vector across the group. Every member receives the
    /// reduced result.
    pub async fn all_reduce(
        &mut self,
        contribution: Vec<f32>,
        op: ReduceOp,
    ) -> Result<Vec<f32>, CommError> {
        if self.size() == 1 {
            return Ok(contribution);
        }
        let coord = self.coordinator();
        if self.me == coord {
            let mut acc = contribution;
            let from = self
                .from_members
                .as_ref()
                .ok_or(CommError::NotInGroup { rank: self.me })?
                .clone();
            {
                let mut rx = from.lock().await;
                for _ in 0..self.size() - 1 {
                    let (_, msg) = rx
                        .recv()
                        .await
                        .ok_or(CommError::Disconnected { peer: coord })?;
                    let v = match msg {
                        GroupMsg::Floats(v) => v,
                        GroupMsg::Tensor(_) => {
                            return Err(CommError::UnexpectedMessage {
                                expected: "floats",
                                got: "tensor",
                            })
                        }
                    };
                    for (a, b) in acc.iter_mut().zip(v) {
                        *a = match op {
                            ReduceOp::Sum => *a + b,
                            ReduceOp::Min => a.min(b),
                            ReduceOp::Max => a.max(b),
                        };
                    }
                }
            }
            self.fanout_tx
                .send((coord, GroupMsg::Floats(acc.clone())))
                .map_err(|_| CommError::Disconnected { peer: coord })?;
            self.fanout_recv(coord).await?;
            Ok(acc)
        } else {
            self.to_coord
                .send((self.me, GroupMsg::Floats(contribution)))
                .map_err(|_| CommError::Disconnected { peer: coord })?;
            match self.fanout_recv(coord).await? {
                GroupMsg::Floats(v) => Ok(v),
                GroupMsg::Tensor(_) => Err(CommError::UnexpectedMessage {
                    expected: "floats",
                    got: "tensor",
                }),
            }
        }
    }

    /// Block until every member has arrived.
    pub async fn barrier(&mut self) -> Result<(), CommError> {
        self.all_reduce(vec![0.0], ReduceOp::Sum).await.map(|_| ())
    }
}

/// The full in-process mesh: one [`P2p`] endpoint per worker with a dedicated
/// link for every ordered pair. Construction mirrors wiring up duplex pairs
/// between stage processes.
pub struct CommWorld;

impl CommWorld {
    pub fn endpoints(n: usize) -> Vec<P2p> {
        let mut txs: Vec<HashMap<usize, WireTx>> = (0..n).map(|_| HashMap::new()).collect();
        let mut rxs: Vec<HashMap<usize, WireRx>> = (0..n).map(|_| HashMap::new()).collect();
        for src in 0..n {
            for dst in 0..n {
                if src == dst {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                txs[src].insert(dst, tx);
                rxs[dst].insert(src, Arc::new(Mutex::new(rx)));
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (senders, receivers))| P2p {
                rank,
                senders,
                receivers,
            })
            .collect()
    }
}
