//! Communication fabric: collective reduction within a TP group and tagged
//! point-to-point activation hand-off between adjacent pipeline stages.
//!
//! Two implementations are provided. [`LocalFabric`] is the single-rank
//! identity fabric. [`ThreadFabric`] connects ranks running as threads in one
//! process through channels and a shared reduction buffer; it is the backend
//! for multi-rank tests and CPU SPMD runs.
//!
//! The point-to-point wire contract sends the sequence identifier first as a
//! small control message, then the payload, so the receiving stage can
//! correlate (or create) the right sequence group before touching activation
//! data. Messages between a fixed (source, destination) pair are ordered.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

use candle_core::{DType, Device, Tensor};

use super::error::{DistributedError, Result};
use super::process_group::{ParallelConfig, RankCoords};
use crate::sequence::SequenceId;

/// Device-to-device communication for one rank.
///
/// All calls are blocking. `reduce_add` is a collective over the TP group
/// sharing this rank's stage: every participant must call it with the same
/// element count, in the same order relative to its other collective calls.
pub trait CommFabric: Send + Sync {
    /// Size of this rank's tensor-parallel group.
    fn size(&self) -> usize;

    /// This rank's position within its tensor-parallel group.
    fn rank(&self) -> usize;

    /// Pipeline stage index ("color") of this rank.
    fn color(&self) -> usize;

    /// Number of pipeline stages.
    fn stages(&self) -> usize;

    /// Whether this is the coordinating rank (tp 0 of stage 0).
    fn is_master(&self) -> bool {
        self.rank() == 0 && self.color() == 0
    }

    /// Element-wise sum across the TP group; result visible on all ranks.
    ///
    /// Identity when the group size is 1.
    fn reduce_add(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Send an activation tensor to the same TP slot of `dst_stage`, tagged
    /// with the sequence identifier.
    fn send_activation(&self, dst_stage: usize, sequence_id: SequenceId, data: &Tensor)
        -> Result<()>;

    /// Receive the next activation from the same TP slot of `src_stage`.
    ///
    /// Completes only when a matching send has been issued; returns the
    /// sequence identifier it was tagged with. `expected_shape` is what the
    /// receiver posted for; a differently shaped payload is an error.
    fn recv_activation(
        &self,
        src_stage: usize,
        expected_shape: &[usize],
    ) -> Result<(SequenceId, Tensor)>;
}

/// Single-rank fabric: reduction is identity, there are no stage peers.
#[derive(Debug, Default)]
pub struct LocalFabric;

impl LocalFabric {
    pub fn new() -> Self {
        Self
    }
}

impl CommFabric for LocalFabric {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn color(&self) -> usize {
        0
    }

    fn stages(&self) -> usize {
        1
    }

    fn reduce_add(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn send_activation(&self, dst_stage: usize, _id: SequenceId, _data: &Tensor) -> Result<()> {
        Err(DistributedError::NoPeer { stage: dst_stage })
    }

    fn recv_activation(&self, src_stage: usize, _shape: &[usize]) -> Result<(SequenceId, Tensor)> {
        Err(DistributedError::NoPeer { stage: src_stage })
    }
}

/// Wire message for the in-process point-to-point channel.
///
/// The control frame always precedes its payload frame.
enum Frame {
    Control { sequence_id: SequenceId },
    Payload { shape: Vec<usize>, data: Vec<f32> },
}

/// Shared accumulator backing one TP group's `reduce_add`.
struct ReduceState {
    acc: Vec<f32>,
    arrived: usize,
    departed: usize,
    generation: u64,
    result: Vec<f32>,
    /// A mismatched contribution poisons the group: every participant of
    /// the round errors out instead of waiting on a sum that cannot
    /// complete.
    failed: bool,
}

struct ReduceGroup {
    size: usize,
    state: Mutex<ReduceState>,
    cv: Condvar,
}

impl ReduceGroup {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(ReduceState {
                acc: Vec::new(),
                arrived: 0,
                departed: 0,
                generation: 0,
                result: Vec::new(),
                failed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn reduce(&self, contribution: &[f32]) -> Result<Vec<f32>> {
        let mut st = self.state.lock().expect("reduce group poisoned");

        // Wait until the previous round has fully drained before joining.
        while st.arrived == self.size && !st.failed {
            st = self.cv.wait(st).expect("reduce group poisoned");
        }
        if st.failed {
            return Err(DistributedError::Disconnected);
        }

        if st.arrived == 0 {
            st.acc = contribution.to_vec();
        } else {
            if st.acc.len() != contribution.len() {
                st.failed = true;
                self.cv.notify_all();
                return Err(DistributedError::ElementCountMismatch {
                    expected: st.acc.len(),
                    actual: contribution.len(),
                });
            }
            for (a, c) in st.acc.iter_mut().zip(contribution) {
                *a += c;
            }
        }
        st.arrived += 1;

        let my_generation = st.generation;
        if st.arrived == self.size {
            st.result = std::mem::take(&mut st.acc);
            st.generation += 1;
            self.cv.notify_all();
        } else {
            while st.generation == my_generation {
                if st.failed {
                    return Err(DistributedError::Disconnected);
                }
                st = self.cv.wait(st).expect("reduce group poisoned");
            }
        }

        let out = st.result.clone();
        st.departed += 1;
        if st.departed == self.size {
            st.arrived = 0;
            st.departed = 0;
            self.cv.notify_all();
        }
        Ok(out)
    }
}

/// In-process fabric endpoint for one rank.
///
/// Built in a full set by [`ThreadFabric::connect`]; each endpoint is moved
/// into the thread that plays its rank.
pub struct ThreadFabric {
    coords: RankCoords,
    config: ParallelConfig,
    reduce: Arc<ReduceGroup>,
    senders: HashMap<usize, Sender<Frame>>,
    receivers: HashMap<usize, Mutex<Receiver<Frame>>>,
    device: Device,
}

impl ThreadFabric {
    /// Wire up a full world of endpoints, one per rank, indexed by world rank.
    ///
    /// Point-to-point channels exist between every pair of adjacent-stage
    /// peers sharing a TP slot; each stage shares one reduction group.
    pub fn connect(config: ParallelConfig) -> Vec<ThreadFabric> {
        let tp = config.tensor_parallel_size;
        let pp = config.pipeline_parallel_size;

        let groups: Vec<Arc<ReduceGroup>> =
            (0..pp).map(|_| Arc::new(ReduceGroup::new(tp))).collect();

        // channels[(src, dst)] between adjacent stages, same TP slot.
        let mut sends: Vec<HashMap<usize, Sender<Frame>>> =
            (0..config.world_size()).map(|_| HashMap::new()).collect();
        let mut recvs: Vec<HashMap<usize, Mutex<Receiver<Frame>>>> =
            (0..config.world_size()).map(|_| HashMap::new()).collect();

        for stage in 0..pp.saturating_sub(1) {
            for slot in 0..tp {
                let src = stage * tp + slot;
                let dst = (stage + 1) * tp + slot;
                let (tx, rx) = channel();
                sends[src].insert(dst, tx);
                recvs[dst].insert(src, Mutex::new(rx));
            }
        }

        let mut out = Vec::with_capacity(config.world_size());
        for world in 0..config.world_size() {
            let coords = RankCoords::from_world(world, config);
            out.push(ThreadFabric {
                coords,
                config,
                reduce: Arc::clone(&groups[coords.pp_rank]),
                senders: std::mem::take(&mut sends[world]),
                receivers: std::mem::take(&mut recvs[world]),
                device: Device::Cpu,
            });
        }
        out
    }
}

impl CommFabric for ThreadFabric {
    fn size(&self) -> usize {
        self.config.tensor_parallel_size
    }

    fn rank(&self) -> usize {
        self.coords.tp_rank
    }

    fn color(&self) -> usize {
        self.coords.pp_rank
    }

    fn stages(&self) -> usize {
        self.config.pipeline_parallel_size
    }

    fn reduce_add(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.size() == 1 {
            return Ok(tensor.clone());
        }
        let shape = tensor.dims().to_vec();
        let flat = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let summed = self.reduce.reduce(&flat)?;
        let out = Tensor::from_vec(summed, shape.as_slice(), &self.device)?;
        Ok(out.to_dtype(tensor.dtype())?)
    }

    fn send_activation(
        &self,
        dst_stage: usize,
        sequence_id: SequenceId,
        data: &Tensor,
    ) -> Result<()> {
        let dst = self.coords.peer_in_stage(dst_stage, self.config);
        let tx = self
            .senders
            .get(&dst)
            .ok_or(DistributedError::NoPeer { stage: dst_stage })?;
        let shape = data.dims().to_vec();
        let flat = data.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        tx.send(Frame::Control { sequence_id })
            .map_err(|_| DistributedError::Disconnected)?;
        tx.send(Frame::Payload { shape, data: flat })
            .map_err(|_| DistributedError::Disconnected)?;
        Ok(())
    }

    fn recv_activation(
        &self,
        src_stage: usize,
        expected_shape: &[usize],
    ) -> Result<(SequenceId, Tensor)> {
        let src = self.coords.peer_in_stage(src_stage, self.config);
        let rx = self
            .receivers
            .get(&src)
            .ok_or(DistributedError::NoPeer { stage: src_stage })?;
        let rx = rx.lock().expect("receiver poisoned");

        let sequence_id = match rx.recv().map_err(|_| DistributedError::Disconnected)? {
            Frame::Control { sequence_id } => sequence_id,
            Frame::Payload { .. } => {
                return Err(DistributedError::Protocol(
                    "payload frame before control frame".into(),
                ))
            }
        };
        let (shape, data) = match rx.recv().map_err(|_| DistributedError::Disconnected)? {
            Frame::Payload { shape, data } => (shape, data),
            Frame::Control { .. } => {
                return Err(DistributedError::Protocol(
                    "control frame where payload was expected".into(),
                ))
            }
        };
        if shape != expected_shape {
            return Err(DistributedError::ShapeMismatch {
                expected: expected_shape.to_vec(),
                actual: shape,
            });
        }
        let tensor = Tensor::from_vec(data, shape.as_slice(), &self.device)?;
        Ok((sequence_id, tensor))
    }
}
