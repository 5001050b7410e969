//! Admission scheduling for pipeline-parallel decode.
//!
//! Each stage runs one compute loop pulling from a bounded ready queue.
//! On stage 0, inbound submissions are admitted when the queue has room; on
//! later stages a sequence group becomes ready the moment its activation
//! lands from the previous stage. The compute loop blocks on the queue
//! instead of spinning, and a shared cancellation token unblocks it for
//! shutdown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use candle_core::Tensor;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::sequence::{SequenceGroupMeta, SequenceId, SequenceStatus};

/// Cooperative shutdown flag shared between the compute loop and whoever
/// owns the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded FIFO of sequence groups ready to run on this stage.
struct ReadyQueue {
    queue: Mutex<VecDeque<SequenceId>>,
    cv: Condvar,
    capacity: usize,
}

impl ReadyQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("ready queue poisoned").len()
    }

    fn has_room(&self) -> bool {
        self.len() < self.capacity
    }

    fn push(&self, id: SequenceId) -> Result<()> {
        let mut q = self.queue.lock().expect("ready queue poisoned");
        if q.len() >= self.capacity {
            return Err(EngineError::QueueFull {
                capacity: self.capacity,
            });
        }
        q.push_back(id);
        self.cv.notify_one();
        Ok(())
    }

    /// Block until an entry is available or the token is cancelled.
    ///
    /// The wait is timed so a cancellation that races with the last notify is
    /// still observed promptly.
    fn pop_blocking(&self, cancel: &CancelToken) -> Result<SequenceId> {
        let mut q = self.queue.lock().expect("ready queue poisoned");
        loop {
            if let Some(id) = q.pop_front() {
                self.cv.notify_one();
                return Ok(id);
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(q, Duration::from_millis(50))
                .expect("ready queue poisoned");
            q = guard;
        }
    }
}

/// Registry of live sequence groups plus the stage's admission queues.
pub struct SequenceScheduler {
    pool: Mutex<HashMap<SequenceId, SequenceGroupMeta>>,
    inbound: Mutex<VecDeque<SequenceId>>,
    ready: ReadyQueue,
}

impl SequenceScheduler {
    pub fn new(ready_capacity: usize) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            inbound: Mutex::new(VecDeque::new()),
            ready: ReadyQueue::new(ready_capacity),
        }
    }

    pub fn live_count(&self) -> usize {
        self.pool.lock().expect("sequence pool poisoned").len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Register a new sequence group on the first stage. It waits in the
    /// inbound queue until `admit_local` moves it forward.
    pub fn submit(&self, meta: SequenceGroupMeta) {
        let id = meta.sequence_id;
        debug!(sequence_id = id, "sequence group submitted");
        self.pool
            .lock()
            .expect("sequence pool poisoned")
            .insert(id, meta);
        self.inbound
            .lock()
            .expect("inbound queue poisoned")
            .push_back(id);
    }

    /// Move at most one inbound group into the ready queue, respecting its
    /// capacity. Returns whether anything was admitted.
    pub fn admit_local(&self) -> Result<bool> {
        if !self.ready.has_room() {
            return Ok(false);
        }
        let id = {
            let mut inbound = self.inbound.lock().expect("inbound queue poisoned");
            match inbound.pop_front() {
                Some(id) => id,
                None => return Ok(false),
            }
        };
        self.set_status(id, SequenceStatus::Admitted)?;
        self.ready.push(id)?;
        self.set_status(id, SequenceStatus::Ready)?;
        debug!(sequence_id = id, "sequence group admitted");
        Ok(true)
    }

    /// Register (or update) a group whose activation just arrived from the
    /// previous stage, and mark it ready.
    pub fn admit_remote(
        &self,
        id: SequenceId,
        input_seq_len: usize,
        past_seq_len: usize,
        slot: usize,
        activation: Tensor,
    ) -> Result<()> {
        {
            let mut pool = self.pool.lock().expect("sequence pool poisoned");
            let meta = pool
                .entry(id)
                .or_insert_with(|| SequenceGroupMeta::new(id, Vec::new(), slot));
            meta.input_seq_len = input_seq_len;
            meta.past_seq_len = past_seq_len;
            meta.activation = Some(activation);
            meta.status = SequenceStatus::Admitted;
        }
        self.ready.push(id)?;
        self.set_status(id, SequenceStatus::Ready)?;
        Ok(())
    }

    /// Block until a ready group is available, then mark it running and
    /// return its bookkeeping. Fails with `Cancelled` on shutdown.
    pub fn next_running(&self, cancel: &CancelToken) -> Result<SequenceGroupMeta> {
        let id = self.ready.pop_blocking(cancel)?;
        self.set_status(id, SequenceStatus::Running)?;
        let pool = self.pool.lock().expect("sequence pool poisoned");
        pool.get(&id)
            .cloned()
            .ok_or(EngineError::UnknownSequence(id))
    }

    /// Write back post-step bookkeeping for a still-live group.
    pub fn update(&self, meta: SequenceGroupMeta) -> Result<()> {
        let mut pool = self.pool.lock().expect("sequence pool poisoned");
        match pool.get_mut(&meta.sequence_id) {
            Some(slot) => {
                *slot = meta;
                Ok(())
            }
            None => Err(EngineError::UnknownSequence(meta.sequence_id)),
        }
    }

    /// Retire a finished group from the registry.
    pub fn complete(&self, id: SequenceId) -> Result<()> {
        let mut pool = self.pool.lock().expect("sequence pool poisoned");
        match pool.remove(&id) {
            Some(_) => {
                debug!(sequence_id = id, "sequence group completed");
                Ok(())
            }
            None => Err(EngineError::UnknownSequence(id)),
        }
    }

    fn set_status(&self, id: SequenceId, status: SequenceStatus) -> Result<()> {
        let mut pool = self.pool.lock().expect("sequence pool poisoned");
        match pool.get_mut(&id) {
            Some(meta) => {
                meta.status = status;
                Ok(())
            }
            None => Err(EngineError::UnknownSequence(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn meta(id: SequenceId) -> SequenceGroupMeta {
        SequenceGroupMeta::new(id, vec![1, 2, 3], id as usize)
    }

    #[test]
    fn admission_respects_capacity() {
        let sched = SequenceScheduler::new(2);
        for id in 0..3 {
            sched.submit(meta(id));
        }

        assert!(sched.admit_local().unwrap());
        assert!(sched.admit_local().unwrap());
        // Queue is at capacity; the third stays inbound.
        assert!(!sched.admit_local().unwrap());
        assert_eq!(sched.ready_count(), 2);

        // Draining one opens a slot.
        let cancel = CancelToken::new();
        let running = sched.next_running(&cancel).unwrap();
        assert_eq!(running.sequence_id, 0);
        assert_eq!(running.status, SequenceStatus::Running);
        assert!(sched.admit_local().unwrap());
    }

    #[test]
    fn ready_order_is_fifo() {
        let sched = SequenceScheduler::new(8);
        for id in 0..4 {
            sched.submit(meta(id));
            sched.admit_local().unwrap();
        }
        let cancel = CancelToken::new();
        for expected in 0..4 {
            assert_eq!(sched.next_running(&cancel).unwrap().sequence_id, expected);
        }
    }

    #[test]
    fn blocked_wait_wakes_on_late_admission() {
        let sched = Arc::new(SequenceScheduler::new(4));
        let cancel = CancelToken::new();

        let waiter = {
            let sched = Arc::clone(&sched);
            let cancel = cancel.clone();
            thread::spawn(move || sched.next_running(&cancel))
        };

        thread::sleep(Duration::from_millis(20));
        sched.submit(meta(9));
        sched.admit_local().unwrap();

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got.sequence_id, 9);
    }

    #[test]
    fn cancellation_unblocks_empty_wait() {
        let sched = Arc::new(SequenceScheduler::new(4));
        let cancel = CancelToken::new();

        let waiter = {
            let sched = Arc::clone(&sched);
            let cancel = cancel.clone();
            thread::spawn(move || sched.next_running(&cancel))
        };

        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn remote_admission_creates_and_readies_group() {
        let sched = SequenceScheduler::new(4);
        let act = Tensor::zeros((1, 4), candle_core::DType::F32, &candle_core::Device::Cpu)
            .unwrap();
        sched.admit_remote(7, 1, 3, 0, act).unwrap();

        let cancel = CancelToken::new();
        let got = sched.next_running(&cancel).unwrap();
        assert_eq!(got.sequence_id, 7);
        assert_eq!(got.past_seq_len, 3);
        assert!(got.activation.is_some());

        sched.complete(7).unwrap();
        assert_eq!(sched.live_count(), 0);
        assert!(matches!(
            sched.complete(7),
            Err(EngineError::UnknownSequence(7))
        ));
    }
}
