//! Producer state machine: parallel fill, ordered broadcast.
//!
//! Up to `max_concurrency` fill tasks run concurrently. Each task rents a
//! block, claims the next sequence number with an atomic fetch-and-increment,
//! and has the worker fill it. Completed blocks are merged back into strict
//! sequence order through a min-heap guarded by a single mutex; the heap is
//! drained and broadcast inside the same critical section, so the broadcast
//! order is exactly 0,1,2,... regardless of fill completion order. The mutex
//! is never held across an await: the consumer channels are unbounded, so
//! handing a block over is a non-blocking `try_send`.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::{debug, info};

use crate::buffer::{Block, BufferPool};
use crate::error::{EngineError, Result};
use crate::worker::Producer;

use super::{MachineCore, StreamProgress};

/// Heap entry ordered by sequence number, lowest first.
struct PendingBlock(Arc<Block>);

impl PendingBlock {
    fn sequence(&self) -> u64 {
        self.0.sequence()
    }
}

impl PartialEq for PendingBlock {
    fn eq(&self, other: &Self) -> bool {
        self.sequence() == other.sequence()
    }
}

impl Eq for PendingBlock {}

impl PartialOrd for PendingBlock {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingBlock {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the lowest sequence first.
        other.sequence().cmp(&self.sequence())
    }
}

/// Reorder merge state, guarded by a single mutex.
struct ReorderState {
    pending: BinaryHeap<PendingBlock>,
    /// Next sequence number to broadcast.
    drain_seq: u64,
    /// Data length of the most recently broadcast block. Once a short block
    /// has gone out, no later block may carry more data.
    last_len: usize,
}

pub(crate) struct ProducerMachine {
    core: Arc<MachineCore>,
    worker: Arc<dyn Producer>,
    pool: Arc<BufferPool>,
    outputs: Vec<async_channel::Sender<Arc<Block>>>,
    reorder: Mutex<ReorderState>,
    next_seq: AtomicU64,
    progress: Arc<StreamProgress>,
}

impl ProducerMachine {
    pub fn new(
        core: Arc<MachineCore>,
        worker: Arc<dyn Producer>,
        pool: Arc<BufferPool>,
        outputs: Vec<async_channel::Sender<Arc<Block>>>,
        progress: Arc<StreamProgress>,
    ) -> Arc<Self> {
        let last_len = pool.block_size();
        Arc::new(Self {
            core,
            worker,
            pool,
            outputs,
            reorder: Mutex::new(ReorderState {
                pending: BinaryHeap::new(),
                drain_seq: 0,
                last_len,
            }),
            next_seq: AtomicU64::new(0),
            progress,
        })
    }

    pub fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }

    pub fn worker(&self) -> &Arc<dyn Producer> {
        &self.worker
    }

    /// Run the fill tasks to completion, then shut the stream down:
    /// signal EOS by closing every consumer channel and return any blocks
    /// still queued in the reorder heap to the pool.
    pub async fn body(self: Arc<Self>) {
        let concurrency = self.worker.max_concurrency().max(1);
        info!(
            machine = %self.core.label(),
            concurrency,
            "producer starting"
        );

        let tasks: Vec<_> = (0..concurrency)
            .map(|task_id| {
                let machine = self.clone();
                tokio::spawn(machine.fill_task(task_id))
            })
            .collect();

        for joined in join_all(tasks).await {
            if let Err(join_err) = joined {
                self.core.record(EngineError::invariant(format!(
                    "fill task panicked: {join_err}"
                )));
            }
        }

        for tx in &self.outputs {
            tx.close();
        }

        let leftovers = {
            let mut state = self.reorder.lock().expect("reorder lock poisoned");
            std::mem::take(&mut state.pending)
        };
        for pending in leftovers {
            if let Err(e) = self.pool.release(pending.0) {
                self.core.record(e);
            }
        }

        info!(
            machine = %self.core.label(),
            blocks = self.progress.blocks(),
            bytes = self.progress.bytes(),
            "producer finished"
        );
    }

    async fn fill_task(self: Arc<Self>, task_id: usize) {
        loop {
            let block = match self.pool.rent(self.core.cancel_token()).await {
                Ok(block) => block,
                Err(e) => {
                    self.core.record(e);
                    break;
                }
            };

            let sequence = self.next_seq.fetch_add(1, Ordering::Relaxed);
            block.set_sequence(sequence);

            match self.worker.fill(&block).await {
                Ok(0) => {
                    debug!(
                        machine = %self.core.label(),
                        task_id,
                        sequence,
                        "end of stream"
                    );
                    if let Err(e) = self.pool.release(block) {
                        self.core.record(e);
                    }
                    break;
                }
                Ok(written) if written > block.capacity() => {
                    let capacity = block.capacity();
                    if let Err(e) = self.pool.release(block) {
                        self.core.record(e);
                    }
                    self.core.record(EngineError::invariant(format!(
                        "fill returned {written} bytes for a {capacity}-byte block"
                    )));
                    break;
                }
                Ok(written) => {
                    block.set_len(written);
                    debug!(
                        machine = %self.core.label(),
                        task_id,
                        sequence,
                        len = written,
                        "block filled"
                    );
                    if let Err(e) = self.merge(block) {
                        self.core.record(e);
                        break;
                    }
                }
                Err(e) => {
                    if let Err(release_err) = self.pool.release(block) {
                        self.core.record(release_err);
                    }
                    self.core
                        .record(EngineError::worker(self.worker.name(), e));
                    break;
                }
            }
        }
    }

    /// Insert a filled block into the reorder heap and broadcast every block
    /// that is now in sequence. Runs entirely inside the reorder critical
    /// section; block releases are deferred until the lock is dropped.
    fn merge(&self, block: Arc<Block>) -> Result<()> {
        let fanout = self.outputs.len();
        let mut to_release: Vec<Arc<Block>> = Vec::new();
        let mut result = Ok(());

        {
            let mut state = self.reorder.lock().expect("reorder lock poisoned");
            state.pending.push(PendingBlock(block));

            while state
                .pending
                .peek()
                .is_some_and(|p| p.sequence() == state.drain_seq)
            {
                let ready = match state.pending.pop() {
                    Some(pending) => pending.0,
                    None => break,
                };

                if ready.len() > state.last_len {
                    result = Err(EngineError::invariant(format!(
                        "block {} carries {} bytes after a short block of {}",
                        ready.sequence(),
                        ready.len(),
                        state.last_len
                    )));
                    to_release.push(ready);
                    break;
                }

                if self.core.cancel_token().is_cancelled() {
                    result = Err(EngineError::Cancelled);
                    to_release.push(ready);
                    break;
                }

                state.last_len = ready.len();
                state.drain_seq += 1;
                self.progress.add_block(ready.len());

                if let Err(e) = ready.share(fanout) {
                    result = Err(e);
                    to_release.push(ready);
                    break;
                }
                for tx in &self.outputs {
                    // A closed channel means that consumer has already shut
                    // down; its share goes straight back to the pool.
                    if tx.try_send(ready.clone()).is_err() {
                        to_release.push(ready.clone());
                    }
                }
            }
        }

        for block in to_release {
            if let Err(e) = self.pool.release(block) {
                self.core.record(e);
            }
        }
        result
    }
}
