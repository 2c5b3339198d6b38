//! Consumer state machine: ordered receive, parallel drain.
//!
//! The machine receives the broadcast block stream over an unbounded
//! single-writer channel and dispatches up to `max_concurrency` drain tasks
//! of the consumer worker. With one task the drain order is the strict
//! broadcast order; with more, drains may overlap and the worker recovers
//! the absolute position from each block's sequence number. Channel closure
//! is the clean end-of-stream signal; data blocks always carry at least one
//! valid byte.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use crate::buffer::{Block, BufferPool};
use crate::error::EngineError;
use crate::worker::Consumer;

use super::MachineCore;

pub(crate) struct ConsumerMachine {
    core: Arc<MachineCore>,
    worker: Arc<dyn Consumer>,
    pool: Arc<BufferPool>,
    input: async_channel::Receiver<Arc<Block>>,
}

impl ConsumerMachine {
    pub fn new(
        core: Arc<MachineCore>,
        worker: Arc<dyn Consumer>,
        pool: Arc<BufferPool>,
        input: async_channel::Receiver<Arc<Block>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            worker,
            pool,
            input,
        })
    }

    pub fn core(&self) -> &Arc<MachineCore> {
        &self.core
    }

    pub fn worker(&self) -> &Arc<dyn Consumer> {
        &self.worker
    }

    /// Run the drain tasks to completion, then drain the channel to the end
    /// so every remaining block goes back to the pool. The trailing drain
    /// ignores cancellation: the producer closes the channel on every exit
    /// path, and no block may be stranded.
    pub async fn body(self: Arc<Self>) {
        let concurrency = self.worker.max_concurrency().max(1);
        info!(
            machine = %self.core.label(),
            concurrency,
            "consumer starting"
        );

        let tasks: Vec<_> = (0..concurrency)
            .map(|task_id| {
                let machine = self.clone();
                tokio::spawn(machine.drain_task(task_id))
            })
            .collect();

        for joined in join_all(tasks).await {
            if let Err(join_err) = joined {
                self.core.record(EngineError::invariant(format!(
                    "drain task panicked: {join_err}"
                )));
            }
        }

        while let Ok(block) = self.input.recv().await {
            if let Err(e) = self.pool.release(block) {
                self.core.record(e);
            }
        }

        info!(machine = %self.core.label(), "consumer finished");
    }

    async fn drain_task(self: Arc<Self>, task_id: usize) {
        loop {
            let block = tokio::select! {
                _ = self.core.cancel_token().cancelled() => {
                    self.core.record(EngineError::Cancelled);
                    break;
                }
                received = self.input.recv() => match received {
                    Ok(block) => block,
                    // Channel closed: clean end of stream.
                    Err(_) => break,
                },
            };

            if block.is_empty() {
                let sequence = block.sequence();
                if let Err(e) = self.pool.release(block) {
                    self.core.record(e);
                }
                self.core.record(EngineError::invariant(format!(
                    "received block {sequence} with no data"
                )));
                break;
            }

            debug!(
                machine = %self.core.label(),
                task_id,
                sequence = block.sequence(),
                len = block.len(),
                "draining block"
            );

            let drained = self.worker.drain(&block).await;
            if let Err(e) = self.pool.release(block) {
                self.core.record(e);
                break;
            }
            if let Err(e) = drained {
                self.core
                    .record(EngineError::worker(self.worker.name(), e));
                break;
            }
        }
    }
}
