//! Worker contracts for the transfer engine.
//!
//! This module defines the two worker roles driven by the engine:
//!
//! - [`Producer`]: fills rented blocks with the next stretch of the stream
//! - [`Consumer`]: drains broadcast blocks to a destination
//!
//! Workers are handed a [`WorkerContext`] at initialize time - a non-owning
//! handle to their owning state machine carrying the machine's cancellation
//! token and the pool's block size. Workers are contractually required to
//! observe cancellation at each opportunity.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::buffer::Block;
use crate::error::Result;
use crate::hash::{BlockHasher, HashDigest};

/// Non-owning handle from a worker back to its owning state machine.
///
/// Cloned into the worker at initialize; carries everything a worker may
/// query mid-stream (cancellation, block size) without owning any of it.
#[derive(Clone)]
pub struct WorkerContext {
    machine: String,
    block_size: usize,
    cancel: CancellationToken,
}

impl WorkerContext {
    pub(crate) fn new(machine: String, block_size: usize, cancel: CancellationToken) -> Self {
        Self {
            machine,
            block_size,
            cancel,
        }
    }

    /// Label of the owning state machine, for logging.
    pub fn machine(&self) -> &str {
        &self.machine
    }

    /// The pool's fixed block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The owning machine's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the owning machine has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("machine", &self.machine)
            .field("block_size", &self.block_size)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Resources handed to a worker's finalize for the verification pass.
///
/// The engine owns both resources: the scratch block goes back to the pool
/// and the hasher is dropped once finalize returns, on every path.
pub struct VerifyContext {
    pub(crate) hasher: Box<dyn BlockHasher>,
    pub(crate) scratch: Arc<Block>,
}

impl VerifyContext {
    /// The hash engine to feed the re-read output into.
    pub fn hasher(&mut self) -> &mut dyn BlockHasher {
        self.hasher.as_mut()
    }

    /// A rented scratch block for re-read IO. Sector-aligned, refcount 1.
    pub fn scratch(&self) -> &Arc<Block> {
        &self.scratch
    }

    /// Feed `data` into the hash engine.
    pub fn append(&mut self, data: &[u8]) {
        self.hasher.append(data);
    }

    /// Produce the verification digest, resetting the engine.
    pub fn finish(&mut self) -> HashDigest {
        self.hasher.finalize_reset()
    }
}

/// Capabilities shared by both worker roles.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable name of this worker, used in logs and error reports.
    fn name(&self) -> &str;

    /// Upper bound on concurrent fill/drain calls for this worker.
    ///
    /// Must be at least 1. Workers doing inherently sequential IO should
    /// report 1.
    fn max_concurrency(&self) -> usize {
        1
    }

    /// Acquire resources before the transfer begins.
    async fn initialize(&self, ctx: WorkerContext) -> Result<()>;

    /// Release resources and, when `verify` is present, re-read this
    /// worker's own output, feed it into the hash engine and return the
    /// verification digest.
    ///
    /// Invoked exactly once per transfer on every path - success, error and
    /// cancellation - so resource release must not depend on a clean run.
    async fn finalize(&self, verify: Option<&mut VerifyContext>) -> Result<Option<HashDigest>>;
}

/// A worker that produces the ordered block stream.
#[async_trait]
pub trait Producer: Worker {
    /// Fill `block.memory_mut()` with the bytes at stream position
    /// `block.sequence() * block_size` and return the number of bytes
    /// written.
    ///
    /// Must return exactly the block capacity unless this is the last block,
    /// in which case any value in `0..=capacity` is allowed; 0 signals
    /// end-of-stream. With concurrent fills, positions past the end may be
    /// probed after the stream is exhausted and must keep returning 0. May
    /// be called concurrently up to [`max_concurrency`](Worker::max_concurrency).
    /// Must observe cancellation. The engine stops invoking fill after any
    /// error.
    async fn fill(&self, block: &Arc<Block>) -> Result<usize>;
}

/// A worker that drains the broadcast block stream.
#[async_trait]
pub trait Consumer: Worker {
    /// Consume `block.data()` completely.
    ///
    /// Blocks arrive in strict sequence order; with
    /// [`max_concurrency`](Worker::max_concurrency) above 1 drain calls may
    /// overlap, and the absolute stream position is always recoverable from
    /// `block.sequence()`. The block content must be treated as read-only.
    async fn drain(&self, block: &Arc<Block>) -> Result<()>;
}
