//! Fixed-capacity pool of sector-aligned blocks.
//!
//! The pool preallocates every block up front and hands them out one at a
//! time with capacity-bounded backpressure: a semaphore carries one permit
//! per block, the available blocks sit in a queue behind a mutex. Returning
//! order need not match rent order.
//!
//! The pool is the only shared mutable resource in the engine core and is
//! internally synchronized; the queue mutex is never held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

use super::block::{Block, SECTOR_SIZE};

/// Process-wide pool identity counter, used to detect foreign-block returns.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed set of preallocated aligned blocks with rent/return semantics.
pub struct BufferPool {
    id: u64,
    block_size: usize,
    capacity: usize,
    arena: Vec<Arc<Block>>,
    available: Mutex<VecDeque<Arc<Block>>>,
    permits: Semaphore,
    closed: AtomicBool,
}

impl BufferPool {
    /// Create a pool of `capacity` blocks of `block_size` bytes each.
    ///
    /// Block size must be a positive multiple of [`SECTOR_SIZE`]; capacity
    /// must be at least 1.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self> {
        if block_size == 0 || block_size % SECTOR_SIZE != 0 {
            return Err(EngineError::config(format!(
                "block size must be a positive multiple of {SECTOR_SIZE}, got {block_size}"
            )));
        }
        if capacity == 0 {
            return Err(EngineError::config("pool capacity must be at least 1"));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut arena = Vec::with_capacity(capacity);
        for slot in 0..capacity {
            arena.push(Arc::new(Block::new(block_size, id, slot)?));
        }
        let available = arena.iter().cloned().collect::<VecDeque<_>>();

        Ok(Self {
            id,
            block_size,
            capacity,
            arena,
            available: Mutex::new(available),
            permits: Semaphore::new(capacity),
            closed: AtomicBool::new(false),
        })
    }

    /// The fixed size of every block in the pool.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks currently available for rent.
    pub fn available(&self) -> usize {
        self.available.lock().expect("pool lock poisoned").len()
    }

    /// Rent a block, waiting until one is available or `cancel` fires.
    ///
    /// The returned block has reference count exactly 1.
    pub async fn rent(&self, cancel: &CancellationToken) -> Result<Arc<Block>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            acquired = self.permits.acquire() => {
                acquired.map_err(|_| EngineError::Disposed)?
            }
        };
        permit.forget();
        self.take_available()
    }

    /// Rent a block without observing cancellation.
    ///
    /// Used for the verification scratch block, where finalize must run even
    /// when cancellation is already signaled.
    pub async fn rent_uncancellable(&self) -> Result<Arc<Block>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Disposed)?;
        permit.forget();
        self.take_available()
    }

    fn take_available(&self) -> Result<Arc<Block>> {
        let block = self
            .available
            .lock()
            .expect("pool lock poisoned")
            .pop_front()
            .ok_or_else(|| {
                EngineError::invariant("pool permit acquired but no block available")
            })?;
        block.begin_rent()?;
        Ok(block)
    }

    /// Return one reference to the pool.
    ///
    /// Decrements the block's reference count; when it reaches zero the block
    /// re-enters the available queue and one waiter is woken. Fails with an
    /// invariant error if the block does not belong to this pool or the count
    /// would go negative.
    pub fn release(&self, block: Arc<Block>) -> Result<()> {
        if block.pool_id() != self.id
            || block.slot() >= self.arena.len()
            || !Arc::ptr_eq(&self.arena[block.slot()], &block)
        {
            return Err(EngineError::invariant(
                "block returned to a pool it does not belong to",
            ));
        }

        if block.release_ref()? {
            block.set_len(0);
            self.available
                .lock()
                .expect("pool lock poisoned")
                .push_back(block);
            self.permits.add_permits(1);
        }
        Ok(())
    }

    /// Assert that the pool is fully idle: every block present in the
    /// available queue with reference count 0, and the permit count matching
    /// capacity.
    pub fn assert_idle(&self) -> Result<()> {
        let available = self.available.lock().expect("pool lock poisoned");
        if available.len() != self.capacity {
            return Err(EngineError::invariant(format!(
                "pool has {} of {} blocks available",
                available.len(),
                self.capacity
            )));
        }
        for block in available.iter() {
            if block.ref_count() != 0 {
                return Err(EngineError::invariant(format!(
                    "idle block {} has reference count {}",
                    block.slot(),
                    block.ref_count()
                )));
            }
        }
        if self.permits.available_permits() != self.capacity {
            return Err(EngineError::invariant(format!(
                "pool has {} of {} permits available",
                self.permits.available_permits(),
                self.capacity
            )));
        }
        Ok(())
    }

    /// Close the pool. Pending and future rents fail with `Disposed`;
    /// outstanding blocks may still be returned.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.block_size)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}
