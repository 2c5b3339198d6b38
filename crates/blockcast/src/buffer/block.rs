//! Sector-aligned transfer blocks.
//!
//! A [`Block`] is an inert data carrier: a fixed-capacity, sector-aligned
//! byte region plus the metadata the pipeline needs to route it (sequence
//! number, valid-data length, reference count, owning-pool identity).
//!
//! # Safety model
//!
//! The backing region is a raw aligned allocation. To keep aliasing sound we
//! never hold `&mut [u8]` and `&[u8]` views of the same block concurrently:
//!
//! 1. While a block is rented to the producer (reference count 1) the filling
//!    task is its sole holder and may take the mutable view.
//! 2. Between broadcast and return the content is immutable by contract;
//!    consumers only take the shared views ([`Block::memory`]/[`Block::data`]).
//!
//! [`Block::memory_mut`] documents this exclusivity requirement and checks the
//! reference count in debug builds.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::{EngineError, Result};

/// Alignment granularity required for unbuffered file IO, in bytes.
pub const SECTOR_SIZE: usize = 4096;

/// Owned sector-aligned heap region.
struct AlignedRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedRegion {
    /// Allocate a zeroed region of `capacity` bytes aligned to [`SECTOR_SIZE`].
    fn allocate(capacity: usize) -> Result<Self> {
        let layout = Layout::from_size_align(capacity, SECTOR_SIZE)
            .map_err(|e| EngineError::config(format!("invalid block layout: {e}")))?;
        // SAFETY: layout has non-zero size (validated by the pool) and a
        // power-of-two alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| EngineError::invariant("aligned block allocation failed"))?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was produced by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the region is an owned allocation with no thread affinity; all
// access is mediated by `Block`, which enforces the exclusivity rules
// described in the module docs.
unsafe impl Send for AlignedRegion {}
unsafe impl Sync for AlignedRegion {}

/// A pooled, sector-aligned transfer block.
///
/// Blocks are preallocated by a [`BufferPool`](super::BufferPool) and handed
/// out as `Arc<Block>`. The `sequence` number is the zero-based index of the
/// block within the logical stream (`byte offset / block size`); `len` is the
/// number of valid bytes at the front of the region.
pub struct Block {
    region: AlignedRegion,
    capacity: usize,
    sequence: AtomicU64,
    len: AtomicUsize,
    refs: AtomicUsize,
    pool_id: u64,
    slot: usize,
}

impl Block {
    pub(crate) fn new(capacity: usize, pool_id: u64, slot: usize) -> Result<Self> {
        Ok(Self {
            region: AlignedRegion::allocate(capacity)?,
            capacity,
            sequence: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            refs: AtomicUsize::new(0),
            pool_id,
            slot,
        })
    }

    /// Fixed capacity of the block (the pool's block size).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Zero-based index of this block within the logical stream.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Number of valid bytes at the front of the region.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the block carries no valid data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full block region.
    pub fn memory(&self) -> &[u8] {
        // SAFETY: the region is alive for the lifetime of self, and no
        // exclusive view exists while the block is shared (see module docs).
        unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr(), self.capacity) }
    }

    /// The valid prefix of the block (`memory()[..len()]`).
    pub fn data(&self) -> &[u8] {
        &self.memory()[..self.len()]
    }

    /// Exclusive view of the full block region for filling.
    ///
    /// Only the task the block is currently rented to may call this, and only
    /// before broadcast (reference count 1): the producer during fill, or a
    /// worker reading back its output into a rented scratch block. Consumers
    /// must treat broadcast blocks as read-only.
    #[allow(clippy::mut_from_ref)]
    pub fn memory_mut(&self) -> &mut [u8] {
        debug_assert_eq!(
            self.refs.load(Ordering::Acquire),
            1,
            "mutable access to a shared block"
        );
        // SAFETY: per the rental contract above the caller is the sole holder,
        // so no shared view of the region is live.
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr.as_ptr(), self.capacity) }
    }

    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    pub(crate) fn set_len(&self, len: usize) {
        debug_assert!(len <= self.capacity);
        self.len.store(len, Ordering::Release);
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Transition idle -> rented (reference count 0 -> 1).
    pub(crate) fn begin_rent(&self) -> Result<()> {
        match self
            .refs
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(EngineError::invariant(format!(
                "rented block {} had reference count {actual}",
                self.slot
            ))),
        }
    }

    /// Raise the reference count to the broadcast fan-out.
    ///
    /// Called by the producer immediately before handing the block to the
    /// consumer channels; the count must still be the rental count of 1.
    pub(crate) fn share(&self, fanout: usize) -> Result<()> {
        debug_assert!(fanout >= 1);
        match self
            .refs
            .compare_exchange(1, fanout, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(actual) => Err(EngineError::invariant(format!(
                "broadcast block {} had reference count {actual}",
                self.slot
            ))),
        }
    }

    /// Drop one reference. Returns true when this was the last holder.
    pub(crate) fn release_ref(&self) -> Result<bool> {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Underflow: restore and report.
            self.refs.fetch_add(1, Ordering::AcqRel);
            return Err(EngineError::invariant(format!(
                "block {} returned more times than it was shared",
                self.slot
            )));
        }
        Ok(prev == 1)
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("slot", &self.slot)
            .field("capacity", &self.capacity)
            .field("sequence", &self.sequence())
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_region_is_sector_aligned() {
        let block = Block::new(SECTOR_SIZE * 4, 1, 0).unwrap();
        assert_eq!(block.memory().as_ptr() as usize % SECTOR_SIZE, 0);
        assert_eq!(block.capacity(), SECTOR_SIZE * 4);
    }

    #[test]
    fn test_data_is_valid_prefix() {
        let block = Block::new(SECTOR_SIZE, 1, 0).unwrap();
        block.begin_rent().unwrap();
        block.memory_mut()[..3].copy_from_slice(b"abc");
        block.set_len(3);
        assert_eq!(block.data(), b"abc");
        assert_eq!(block.memory().len(), SECTOR_SIZE);
    }

    #[test]
    fn test_ref_count_transitions() {
        let block = Block::new(SECTOR_SIZE, 1, 0).unwrap();
        assert_eq!(block.ref_count(), 0);

        block.begin_rent().unwrap();
        assert_eq!(block.ref_count(), 1);
        assert!(block.begin_rent().is_err());

        block.share(3).unwrap();
        assert_eq!(block.ref_count(), 3);

        assert!(!block.release_ref().unwrap());
        assert!(!block.release_ref().unwrap());
        assert!(block.release_ref().unwrap());
        assert_eq!(block.ref_count(), 0);

        assert!(block.release_ref().is_err());
        assert_eq!(block.ref_count(), 0);
    }

    #[test]
    fn test_share_requires_rental() {
        let block = Block::new(SECTOR_SIZE, 1, 0).unwrap();
        assert!(block.share(2).is_err());
    }
}
