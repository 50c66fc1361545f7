//! Fixed-capacity pool of equally sized blocks, handed out by index.
//!
//! The arena is allocated once in [`BlockPool::new`]; after that reserve and
//! release never allocate and finish in `O(block_count)` worst case. A
//! rotating cursor resumes each search where the previous one stopped, so
//! consecutive reservations walk the pool round-robin instead of always
//! hammering the low indices.
//!
//! Ownership of a busy block is exclusive. It moves between holders (and
//! between interrupt and task context) as a [`BlockIndex`], never as a raw
//! pointer; [`Block`] is the RAII form for code that keeps it local.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Handle to one block of a [`BlockPool`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockIndex(usize);

impl BlockIndex {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

/// Block pool errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every block is busy. Recoverable: apply backpressure and retry.
    Unavailable,
    /// The index is not below the pool's block count.
    InvalidIndex,
    /// The block was not busy; releasing it again would alias it.
    AlreadyFree,
    /// `block_count * block_size` does not fit in `usize`.
    TooLarge,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Unavailable => f.write_str("no free block in pool"),
            PoolError::InvalidIndex => f.write_str("block index out of range"),
            PoolError::AlreadyFree => f.write_str("block already free"),
            PoolError::TooLarge => f.write_str("pool size overflows usize"),
        }
    }
}

/// A bounded pool of `block_count` blocks of `block_size` bytes each.
///
/// Safe for one task-context reserver running concurrently with releases
/// from interrupt context: busy flags are claimed with compare-exchange and
/// only the reserver moves the search cursor.
pub struct BlockPool {
    block_count: usize,
    block_size: usize,
    arena: Box<[UnsafeCell<u8>]>,
    busy: Box<[AtomicBool]>,
    next_free_hint: AtomicUsize,
    available: AtomicUsize,
}

// SAFETY: bytes of a block are only reachable through the index that owns
// it, and ownership is arbitrated by the atomic busy flags.
unsafe impl Sync for BlockPool {}
unsafe impl Send for BlockPool {}

impl BlockPool {
    /// Allocate the arena and bookkeeping for `block_count` blocks.
    ///
    /// This is the only allocation the pool ever makes; call it during
    /// setup, not from an ISR.
    ///
    /// # Panics
    ///
    /// If the arena size overflows `usize`; see [`try_new`](Self::try_new).
    pub fn new(block_count: usize, block_size: usize) -> Self {
        match Self::try_new(block_count, block_size) {
            Ok(pool) => pool,
            Err(err) => panic!("block pool {}x{}: {}", block_count, block_size, err),
        }
    }

    /// [`new`](Self::new), failing with `TooLarge` instead of panicking.
    pub fn try_new(block_count: usize, block_size: usize) -> Result<Self, PoolError> {
        let arena_len = block_count
            .checked_mul(block_size)
            .ok_or(PoolError::TooLarge)?;
        let arena: Vec<UnsafeCell<u8>> = (0..arena_len).map(|_| UnsafeCell::new(0)).collect();
        let busy: Vec<AtomicBool> = (0..block_count).map(|_| AtomicBool::new(false)).collect();

        Ok(Self {
            block_count,
            block_size,
            arena: arena.into_boxed_slice(),
            busy: busy.into_boxed_slice(),
            next_free_hint: AtomicUsize::new(0),
            available: AtomicUsize::new(block_count),
        })
    }

    /// Reserve a free block.
    pub fn reserve(&self) -> Result<BlockIndex, PoolError> {
        if self.available.load(Ordering::Acquire) == 0 {
            return Err(PoolError::Unavailable);
        }

        let start = self.next_free_hint.load(Ordering::Relaxed) % self.block_count;
        for step in 0..self.block_count {
            let idx = (start + step) % self.block_count;
            if self.busy[idx]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.available.fetch_sub(1, Ordering::AcqRel);
                self.next_free_hint
                    .store((idx + 1) % self.block_count, Ordering::Relaxed);
                return Ok(BlockIndex(idx));
            }
        }

        Err(PoolError::Unavailable)
    }

    /// Reserve a free block as an RAII handle that releases on drop.
    pub fn reserve_block(&self) -> Result<Block<'_>, PoolError> {
        self.reserve().map(|index| Block { pool: self, index })
    }

    /// Return a busy block to the pool.
    pub fn release(&self, index: BlockIndex) -> Result<(), PoolError> {
        let flag = self.busy.get(index.0).ok_or(PoolError::InvalidIndex)?;

        if !flag.swap(false, Ordering::AcqRel) {
            return Err(PoolError::AlreadyFree);
        }
        self.available.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Take back RAII ownership of a block handed over by index.
    ///
    /// # Safety
    /// The caller must be the block's sole owner, i.e. the index came from
    /// [`reserve`](Self::reserve) or [`Block::into_index`] and has not been
    /// released or claimed since.
    pub unsafe fn claim(&self, index: BlockIndex) -> Result<Block<'_>, PoolError> {
        match self.busy.get(index.0) {
            None => Err(PoolError::InvalidIndex),
            Some(flag) if !flag.load(Ordering::Acquire) => Err(PoolError::AlreadyFree),
            Some(_) => Ok(Block { pool: self, index }),
        }
    }

    /// Address of a block inside the arena.
    pub fn block_ptr(&self, index: BlockIndex) -> Option<NonNull<u8>> {
        if index.0 >= self.block_count || self.block_size == 0 {
            return None;
        }
        // SAFETY: `index < block_count`, so the offset is inside the arena.
        let cell = unsafe { self.arena.as_ptr().add(index.0 * self.block_size) };
        NonNull::new(UnsafeCell::raw_get(cell))
    }

    /// Bytes of a block.
    ///
    /// # Safety
    /// The caller must own `index` and hold no other reference to the block.
    pub unsafe fn block_mut(&self, index: BlockIndex) -> &mut [u8] {
        match self.block_ptr(index) {
            // SAFETY: in-bounds range of the arena, exclusively owned per the contract.
            Some(ptr) => unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), self.block_size) },
            None => &mut [],
        }
    }

    /// Whether `index` is currently held by someone.
    pub fn is_busy(&self, index: BlockIndex) -> bool {
        self.busy
            .get(index.0)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }
}

/// A reserved block, released back to its pool on drop.
pub struct Block<'a> {
    pool: &'a BlockPool,
    index: BlockIndex,
}

impl Block<'_> {
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    /// Give up RAII ownership and keep only the index.
    ///
    /// The block stays busy until someone releases or claims the index.
    pub fn into_index(self) -> BlockIndex {
        let index = self.index;
        core::mem::forget(self);
        index
    }
}

impl Deref for Block<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.pool.block_ptr(self.index) {
            // SAFETY: this handle owns the block.
            Some(ptr) => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.pool.block_size) },
            None => &[],
        }
    }
}

impl DerefMut for Block<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle owns the block.
        unsafe { self.pool.block_mut(self.index) }
    }
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        // Only fails if someone released our index behind our back.
        let _ = self.pool.release(self.index);
    }
}

impl fmt::Debug for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block").field("index", &self.index).finish()
    }
}
