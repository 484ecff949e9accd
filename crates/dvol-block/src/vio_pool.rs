//! Fixed-capacity pool of preallocated metadata I/O carriers.
//!
//! Each entry owns a 4 KiB buffer and a completion slot. The pool is pinned
//! to one zone thread; callers that find the pool empty are queued and served
//! in FIFO order as entries come back. Entries are addressed by handle
//! (index into the pool arena) rather than by pointer.

use dvol_error::{DvolError, Result};
use dvol_types::{BLOCK_SIZE, PhysicalBlockNumber};
use std::collections::VecDeque;
use std::thread::ThreadId;
use tracing::trace;

/// Handle to a pool entry: an index into the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VioHandle(pub u32);

/// A preallocated I/O carrier.
#[derive(Debug)]
pub struct VioPoolEntry {
    /// One block of scratch space for the transfer.
    pub buffer: Vec<u8>,
    /// The physical block the current operation targets, if any.
    pub pbn: Option<PhysicalBlockNumber>,
    /// Opaque completion slot: which object this carrier is working for.
    pub parent: Option<u32>,
}

impl VioPoolEntry {
    fn new() -> Self {
        Self {
            buffer: vec![0_u8; BLOCK_SIZE],
            pbn: None,
            parent: None,
        }
    }

    fn reset(&mut self) {
        self.pbn = None;
        self.parent = None;
    }
}

/// Callback invoked when a pool entry becomes available for a waiter.
pub type VioWaiter = Box<dyn FnOnce(VioHandle, &mut VioPoolEntry) + Send>;

/// A fixed set of preallocated I/O carriers pinned to one thread.
pub struct VioPool {
    entries: Vec<VioPoolEntry>,
    busy: Vec<bool>,
    free: Vec<u32>,
    waiters: VecDeque<VioWaiter>,
    busy_count: usize,
    outage_count: u64,
    owner: ThreadId,
}

impl std::fmt::Debug for VioPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VioPool")
            .field("size", &self.entries.len())
            .field("busy_count", &self.busy_count)
            .field("waiters", &self.waiters.len())
            .field("outage_count", &self.outage_count)
            .finish()
    }
}

impl VioPool {
    /// Create a pool of `size` entries, pinned to the calling thread.
    #[must_use]
    pub fn new(size: usize) -> Self {
        let mut free = Vec::with_capacity(size);
        // Pop order matches entry order: handle 0 first.
        for index in (0..size).rev() {
            #[allow(clippy::cast_possible_truncation)]
            free.push(index as u32);
        }
        Self {
            entries: (0..size).map(|_| VioPoolEntry::new()).collect(),
            busy: vec![false; size],
            free,
            waiters: VecDeque::new(),
            busy_count: 0,
            outage_count: 0,
            owner: std::thread::current().id(),
        }
    }

    fn check_thread(&self) -> Result<()> {
        if std::thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(DvolError::Assertion("vio pool used off its zone thread"))
        }
    }

    /// Acquire an entry for `waiter`. If an entry is free the waiter runs
    /// synchronously; otherwise it is queued and the outage counter bumps.
    pub fn acquire(&mut self, waiter: VioWaiter) -> Result<()> {
        self.check_thread()?;
        if let Some(index) = self.free.pop() {
            self.busy[index as usize] = true;
            self.busy_count += 1;
            let handle = VioHandle(index);
            waiter(handle, &mut self.entries[index as usize]);
            return Ok(());
        }

        self.outage_count += 1;
        trace!(
            target: "dvol::block::vio_pool",
            outage_count = self.outage_count,
            "pool empty, queueing waiter"
        );
        self.waiters.push_back(waiter);
        Ok(())
    }

    /// Acquire an entry without queueing: returns `None` (and counts an
    /// outage) when the pool is empty. Writeback paths that can defer work
    /// use this instead of a waiter callback.
    pub fn try_acquire(&mut self) -> Result<Option<VioHandle>> {
        self.check_thread()?;
        let Some(index) = self.free.pop() else {
            self.outage_count += 1;
            return Ok(None);
        };
        self.busy[index as usize] = true;
        self.busy_count += 1;
        Ok(Some(VioHandle(index)))
    }

    /// Return an entry. The next queued waiter, if any, is served with this
    /// same entry; otherwise the entry goes back on the free list.
    pub fn return_entry(&mut self, handle: VioHandle) -> Result<()> {
        self.check_thread()?;
        let index = handle.0 as usize;
        if index >= self.entries.len() || !self.busy[index] {
            return Err(DvolError::Assertion("returned vio entry is not busy"));
        }

        self.entries[index].reset();
        if let Some(waiter) = self.waiters.pop_front() {
            waiter(handle, &mut self.entries[index]);
            return Ok(());
        }

        self.busy[index] = false;
        self.busy_count -= 1;
        self.free.push(handle.0);
        Ok(())
    }

    /// Mutable access to a busy entry (for filling the buffer mid-operation).
    pub fn entry_mut(&mut self, handle: VioHandle) -> Result<&mut VioPoolEntry> {
        let index = handle.0 as usize;
        if index >= self.entries.len() || !self.busy[index] {
            return Err(DvolError::Assertion("vio entry handle is not busy"));
        }
        Ok(&mut self.entries[index])
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy_count != 0
    }

    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.busy_count
    }

    /// Number of acquires that had to queue.
    #[must_use]
    pub fn outage_count(&self) -> u64 {
        self.outage_count
    }

    /// Verify every entry has been returned; the owner must call this before
    /// dropping the pool.
    pub fn check_idle(&self) -> Result<()> {
        if self.busy_count != 0 || !self.waiters.is_empty() {
            return Err(DvolError::Assertion("vio pool freed with busy entries or waiters"));
        }
        Ok(())
    }
}
