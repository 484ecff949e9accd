//! Per-slab reference counters.
//!
//! One byte per data block, with the byte values carrying semantics: 0 is
//! free, 1..=254 is an exact count (254 is the saturated maximum, written
//! for block-map tree pages so they never dedupe), and 255 is a provisional
//! allocation owned by exactly one PBN lock. The counters are grouped into
//! reference blocks that flush independently; each block remembers which
//! slab-journal sequence it must keep locked until its write completes.
//!
//! The allocator keeps a search cursor per slab and finds free counters with
//! a word-at-a-time zero-byte scan over the (padded) counter array, skipping
//! blocks whose `allocated_count` says they are full.

use crate::journal::SlabJournal;
use crate::pbn_lock::PbnLock;
use crate::readonly::ReadOnlyNotifier;
use dvol_block::{BlockDevice, VioHandle, VioPool};
use dvol_error::{DvolError, Result};
use dvol_ondisk::{SlabJournalEntry, pack_reference_block, unpack_reference_block};
use dvol_types::{
    BlockCount, COUNTS_PER_BLOCK, COUNTS_PER_SECTOR, EMPTY_REFERENCE_COUNT, JournalOperation,
    JournalPoint, MAXIMUM_REFERENCE_COUNT, PROVISIONAL_REFERENCE_COUNT, PhysicalBlockNumber,
    ReferenceStatus, SECTORS_PER_BLOCK, SlabBlockNumber, SlabCount, reference_status,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

const BYTES_PER_WORD: usize = 8;

/// Counters shared across a zone's slabs; written by the zone thread only,
/// read elsewhere with relaxed loads.
#[derive(Debug, Default)]
pub struct RefCountStatistics {
    pub blocks_written: AtomicU64,
}

impl RefCountStatistics {
    #[must_use]
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }
}

/// Bookkeeping for one on-disk reference block.
#[derive(Debug, Clone)]
struct ReferenceBlockState {
    /// Non-free counters owned by this block; the source of truth for the
    /// allocator's full-block skip.
    allocated_count: u32,
    /// Slab-journal sequence this block pins while dirty (0 = none).
    slab_journal_lock: u64,
    /// Lock latched at write launch, released when the write completes.
    slab_journal_lock_to_release: u64,
    is_dirty: bool,
    is_writing: bool,
    commit_points: [JournalPoint; SECTORS_PER_BLOCK],
}

impl ReferenceBlockState {
    fn new() -> Self {
        Self {
            allocated_count: 0,
            slab_journal_lock: 0,
            slab_journal_lock_to_release: 0,
            is_dirty: false,
            is_writing: false,
            commit_points: [JournalPoint::default(); SECTORS_PER_BLOCK],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SearchCursor {
    block: u32,
    index: u32,
    end_index: u32,
}

#[derive(Debug, Default)]
struct UpdateOutcome {
    free_status_changed: bool,
    provisional_decrement: bool,
}

/// Reference counters for one slab.
pub struct RefCounts {
    slab_number: SlabCount,
    /// First data-block PBN of the slab.
    slab_start: PhysicalBlockNumber,
    /// PBN of the first on-disk reference block.
    origin: PhysicalBlockNumber,
    /// Number of data blocks (and live counters).
    block_count: u32,
    free_blocks: BlockCount,
    /// Padded so a word scan may read past the last counter.
    counters: Vec<u8>,
    reference_block_count: u32,
    blocks: Vec<ReferenceBlockState>,
    dirty_blocks: VecDeque<u32>,
    search_cursor: SearchCursor,
    slab_journal_point: JournalPoint,
    ever_dirtied: bool,
    notifier: ReadOnlyNotifier,
    statistics: Arc<RefCountStatistics>,
}

impl std::fmt::Debug for RefCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCounts")
            .field("slab_number", &self.slab_number)
            .field("block_count", &self.block_count)
            .field("free_blocks", &self.free_blocks)
            .field("dirty_blocks", &self.dirty_blocks.len())
            .finish()
    }
}

impl RefCounts {
    /// Create counters for a slab whose data region starts at `slab_start`
    /// and whose reference blocks live at `origin`.
    #[must_use]
    pub fn new(
        slab_number: SlabCount,
        slab_start: PhysicalBlockNumber,
        origin: PhysicalBlockNumber,
        block_count: u32,
        notifier: ReadOnlyNotifier,
        statistics: Arc<RefCountStatistics>,
    ) -> Self {
        let reference_block_count =
            u32::try_from((u64::from(block_count)).div_ceil(COUNTS_PER_BLOCK as u64))
                .unwrap_or(u32::MAX);
        // The runt block gets a full-length array slice, plus two words of
        // padding so the word search may read past the very end.
        let padded =
            reference_block_count as usize * COUNTS_PER_BLOCK + 2 * BYTES_PER_WORD;
        let mut counts = Self {
            slab_number,
            slab_start,
            origin,
            block_count,
            free_blocks: BlockCount::from(block_count),
            counters: vec![EMPTY_REFERENCE_COUNT; padded],
            reference_block_count,
            blocks: vec![ReferenceBlockState::new(); reference_block_count as usize],
            dirty_blocks: VecDeque::new(),
            search_cursor: SearchCursor {
                block: 0,
                index: 0,
                end_index: 0,
            },
            slab_journal_point: JournalPoint::default(),
            ever_dirtied: false,
            notifier,
            statistics,
        };
        counts.reset_search_cursor();
        counts
    }

    // ── Index arithmetic ────────────────────────────────────────────────────

    fn index_to_pbn(&self, index: u32) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.slab_start.0 + u64::from(index))
    }

    /// Pin an arbitrary PBN to a counter index, clamping out-of-range values
    /// to the ends of the array (range-count helper semantics).
    fn pbn_to_index(&self, pbn: PhysicalBlockNumber) -> u32 {
        if pbn < self.slab_start {
            return 0;
        }
        let index = pbn.0 - self.slab_start.0;
        u32::try_from(index.min(u64::from(self.block_count))).unwrap_or(self.block_count)
    }

    pub(crate) fn sbn_from_pbn(&self, pbn: PhysicalBlockNumber) -> Result<SlabBlockNumber> {
        if pbn < self.slab_start {
            return Err(DvolError::OutOfRange { pbn: pbn.0 });
        }
        let index = pbn.0 - self.slab_start.0;
        if index >= u64::from(self.block_count) {
            return Err(DvolError::OutOfRange { pbn: pbn.0 });
        }
        SlabBlockNumber::try_from(index).map_err(|_| DvolError::OutOfRange { pbn: pbn.0 })
    }

    fn block_index_for(sbn: SlabBlockNumber) -> u32 {
        sbn / COUNTS_PER_BLOCK as u32
    }

    /// Counters covered by reference block `index` (the last one is a runt).
    fn counts_in_block(&self, index: u32) -> u32 {
        let first = index * COUNTS_PER_BLOCK as u32;
        (self.block_count - first).min(COUNTS_PER_BLOCK as u32)
    }

    // ── Observers ───────────────────────────────────────────────────────────

    /// Blocks with a counter of zero.
    #[must_use]
    pub fn free_block_count(&self) -> BlockCount {
        self.free_blocks
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    #[must_use]
    pub fn reference_block_count(&self) -> u32 {
        self.reference_block_count
    }

    /// The live counter bytes (without the search padding).
    #[must_use]
    pub fn counters(&self) -> &[u8] {
        &self.counters[..self.block_count as usize]
    }

    #[must_use]
    pub fn slab_journal_point(&self) -> JournalPoint {
        self.slab_journal_point
    }

    /// Whether any counter has ever been dirtied; pristine slabs skip their
    /// reference-count load entirely.
    #[must_use]
    pub fn ever_dirtied(&self) -> bool {
        self.ever_dirtied
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.dirty_blocks.is_empty() && self.blocks.iter().all(|block| !block.is_writing)
    }

    /// Reference status of a counter.
    pub fn reference_status_of(&self, pbn: PhysicalBlockNumber) -> Result<ReferenceStatus> {
        let sbn = self.sbn_from_pbn(pbn)?;
        Ok(reference_status(self.counters[sbn as usize]))
    }

    /// How many more increments the counter can absorb before saturating. A
    /// provisional counter counts as a single holder.
    #[must_use]
    pub fn available_references(&self, pbn: PhysicalBlockNumber) -> u8 {
        let Ok(sbn) = self.sbn_from_pbn(pbn) else {
            return 0;
        };
        match self.counters[sbn as usize] {
            PROVISIONAL_REFERENCE_COUNT => MAXIMUM_REFERENCE_COUNT - 1,
            count => MAXIMUM_REFERENCE_COUNT.saturating_sub(count),
        }
    }

    /// Count unreferenced blocks in `[start_pbn, end_pbn)`; the bounds are
    /// pinned to the slab.
    #[must_use]
    pub fn count_unreferenced(
        &self,
        start_pbn: PhysicalBlockNumber,
        end_pbn: PhysicalBlockNumber,
    ) -> BlockCount {
        let start = self.pbn_to_index(start_pbn) as usize;
        let end = self.pbn_to_index(end_pbn) as usize;
        self.counters[start..end]
            .iter()
            .filter(|count| **count == EMPTY_REFERENCE_COUNT)
            .count() as BlockCount
    }

    /// Structural equivalence, used by replay round-trip tests.
    #[must_use]
    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        if self.block_count != other.block_count
            || self.free_blocks != other.free_blocks
            || self.reference_block_count != other.reference_block_count
        {
            return false;
        }
        if self
            .blocks
            .iter()
            .zip(&other.blocks)
            .any(|(mine, theirs)| mine.allocated_count != theirs.allocated_count)
        {
            return false;
        }
        self.counters() == other.counters()
    }

    /// Terse one-line diagnostic dump.
    pub fn dump(&self) {
        info!(
            target: "dvol::slab::refcounts",
            slab = self.slab_number,
            free = self.free_blocks,
            blocks = self.block_count,
            reference_blocks = self.reference_block_count,
            dirty = self.dirty_blocks.len(),
            journal_point = %self.slab_journal_point,
            "ref counts"
        );
    }

    // ── Counter transitions ─────────────────────────────────────────────────

    fn increment_for_data(
        &mut self,
        block_index: u32,
        sbn: SlabBlockNumber,
        status: ReferenceStatus,
        lock: Option<&mut PbnLock>,
    ) -> Result<bool> {
        let slot = sbn as usize;
        let changed = match status {
            ReferenceStatus::Free => {
                self.counters[slot] = 1;
                self.blocks[block_index as usize].allocated_count += 1;
                self.free_blocks -= 1;
                true
            }
            ReferenceStatus::Provisional => {
                self.counters[slot] = 1;
                false
            }
            ReferenceStatus::Single | ReferenceStatus::Shared => {
                if self.counters[slot] >= MAXIMUM_REFERENCE_COUNT {
                    return Err(DvolError::RefCountInvalid {
                        slab: self.slab_number,
                        sbn,
                        detail: "incrementing a block already having 254 references",
                    });
                }
                self.counters[slot] += 1;
                false
            }
        };

        if let Some(lock) = lock {
            lock.unassign_provisional_reference();
        }
        Ok(changed)
    }

    fn decrement_for_data(
        &mut self,
        block_index: u32,
        sbn: SlabBlockNumber,
        status: ReferenceStatus,
        lock: Option<&mut PbnLock>,
    ) -> Result<bool> {
        let slot = sbn as usize;
        let changed = match status {
            ReferenceStatus::Free => {
                return Err(DvolError::RefCountInvalid {
                    slab: self.slab_number,
                    sbn,
                    detail: "decrementing free block",
                });
            }
            ReferenceStatus::Provisional | ReferenceStatus::Single => {
                if let Some(lock) = lock {
                    // A read lock pins the block; it must not become
                    // unreferenced out from under the holder.
                    self.counters[slot] = PROVISIONAL_REFERENCE_COUNT;
                    lock.assign_provisional_reference();
                    false
                } else {
                    self.counters[slot] = EMPTY_REFERENCE_COUNT;
                    self.blocks[block_index as usize].allocated_count -= 1;
                    self.free_blocks += 1;
                    true
                }
            }
            ReferenceStatus::Shared => {
                self.counters[slot] -= 1;
                false
            }
        };
        Ok(changed)
    }

    /// Block-map pages never dedupe: every successful path lands on the
    /// saturated maximum.
    fn increment_for_block_map(
        &mut self,
        block_index: u32,
        sbn: SlabBlockNumber,
        status: ReferenceStatus,
        lock: Option<&mut PbnLock>,
        normal_operation: bool,
    ) -> Result<bool> {
        let slot = sbn as usize;
        match status {
            ReferenceStatus::Free => {
                if normal_operation {
                    return Err(DvolError::RefCountInvalid {
                        slab: self.slab_number,
                        sbn,
                        detail: "incrementing unallocated block map block",
                    });
                }
                self.counters[slot] = MAXIMUM_REFERENCE_COUNT;
                self.blocks[block_index as usize].allocated_count += 1;
                self.free_blocks -= 1;
                Ok(true)
            }
            ReferenceStatus::Provisional => {
                if !normal_operation {
                    return Err(DvolError::RefCountInvalid {
                        slab: self.slab_number,
                        sbn,
                        detail: "block map block had provisional reference during replay",
                    });
                }
                self.counters[slot] = MAXIMUM_REFERENCE_COUNT;
                if let Some(lock) = lock {
                    lock.unassign_provisional_reference();
                }
                Ok(false)
            }
            ReferenceStatus::Single | ReferenceStatus::Shared => Err(DvolError::RefCountInvalid {
                slab: self.slab_number,
                sbn,
                detail: "incrementing a block map block which is already referenced",
            }),
        }
    }

    fn update_counter(
        &mut self,
        block_index: u32,
        sbn: SlabBlockNumber,
        point: Option<JournalPoint>,
        operation: JournalOperation,
        lock: Option<&mut PbnLock>,
        normal_operation: bool,
    ) -> Result<UpdateOutcome> {
        let status = reference_status(self.counters[sbn as usize]);
        let mut outcome = UpdateOutcome::default();

        match operation {
            JournalOperation::DataIncrement => {
                outcome.free_status_changed =
                    self.increment_for_data(block_index, sbn, status, lock)?;
            }
            JournalOperation::DataDecrement => {
                outcome.free_status_changed =
                    self.decrement_for_data(block_index, sbn, status, lock)?;
                if status == ReferenceStatus::Provisional {
                    outcome.provisional_decrement = true;
                }
            }
            JournalOperation::BlockMapIncrement => {
                outcome.free_status_changed = self.increment_for_block_map(
                    block_index,
                    sbn,
                    status,
                    lock,
                    normal_operation,
                )?;
            }
        }

        if let Some(point) = point {
            if point.is_valid() {
                self.slab_journal_point = point;
            }
        }
        Ok(outcome)
    }

    // ── Public adjustment entry points ──────────────────────────────────────

    /// Apply an adjustment journaled at `point`, coupling the containing
    /// reference block to the slab journal's per-sequence locks.
    pub fn adjust(
        &mut self,
        journal: &mut SlabJournal,
        operation: JournalOperation,
        pbn: PhysicalBlockNumber,
        lock: Option<&mut PbnLock>,
        point: JournalPoint,
    ) -> Result<bool> {
        let sbn = self.sbn_from_pbn(pbn)?;
        let block_index = Self::block_index_for(sbn);
        let outcome =
            self.update_counter(block_index, sbn, Some(point), operation, lock, true)?;
        if outcome.provisional_decrement {
            // Releasing a provisional reference does not dirty the block;
            // the counter was never confirmed on disk, so no reference-block
            // write will ever cover this entry. Drop its journal lock now.
            if point.is_valid() {
                journal.adjust_block_reference(point.sequence_number, -1)?;
            }
            return Ok(outcome.free_status_changed);
        }

        let block = &mut self.blocks[block_index as usize];
        if block.is_dirty && block.slab_journal_lock > 0 {
            // The block already pins an earlier sequence; both adjustments
            // flush together, so the newer entry's per-entry lock can be
            // released now.
            if !point.is_valid() {
                let err =
                    DvolError::Assertion("reference count adjustments need slab journal points");
                self.notifier.enter_read_only("refcounts", &err);
                return Err(err);
            }
            journal.adjust_block_reference(point.sequence_number, -1)?;
            return Ok(outcome.free_status_changed);
        }

        // First journaled update since the block was last clean: convert the
        // per-entry lock into an uncommitted reference-block lock.
        block.slab_journal_lock = if point.is_valid() {
            point.sequence_number
        } else {
            0
        };
        self.dirty_block(block_index);
        Ok(outcome.free_status_changed)
    }

    /// Apply an adjustment during offline rebuild: replay semantics, no
    /// journal point.
    pub fn adjust_for_rebuild(
        &mut self,
        pbn: PhysicalBlockNumber,
        operation: JournalOperation,
    ) -> Result<()> {
        let sbn = self.sbn_from_pbn(pbn)?;
        let block_index = Self::block_index_for(sbn);
        self.update_counter(block_index, sbn, None, operation, None, false)?;
        self.dirty_block(block_index);
        Ok(())
    }

    /// Replay one slab-journal entry. The entry is skipped when its sector's
    /// commit point already covers it, and applying the same entry twice is
    /// a no-op.
    pub fn replay(&mut self, entry: SlabJournalEntry, entry_point: JournalPoint) -> Result<()> {
        let block_index = Self::block_index_for(entry.sbn);
        let sector =
            (entry.sbn as usize % COUNTS_PER_BLOCK) / COUNTS_PER_SECTOR;
        if !self.blocks[block_index as usize].commit_points[sector].is_before(entry_point) {
            // Already reflected in the stored counts.
            return Ok(());
        }

        self.update_counter(
            block_index,
            entry.sbn,
            Some(entry_point),
            entry.operation,
            None,
            false,
        )?;
        self.blocks[block_index as usize].commit_points[sector] = entry_point;
        self.dirty_block(block_index);
        Ok(())
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    fn make_provisional(&mut self, index: u32) {
        self.counters[index as usize] = PROVISIONAL_REFERENCE_COUNT;
        self.blocks[Self::block_index_for(index) as usize].allocated_count += 1;
        self.free_blocks -= 1;
    }

    /// Find a free counter, transition it to provisional, and return its
    /// PBN. The search resumes at the cursor and wraps to the start of the
    /// slab exactly once before giving up.
    pub fn allocate(&mut self) -> Result<PhysicalBlockNumber> {
        let index = match self.search_reference_blocks() {
            Some(index) => index,
            None => {
                self.reset_search_cursor();
                self.search_reference_blocks().ok_or(DvolError::NoSpace)?
            }
        };

        debug_assert_eq!(
            self.counters[index as usize], EMPTY_REFERENCE_COUNT,
            "free block must have ref count of zero"
        );
        self.make_provisional(index);

        // The next search starts just past the block we handed out.
        self.search_cursor.index = index + 1;
        Ok(self.index_to_pbn(index))
    }

    /// Transition `pbn` to provisional if (and only if) it is free, binding
    /// `lock` as the provisional owner.
    pub fn provisionally_reference(
        &mut self,
        pbn: PhysicalBlockNumber,
        lock: Option<&mut PbnLock>,
    ) -> Result<()> {
        let sbn = self.sbn_from_pbn(pbn)?;
        if self.counters[sbn as usize] == EMPTY_REFERENCE_COUNT {
            self.make_provisional(sbn);
            if let Some(lock) = lock {
                lock.assign_provisional_reference();
            }
        }
        Ok(())
    }

    // ── Free-counter search ─────────────────────────────────────────────────

    fn reset_search_cursor(&mut self) {
        self.search_cursor.block = 0;
        self.search_cursor.index = 0;
        // A slab with a single reference block has a runt end index.
        self.search_cursor.end_index = (COUNTS_PER_BLOCK as u32).min(self.block_count);
    }

    fn advance_search_cursor(&mut self) -> bool {
        let last = self.reference_block_count - 1;
        if self.search_cursor.block == last {
            self.reset_search_cursor();
            return false;
        }

        self.search_cursor.block += 1;
        self.search_cursor.index = self.search_cursor.end_index;
        if self.search_cursor.block == last {
            // The last reference block is usually a runt.
            self.search_cursor.end_index = self.block_count;
        } else {
            self.search_cursor.end_index += COUNTS_PER_BLOCK as u32;
        }
        true
    }

    fn search_current_reference_block(&self) -> Option<u32> {
        // Skip blocks known to be full.
        let block = &self.blocks[self.search_cursor.block as usize];
        if block.allocated_count >= COUNTS_PER_BLOCK as u32 {
            return None;
        }
        find_free_counter(
            &self.counters,
            self.search_cursor.index,
            self.search_cursor.end_index,
        )
    }

    fn search_reference_blocks(&mut self) -> Option<u32> {
        if let Some(index) = self.search_current_reference_block() {
            return Some(index);
        }
        while self.advance_search_cursor() {
            if let Some(index) = self.search_current_reference_block() {
                return Some(index);
            }
        }
        None
    }

    // ── Dirtying and writeback ──────────────────────────────────────────────

    fn dirty_block(&mut self, block_index: u32) {
        let block = &mut self.blocks[block_index as usize];
        if block.is_dirty {
            return;
        }
        block.is_dirty = true;
        self.ever_dirtied = true;
        if block.is_writing {
            // Pending re-dirty: the write's completion re-enqueues it.
            return;
        }
        self.dirty_blocks.push_back(block_index);
    }

    /// Mark every reference block dirty (rebuild save path).
    pub fn dirty_all(&mut self) {
        for index in 0..self.reference_block_count {
            self.dirty_block(index);
        }
    }

    /// Mark all blocks dirty and pin each to slab-journal sequence 1
    /// (rebuild: the rewritten journal starts from scratch).
    pub fn acquire_dirty_block_locks(&mut self, journal: &mut SlabJournal) -> Result<()> {
        self.dirty_all();
        for block in &mut self.blocks {
            block.slab_journal_lock = 1;
        }
        journal.adjust_block_reference(1, i64::from(self.reference_block_count))
    }

    fn start_block_write(
        &mut self,
        block_index: u32,
        pool: &mut VioPool,
        device: &dyn BlockDevice,
        journal: &mut SlabJournal,
    ) -> Result<Option<VioHandle>> {
        if self.notifier.is_read_only() {
            return Ok(None);
        }
        let Some(handle) = pool.try_acquire()? else {
            // No carrier free: put the block back at the head so ordering
            // is preserved for the next save pass.
            self.dirty_blocks.push_front(block_index);
            return Ok(None);
        };

        let commit_point = self.slab_journal_point;
        // The journal entries covered by this block's commit point must be
        // durable before the counters that reflect them.
        if let Err(err) = journal.commit_through(device, commit_point) {
            pool.return_entry(handle)?;
            return Err(err);
        }

        let pbn = PhysicalBlockNumber(self.origin.0 + u64::from(block_index));
        let first = block_index as usize * COUNTS_PER_BLOCK;
        let last = first + self.counts_in_block(block_index) as usize;

        {
            let block = &mut self.blocks[block_index as usize];
            block.is_writing = true;
            block.slab_journal_lock_to_release = block.slab_journal_lock;
            // Clean from this moment: updates that land during the write
            // re-dirty the block and re-enqueue it on completion.
            block.is_dirty = false;
        }

        let packed = pack_reference_block(commit_point, &self.counters[first..last])?;
        let entry = pool.entry_mut(handle)?;
        entry.pbn = Some(pbn);
        entry.parent = Some(block_index);
        entry.buffer.copy_from_slice(&packed);

        if let Err(err) = device.write_block(pbn, &packed) {
            self.blocks[block_index as usize].is_writing = false;
            pool.return_entry(handle)?;
            self.notifier.enter_read_only("refcounts", &err);
            return Err(err);
        }
        self.statistics.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(Some(handle))
    }

    fn finish_block_write(
        &mut self,
        block_index: u32,
        handle: VioHandle,
        pool: &mut VioPool,
        journal: &mut SlabJournal,
    ) -> Result<()> {
        let lock = self.blocks[block_index as usize].slab_journal_lock_to_release;
        journal.adjust_block_reference(lock, -1)?;
        pool.return_entry(handle)?;

        // The writing flag clears only now: releasing the journal lock may
        // have re-dirtied the block, and it must not be double-enqueued.
        let block = &mut self.blocks[block_index as usize];
        block.is_writing = false;
        block.slab_journal_lock_to_release = 0;

        if self.notifier.is_read_only() {
            return Ok(());
        }
        if self.blocks[block_index as usize].is_dirty {
            self.dirty_blocks.push_back(block_index);
        }
        Ok(())
    }

    /// Write the oldest dirty reference block, if any.
    pub fn save_oldest_block(
        &mut self,
        pool: &mut VioPool,
        device: &dyn BlockDevice,
        journal: &mut SlabJournal,
    ) -> Result<()> {
        let Some(block_index) = self.dirty_blocks.pop_front() else {
            return Ok(());
        };
        match self.start_block_write(block_index, pool, device, journal)? {
            Some(handle) => self.finish_block_write(block_index, handle, pool, journal),
            None => Ok(()),
        }
    }

    /// Write `1 / flush_divisor` of the dirty blocks (at least one).
    pub fn save_several(
        &mut self,
        flush_divisor: usize,
        pool: &mut VioPool,
        device: &dyn BlockDevice,
        journal: &mut SlabJournal,
    ) -> Result<()> {
        let dirty = self.dirty_blocks.len();
        if dirty == 0 {
            return Ok(());
        }
        let to_write = (dirty / flush_divisor.max(1)).max(1);
        for _ in 0..to_write {
            self.save_oldest_block(pool, device, journal)?;
        }
        Ok(())
    }

    /// Flush every dirty reference block.
    pub fn save_all(
        &mut self,
        pool: &mut VioPool,
        device: &dyn BlockDevice,
        journal: &mut SlabJournal,
    ) -> Result<()> {
        while !self.dirty_blocks.is_empty() {
            let pending = self.dirty_blocks.len();
            self.save_oldest_block(pool, device, journal)?;
            if self.dirty_blocks.len() >= pending {
                // Pool exhausted with nothing in flight to hand entries back.
                return Err(DvolError::Assertion("reference block save made no progress"));
            }
        }
        Ok(())
    }

    // ── Load and reset ──────────────────────────────────────────────────────

    /// Load all reference blocks from disk. Torn sectors are logged and the
    /// latest commit point wins; provisional counters were never confirmed
    /// and are reset to free.
    pub fn load(&mut self, pool: &mut VioPool, device: &dyn BlockDevice) -> Result<()> {
        self.free_blocks = BlockCount::from(self.block_count);
        for block_index in 0..self.reference_block_count {
            let Some(handle) = pool.try_acquire()? else {
                let err = DvolError::Assertion("metadata pool exhausted during load");
                self.notifier.enter_read_only("refcounts", &err);
                return Err(err);
            };
            let result = self.load_one_block(block_index, handle, pool, device);
            pool.return_entry(handle)?;
            result?;
        }
        self.reset_search_cursor();
        Ok(())
    }

    fn load_one_block(
        &mut self,
        block_index: u32,
        handle: VioHandle,
        pool: &mut VioPool,
        device: &dyn BlockDevice,
    ) -> Result<()> {
        let pbn = PhysicalBlockNumber(self.origin.0 + u64::from(block_index));
        let raw = match device.read_block(pbn) {
            Ok(raw) => raw,
            Err(err) => {
                self.notifier.enter_read_only("refcounts", &err);
                return Err(err);
            }
        };
        let entry = pool.entry_mut(handle)?;
        entry.pbn = Some(pbn);
        entry.buffer.copy_from_slice(raw.as_slice());
        let unpacked = unpack_reference_block(&entry.buffer)?;

        for sector in unpacked.torn_sectors() {
            warn!(
                target: "dvol::slab::refcounts",
                slab = self.slab_number,
                block = block_index,
                sector,
                "torn write detected in reference block sector"
            );
        }
        let latest = unpacked.latest_commit_point();
        if self.slab_journal_point.is_before(latest) {
            self.slab_journal_point = latest;
        }

        let first = block_index as usize * COUNTS_PER_BLOCK;
        let live = self.counts_in_block(block_index) as usize;
        self.counters[first..first + live].copy_from_slice(&unpacked.counters[..live]);

        let block = &mut self.blocks[block_index as usize];
        block.commit_points = unpacked.commit_points;

        // Provisional counters found on disk lost their owner in the crash.
        let mut allocated = 0_u32;
        for counter in &mut self.counters[first..first + live] {
            if *counter == PROVISIONAL_REFERENCE_COUNT {
                *counter = EMPTY_REFERENCE_COUNT;
            }
            if *counter != EMPTY_REFERENCE_COUNT {
                allocated += 1;
            }
        }
        self.blocks[block_index as usize].allocated_count = allocated;
        self.free_blocks -= BlockCount::from(allocated);
        Ok(())
    }

    /// Reset every counter to free and drop all bookkeeping.
    pub fn reset(&mut self) {
        self.counters.fill(EMPTY_REFERENCE_COUNT);
        self.free_blocks = BlockCount::from(self.block_count);
        self.slab_journal_point = JournalPoint::default();
        for block in &mut self.blocks {
            *block = ReferenceBlockState::new();
        }
        self.dirty_blocks.clear();
        self.ever_dirtied = false;
        self.reset_search_cursor();
    }
}

// ── Zero-byte word scan ─────────────────────────────────────────────────────

fn load_le_word(counters: &[u8], index: usize) -> u64 {
    let mut word = 0_u64;
    for (shift, byte) in counters[index..index + BYTES_PER_WORD].iter().enumerate() {
        word |= u64::from(*byte) << (8 * shift);
    }
    word
}

/// Branch-free detection of a zero byte in eight packed counters.
fn word_has_zero_byte(word: u64) -> bool {
    (word.wrapping_sub(0x0101_0101_0101_0101) & !word & 0x8080_8080_8080_8080) != 0
}

/// First index in `[index, index + 8)` holding zero, if it is below `end`.
fn zero_byte_in_word(counters: &[u8], index: usize, end: usize) -> Option<usize> {
    let mut word = load_le_word(counters, index);
    for offset in 0..BYTES_PER_WORD {
        if word & 0xFF == 0 {
            let found = index + offset;
            return (found < end).then_some(found);
        }
        word >>= 8;
    }
    None
}

/// Find the first zero counter in `[start, end)`. The array must carry at
/// least a word of padding past `end` so whole-word reads stay in bounds.
#[must_use]
pub fn find_free_counter(counters: &[u8], start: u32, end: u32) -> Option<u32> {
    let end = end as usize;
    let mut next = start as usize;
    if next >= end {
        return None;
    }

    // Check every byte of the first (possibly unaligned) word.
    if let Some(found) = zero_byte_in_word(counters, next, end) {
        return u32::try_from(found).ok();
    }

    next += BYTES_PER_WORD;
    while next < end {
        let word = load_le_word(counters, next);
        if word_has_zero_byte(word) {
            // The first zero byte may still be past the live range.
            return zero_byte_in_word(counters, next, end)
                .and_then(|found| u32::try_from(found).ok());
        }
        next += BYTES_PER_WORD;
    }
    None
}
