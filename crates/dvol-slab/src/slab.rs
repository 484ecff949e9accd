//! A slab: one physical region's reference counts, journal, and admin
//! state, bound together under single-writer zone ownership.

use crate::admin::AdminState;
use crate::journal::SlabJournal;
use crate::pbn_lock::PbnLock;
use crate::readonly::ReadOnlyNotifier;
use crate::refcounts::{RefCountStatistics, RefCounts};
use crate::summary::SlabSummaryZone;
use dvol_block::{BlockDevice, VioPool};
use dvol_error::{DvolError, Result};
use dvol_ondisk::{Region, SlabJournalEntry, VolumeGeometry};
use dvol_types::{
    BlockCount, JournalOperation, JournalPoint, PhysicalBlockNumber, SlabCount,
};
use std::sync::Arc;
use tracing::debug;

/// One slab of the physical space.
#[derive(Debug)]
pub struct Slab {
    slab_number: SlabCount,
    state: AdminState,
    start: PhysicalBlockNumber,
    ref_counts: RefCounts,
    journal: SlabJournal,
    notifier: ReadOnlyNotifier,
}

impl Slab {
    /// Build the in-memory state for one slab of `geometry`.
    pub fn new(
        geometry: &VolumeGeometry,
        slab_number: SlabCount,
        notifier: ReadOnlyNotifier,
        statistics: Arc<RefCountStatistics>,
    ) -> Result<Self> {
        let start = geometry.slab_origin_of(slab_number);
        let data_blocks = u32::try_from(geometry.slab_config.data_blocks)
            .map_err(|_| DvolError::Assertion("slab data region exceeds counter addressing"))?;
        let ref_counts = RefCounts::new(
            slab_number,
            start,
            geometry.reference_block_origin(slab_number),
            data_blocks,
            notifier.clone(),
            statistics,
        );
        let journal = SlabJournal::new(
            slab_number,
            geometry.nonce,
            Region {
                start: geometry.slab_journal_origin(slab_number),
                blocks: geometry.slab_config.journal_blocks,
            },
            notifier.clone(),
        );
        Ok(Self {
            slab_number,
            state: AdminState::Normal,
            start,
            ref_counts,
            journal,
            notifier,
        })
    }

    #[must_use]
    pub fn slab_number(&self) -> SlabCount {
        self.slab_number
    }

    #[must_use]
    pub fn start(&self) -> PhysicalBlockNumber {
        self.start
    }

    #[must_use]
    pub fn state(&self) -> AdminState {
        self.state
    }

    #[must_use]
    pub fn ref_counts(&self) -> &RefCounts {
        &self.ref_counts
    }

    #[must_use]
    pub fn journal(&self) -> &SlabJournal {
        &self.journal
    }

    #[must_use]
    pub fn free_block_count(&self) -> BlockCount {
        self.ref_counts.free_block_count()
    }

    fn check_open(&self) -> Result<()> {
        if self.notifier.is_read_only() {
            return Err(DvolError::ReadOnly);
        }
        if !self.state.is_open() {
            return Err(DvolError::InvalidAdminState {
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Journal and apply one reference-count adjustment.
    pub fn adjust_reference_count(
        &mut self,
        operation: JournalOperation,
        pbn: PhysicalBlockNumber,
        lock: Option<&mut PbnLock>,
    ) -> Result<bool> {
        self.check_open()?;
        let sbn = self.ref_counts.sbn_from_pbn(pbn)?;
        let point = self.journal.append(sbn, operation)?;
        self.ref_counts
            .adjust(&mut self.journal, operation, pbn, lock, point)
    }

    /// Allocate a free block, leaving it provisionally referenced.
    pub fn allocate(&mut self) -> Result<PhysicalBlockNumber> {
        self.check_open()?;
        self.ref_counts.allocate()
    }

    /// Pin `pbn` provisionally if it is currently free.
    pub fn provisionally_reference(
        &mut self,
        pbn: PhysicalBlockNumber,
        lock: Option<&mut PbnLock>,
    ) -> Result<()> {
        self.check_open()?;
        self.ref_counts.provisionally_reference(pbn, lock)
    }

    /// Replay one slab-journal entry against the counters.
    pub fn replay_entry(
        &mut self,
        entry: SlabJournalEntry,
        point: JournalPoint,
    ) -> Result<()> {
        self.ref_counts.replay(entry, point)
    }

    /// Move to `target` and drain per its semantics: loading counts for a
    /// scrub, or committing the journal and flushing dirty counts for a
    /// save. The summary entry is refreshed when the slab saves.
    pub fn drain(
        &mut self,
        target: AdminState,
        pool: &mut VioPool,
        device: &dyn BlockDevice,
        summary: &mut SlabSummaryZone,
    ) -> Result<()> {
        debug!(
            target: "dvol::slab",
            slab = self.slab_number,
            from = %self.state,
            to = %target,
            "slab drain"
        );
        self.state = target;

        let save = match target {
            AdminState::Scrubbing => {
                if summary.must_load(self.slab_number) {
                    self.ref_counts.load(pool, device)?;
                }
                return Ok(());
            }
            AdminState::SaveForScrubbing => {
                if !summary.must_load(self.slab_number) {
                    // Never written: force everything out.
                    self.ref_counts.dirty_all();
                }
                true
            }
            AdminState::Rebuilding => {
                self.ref_counts.dirty_all();
                true
            }
            AdminState::Saving => true,
            AdminState::Recovering | AdminState::Suspending => false,
            _ => return Ok(()),
        };

        if save {
            self.journal.commit_all(device)?;
            self.ref_counts.save_all(pool, device, &mut self.journal)?;
            summary.update(
                self.slab_number,
                self.journal.tail_block_offset(),
                self.ref_counts.ever_dirtied(),
                true,
                self.ref_counts.free_block_count(),
            )?;
        }
        Ok(())
    }

    /// Reopen after a drain (resume).
    pub fn resume(&mut self) {
        self.state = AdminState::Normal;
    }

    /// Whether all reference-count I/O has settled.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.ref_counts.is_clean()
    }
}
