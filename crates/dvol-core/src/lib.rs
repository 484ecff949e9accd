#![forbid(unsafe_code)]
//! Volume binding: geometry, slabs, summary, block map, and recovery
//! journal assembled into one open volume.
//!
//! The volume owns the write-side orchestration the external request
//! pipeline drives: allocate a block (provisional), install the logical
//! mapping, confirm the reference, decrement the displaced mapping. It also
//! owns formatting and the clean-shutdown save sequence the offline audit
//! depends on.

use dvol_block::{BlockDevice, VioPool};
use dvol_blockmap::{BlockMap, TreePageAllocator};
use dvol_error::{DvolError, Result};
use dvol_journal::RecoveryJournal;
use dvol_ondisk::{
    BlockMapEntry, BlockMapPage, BlockMapPageHeader, Region, SlabConfig, VolumeGeometry,
    hint_shift_for,
};
use dvol_slab::{
    AdminState, ReadOnlyNotifier, ReadOnlySink, RefCountStatistics, Slab, SlabSummaryZone,
};
use dvol_types::{
    BlockCount, COUNTS_PER_BLOCK, JournalOperation, LogicalBlockNumber, MappingState,
    PhysicalBlockNumber, SlabCount, ZoneCount, block_count_for,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Metadata I/O carriers per volume; sized for one zone's writeback.
const VIO_POOL_SIZE: usize = 4;

/// Parameters for formatting a new volume.
#[derive(Debug, Clone)]
pub struct VolumeConfig {
    pub nonce: u64,
    pub slab_count: SlabCount,
    /// Slabs are `2^slab_size_shift` blocks.
    pub slab_size_shift: u8,
    pub logical_blocks: BlockCount,
    pub logical_zone_count: ZoneCount,
    pub index_blocks: BlockCount,
    pub recovery_journal_blocks: BlockCount,
    pub slab_journal_blocks: BlockCount,
}

impl VolumeConfig {
    /// A small-volume configuration with sensible region sizes.
    #[must_use]
    pub fn new(nonce: u64, slab_count: SlabCount, slab_size_shift: u8) -> Self {
        Self {
            nonce,
            slab_count,
            slab_size_shift,
            logical_blocks: 1 << 20,
            logical_zone_count: 1,
            index_blocks: 8,
            recovery_journal_blocks: 8,
            slab_journal_blocks: 2,
        }
    }
}

/// Compute the fixed layout for a configuration.
pub fn compute_geometry(config: &VolumeConfig) -> Result<VolumeGeometry> {
    if config.logical_zone_count == 0 || config.slab_count == 0 {
        return Err(DvolError::Assertion("volume needs at least one zone and one slab"));
    }
    let slab_blocks: BlockCount = 1 << config.slab_size_shift;
    if config.slab_journal_blocks >= slab_blocks {
        return Err(DvolError::Assertion("slab journal cannot fill the slab"));
    }

    // Split the slab into data, reference, and journal blocks: R must cover
    // exactly the data region, so grow R until the split is stable.
    let journal_blocks = config.slab_journal_blocks;
    let mut reference_blocks = 1;
    let data_blocks = loop {
        let data = slab_blocks - journal_blocks - reference_blocks;
        let needed = block_count_for(data, COUNTS_PER_BLOCK as u64);
        if needed <= reference_blocks {
            break data;
        }
        reference_blocks = needed;
    };

    let index_start = 1_u64;
    let recovery_start = index_start + config.index_blocks;
    let summary_start = recovery_start + config.recovery_journal_blocks;
    let summary_blocks = SlabSummaryZone::blocks_needed(config.slab_count).max(1);
    let roots_start = summary_start + summary_blocks;
    let slab_origin = roots_start + BlockCount::from(config.logical_zone_count);

    Ok(VolumeGeometry {
        nonce: config.nonce,
        logical_blocks: config.logical_blocks,
        logical_zone_count: config.logical_zone_count,
        physical_zone_count: 1,
        hint_shift: hint_shift_for(config.slab_size_shift),
        slab_size_shift: config.slab_size_shift,
        slab_count: config.slab_count,
        slab_origin: PhysicalBlockNumber(slab_origin),
        slab_config: SlabConfig {
            data_blocks,
            reference_blocks,
            journal_blocks,
        },
        index_region: Region {
            start: PhysicalBlockNumber(index_start),
            blocks: config.index_blocks,
        },
        recovery_journal: Region {
            start: PhysicalBlockNumber(recovery_start),
            blocks: config.recovery_journal_blocks,
        },
        summary: Region {
            start: PhysicalBlockNumber(summary_start),
            blocks: summary_blocks,
        },
        block_map_roots: (0..u64::from(config.logical_zone_count))
            .map(|zone| PhysicalBlockNumber(roots_start + zone))
            .collect(),
    })
}

/// An open volume.
pub struct Volume<D: BlockDevice> {
    device: D,
    geometry: VolumeGeometry,
    state: AdminState,
    notifier: ReadOnlyNotifier,
    sink: ReadOnlySink,
    pool: VioPool,
    statistics: Arc<RefCountStatistics>,
    summary: SlabSummaryZone,
    slabs: Vec<Slab>,
    block_map: BlockMap,
    recovery_journal: RecoveryJournal,
}

impl<D: BlockDevice> std::fmt::Debug for Volume<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("slab_count", &self.geometry.slab_count)
            .field("logical_blocks", &self.geometry.logical_blocks)
            .field("read_only", &self.notifier.is_read_only())
            .finish()
    }
}

impl<D: BlockDevice> Volume<D> {
    fn assemble(device: D, geometry: VolumeGeometry) -> Result<Self> {
        let (notifier, sink) = ReadOnlyNotifier::new();
        let statistics = Arc::new(RefCountStatistics::default());
        let mut slabs = Vec::with_capacity(usize::from(geometry.slab_count));
        for slab_number in 0..geometry.slab_count {
            slabs.push(Slab::new(
                &geometry,
                slab_number,
                notifier.clone(),
                Arc::clone(&statistics),
            )?);
        }
        let summary = SlabSummaryZone::new_pristine(
            0,
            geometry.hint_shift,
            geometry.summary.start,
            geometry.slab_count,
            geometry.slab_config.data_blocks,
            notifier.clone(),
        )?;
        let block_map = BlockMap::new(geometry.nonce, geometry.block_map_roots.clone());
        let recovery_journal = RecoveryJournal::new(geometry.nonce, geometry.recovery_journal);
        Ok(Self {
            device,
            geometry,
            state: AdminState::Normal,
            notifier,
            sink,
            pool: VioPool::new(VIO_POOL_SIZE),
            statistics,
            summary,
            slabs,
            block_map,
            recovery_journal,
        })
    }

    /// Format a fresh volume onto `device` and return it open.
    pub fn format(device: D, config: &VolumeConfig) -> Result<Self> {
        let geometry = compute_geometry(config)?;
        if device.block_count() < geometry.physical_end().0 {
            return Err(DvolError::OutOfRange {
                pbn: geometry.physical_end().0,
            });
        }
        info!(
            target: "dvol::core",
            slabs = geometry.slab_count,
            slab_blocks = geometry.slab_blocks(),
            data_blocks = geometry.slab_config.data_blocks,
            "formatting volume"
        );

        device.write_block(PhysicalBlockNumber(0), &geometry.encode()?)?;
        for root in &geometry.block_map_roots {
            let page = BlockMapPage::new(BlockMapPageHeader {
                pbn: *root,
                nonce: geometry.nonce,
                recovery_sequence: 0,
                generation: 0,
            });
            device.write_block(*root, &page.encode()?)?;
        }

        let mut volume = Self::assemble(device, geometry)?;
        volume.summary.flush(&volume.device)?;
        volume.recovery_journal.save(&volume.device)?;
        volume.device.flush()?;
        Ok(volume)
    }

    /// Open an existing volume, loading summary, journal state, and the
    /// reference counts of every used slab.
    pub fn open(device: D) -> Result<Self> {
        let geometry = VolumeGeometry::decode(device.read_block(PhysicalBlockNumber(0))?.as_slice())?;
        let mut volume = Self::assemble(device, geometry)?;
        volume.summary = SlabSummaryZone::load(
            0,
            volume.geometry.hint_shift,
            volume.geometry.summary.start,
            volume.geometry.slab_count,
            &volume.device,
            volume.notifier.clone(),
        )?;
        volume.recovery_journal = RecoveryJournal::load(
            &volume.device,
            volume.geometry.nonce,
            volume.geometry.recovery_journal,
        )?;

        for slab in &mut volume.slabs {
            // Counters load on demand: only slabs marked must-load were
            // ever written.
            slab.drain(
                AdminState::Scrubbing,
                &mut volume.pool,
                &volume.device,
                &mut volume.summary,
            )?;
            slab.resume();
        }
        debug!(
            target: "dvol::core",
            logical_blocks_used = volume.recovery_journal.logical_blocks_used(),
            "volume opened"
        );
        Ok(volume)
    }

    // ── Observers ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn recovery_journal(&self) -> &RecoveryJournal {
        &self.recovery_journal
    }

    #[must_use]
    pub fn summary(&self) -> &SlabSummaryZone {
        &self.summary
    }

    #[must_use]
    pub fn slab(&self, slab_number: SlabCount) -> &Slab {
        &self.slabs[usize::from(slab_number)]
    }

    #[must_use]
    pub fn statistics(&self) -> &RefCountStatistics {
        &self.statistics
    }

    /// Drain pending read-only events (testing and diagnostics).
    pub fn read_only_events(&self) -> Vec<dvol_slab::ReadOnlyEvent> {
        self.sink.drain()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.notifier.is_read_only()
    }

    /// Look up one logical mapping.
    pub fn read_mapping(
        &self,
        lbn: LogicalBlockNumber,
    ) -> Result<(PhysicalBlockNumber, MappingState)> {
        self.check_lbn(lbn)?;
        self.block_map.find_mapping(&self.device, lbn)
    }

    fn check_lbn(&self, lbn: LogicalBlockNumber) -> Result<()> {
        if lbn.0 >= self.geometry.logical_blocks {
            return Err(DvolError::OutOfRange { pbn: lbn.0 });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
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

    fn slab_for(&mut self, pbn: PhysicalBlockNumber) -> Result<&mut Slab> {
        let slab_number = self.geometry.slab_number(pbn)?;
        Ok(&mut self.slabs[usize::from(slab_number)])
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    /// Allocate an unreferenced data block, choosing the candidate slab by
    /// its summary free-block hint and falling back across the rest.
    pub fn allocate_block(&mut self) -> Result<PhysicalBlockNumber> {
        self.check_writable()?;
        let mut order: Vec<SlabCount> = (0..self.geometry.slab_count).collect();
        order.sort_by_key(|slab| std::cmp::Reverse(self.summary.approximate_free_blocks(*slab)));

        for slab_number in order {
            match self.slabs[usize::from(slab_number)].allocate() {
                Ok(pbn) => return Ok(pbn),
                Err(DvolError::NoSpace) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DvolError::NoSpace)
    }

    // ── Mapping pipeline ────────────────────────────────────────────────────

    /// Install `lbn -> (pbn, state)`: journal the change, update the block
    /// map (allocating interior pages as needed), confirm the new block's
    /// reference, and release the displaced one.
    pub fn map_logical_block(
        &mut self,
        lbn: LogicalBlockNumber,
        pbn: PhysicalBlockNumber,
        state: MappingState,
    ) -> Result<()> {
        self.check_writable()?;
        self.check_lbn(lbn)?;
        if state.is_unmapped() {
            return Err(DvolError::Assertion("mapping state must map a block"));
        }
        // Data mappings may only target slab data blocks.
        self.geometry.slab_block_number(pbn)?;

        let old = self.block_map.find_mapping(&self.device, lbn)?;
        let was_mapped = !old.1.is_unmapped();

        let point = self.recovery_journal.record_mapping_change(was_mapped, true);
        {
            let mut allocator = SlabTreeAllocator {
                slabs: &mut self.slabs,
                recovery_journal: &mut self.recovery_journal,
            };
            self.block_map.put_mapping(
                &self.device,
                &mut allocator,
                lbn,
                BlockMapEntry { pbn, state },
                point.sequence_number,
            )?;
        }

        // Remapping an LBN onto the block it already references (a state
        // change) moves no references.
        let same_block = was_mapped && old.0 == pbn;
        if !same_block {
            self.slab_for(pbn)?
                .adjust_reference_count(JournalOperation::DataIncrement, pbn, None)?;
            if was_mapped && !old.0.is_zero() {
                self.slab_for(old.0)?
                    .adjust_reference_count(JournalOperation::DataDecrement, old.0, None)?;
            }
        }
        Ok(())
    }

    /// Remove the mapping for `lbn`, releasing its block's reference.
    pub fn unmap_logical_block(
        &mut self,
        lbn: LogicalBlockNumber,
    ) -> Result<Option<PhysicalBlockNumber>> {
        self.check_writable()?;
        self.check_lbn(lbn)?;
        let old = self.block_map.find_mapping(&self.device, lbn)?;
        if old.1.is_unmapped() {
            return Ok(None);
        }

        let point = self.recovery_journal.record_mapping_change(true, false);
        {
            let mut allocator = SlabTreeAllocator {
                slabs: &mut self.slabs,
                recovery_journal: &mut self.recovery_journal,
            };
            self.block_map.put_mapping(
                &self.device,
                &mut allocator,
                lbn,
                BlockMapEntry::unmapped(),
                point.sequence_number,
            )?;
        }

        if !old.0.is_zero() {
            self.slab_for(old.0)?
                .adjust_reference_count(JournalOperation::DataDecrement, old.0, None)?;
        }
        Ok(Some(old.0))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Clean shutdown: drain every slab, flush the summary and journal
    /// state, and sync the device. The volume is left suspended.
    pub fn save_all(&mut self) -> Result<()> {
        self.state = AdminState::Saving;
        for slab in &mut self.slabs {
            slab.drain(
                AdminState::Saving,
                &mut self.pool,
                &self.device,
                &mut self.summary,
            )?;
        }
        self.summary.flush(&self.device)?;
        self.recovery_journal.save(&self.device)?;
        self.device.flush()?;
        self.pool.check_idle()
    }

    /// Reopen the volume and its slabs after a save.
    pub fn resume(&mut self) {
        self.state = AdminState::Normal;
        for slab in &mut self.slabs {
            slab.resume();
        }
    }
}

/// Tree pages come out of the slabs like data, but saturated so they never
/// dedupe and never look free.
struct SlabTreeAllocator<'a> {
    slabs: &'a mut [Slab],
    recovery_journal: &'a mut RecoveryJournal,
}

impl TreePageAllocator for SlabTreeAllocator<'_> {
    fn allocate_tree_page(&mut self) -> Result<PhysicalBlockNumber> {
        for slab in self.slabs.iter_mut() {
            match slab.allocate() {
                Ok(pbn) => {
                    slab.adjust_reference_count(
                        JournalOperation::BlockMapIncrement,
                        pbn,
                        None,
                    )?;
                    self.recovery_journal.record_block_map_allocation();
                    return Ok(pbn);
                }
                Err(DvolError::NoSpace) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DvolError::NoSpace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvol_block::{ByteBlockDevice, MemByteDevice};
    use dvol_types::{BLOCK_SIZE, MAXIMUM_REFERENCE_COUNT};

    fn test_device(blocks: u64) -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(MemByteDevice::new(blocks * BLOCK_SIZE as u64))
    }

    fn small_volume() -> Volume<ByteBlockDevice<MemByteDevice>> {
        let config = VolumeConfig::new(0x5EED, 2, 8);
        let geometry = compute_geometry(&config).unwrap();
        Volume::format(test_device(geometry.physical_end().0 + 1), &config).unwrap()
    }

    #[test]
    fn geometry_split_is_exact() {
        let config = VolumeConfig::new(1, 4, 8);
        let geometry = compute_geometry(&config).unwrap();
        let slab = geometry.slab_config;
        assert_eq!(
            slab.data_blocks + slab.reference_blocks + slab.journal_blocks,
            256
        );
        assert_eq!(
            slab.reference_blocks,
            block_count_for(slab.data_blocks, COUNTS_PER_BLOCK as u64)
        );

        // A slab big enough to need several reference blocks.
        let config = VolumeConfig::new(1, 1, 14);
        let geometry = compute_geometry(&config).unwrap();
        let slab = geometry.slab_config;
        assert_eq!(
            slab.data_blocks + slab.reference_blocks + slab.journal_blocks,
            1 << 14
        );
        assert_eq!(
            slab.reference_blocks,
            block_count_for(slab.data_blocks, COUNTS_PER_BLOCK as u64)
        );
    }

    #[test]
    fn format_then_open_round_trips_geometry() {
        let config = VolumeConfig::new(0xABCD, 2, 8);
        let geometry = compute_geometry(&config).unwrap();
        let device = test_device(geometry.physical_end().0 + 1);
        let volume = Volume::format(device, &config).unwrap();
        let geometry = volume.geometry().clone();
        drop(volume);

        // Re-open over the same backing store.
        let raw = geometry.encode().unwrap();
        let device = test_device(geometry.physical_end().0 + 1);
        device.write_block(PhysicalBlockNumber(0), &raw).unwrap();
        let reopened = Volume::open(device).unwrap();
        assert_eq!(reopened.geometry(), &geometry);
    }

    #[test]
    fn allocate_map_read_back() {
        let mut volume = small_volume();
        let pbn = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(7), pbn, MappingState::Mapped)
            .unwrap();

        let (read_pbn, state) = volume.read_mapping(LogicalBlockNumber(7)).unwrap();
        assert_eq!(read_pbn, pbn);
        assert_eq!(state, MappingState::Mapped);
        assert_eq!(volume.recovery_journal().logical_blocks_used(), 1);

        // The data block is confirmed; tree pages are saturated.
        let slab0 = volume.slab(0);
        let sbn = (pbn.0 - slab0.start().0) as usize;
        assert_eq!(slab0.ref_counts().counters()[sbn], 1);
        let saturated = slab0
            .ref_counts()
            .counters()
            .iter()
            .filter(|count| **count == MAXIMUM_REFERENCE_COUNT)
            .count();
        assert_eq!(saturated, 4, "one interior page per tree level");
    }

    #[test]
    fn remap_releases_previous_block() {
        let mut volume = small_volume();
        let first = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(0), first, MappingState::Mapped)
            .unwrap();
        let second = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(0), second, MappingState::Mapped)
            .unwrap();

        assert_eq!(volume.recovery_journal().logical_blocks_used(), 1);
        let slab0 = volume.slab(0);
        let first_sbn = (first.0 - slab0.start().0) as usize;
        let second_sbn = (second.0 - slab0.start().0) as usize;
        assert_eq!(slab0.ref_counts().counters()[first_sbn], 0);
        assert_eq!(slab0.ref_counts().counters()[second_sbn], 1);
    }

    #[test]
    fn unmap_frees_and_clears() {
        let mut volume = small_volume();
        let pbn = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(3), pbn, MappingState::Mapped)
            .unwrap();
        assert_eq!(volume.unmap_logical_block(LogicalBlockNumber(3)).unwrap(), Some(pbn));
        assert_eq!(volume.recovery_journal().logical_blocks_used(), 0);

        let (read_pbn, state) = volume.read_mapping(LogicalBlockNumber(3)).unwrap();
        assert!(state.is_unmapped());
        assert!(read_pbn.is_zero());

        // Unmapping twice is a no-op.
        assert_eq!(volume.unmap_logical_block(LogicalBlockNumber(3)).unwrap(), None);
    }

    #[test]
    fn dedup_style_remap_shares_a_block() {
        let mut volume = small_volume();
        let pbn = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(1), pbn, MappingState::Mapped)
            .unwrap();
        // A second logical block referencing the same physical block.
        volume
            .map_logical_block(LogicalBlockNumber(2), pbn, MappingState::Mapped)
            .unwrap();

        assert_eq!(volume.recovery_journal().logical_blocks_used(), 2);
        let slab0 = volume.slab(0);
        let sbn = (pbn.0 - slab0.start().0) as usize;
        assert_eq!(slab0.ref_counts().counters()[sbn], 2);
    }

    #[test]
    fn mapping_to_metadata_blocks_is_rejected() {
        let mut volume = small_volume();
        let reference_block = volume.geometry().reference_block_origin(0);
        assert!(matches!(
            volume.map_logical_block(LogicalBlockNumber(0), reference_block, MappingState::Mapped),
            Err(DvolError::OutOfRange { .. })
        ));
        assert!(matches!(
            volume.map_logical_block(
                LogicalBlockNumber(0),
                PhysicalBlockNumber(0),
                MappingState::Mapped
            ),
            Err(DvolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn save_then_open_restores_counts() {
        let config = VolumeConfig::new(0xF00D, 2, 8);
        let geometry = compute_geometry(&config).unwrap();
        let blocks = geometry.physical_end().0 + 1;

        let backing = MemByteDevice::new(blocks * BLOCK_SIZE as u64);
        let mut volume = Volume::format(ByteBlockDevice::new(backing), &config).unwrap();
        let pbn = volume.allocate_block().unwrap();
        volume
            .map_logical_block(LogicalBlockNumber(9), pbn, MappingState::Mapped)
            .unwrap();
        volume.save_all().unwrap();

        // Clone the backing bytes into a fresh device, as if reattaching.
        let snapshot = volume.device().inner().contents();
        let device = ByteBlockDevice::new(MemByteDevice::new(blocks * BLOCK_SIZE as u64));
        device.inner().patch(0, &snapshot);

        let reopened = Volume::open(device).unwrap();
        assert_eq!(reopened.recovery_journal().logical_blocks_used(), 1);
        assert!(reopened.summary().must_load(0));
        let slab0 = reopened.slab(0);
        let sbn = (pbn.0 - slab0.start().0) as usize;
        assert_eq!(slab0.ref_counts().counters()[sbn], 1);
        let (read_pbn, _) = reopened.read_mapping(LogicalBlockNumber(9)).unwrap();
        assert_eq!(read_pbn, pbn);
    }

    #[test]
    fn allocation_prefers_fuller_hints_then_falls_back() {
        let mut volume = small_volume();
        // Exhaust slab 0's data blocks.
        let data_blocks = volume.geometry().slab_config.data_blocks;
        for _ in 0..data_blocks {
            volume.slabs[0].allocate().unwrap();
        }
        // The next allocation falls over to slab 1.
        let pbn = volume.allocate_block().unwrap();
        assert_eq!(volume.geometry().slab_number(pbn).unwrap(), 1);
    }

    #[test]
    fn saving_volume_rejects_new_mappings() {
        let mut volume = small_volume();
        let pbn = volume.allocate_block().unwrap();
        volume.save_all().unwrap();
        assert!(matches!(
            volume.map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped),
            Err(DvolError::InvalidAdminState { .. })
        ));
        volume.resume();
        volume
            .map_logical_block(LogicalBlockNumber(0), pbn, MappingState::Mapped)
            .unwrap();
    }
}
