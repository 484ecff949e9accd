//! Per-zone slab summary.
//!
//! A dense array of two-byte entries, one per slab, sharded so each zone
//! owns and writes its own region. Updates are buffered per sector; a flush
//! rewrites only the blocks whose sectors changed. Readers get the
//! `must_load` bit (pristine versus used slab) and a free-count
//! approximation good to `2^hint_shift` blocks.

use crate::readonly::ReadOnlyNotifier;
use dvol_block::BlockDevice;
use dvol_error::Result;
use dvol_ondisk::{
    SUMMARY_ENTRIES_PER_BLOCK, SUMMARY_ENTRIES_PER_SECTOR, SlabSummaryEntry,
    approximate_free_blocks, compute_free_block_hint,
};
use dvol_types::{BLOCK_SIZE, BlockCount, PhysicalBlockNumber, SlabCount, ZoneCount};
use std::collections::BTreeSet;
use tracing::debug;

/// One zone's shard of the slab summary.
#[derive(Debug)]
pub struct SlabSummaryZone {
    zone: ZoneCount,
    hint_shift: u8,
    origin: PhysicalBlockNumber,
    entries: Vec<SlabSummaryEntry>,
    dirty_sectors: BTreeSet<usize>,
    notifier: ReadOnlyNotifier,
}

impl SlabSummaryZone {
    /// Blocks one zone's shard occupies for `slab_count` slabs.
    #[must_use]
    pub fn blocks_needed(slab_count: SlabCount) -> BlockCount {
        (usize::from(slab_count).div_ceil(SUMMARY_ENTRIES_PER_BLOCK)) as BlockCount
    }

    /// A shard for a freshly formatted volume: every slab pristine and
    /// clean, hints covering the whole data region.
    pub fn new_pristine(
        zone: ZoneCount,
        hint_shift: u8,
        origin: PhysicalBlockNumber,
        slab_count: SlabCount,
        data_blocks: BlockCount,
        notifier: ReadOnlyNotifier,
    ) -> Result<Self> {
        let entry = SlabSummaryEntry {
            tail_block_offset: 0,
            must_load: false,
            is_clean: true,
            free_block_hint: compute_free_block_hint(data_blocks, hint_shift)?,
        };
        let mut zone = Self {
            zone,
            hint_shift,
            origin,
            entries: vec![entry; usize::from(slab_count)],
            dirty_sectors: BTreeSet::new(),
            notifier,
        };
        // Everything must reach disk on the first flush.
        for sector in 0..usize::from(slab_count).div_ceil(SUMMARY_ENTRIES_PER_SECTOR) {
            zone.dirty_sectors.insert(sector);
        }
        Ok(zone)
    }

    /// Load a shard from disk.
    pub fn load(
        zone: ZoneCount,
        hint_shift: u8,
        origin: PhysicalBlockNumber,
        slab_count: SlabCount,
        device: &dyn BlockDevice,
        notifier: ReadOnlyNotifier,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(usize::from(slab_count));
        let blocks = Self::blocks_needed(slab_count);
        let raw = device.read_blocks(origin, blocks)?;
        for slab in 0..usize::from(slab_count) {
            let offset = slab * 2;
            entries.push(SlabSummaryEntry::decode([raw[offset], raw[offset + 1]]));
        }
        Ok(Self {
            zone,
            hint_shift,
            origin,
            entries,
            dirty_sectors: BTreeSet::new(),
            notifier,
        })
    }

    #[must_use]
    pub fn zone_number(&self) -> ZoneCount {
        self.zone
    }

    #[must_use]
    pub fn hint_shift(&self) -> u8 {
        self.hint_shift
    }

    #[must_use]
    pub fn entry(&self, slab: SlabCount) -> SlabSummaryEntry {
        self.entries[usize::from(slab)]
    }

    /// Whether the slab's reference counts were ever written.
    #[must_use]
    pub fn must_load(&self, slab: SlabCount) -> bool {
        self.entries[usize::from(slab)].must_load
    }

    /// Approximate free blocks; within `2^hint_shift` of the truth for a
    /// clean slab.
    #[must_use]
    pub fn approximate_free_blocks(&self, slab: SlabCount) -> BlockCount {
        approximate_free_blocks(self.entries[usize::from(slab)].free_block_hint, self.hint_shift)
    }

    /// Record a slab's new summary state; the containing sector is queued
    /// for the next flush.
    pub fn update(
        &mut self,
        slab: SlabCount,
        tail_block_offset: u8,
        must_load: bool,
        is_clean: bool,
        free_blocks: BlockCount,
    ) -> Result<()> {
        let entry = SlabSummaryEntry {
            tail_block_offset,
            must_load,
            is_clean,
            free_block_hint: compute_free_block_hint(free_blocks, self.hint_shift)?,
        };
        // Validate the widths now rather than at flush time.
        entry.encode()?;
        self.entries[usize::from(slab)] = entry;
        self.dirty_sectors
            .insert(usize::from(slab) / SUMMARY_ENTRIES_PER_SECTOR);
        Ok(())
    }

    /// Write out every block containing a dirty sector.
    pub fn flush(&mut self, device: &dyn BlockDevice) -> Result<()> {
        let sectors_per_block = SUMMARY_ENTRIES_PER_BLOCK / SUMMARY_ENTRIES_PER_SECTOR;
        let dirty_blocks: BTreeSet<usize> = self
            .dirty_sectors
            .iter()
            .map(|sector| sector / sectors_per_block)
            .collect();

        for block_index in dirty_blocks {
            let mut block = vec![0_u8; BLOCK_SIZE];
            let first_entry = block_index * SUMMARY_ENTRIES_PER_BLOCK;
            for (slot, entry) in self
                .entries
                .iter()
                .enumerate()
                .skip(first_entry)
                .take(SUMMARY_ENTRIES_PER_BLOCK)
            {
                let bytes = entry.encode()?;
                let offset = (slot - first_entry) * 2;
                block[offset..offset + 2].copy_from_slice(&bytes);
            }
            let pbn = PhysicalBlockNumber(self.origin.0 + block_index as u64);
            debug!(
                target: "dvol::slab::summary",
                zone = self.zone,
                block = block_index,
                pbn = pbn.0,
                "flushing summary block"
            );
            if let Err(err) = device.write_block(pbn, &block) {
                self.notifier.enter_read_only("slab summary", &err);
                return Err(err);
            }
        }
        self.dirty_sectors.clear();
        Ok(())
    }

    #[must_use]
    pub fn has_dirty_sectors(&self) -> bool {
        !self.dirty_sectors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvol_block::{ByteBlockDevice, MemByteDevice};

    fn device() -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(MemByteDevice::new(16 * BLOCK_SIZE as u64))
    }

    fn notifier() -> ReadOnlyNotifier {
        ReadOnlyNotifier::new().0
    }

    #[test]
    fn pristine_zone_round_trips_through_disk() {
        let device = device();
        let mut zone =
            SlabSummaryZone::new_pristine(0, 2, PhysicalBlockNumber(1), 10, 253, notifier())
                .unwrap();
        assert!(zone.has_dirty_sectors());
        zone.flush(&device).unwrap();
        assert!(!zone.has_dirty_sectors());

        let loaded =
            SlabSummaryZone::load(0, 2, PhysicalBlockNumber(1), 10, &device, notifier()).unwrap();
        for slab in 0..10 {
            assert!(!loaded.must_load(slab));
            assert!(loaded.entry(slab).is_clean);
            // 253 >> 2 << 2 == 252.
            assert_eq!(loaded.approximate_free_blocks(slab), 252);
        }
    }

    #[test]
    fn update_marks_slab_used_and_survives_flush() {
        let device = device();
        let mut zone =
            SlabSummaryZone::new_pristine(0, 2, PhysicalBlockNumber(1), 4, 253, notifier())
                .unwrap();
        zone.update(2, 1, true, true, 100).unwrap();
        zone.flush(&device).unwrap();

        let loaded =
            SlabSummaryZone::load(0, 2, PhysicalBlockNumber(1), 4, &device, notifier()).unwrap();
        assert!(loaded.must_load(2));
        assert!(!loaded.must_load(1));
        assert_eq!(loaded.entry(2).tail_block_offset, 1);
        let approx = loaded.approximate_free_blocks(2);
        assert!(approx <= 100 && 100 - approx < 4);
    }

    #[test]
    fn hint_error_stays_within_quantum() {
        let mut zone =
            SlabSummaryZone::new_pristine(0, 3, PhysicalBlockNumber(1), 1, 200, notifier())
                .unwrap();
        for free in [0_u64, 1, 7, 8, 100, 200] {
            zone.update(0, 0, true, true, free).unwrap();
            let approx = zone.approximate_free_blocks(0);
            assert!(approx <= free);
            assert!(free - approx < 8);
        }
    }

    #[test]
    fn write_failure_enters_read_only() {
        let (notifier, sink) = ReadOnlyNotifier::new();
        let device = ByteBlockDevice::new(MemByteDevice::new(BLOCK_SIZE as u64));
        let mut zone =
            SlabSummaryZone::new_pristine(0, 2, PhysicalBlockNumber(5), 4, 253, notifier)
                .unwrap();
        assert!(zone.flush(&device).is_err());
        assert!(sink.is_read_only());
    }
}
