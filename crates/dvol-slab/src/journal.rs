//! Per-slab journal of reference-count adjustments.
//!
//! Entries are batched into fixed-size journal blocks written to the slab's
//! journal region, a ring addressed by sequence number. Every appended entry
//! takes one lock unit on its block's sequence; the unit is released either
//! immediately (when the reference block absorbing the adjustment already
//! holds a lock that covers it) or when that reference block's write
//! completes. A sequence with outstanding locks is never reclaimed, so
//! replay from the lowest locked sequence recovers exactly the adjustments
//! missing from the reference counts.

use crate::readonly::ReadOnlyNotifier;
use dvol_block::BlockDevice;
use dvol_error::{DvolError, Result};
use dvol_ondisk::{
    Region, SLAB_JOURNAL_ENTRIES_PER_BLOCK, SlabJournalBlock, SlabJournalEntry,
};
use dvol_types::{JournalOperation, JournalPoint, PhysicalBlockNumber, SlabBlockNumber, SlabCount};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

/// The journal side of one slab.
#[derive(Debug)]
pub struct SlabJournal {
    slab_number: SlabCount,
    nonce: u64,
    region: Region,
    /// Sequence of the open (tail) block; sequences start at 1.
    tail_sequence: u64,
    tail_entries: Vec<SlabJournalEntry>,
    /// Full blocks awaiting commit, oldest first.
    sealed: VecDeque<SlabJournalBlock>,
    /// Highest sequence whose block is durably written.
    committed_sequence: u64,
    /// Outstanding lock units per sequence.
    locks: BTreeMap<u64, i64>,
    notifier: ReadOnlyNotifier,
}

impl SlabJournal {
    #[must_use]
    pub fn new(
        slab_number: SlabCount,
        nonce: u64,
        region: Region,
        notifier: ReadOnlyNotifier,
    ) -> Self {
        Self {
            slab_number,
            nonce,
            region,
            tail_sequence: 1,
            tail_entries: Vec::new(),
            sealed: VecDeque::new(),
            committed_sequence: 0,
            locks: BTreeMap::new(),
            notifier,
        }
    }

    /// Oldest sequence that still holds locks (bounds ring reclaim).
    #[must_use]
    pub fn head_sequence(&self) -> u64 {
        self.locks
            .keys()
            .next()
            .copied()
            .unwrap_or(self.tail_sequence)
    }

    /// Append an adjustment, assigning it the next journal point and taking
    /// one lock unit on its sequence.
    pub fn append(
        &mut self,
        sbn: SlabBlockNumber,
        operation: JournalOperation,
    ) -> Result<JournalPoint> {
        if self.tail_sequence.saturating_sub(self.head_sequence()) >= self.region.blocks {
            // The ring cannot grow past the oldest locked block.
            return Err(DvolError::Assertion("slab journal ring is full of locked blocks"));
        }

        let entry_count = u16::try_from(self.tail_entries.len())
            .map_err(|_| DvolError::Assertion("slab journal tail overflowed"))?;
        let point = JournalPoint::new(self.tail_sequence, entry_count);
        self.tail_entries.push(SlabJournalEntry { sbn, operation });
        *self.locks.entry(self.tail_sequence).or_insert(0) += 1;
        trace!(
            target: "dvol::slab::journal",
            slab = self.slab_number,
            sbn,
            op = %operation,
            point = %point,
            "journaled adjustment"
        );

        if self.tail_entries.len() == SLAB_JOURNAL_ENTRIES_PER_BLOCK {
            self.seal_tail();
        }
        Ok(point)
    }

    fn seal_tail(&mut self) {
        self.sealed.push_back(SlabJournalBlock {
            sequence_number: self.tail_sequence,
            nonce: self.nonce,
            entries: std::mem::take(&mut self.tail_entries),
        });
        self.tail_sequence += 1;
    }

    /// Adjust the lock count of `sequence` by `delta`. Sequence 0 marks "no
    /// lock held" and is ignored.
    pub fn adjust_block_reference(&mut self, sequence: u64, delta: i64) -> Result<()> {
        if sequence == 0 {
            return Ok(());
        }

        let count = self.locks.entry(sequence).or_insert(0);
        *count += delta;
        if *count < 0 {
            let err = DvolError::Assertion("slab journal lock released below zero");
            self.notifier.enter_read_only("slab journal", &err);
            return Err(err);
        }
        if *count == 0 {
            self.locks.remove(&sequence);
            trace!(
                target: "dvol::slab::journal",
                slab = self.slab_number,
                sequence,
                "journal sequence fully unlocked"
            );
        }
        Ok(())
    }

    /// Outstanding lock units on a sequence (observer).
    #[must_use]
    pub fn lock_count(&self, sequence: u64) -> i64 {
        self.locks.get(&sequence).copied().unwrap_or(0)
    }

    fn ring_slot(&self, sequence: u64) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.region.start.0 + ((sequence - 1) % self.region.blocks))
    }

    /// Ring offset of the tail block, as recorded in the slab summary.
    #[must_use]
    pub fn tail_block_offset(&self) -> u8 {
        #[allow(clippy::cast_possible_truncation)]
        let offset = ((self.tail_sequence - 1) % self.region.blocks) as u8;
        offset
    }

    /// Commit every entry whose journal point is at or before `point`:
    /// sealed blocks up to the point's sequence, plus the open tail block if
    /// the point lands inside it. Reference blocks call this before writing
    /// so their commit point never runs ahead of the journal.
    pub fn commit_through(&mut self, device: &dyn BlockDevice, point: JournalPoint) -> Result<()> {
        if !point.is_valid() {
            return Ok(());
        }

        while let Some(block) = self.sealed.front() {
            if block.sequence_number > point.sequence_number {
                break;
            }
            let block = self.sealed.pop_front();
            let Some(block) = block else { break };
            self.write_journal_block(device, &block)?;
            self.committed_sequence = block.sequence_number;
        }

        if point.sequence_number == self.tail_sequence && !self.tail_entries.is_empty() {
            let tail = SlabJournalBlock {
                sequence_number: self.tail_sequence,
                nonce: self.nonce,
                entries: self.tail_entries.clone(),
            };
            self.write_journal_block(device, &tail)?;
        }
        Ok(())
    }

    /// Commit everything, including the partial tail.
    pub fn commit_all(&mut self, device: &dyn BlockDevice) -> Result<()> {
        let through = JournalPoint::new(self.tail_sequence, 0);
        self.commit_through(device, through)
    }

    fn write_journal_block(
        &self,
        device: &dyn BlockDevice,
        block: &SlabJournalBlock,
    ) -> Result<()> {
        let slot = self.ring_slot(block.sequence_number);
        debug!(
            target: "dvol::slab::journal",
            slab = self.slab_number,
            sequence = block.sequence_number,
            entries = block.entries.len(),
            slot = slot.0,
            "committing journal block"
        );
        match device.write_block(slot, &block.encode()?) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.notifier.enter_read_only("slab journal", &err);
                Err(err)
            }
        }
    }

    /// Read back every live journal entry from the region, in point order.
    /// This is the replay feed: entries from sequences that still held locks
    /// at crash time are exactly the ones the reference counts may miss.
    pub fn load_entries(
        &self,
        device: &dyn BlockDevice,
    ) -> Result<Vec<(JournalPoint, SlabJournalEntry)>> {
        let mut blocks = Vec::new();
        for index in 0..self.region.blocks {
            let pbn = PhysicalBlockNumber(self.region.start.0 + index);
            let raw = device.read_block(pbn)?;
            if let Some(block) = SlabJournalBlock::decode(raw.as_slice(), self.nonce)? {
                blocks.push(block);
            }
        }
        blocks.sort_by_key(|block| block.sequence_number);

        let mut entries = Vec::new();
        for block in blocks {
            for (index, entry) in block.entries.iter().enumerate() {
                let entry_count = u16::try_from(index)
                    .map_err(|_| DvolError::Assertion("journal block entry index overflow"))?;
                entries.push((
                    JournalPoint::new(block.sequence_number, entry_count),
                    *entry,
                ));
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvol_block::{ByteBlockDevice, MemByteDevice};
    use dvol_types::BLOCK_SIZE;

    fn journal() -> SlabJournal {
        let (notifier, _sink) = ReadOnlyNotifier::new();
        SlabJournal::new(
            0,
            0xCAFE,
            Region {
                start: PhysicalBlockNumber(0),
                blocks: 4,
            },
            notifier,
        )
    }

    fn device() -> ByteBlockDevice<MemByteDevice> {
        ByteBlockDevice::new(MemByteDevice::new(8 * BLOCK_SIZE as u64))
    }

    #[test]
    fn points_increase_within_and_across_blocks() {
        let mut journal = journal();
        let first = journal
            .append(7, JournalOperation::DataIncrement)
            .unwrap();
        assert_eq!(first, JournalPoint::new(1, 0));

        let mut previous = first;
        for sbn in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK as u32 {
            let point = journal.append(sbn, JournalOperation::DataIncrement).unwrap();
            assert!(previous.is_before(point));
            previous = point;
        }
        // The first block sealed; the tail moved to sequence 2.
        assert_eq!(previous.sequence_number, 2);
    }

    #[test]
    fn append_locks_and_release_unlocks() {
        let mut journal = journal();
        journal.append(1, JournalOperation::DataIncrement).unwrap();
        journal.append(2, JournalOperation::DataIncrement).unwrap();
        assert_eq!(journal.lock_count(1), 2);
        assert_eq!(journal.head_sequence(), 1);

        journal.adjust_block_reference(1, -1).unwrap();
        assert_eq!(journal.lock_count(1), 1);
        journal.adjust_block_reference(1, -1).unwrap();
        assert_eq!(journal.lock_count(1), 0);
        assert_eq!(journal.head_sequence(), journal.tail_sequence);

        // Sequence 0 means "no lock" and is ignored.
        journal.adjust_block_reference(0, -1).unwrap();
    }

    #[test]
    fn over_release_enters_read_only() {
        let (notifier, sink) = ReadOnlyNotifier::new();
        let mut journal = SlabJournal::new(
            3,
            1,
            Region {
                start: PhysicalBlockNumber(0),
                blocks: 2,
            },
            notifier,
        );
        assert!(journal.adjust_block_reference(5, -1).is_err());
        assert!(sink.is_read_only());
        assert_eq!(sink.drain().len(), 1);
    }

    #[test]
    fn commit_and_reload_round_trip() {
        let mut journal = journal();
        let device = device();
        let mut expected = Vec::new();
        for sbn in 0..5_u32 {
            let op = if sbn % 2 == 0 {
                JournalOperation::DataIncrement
            } else {
                JournalOperation::DataDecrement
            };
            let point = journal.append(sbn, op).unwrap();
            expected.push((point, SlabJournalEntry { sbn, operation: op }));
        }
        journal.commit_all(&device).unwrap();

        let loaded = journal.load_entries(&device).unwrap();
        assert_eq!(loaded, expected);
    }

    #[test]
    fn commit_through_stops_at_the_point() {
        let mut journal = journal();
        let device = device();

        // Fill one block plus a few tail entries.
        for sbn in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK as u32 + 3 {
            journal.append(sbn, JournalOperation::DataIncrement).unwrap();
        }

        // Committing through a sequence-1 point writes only the sealed block.
        journal
            .commit_through(&device, JournalPoint::new(1, 10))
            .unwrap();
        let loaded = journal.load_entries(&device).unwrap();
        assert_eq!(loaded.len(), SLAB_JOURNAL_ENTRIES_PER_BLOCK);

        // Committing through a tail point writes the partial tail too.
        journal
            .commit_through(&device, JournalPoint::new(2, 0))
            .unwrap();
        let loaded = journal.load_entries(&device).unwrap();
        assert_eq!(loaded.len(), SLAB_JOURNAL_ENTRIES_PER_BLOCK + 3);
    }

    #[test]
    fn ring_full_of_locked_blocks_is_rejected() {
        let (notifier, _sink) = ReadOnlyNotifier::new();
        let mut journal = SlabJournal::new(
            0,
            1,
            Region {
                start: PhysicalBlockNumber(0),
                blocks: 1,
            },
            notifier,
        );
        // Seal the only ring block while sequence 1 stays locked.
        for sbn in 0..SLAB_JOURNAL_ENTRIES_PER_BLOCK as u32 {
            journal.append(sbn, JournalOperation::DataIncrement).unwrap();
        }
        assert!(journal.append(0, JournalOperation::DataIncrement).is_err());
    }

    #[test]
    fn tail_block_offset_wraps_the_ring() {
        let mut journal = journal();
        assert_eq!(journal.tail_block_offset(), 0);
        for _ in 0..5 {
            journal.seal_tail();
            // Drop the lockless sealed blocks so the ring can advance.
            journal.sealed.clear();
        }
        assert_eq!(journal.tail_block_offset(), 5 % 4);
    }
}
