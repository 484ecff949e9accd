#![forbid(unsafe_code)]
//! Recovery journal interface.
//!
//! The replay driver and the request-ingest pipeline live outside the engine
//! core; what the core needs from the recovery journal is (a) a source of
//! totally-ordered journal points that slab journals and block-map pages
//! consume for replay ordering, and (b) the logical-blocks-used figure the
//! audit checks the block map against. This crate provides both, plus the
//! ring-buffer header persistence that survives a clean shutdown.

use dvol_block::BlockDevice;
use dvol_error::{DvolError, Result};
use dvol_ondisk::{RecoveryBlockHeader, Region};
use dvol_types::{BLOCK_SIZE, JournalPoint, PhysicalBlockNumber};
use tracing::debug;

/// Entries per recovery-journal block; bounds `entry_count` in points.
pub const RECOVERY_JOURNAL_ENTRIES_PER_BLOCK: u16 = 311;

/// The engine-side view of the recovery journal.
#[derive(Debug)]
pub struct RecoveryJournal {
    nonce: u64,
    region: Region,
    tail_sequence: u64,
    entry_count: u16,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,
}

impl RecoveryJournal {
    /// A fresh journal for a newly formatted volume.
    #[must_use]
    pub fn new(nonce: u64, region: Region) -> Self {
        Self {
            nonce,
            region,
            tail_sequence: 1,
            entry_count: 0,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
        }
    }

    /// Issue the next journal point. Points within one block share a
    /// sequence number and are ordered by entry count.
    pub fn append(&mut self) -> JournalPoint {
        let point = JournalPoint::new(self.tail_sequence, self.entry_count);
        self.entry_count += 1;
        if self.entry_count == RECOVERY_JOURNAL_ENTRIES_PER_BLOCK {
            self.tail_sequence += 1;
            self.entry_count = 0;
        }
        point
    }

    /// Journal a leaf block-map update, keeping the logical-blocks-used
    /// count in step with the mapping transition.
    pub fn record_mapping_change(&mut self, was_mapped: bool, is_mapped: bool) -> JournalPoint {
        match (was_mapped, is_mapped) {
            (false, true) => self.logical_blocks_used += 1,
            (true, false) => self.logical_blocks_used -= 1,
            _ => {}
        }
        self.append()
    }

    /// Journal the allocation of a new block-map tree page.
    pub fn record_block_map_allocation(&mut self) -> JournalPoint {
        self.block_map_data_blocks += 1;
        self.append()
    }

    /// Sequence the next appended entry will carry.
    #[must_use]
    pub fn tail_sequence(&self) -> u64 {
        self.tail_sequence
    }

    /// Mapped logical blocks according to the journal.
    #[must_use]
    pub fn logical_blocks_used(&self) -> u64 {
        self.logical_blocks_used
    }

    /// Blocks allocated to block-map tree pages.
    #[must_use]
    pub fn block_map_data_blocks(&self) -> u64 {
        self.block_map_data_blocks
    }

    fn ring_slot(&self, sequence: u64) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.region.start.0 + (sequence % self.region.blocks))
    }

    /// Persist the tail header at its ring position.
    pub fn save(&self, device: &dyn BlockDevice) -> Result<()> {
        if self.region.blocks == 0 {
            return Err(DvolError::Assertion("recovery journal region is empty"));
        }
        let header = RecoveryBlockHeader {
            sequence_number: self.tail_sequence,
            nonce: self.nonce,
            entry_count: self.entry_count,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        };
        let mut block = vec![0_u8; BLOCK_SIZE];
        header.encode_into(&mut block)?;
        let slot = self.ring_slot(self.tail_sequence);
        debug!(
            target: "dvol::journal",
            sequence = self.tail_sequence,
            logical_blocks_used = self.logical_blocks_used,
            slot = slot.0,
            "saving recovery journal tail"
        );
        device.write_block(slot, &block)
    }

    /// Load the journal state from a clean image: scan the ring and adopt
    /// the header with the highest sequence number.
    pub fn load(device: &dyn BlockDevice, nonce: u64, region: Region) -> Result<Self> {
        let mut latest: Option<RecoveryBlockHeader> = None;
        for index in 0..region.blocks {
            let pbn = PhysicalBlockNumber(region.start.0 + index);
            let block = device.read_block(pbn)?;
            if let Some(header) = RecoveryBlockHeader::decode(block.as_slice(), nonce)? {
                if latest.is_none_or(|seen| seen.sequence_number < header.sequence_number) {
                    latest = Some(header);
                }
            }
        }

        let mut journal = Self::new(nonce, region);
        if let Some(header) = latest {
            journal.tail_sequence = header.sequence_number;
            journal.entry_count = header.entry_count;
            journal.logical_blocks_used = header.logical_blocks_used;
            journal.block_map_data_blocks = header.block_map_data_blocks;
        }
        Ok(journal)
    }
}
