//! Packed slab-journal blocks.
//!
//! A journal block is a 24-byte header followed by four-byte entries, each
//! packing a slab block number and a two-bit operation code. The nonce in
//! the header distinguishes live blocks from stale ring contents left by an
//! earlier format of the volume.

use dvol_error::{DvolError, Result};
use dvol_types::{
    BLOCK_SIZE, JournalOperation, ParseError, SlabBlockNumber, read_le_u16, read_le_u32,
    read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};

/// Header bytes at the front of each journal block.
pub const SLAB_JOURNAL_HEADER_SIZE: usize = 24;

/// Entries per journal block.
pub const SLAB_JOURNAL_ENTRIES_PER_BLOCK: usize =
    (BLOCK_SIZE - SLAB_JOURNAL_HEADER_SIZE) / 4;

const SBN_MASK: u32 = (1 << 30) - 1;

/// One reference-count adjustment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabJournalEntry {
    pub sbn: SlabBlockNumber,
    pub operation: JournalOperation,
}

impl SlabJournalEntry {
    fn pack(self) -> Result<u32> {
        if self.sbn > SBN_MASK {
            return Err(DvolError::Assertion("slab block number exceeds entry width"));
        }
        Ok((u32::from(self.operation.to_code()) << 30) | self.sbn)
    }

    fn unpack(raw: u32) -> Result<Self> {
        // Codes use two bits; 3 is unassigned and means a corrupt or
        // unsupported entry, which the caller escalates.
        #[allow(clippy::cast_possible_truncation)]
        let code = (raw >> 30) as u8;
        let operation = JournalOperation::from_code(code)
            .map_err(|_| DvolError::NotImplemented { code })?;
        Ok(Self {
            sbn: raw & SBN_MASK,
            operation,
        })
    }
}

/// A decoded slab-journal block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabJournalBlock {
    pub sequence_number: u64,
    pub nonce: u64,
    pub entries: Vec<SlabJournalEntry>,
}

impl SlabJournalBlock {
    /// Encode into one on-disk block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.entries.len() > SLAB_JOURNAL_ENTRIES_PER_BLOCK {
            return Err(DvolError::Assertion("too many entries for one journal block"));
        }
        let mut block = vec![0_u8; BLOCK_SIZE];
        write_le_u64(&mut block, 0, self.sequence_number);
        write_le_u64(&mut block, 8, self.nonce);
        let count = u16::try_from(self.entries.len())
            .map_err(|_| DvolError::Assertion("entry count exceeds u16"))?;
        write_le_u16(&mut block, 16, count);

        let mut offset = SLAB_JOURNAL_HEADER_SIZE;
        for entry in &self.entries {
            write_le_u32(&mut block, offset, entry.pack()?);
            offset += 4;
        }
        Ok(block)
    }

    /// Decode an on-disk block. Returns `None` if the nonce does not match
    /// (stale ring contents, not corruption).
    pub fn decode(block: &[u8], expected_nonce: u64) -> Result<Option<Self>> {
        let corrupt = |source| DvolError::corrupt("slab journal block", source);
        let nonce = read_le_u64(block, 8).map_err(corrupt)?;
        if nonce != expected_nonce {
            return Ok(None);
        }

        let sequence_number = read_le_u64(block, 0).map_err(corrupt)?;
        let entry_count = usize::from(read_le_u16(block, 16).map_err(corrupt)?);
        if entry_count > SLAB_JOURNAL_ENTRIES_PER_BLOCK {
            return Err(corrupt(ParseError::InvalidField {
                field: "entry_count",
                reason: "exceeds journal block capacity",
            }));
        }

        let mut entries = Vec::with_capacity(entry_count);
        let mut offset = SLAB_JOURNAL_HEADER_SIZE;
        for _ in 0..entry_count {
            entries.push(SlabJournalEntry::unpack(
                read_le_u32(block, offset).map_err(corrupt)?,
            )?);
            offset += 4;
        }

        Ok(Some(Self {
            sequence_number,
            nonce,
            entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let block = SlabJournalBlock {
            sequence_number: 17,
            nonce: 0xA0A0,
            entries: vec![
                SlabJournalEntry {
                    sbn: 0,
                    operation: JournalOperation::DataIncrement,
                },
                SlabJournalEntry {
                    sbn: SBN_MASK,
                    operation: JournalOperation::BlockMapIncrement,
                },
                SlabJournalEntry {
                    sbn: 12345,
                    operation: JournalOperation::DataDecrement,
                },
            ],
        };
        let bytes = block.encode().unwrap();
        assert_eq!(
            SlabJournalBlock::decode(&bytes, block.nonce).unwrap().unwrap(),
            block
        );
    }

    #[test]
    fn nonce_mismatch_reads_as_stale() {
        let block = SlabJournalBlock {
            sequence_number: 1,
            nonce: 7,
            entries: Vec::new(),
        };
        let bytes = block.encode().unwrap();
        assert_eq!(SlabJournalBlock::decode(&bytes, 8).unwrap(), None);
    }

    #[test]
    fn unknown_operation_code_is_not_implemented() {
        let block = SlabJournalBlock {
            sequence_number: 1,
            nonce: 7,
            entries: vec![SlabJournalEntry {
                sbn: 5,
                operation: JournalOperation::DataIncrement,
            }],
        };
        let mut bytes = block.encode().unwrap();
        // Force the entry's op code to the unassigned value 3.
        bytes[SLAB_JOURNAL_HEADER_SIZE + 3] |= 0xC0;
        assert!(matches!(
            SlabJournalBlock::decode(&bytes, 7),
            Err(DvolError::NotImplemented { code: 3 })
        ));
    }

    #[test]
    fn oversized_sbn_is_rejected() {
        let entry = SlabJournalEntry {
            sbn: SBN_MASK + 1,
            operation: JournalOperation::DataIncrement,
        };
        assert!(entry.pack().is_err());
    }

    #[test]
    fn capacity_fills_a_block() {
        assert_eq!(SLAB_JOURNAL_ENTRIES_PER_BLOCK, 1018);
        let block = SlabJournalBlock {
            sequence_number: 2,
            nonce: 3,
            entries: vec![
                SlabJournalEntry {
                    sbn: 1,
                    operation: JournalOperation::DataIncrement,
                };
                SLAB_JOURNAL_ENTRIES_PER_BLOCK
            ],
        };
        assert!(block.encode().is_ok());
    }
}
