//! Recovery-journal block headers.
//!
//! The engine core only consumes the recovery journal at its boundary: it
//! needs the journal's sequence numbers for replay ordering and the
//! logical-blocks-used figure the audit compares against. The header codec
//! covers exactly that.

use dvol_error::{DvolError, Result};
use dvol_types::{read_le_u16, read_le_u64, write_le_u16, write_le_u64};

/// Header bytes at the front of each recovery journal block.
pub const RECOVERY_HEADER_SIZE: usize = 42;

/// Decoded recovery-journal block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryBlockHeader {
    pub sequence_number: u64,
    pub nonce: u64,
    pub entry_count: u16,
    /// Mapped logical blocks at the time this block was written.
    pub logical_blocks_used: u64,
    /// Blocks allocated to block-map tree pages at that time.
    pub block_map_data_blocks: u64,
}

impl RecoveryBlockHeader {
    /// Encode into the block prefix.
    pub fn encode_into(&self, block: &mut [u8]) -> Result<()> {
        if block.len() < RECOVERY_HEADER_SIZE {
            return Err(DvolError::Assertion("recovery header needs a full block"));
        }
        write_le_u64(block, 0, self.sequence_number);
        write_le_u64(block, 8, self.nonce);
        write_le_u16(block, 16, self.entry_count);
        write_le_u64(block, 18, self.logical_blocks_used);
        write_le_u64(block, 26, self.block_map_data_blocks);
        Ok(())
    }

    /// Decode; returns `None` when the nonce mismatches (stale ring block).
    pub fn decode(block: &[u8], expected_nonce: u64) -> Result<Option<Self>> {
        let corrupt = |source| DvolError::corrupt("recovery journal block", source);
        let nonce = read_le_u64(block, 8).map_err(corrupt)?;
        if nonce != expected_nonce {
            return Ok(None);
        }
        Ok(Some(Self {
            sequence_number: read_le_u64(block, 0).map_err(corrupt)?,
            nonce,
            entry_count: read_le_u16(block, 16).map_err(corrupt)?,
            logical_blocks_used: read_le_u64(block, 18).map_err(corrupt)?,
            block_map_data_blocks: read_le_u64(block, 26).map_err(corrupt)?,
        }))
    }
}
