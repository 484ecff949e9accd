//! Packed slab-summary entries.
//!
//! Two bytes per slab: `{tail_offset:u7, must_load:u1}` then
//! `{is_clean:u1, free_hint:u7}`. The free hint is the actual free count
//! quantized by the geometry's hint shift, so a whole zone's summary fits in
//! a handful of sectors and a single-sector write refreshes 256 slabs.

use dvol_error::{DvolError, Result};
use dvol_types::{BLOCK_SIZE, BlockCount, ParseError, SECTOR_SIZE};

/// Summary entries per 512-byte sector.
pub const SUMMARY_ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / 2;

/// Summary entries per 4 KiB block.
pub const SUMMARY_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / 2;

/// One slab's summary record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabSummaryEntry {
    /// Offset of the slab journal's tail block within the journal region.
    pub tail_block_offset: u8,
    /// Whether the slab's reference counts were ever written and must be
    /// loaded before use. Pristine slabs skip the load entirely.
    pub must_load: bool,
    /// Whether the slab was cleanly saved.
    pub is_clean: bool,
    /// Quantized free-block count (`actual >> hint_shift`).
    pub free_block_hint: u8,
}

impl SlabSummaryEntry {
    /// Encode into the two-byte wire form.
    pub fn encode(self) -> Result<[u8; 2]> {
        if self.tail_block_offset > 0x7F || self.free_block_hint > 0x7F {
            return Err(DvolError::Assertion("summary field exceeds its seven-bit width"));
        }
        Ok([
            self.tail_block_offset | (u8::from(self.must_load) << 7),
            u8::from(self.is_clean) | (self.free_block_hint << 1),
        ])
    }

    /// Decode from the two-byte wire form.
    #[must_use]
    pub fn decode(bytes: [u8; 2]) -> Self {
        Self {
            tail_block_offset: bytes[0] & 0x7F,
            must_load: bytes[0] & 0x80 != 0,
            is_clean: bytes[1] & 0x01 != 0,
            free_block_hint: (bytes[1] >> 1) & 0x7F,
        }
    }
}

/// The hint shift that keeps a slab's worst-case free count within the
/// seven-bit hint field: a completely free `2^k` slab quantizes to 64.
#[must_use]
pub fn hint_shift_for(slab_size_shift: u8) -> u8 {
    slab_size_shift.saturating_sub(6)
}

/// Quantize an exact free count into a hint.
pub fn compute_free_block_hint(free_blocks: BlockCount, hint_shift: u8) -> Result<u8> {
    let hint = free_blocks >> hint_shift;
    u8::try_from(hint)
        .ok()
        .filter(|hint| *hint <= 0x7F)
        .ok_or_else(|| {
            DvolError::corrupt(
                "slab summary",
                ParseError::InvalidField {
                    field: "free_block_hint",
                    reason: "free count too large for hint width",
                },
            )
        })
}

/// Expand a hint back into an approximate free count.
#[must_use]
pub fn approximate_free_blocks(hint: u8, hint_shift: u8) -> BlockCount {
    BlockCount::from(hint) << hint_shift
}
