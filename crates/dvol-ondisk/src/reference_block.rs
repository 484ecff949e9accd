//! Packed reference blocks.
//!
//! One 4 KiB block carries eight 512-byte sectors; each sector starts with
//! its own packed commit point followed by 504 one-byte counters. Per-sector
//! commit points make torn writes detectable at load time: a sector whose
//! point disagrees with sector 0 was not written atomically with it.

use dvol_error::{DvolError, Result};
use dvol_types::{
    BLOCK_SIZE, COUNTS_PER_BLOCK, COUNTS_PER_SECTOR, JournalPoint, PACKED_JOURNAL_POINT_SIZE,
    ParseError, SECTOR_SIZE, SECTORS_PER_BLOCK, read_le_u64, write_le_u64,
};

/// A reference block as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedReferenceBlock {
    /// All `COUNTS_PER_BLOCK` counters, in slab order.
    pub counters: Vec<u8>,
    /// The commit point each sector was written under.
    pub commit_points: [JournalPoint; SECTORS_PER_BLOCK],
}

impl UnpackedReferenceBlock {
    /// The latest commit point found in any sector. On a torn block this is
    /// the point the block must be considered current through.
    #[must_use]
    pub fn latest_commit_point(&self) -> JournalPoint {
        self.commit_points.iter().copied().max().unwrap_or_default()
    }

    /// Sectors whose commit point disagrees with sector 0 (torn write).
    #[must_use]
    pub fn torn_sectors(&self) -> Vec<usize> {
        self.commit_points
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, point)| **point != self.commit_points[0])
            .map(|(sector, _)| sector)
            .collect()
    }
}

/// Pack `counters` (at most `COUNTS_PER_BLOCK`, shorter for a runt block)
/// into one on-disk reference block, stamping every sector with
/// `commit_point`.
pub fn pack_reference_block(commit_point: JournalPoint, counters: &[u8]) -> Result<Vec<u8>> {
    if counters.len() > COUNTS_PER_BLOCK {
        return Err(DvolError::Assertion("too many counters for one reference block"));
    }

    let mut block = vec![0_u8; BLOCK_SIZE];
    for sector in 0..SECTORS_PER_BLOCK {
        let base = sector * SECTOR_SIZE;
        write_le_u64(&mut block, base, commit_point.pack());

        let first = sector * COUNTS_PER_SECTOR;
        if first >= counters.len() {
            continue;
        }
        let last = (first + COUNTS_PER_SECTOR).min(counters.len());
        let dest = base + PACKED_JOURNAL_POINT_SIZE;
        block[dest..dest + (last - first)].copy_from_slice(&counters[first..last]);
    }
    Ok(block)
}

/// Unpack a reference block. The caller decides how to react to torn
/// sectors; decoding itself never fails on counter contents.
pub fn unpack_reference_block(block: &[u8]) -> Result<UnpackedReferenceBlock> {
    if block.len() != BLOCK_SIZE {
        return Err(DvolError::corrupt(
            "reference block",
            ParseError::InsufficientData {
                needed: BLOCK_SIZE,
                offset: 0,
                actual: block.len(),
            },
        ));
    }

    let mut counters = vec![0_u8; COUNTS_PER_BLOCK];
    let mut commit_points = [JournalPoint::default(); SECTORS_PER_BLOCK];
    for (sector, point) in commit_points.iter_mut().enumerate() {
        let base = sector * SECTOR_SIZE;
        *point = JournalPoint::unpack(
            read_le_u64(block, base).map_err(|source| DvolError::corrupt("reference block", source))?,
        );
        let first = sector * COUNTS_PER_SECTOR;
        let src = base + PACKED_JOURNAL_POINT_SIZE;
        counters[first..first + COUNTS_PER_SECTOR]
            .copy_from_slice(&block[src..src + COUNTS_PER_SECTOR]);
    }

    Ok(UnpackedReferenceBlock {
        counters,
        commit_points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let mut counters = vec![0_u8; COUNTS_PER_BLOCK];
        counters[0] = 1;
        counters[503] = 254;
        counters[504] = 7;
        counters[COUNTS_PER_BLOCK - 1] = 255;
        let point = JournalPoint::new(9, 3);

        let block = pack_reference_block(point, &counters).unwrap();
        let unpacked = unpack_reference_block(&block).unwrap();
        assert_eq!(unpacked.counters, counters);
        assert_eq!(unpacked.commit_points, [point; SECTORS_PER_BLOCK]);
        assert!(unpacked.torn_sectors().is_empty());
        assert_eq!(unpacked.latest_commit_point(), point);
    }

    #[test]
    fn runt_block_pads_with_zero() {
        let counters = vec![3_u8; 100];
        let block = pack_reference_block(JournalPoint::new(1, 0), &counters).unwrap();
        let unpacked = unpack_reference_block(&block).unwrap();
        assert_eq!(&unpacked.counters[..100], counters.as_slice());
        assert!(unpacked.counters[100..].iter().all(|count| *count == 0));
    }

    #[test]
    fn torn_sector_detection_adopts_latest_point() {
        let counters = vec![1_u8; COUNTS_PER_BLOCK];
        let newer = JournalPoint::new(5, 2);
        let mut block = pack_reference_block(newer, &counters).unwrap();

        // Revert the last two sectors to an older commit point, simulating a
        // write torn mid-block.
        let older = JournalPoint::new(4, 9);
        for sector in 6..SECTORS_PER_BLOCK {
            write_le_u64(&mut block, sector * SECTOR_SIZE, older.pack());
        }

        let unpacked = unpack_reference_block(&block).unwrap();
        assert_eq!(unpacked.torn_sectors(), vec![6, 7]);
        assert_eq!(unpacked.latest_commit_point(), newer);
    }

    #[test]
    fn wrong_length_is_corrupt() {
        assert!(unpack_reference_block(&[0_u8; 100]).is_err());
        assert!(pack_reference_block(JournalPoint::default(), &[0; COUNTS_PER_BLOCK + 1]).is_err());
    }
}
