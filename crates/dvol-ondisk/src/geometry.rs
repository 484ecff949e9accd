//! The geometry block: fixed volume layout written at PBN 0.
//!
//! Layout in PBN order: geometry block, dedup-index region (opaque here),
//! recovery journal, slab summary, then the slabs, each `{D data, R
//! reference-count, J journal}` blocks.

use dvol_error::{DvolError, Result};
use dvol_types::{
    BLOCK_SIZE, BlockCount, COUNTS_PER_BLOCK, ParseError, PhysicalBlockNumber, SlabBlockNumber,
    SlabCount, ZoneCount, block_count_for, read_le_u16, read_le_u32, read_le_u64, write_le_u16,
    write_le_u32, write_le_u64,
};

const GEOMETRY_MAGIC: u64 = u64::from_le_bytes(*b"dvolGEO\0");
const GEOMETRY_VERSION: u32 = 1;

/// A contiguous run of physical blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: PhysicalBlockNumber,
    pub blocks: BlockCount,
}

impl Region {
    /// First block past the region.
    #[must_use]
    pub fn end(self) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.start.0 + self.blocks)
    }

    #[must_use]
    pub fn contains(self, pbn: PhysicalBlockNumber) -> bool {
        pbn >= self.start && pbn < self.end()
    }
}

/// Derived per-slab block layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabConfig {
    /// Data blocks per slab (`D`).
    pub data_blocks: BlockCount,
    /// Reference-count blocks per slab (`R`).
    pub reference_blocks: BlockCount,
    /// Slab-journal blocks per slab (`J`).
    pub journal_blocks: BlockCount,
}

/// The decoded geometry block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGeometry {
    /// Volume nonce; stamped into every metadata page.
    pub nonce: u64,
    /// Size of the provisioned logical address space, in blocks.
    pub logical_blocks: BlockCount,
    pub logical_zone_count: ZoneCount,
    pub physical_zone_count: ZoneCount,
    /// Quantization shift for slab-summary free-block hints.
    pub hint_shift: u8,
    /// Slabs are `2^slab_size_shift` blocks.
    pub slab_size_shift: u8,
    pub slab_count: SlabCount,
    /// First PBN of slab 0.
    pub slab_origin: PhysicalBlockNumber,
    pub slab_config: SlabConfig,
    /// Dedup-index region; opaque to the engine core.
    pub index_region: Region,
    pub recovery_journal: Region,
    pub summary: Region,
    /// One block-map tree root per logical zone.
    pub block_map_roots: Vec<PhysicalBlockNumber>,
}

impl VolumeGeometry {
    /// Blocks per slab.
    #[must_use]
    pub fn slab_blocks(&self) -> BlockCount {
        1 << self.slab_size_shift
    }

    /// First block past the last slab.
    #[must_use]
    pub fn physical_end(&self) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.slab_origin.0 + u64::from(self.slab_count) * self.slab_blocks())
    }

    /// Origin PBN of a slab.
    #[must_use]
    pub fn slab_origin_of(&self, slab: SlabCount) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.slab_origin.0 + u64::from(slab) * self.slab_blocks())
    }

    /// First reference-count block of a slab.
    #[must_use]
    pub fn reference_block_origin(&self, slab: SlabCount) -> PhysicalBlockNumber {
        PhysicalBlockNumber(self.slab_origin_of(slab).0 + self.slab_config.data_blocks)
    }

    /// First slab-journal block of a slab.
    #[must_use]
    pub fn slab_journal_origin(&self, slab: SlabCount) -> PhysicalBlockNumber {
        PhysicalBlockNumber(
            self.reference_block_origin(slab).0 + self.slab_config.reference_blocks,
        )
    }

    /// Which slab holds `pbn`, or `OutOfRange` if it is outside every slab.
    pub fn slab_number(&self, pbn: PhysicalBlockNumber) -> Result<SlabCount> {
        if pbn < self.slab_origin || pbn >= self.physical_end() {
            return Err(DvolError::OutOfRange { pbn: pbn.0 });
        }
        let index = (pbn.0 - self.slab_origin.0) >> self.slab_size_shift;
        SlabCount::try_from(index).map_err(|_| DvolError::OutOfRange { pbn: pbn.0 })
    }

    /// Resolve a PBN to `(slab, slab block number)`. Slab metadata blocks
    /// (reference and journal regions) are out of range for data mappings.
    pub fn slab_block_number(
        &self,
        pbn: PhysicalBlockNumber,
    ) -> Result<(SlabCount, SlabBlockNumber)> {
        let slab = self.slab_number(pbn)?;
        let offset_mask = self.slab_blocks() - 1;
        let sbn = (pbn.0 - self.slab_origin.0) & offset_mask;
        if sbn >= self.slab_config.data_blocks {
            return Err(DvolError::OutOfRange { pbn: pbn.0 });
        }
        let sbn = SlabBlockNumber::try_from(sbn).map_err(|_| DvolError::OutOfRange { pbn: pbn.0 })?;
        Ok((slab, sbn))
    }

    /// Whether `pbn` addresses a data block in some slab.
    #[must_use]
    pub fn is_data_block(&self, pbn: PhysicalBlockNumber) -> bool {
        self.slab_block_number(pbn).is_ok()
    }

    /// Encode into a fresh geometry block.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.block_map_roots.len() != usize::from(self.logical_zone_count) {
            return Err(DvolError::Assertion("geometry must carry one root per logical zone"));
        }
        self.check_slab_layout()?;

        let mut block = vec![0_u8; BLOCK_SIZE];
        write_le_u64(&mut block, 0, GEOMETRY_MAGIC);
        write_le_u32(&mut block, 8, GEOMETRY_VERSION);
        write_le_u64(&mut block, 12, self.nonce);
        write_le_u64(&mut block, 20, self.logical_blocks);
        block[28] = self.logical_zone_count;
        block[29] = self.physical_zone_count;
        block[30] = self.hint_shift;
        block[31] = self.slab_size_shift;
        write_le_u16(&mut block, 32, self.slab_count);
        write_le_u64(&mut block, 34, self.slab_origin.0);
        write_le_u64(&mut block, 42, self.slab_config.data_blocks);
        write_le_u64(&mut block, 50, self.slab_config.reference_blocks);
        write_le_u64(&mut block, 58, self.slab_config.journal_blocks);
        write_le_u64(&mut block, 66, self.index_region.start.0);
        write_le_u64(&mut block, 74, self.index_region.blocks);
        write_le_u64(&mut block, 82, self.recovery_journal.start.0);
        write_le_u64(&mut block, 90, self.recovery_journal.blocks);
        write_le_u64(&mut block, 98, self.summary.start.0);
        write_le_u64(&mut block, 106, self.summary.blocks);

        let mut offset = 114;
        for root in &self.block_map_roots {
            write_le_u64(&mut block, offset, root.0);
            offset += 8;
        }
        Ok(block)
    }

    /// Decode and validate a geometry block.
    pub fn decode(block: &[u8]) -> Result<Self> {
        let corrupt = |source| DvolError::corrupt("geometry block", source);

        let magic = read_le_u64(block, 0).map_err(corrupt)?;
        if magic != GEOMETRY_MAGIC {
            return Err(corrupt(ParseError::InvalidMagic {
                expected: GEOMETRY_MAGIC,
                actual: magic,
            }));
        }
        let version = read_le_u32(block, 8).map_err(corrupt)?;
        if version != GEOMETRY_VERSION {
            return Err(corrupt(ParseError::UnsupportedVersion {
                expected: GEOMETRY_VERSION,
                actual: version,
            }));
        }

        let mut geometry = Self {
            nonce: read_le_u64(block, 12).map_err(corrupt)?,
            logical_blocks: read_le_u64(block, 20).map_err(corrupt)?,
            logical_zone_count: block[28],
            physical_zone_count: block[29],
            hint_shift: block[30],
            slab_size_shift: block[31],
            slab_count: read_le_u16(block, 32).map_err(corrupt)?,
            slab_origin: PhysicalBlockNumber(read_le_u64(block, 34).map_err(corrupt)?),
            slab_config: SlabConfig {
                data_blocks: read_le_u64(block, 42).map_err(corrupt)?,
                reference_blocks: read_le_u64(block, 50).map_err(corrupt)?,
                journal_blocks: read_le_u64(block, 58).map_err(corrupt)?,
            },
            index_region: Region {
                start: PhysicalBlockNumber(read_le_u64(block, 66).map_err(corrupt)?),
                blocks: read_le_u64(block, 74).map_err(corrupt)?,
            },
            recovery_journal: Region {
                start: PhysicalBlockNumber(read_le_u64(block, 82).map_err(corrupt)?),
                blocks: read_le_u64(block, 90).map_err(corrupt)?,
            },
            summary: Region {
                start: PhysicalBlockNumber(read_le_u64(block, 98).map_err(corrupt)?),
                blocks: read_le_u64(block, 106).map_err(corrupt)?,
            },
            block_map_roots: Vec::new(),
        };

        if geometry.logical_zone_count == 0 || geometry.slab_size_shift >= 32 {
            return Err(corrupt(ParseError::InvalidField {
                field: "geometry",
                reason: "zone count zero or slab shift out of range",
            }));
        }

        let mut offset = 114;
        for _ in 0..geometry.logical_zone_count {
            geometry
                .block_map_roots
                .push(PhysicalBlockNumber(read_le_u64(block, offset).map_err(corrupt)?));
            offset += 8;
        }

        geometry.check_slab_layout()?;
        Ok(geometry)
    }

    fn check_slab_layout(&self) -> Result<()> {
        let config = self.slab_config;
        let total = config.data_blocks + config.reference_blocks + config.journal_blocks;
        if total != self.slab_blocks() {
            return Err(DvolError::corrupt(
                "geometry block",
                ParseError::InvalidField {
                    field: "slab_config",
                    reason: "D + R + J must equal the slab size",
                },
            ));
        }
        if config.reference_blocks != block_count_for(config.data_blocks, COUNTS_PER_BLOCK as u64)
        {
            return Err(DvolError::corrupt(
                "geometry block",
                ParseError::InvalidField {
                    field: "slab_config",
                    reason: "reference blocks do not cover the data blocks",
                },
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_geometry() -> VolumeGeometry {
        // 2^8 = 256-block slabs: 253 data + 1 reference + 2 journal.
        VolumeGeometry {
            nonce: 0xFACE_0FF5,
            logical_blocks: 1 << 20,
            logical_zone_count: 2,
            physical_zone_count: 1,
            hint_shift: 1,
            slab_size_shift: 8,
            slab_count: 4,
            slab_origin: PhysicalBlockNumber(64),
            slab_config: SlabConfig {
                data_blocks: 253,
                reference_blocks: 1,
                journal_blocks: 2,
            },
            index_region: Region {
                start: PhysicalBlockNumber(1),
                blocks: 8,
            },
            recovery_journal: Region {
                start: PhysicalBlockNumber(9),
                blocks: 32,
            },
            summary: Region {
                start: PhysicalBlockNumber(41),
                blocks: 2,
            },
            block_map_roots: vec![PhysicalBlockNumber(43), PhysicalBlockNumber(44)],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let geometry = sample_geometry();
        let block = geometry.encode().unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(VolumeGeometry::decode(&block).unwrap(), geometry);
    }

    #[test]
    fn bad_magic_is_corrupt_component() {
        let mut block = sample_geometry().encode().unwrap();
        block[0] ^= 0xFF;
        assert!(matches!(
            VolumeGeometry::decode(&block),
            Err(DvolError::CorruptComponent { component: "geometry block", .. })
        ));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut block = sample_geometry().encode().unwrap();
        block[8] = 99;
        assert!(VolumeGeometry::decode(&block).is_err());
    }

    #[test]
    fn slab_layout_must_sum_to_slab_size() {
        let mut geometry = sample_geometry();
        geometry.slab_config.journal_blocks = 5;
        assert!(geometry.encode().is_err());
    }

    #[test]
    fn slab_addressing() {
        let geometry = sample_geometry();
        assert_eq!(geometry.slab_blocks(), 256);
        assert_eq!(geometry.slab_origin_of(0), PhysicalBlockNumber(64));
        assert_eq!(geometry.slab_origin_of(1), PhysicalBlockNumber(320));
        assert_eq!(geometry.physical_end(), PhysicalBlockNumber(64 + 4 * 256));

        assert_eq!(geometry.slab_number(PhysicalBlockNumber(64)).unwrap(), 0);
        assert_eq!(geometry.slab_number(PhysicalBlockNumber(319)).unwrap(), 0);
        assert_eq!(geometry.slab_number(PhysicalBlockNumber(320)).unwrap(), 1);
        assert!(geometry.slab_number(PhysicalBlockNumber(63)).is_err());
        assert!(geometry.slab_number(geometry.physical_end()).is_err());
    }

    #[test]
    fn metadata_blocks_are_not_data_blocks() {
        let geometry = sample_geometry();
        // First data block of slab 0.
        assert_eq!(
            geometry.slab_block_number(PhysicalBlockNumber(64)).unwrap(),
            (0, 0)
        );
        // Last data block.
        assert_eq!(
            geometry.slab_block_number(PhysicalBlockNumber(64 + 252)).unwrap(),
            (0, 252)
        );
        // Reference block of slab 0 is metadata.
        assert!(matches!(
            geometry.slab_block_number(geometry.reference_block_origin(0)),
            Err(DvolError::OutOfRange { .. })
        ));
        // Journal blocks are metadata.
        assert!(geometry
            .slab_block_number(geometry.slab_journal_origin(0))
            .is_err());
        assert!(!geometry.is_data_block(PhysicalBlockNumber(0)));
        assert!(geometry.is_data_block(PhysicalBlockNumber(321)));
    }

    #[test]
    fn region_containment() {
        let region = Region {
            start: PhysicalBlockNumber(9),
            blocks: 32,
        };
        assert!(region.contains(PhysicalBlockNumber(9)));
        assert!(region.contains(PhysicalBlockNumber(40)));
        assert!(!region.contains(PhysicalBlockNumber(41)));
        assert_eq!(region.end(), PhysicalBlockNumber(41));
    }
}
