#![forbid(unsafe_code)]
//! On-disk format codecs for dvol volumes.
//!
//! Every structure here is hand-packed little-endian against a fixed layout;
//! nothing on disk goes through serde. The geometry block pins the volume
//! layout, and the remaining modules cover the per-component wire formats:
//! reference blocks (sector-granular commit points for torn-write detection),
//! slab-summary entries, slab-journal blocks, block-map pages, the recovery
//! journal block header, and the dedup-index open-chapter header (boundary
//! only).

pub mod block_map_page;
pub mod geometry;
pub mod open_chapter;
pub mod recovery;
pub mod reference_block;
pub mod slab_journal;
pub mod summary;

pub use block_map_page::{BlockMapEntry, BlockMapPage, BlockMapPageHeader, PAGE_HEADER_SIZE};
pub use geometry::{Region, SlabConfig, VolumeGeometry};
pub use open_chapter::OpenChapterHeader;
pub use recovery::RecoveryBlockHeader;
pub use reference_block::{UnpackedReferenceBlock, pack_reference_block, unpack_reference_block};
pub use slab_journal::{
    SLAB_JOURNAL_ENTRIES_PER_BLOCK, SlabJournalBlock, SlabJournalEntry,
};
pub use summary::{
    SUMMARY_ENTRIES_PER_BLOCK, SUMMARY_ENTRIES_PER_SECTOR, SlabSummaryEntry,
    approximate_free_blocks, compute_free_block_hint, hint_shift_for,
};
