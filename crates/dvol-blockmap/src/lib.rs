#![forbid(unsafe_code)]
//! The block map: a forest of fixed-height radix trees translating logical
//! block numbers to `(PBN, mapping state)`.
//!
//! Each logical zone owns one root. A logical block's page number selects
//! the root round-robin; the page index within that tree decomposes into
//! one radix-812 digit per interior level. Leaves sit at height 0; interior
//! entries must be `Mapped` with a nonzero PBN — never compressed, never
//! a bare PBN on an unmapped entry.
//!
//! Interior pages are allocated out of the slabs like any other block, but
//! their reference counts are saturated (`BLOCK_MAP_INCREMENT`) so they can
//! never dedupe; the allocator is abstracted behind [`TreePageAllocator`]
//! so the tree stays ignorant of slab internals.

use dvol_block::BlockDevice;
use dvol_error::{DvolError, Result};
use dvol_ondisk::{BlockMapEntry, BlockMapPage, BlockMapPageHeader};
use dvol_types::{
    BLOCK_MAP_TREE_HEIGHT, ENTRIES_PER_PAGE, Height, LogicalBlockNumber, MappingState,
    PhysicalBlockNumber, ZERO_BLOCK,
};
use std::collections::HashSet;
use tracing::trace;

/// Interior levels between a root and its leaves.
const INTERIOR_LEVELS: usize = BLOCK_MAP_TREE_HEIGHT as usize - 1;

/// Where an entry lives: its host page and slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapSlot {
    pub page: PhysicalBlockNumber,
    pub slot: u16,
}

/// Allocates a physical block for a new interior tree page, leaving its
/// reference count saturated.
pub trait TreePageAllocator {
    fn allocate_tree_page(&mut self) -> Result<PhysicalBlockNumber>;
}

/// Examiner callback for [`BlockMap::examine`]: invoked once per non-empty
/// mapping with the entry's host slot, height, PBN, and state.
pub type MappingExaminer<'a> =
    dyn FnMut(BlockMapSlot, Height, PhysicalBlockNumber, MappingState) -> Result<()> + 'a;

/// The forest of block-map trees.
#[derive(Debug, Clone)]
pub struct BlockMap {
    nonce: u64,
    roots: Vec<PhysicalBlockNumber>,
}

/// Decomposed address of one logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TreePath {
    root: usize,
    /// Interior digits, root level first.
    digits: [usize; INTERIOR_LEVELS],
    leaf_slot: usize,
}

impl BlockMap {
    #[must_use]
    pub fn new(nonce: u64, roots: Vec<PhysicalBlockNumber>) -> Self {
        Self { nonce, roots }
    }

    #[must_use]
    pub fn roots(&self) -> &[PhysicalBlockNumber] {
        &self.roots
    }

    fn path_for(&self, lbn: LogicalBlockNumber) -> Result<TreePath> {
        let entries = ENTRIES_PER_PAGE as u64;
        let page_number = lbn.0 / entries;
        let leaf_slot = (lbn.0 % entries) as usize;
        let root = (page_number % self.roots.len() as u64) as usize;
        let mut tree_page = page_number / self.roots.len() as u64;

        // Radix-812 digits, least significant first, then reversed so the
        // root consumes the most significant digit.
        let mut digits = [0_usize; INTERIOR_LEVELS];
        for digit in digits.iter_mut() {
            *digit = (tree_page % entries) as usize;
            tree_page /= entries;
        }
        if tree_page != 0 {
            return Err(DvolError::OutOfRange { pbn: lbn.0 });
        }
        digits.reverse();
        Ok(TreePath {
            root,
            digits,
            leaf_slot,
        })
    }

    fn read_page(
        &self,
        device: &dyn BlockDevice,
        pbn: PhysicalBlockNumber,
    ) -> Result<BlockMapPage> {
        let raw = device.read_block(pbn)?;
        BlockMapPage::decode(raw.as_slice(), pbn, self.nonce)
    }

    fn write_page(&self, device: &dyn BlockDevice, page: &BlockMapPage) -> Result<()> {
        device.write_block(page.header.pbn, &page.encode()?)
    }

    /// Look up the mapping for one logical block.
    ///
    /// Descent stops early with `(0, Unmapped)` at the first unmapped
    /// interior entry; a mapped interior entry with PBN 0 is structurally
    /// invalid.
    pub fn find_mapping(
        &self,
        device: &dyn BlockDevice,
        lbn: LogicalBlockNumber,
    ) -> Result<(PhysicalBlockNumber, MappingState)> {
        let path = self.path_for(lbn)?;
        let mut current = self.roots[path.root];

        for digit in path.digits {
            let page = self.read_page(device, current)?;
            let entry = page.entry(digit);
            let slot = u16::try_from(digit).unwrap_or(u16::MAX);
            match entry.state {
                MappingState::Unmapped => return Ok((ZERO_BLOCK, MappingState::Unmapped)),
                MappingState::Mapped if entry.pbn.is_zero() => {
                    return Err(DvolError::BadMapping {
                        page: current.0,
                        slot,
                        detail: "mapped interior entry has no physical block",
                    });
                }
                MappingState::Mapped => current = entry.pbn,
                MappingState::Compressed(_) => {
                    return Err(DvolError::BadMapping {
                        page: current.0,
                        slot,
                        detail: "interior entry is compressed",
                    });
                }
            }
        }

        let leaf = self.read_page(device, current)?;
        let entry = leaf.entry(path.leaf_slot);
        Ok((entry.pbn, entry.state))
    }

    /// Install `new` as the mapping for `lbn`, allocating interior pages on
    /// the way down. Returns the previous leaf entry.
    pub fn put_mapping(
        &mut self,
        device: &dyn BlockDevice,
        allocator: &mut dyn TreePageAllocator,
        lbn: LogicalBlockNumber,
        new: BlockMapEntry,
        recovery_sequence: u64,
    ) -> Result<Option<BlockMapEntry>> {
        let path = self.path_for(lbn)?;
        let mut current = self.roots[path.root];

        for digit in path.digits {
            let mut page = self.read_page(device, current)?;
            let entry = page.entry(digit);
            let child = match entry.state {
                MappingState::Mapped if !entry.pbn.is_zero() => entry.pbn,
                MappingState::Unmapped if entry.pbn.is_zero() => {
                    let child = allocator.allocate_tree_page()?;
                    trace!(
                        target: "dvol::blockmap",
                        lbn = lbn.0,
                        parent = current.0,
                        child = child.0,
                        "allocated interior tree page"
                    );
                    // Write the empty child before linking it so a torn
                    // update never exposes an uninitialized page.
                    let fresh = BlockMapPage::new(BlockMapPageHeader {
                        pbn: child,
                        nonce: self.nonce,
                        recovery_sequence,
                        generation: 0,
                    });
                    self.write_page(device, &fresh)?;

                    page.set_entry(
                        digit,
                        BlockMapEntry {
                            pbn: child,
                            state: MappingState::Mapped,
                        },
                    );
                    page.header.recovery_sequence = recovery_sequence;
                    page.header.generation += 1;
                    self.write_page(device, &page)?;
                    child
                }
                _ => {
                    return Err(DvolError::BadMapping {
                        page: current.0,
                        slot: u16::try_from(digit).unwrap_or(u16::MAX),
                        detail: "interior entry is structurally invalid",
                    });
                }
            };
            current = child;
        }

        let mut leaf = self.read_page(device, current)?;
        let old = leaf.entry(path.leaf_slot);
        leaf.set_entry(path.leaf_slot, new);
        leaf.header.recovery_sequence = recovery_sequence;
        leaf.header.generation += 1;
        self.write_page(device, &leaf)?;

        let was_mapped = !(old.state.is_unmapped() && old.pbn.is_zero());
        Ok(was_mapped.then_some(old))
    }

    /// Walk every reachable page, invoking `examiner` for each non-empty
    /// mapping. Interior entries are reported at their host page's slot
    /// with height > 0; a page is descended at most once, so reference
    /// cycles terminate.
    pub fn examine(&self, device: &dyn BlockDevice, examiner: &mut MappingExaminer<'_>) -> Result<()> {
        let mut visited: HashSet<u64> = HashSet::new();
        for root in &self.roots {
            self.walk(
                device,
                *root,
                BLOCK_MAP_TREE_HEIGHT - 1,
                &mut visited,
                examiner,
            )?;
        }
        Ok(())
    }

    fn walk(
        &self,
        device: &dyn BlockDevice,
        page_pbn: PhysicalBlockNumber,
        height: Height,
        visited: &mut HashSet<u64>,
        examiner: &mut MappingExaminer<'_>,
    ) -> Result<()> {
        let page = self.read_page(device, page_pbn)?;
        for (slot, entry) in page.entries().iter().enumerate() {
            if entry.state.is_unmapped() && entry.pbn.is_zero() {
                continue;
            }
            let slot_ref = BlockMapSlot {
                page: page_pbn,
                slot: u16::try_from(slot).unwrap_or(u16::MAX),
            };
            examiner(slot_ref, height, entry.pbn, entry.state)?;

            // Only structurally valid interior links are followed, and each
            // page only once.
            if height > 0
                && entry.state == MappingState::Mapped
                && !entry.pbn.is_zero()
                && visited.insert(entry.pbn.0)
            {
                self.walk(device, entry.pbn, height - 1, visited, examiner)?;
            }
        }
        Ok(())
    }
}
