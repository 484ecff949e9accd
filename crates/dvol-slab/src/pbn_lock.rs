//! Ownership tokens for physical blocks.
//!
//! A PBN lock is held by one in-flight write over one physical block. While
//! a block's counter is provisional, exactly one lock owns that provisional
//! reference; the flag here moves in lockstep with the counter transitions
//! in the reference-count table.

use dvol_types::PhysicalBlockNumber;

/// What the holder is doing with the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PbnLockType {
    /// Holder allocated the block and is writing new data.
    #[default]
    Write,
    /// Holder is deduplicating against existing data.
    Read,
}

/// An ownership token for a specific PBN held by an in-flight write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbnLock {
    pbn: PhysicalBlockNumber,
    kind: PbnLockType,
    holds_provisional: bool,
}

impl PbnLock {
    #[must_use]
    pub fn new(pbn: PhysicalBlockNumber, kind: PbnLockType) -> Self {
        Self {
            pbn,
            kind,
            holds_provisional: false,
        }
    }

    #[must_use]
    pub fn pbn(&self) -> PhysicalBlockNumber {
        self.pbn
    }

    #[must_use]
    pub fn kind(&self) -> PbnLockType {
        self.kind
    }

    /// Record that this lock now owns the block's provisional reference.
    pub fn assign_provisional_reference(&mut self) {
        self.holds_provisional = true;
    }

    /// Record that the provisional reference has been confirmed or released.
    pub fn unassign_provisional_reference(&mut self) {
        self.holds_provisional = false;
    }

    #[must_use]
    pub fn holds_provisional_reference(&self) -> bool {
        self.holds_provisional
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_flag_follows_assignment() {
        let mut lock = PbnLock::new(PhysicalBlockNumber(5), PbnLockType::Write);
        assert!(!lock.holds_provisional_reference());
        lock.assign_provisional_reference();
        assert!(lock.holds_provisional_reference());
        lock.unassign_provisional_reference();
        assert!(!lock.holds_provisional_reference());
        assert_eq!(lock.pbn(), PhysicalBlockNumber(5));
        assert_eq!(lock.kind(), PbnLockType::Write);
    }
}
