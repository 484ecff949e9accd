#![forbid(unsafe_code)]
//! The physical-zone core of dvol: reference-counting slab allocator, slab
//! journal, and slab summary.
//!
//! ## Design
//!
//! Each slab binds three pieces of state for one contiguous run of physical
//! blocks:
//!
//! 1. **Reference counts** — one byte per data block, packed into on-disk
//!    reference blocks with per-sector commit points.
//! 2. **Slab journal** — an ordered log of count adjustments. A journal
//!    sequence stays locked until every reference block carrying one of its
//!    adjustments has been written, which is what makes replay-after-crash
//!    recover exactly the uncommitted changes.
//! 3. **Admin state** — the lifecycle gate that rejects mutations while the
//!    slab drains, saves, or sits in read-only mode.
//!
//! All mutation happens on the owning zone thread; the only cross-thread
//! surfaces are the read-only bus and relaxed statistic snapshots.

pub mod admin;
pub mod journal;
pub mod pbn_lock;
pub mod readonly;
pub mod refcounts;
pub mod slab;
pub mod summary;

pub use admin::AdminState;
pub use journal::SlabJournal;
pub use pbn_lock::{PbnLock, PbnLockType};
pub use readonly::{ReadOnlyEvent, ReadOnlyNotifier, ReadOnlySink};
pub use refcounts::{RefCountStatistics, RefCounts};
pub use slab::Slab;
pub use summary::SlabSummaryZone;
