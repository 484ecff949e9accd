#![forbid(unsafe_code)]
//! Dedup coordination: per-zone hash locks over chunk names.
//!
//! Each hash zone serializes all work on one chunk name behind a single
//! hash lock, borrowed from a preallocated pool sized to the maximum number
//! of concurrent user I/Os — so borrowing never blocks. The map from chunk
//! name to lock injects a fragment of the name itself as the hash code,
//! keeping the distribution independent of the fragment the dedup index
//! uses for its own buckets.

pub mod hash_zone;

pub use hash_zone::{
    ChunkName, HashLock, HashLockState, HashZone, HashZoneStatistics,
    HashZoneStatisticsSnapshot, LockHandle,
};
