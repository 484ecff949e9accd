//! Hash zones: single-writer lock domains over chunk names.

use dvol_error::{DvolError, Result};
use dvol_slab::PbnLock;
use dvol_types::ZoneCount;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;
use tracing::info;

/// Bytes in a chunk name (the content-derived record name).
pub const CHUNK_NAME_SIZE: usize = 16;

/// A content-derived chunk name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkName(pub [u8; CHUNK_NAME_SIZE]);

impl Hash for ChunkName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.0);
    }
}

/// Hasher that takes its value from bytes `[4..8]` of the chunk name.
///
/// The fragment must not overlap the bytes the dedup index hashes with
/// (`[0..4]`); reusing the index's fragment would correlate collision
/// patterns between the two subsystems.
#[derive(Debug, Default)]
pub struct FragmentHasher {
    state: u64,
}

impl Hasher for FragmentHasher {
    fn write(&mut self, bytes: &[u8]) {
        if bytes.len() >= 8 {
            self.state = u64::from(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]));
        }
    }

    fn finish(&self) -> u64 {
        self.state
    }
}

/// `BuildHasher` for the chunk-name lock map.
#[derive(Debug, Clone, Default)]
pub struct FragmentHashBuilder;

impl BuildHasher for FragmentHashBuilder {
    type Hasher = FragmentHasher;

    fn build_hasher(&self) -> FragmentHasher {
        FragmentHasher::default()
    }
}

/// Handle to a hash lock: an index into the zone's lock arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(pub u32);

/// States of the hash-lock machine. The machine itself lives with the write
/// pipeline; the zone only relies on the contract that a lock comes back in
/// `Destroying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashLockState {
    #[default]
    Initializing,
    Querying,
    Locking,
    Verifying,
    Deduping,
    Writing,
    Updating,
    Bypassing,
    Destroying,
}

/// A lock over all operations on one chunk name.
#[derive(Debug, Default)]
pub struct HashLock {
    name: ChunkName,
    state: HashLockState,
    registered: bool,
    waiter_count: usize,
    duplicate_lock: Option<PbnLock>,
    reference_count: u32,
}

impl HashLock {
    #[must_use]
    pub fn name(&self) -> ChunkName {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> HashLockState {
        self.state
    }

    pub fn set_state(&mut self, state: HashLockState) {
        self.state = state;
    }

    /// Whether this lock is present in its zone's chunk-name map.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiter_count
    }

    pub fn add_waiter(&mut self) {
        self.waiter_count += 1;
    }

    pub fn remove_waiter(&mut self) {
        self.waiter_count = self.waiter_count.saturating_sub(1);
    }

    #[must_use]
    pub fn duplicate_lock(&self) -> Option<&PbnLock> {
        self.duplicate_lock.as_ref()
    }

    pub fn set_duplicate_lock(&mut self, lock: Option<PbnLock>) {
        self.duplicate_lock = lock;
    }

    pub fn take_duplicate_lock(&mut self) -> Option<PbnLock> {
        self.duplicate_lock.take()
    }

    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    pub fn retain(&mut self) {
        self.reference_count += 1;
    }

    pub fn release(&mut self) {
        self.reference_count = self.reference_count.saturating_sub(1);
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Dedup statistics, written by the zone thread and snapshotted elsewhere
/// with relaxed loads.
#[derive(Debug, Default)]
pub struct HashZoneStatistics {
    pub dedupe_advice_valid: AtomicU64,
    pub dedupe_advice_stale: AtomicU64,
    pub concurrent_data_matches: AtomicU64,
    pub concurrent_hash_collisions: AtomicU64,
}

/// Relaxed snapshot of a zone's dedup statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HashZoneStatisticsSnapshot {
    pub dedupe_advice_valid: u64,
    pub dedupe_advice_stale: u64,
    pub concurrent_data_matches: u64,
    pub concurrent_hash_collisions: u64,
}

impl HashZoneStatistics {
    #[must_use]
    pub fn snapshot(&self) -> HashZoneStatisticsSnapshot {
        HashZoneStatisticsSnapshot {
            dedupe_advice_valid: self.dedupe_advice_valid.load(Ordering::Relaxed),
            dedupe_advice_stale: self.dedupe_advice_stale.load(Ordering::Relaxed),
            concurrent_data_matches: self.concurrent_data_matches.load(Ordering::Relaxed),
            concurrent_hash_collisions: self.concurrent_hash_collisions.load(Ordering::Relaxed),
        }
    }
}

/// One hash zone: a lock arena, its free list, and the chunk-name map.
pub struct HashZone {
    zone_number: ZoneCount,
    owner: ThreadId,
    locks: Vec<HashLock>,
    free: Vec<u32>,
    map: HashMap<ChunkName, u32, FragmentHashBuilder>,
    statistics: Arc<HashZoneStatistics>,
}

impl std::fmt::Debug for HashZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashZone")
            .field("zone_number", &self.zone_number)
            .field("capacity", &self.locks.len())
            .field("free", &self.free.len())
            .field("mapped", &self.map.len())
            .finish()
    }
}

impl HashZone {
    /// Create a zone with `capacity` preallocated locks, pinned to the
    /// calling thread. Capacity equals the maximum number of concurrent
    /// user I/Os, so `acquire` never has to wait.
    #[must_use]
    pub fn new(zone_number: ZoneCount, capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for index in (0..capacity).rev() {
            #[allow(clippy::cast_possible_truncation)]
            free.push(index as u32);
        }
        Self {
            zone_number,
            owner: std::thread::current().id(),
            locks: (0..capacity).map(|_| HashLock::default()).collect(),
            free,
            map: HashMap::with_hasher(FragmentHashBuilder),
            statistics: Arc::new(HashZoneStatistics::default()),
        }
    }

    #[must_use]
    pub fn zone_number(&self) -> ZoneCount {
        self.zone_number
    }

    #[must_use]
    pub fn statistics(&self) -> Arc<HashZoneStatistics> {
        Arc::clone(&self.statistics)
    }

    fn check_thread(&self) -> Result<()> {
        if std::thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(DvolError::Assertion("hash zone used off its zone thread"))
        }
    }

    #[must_use]
    pub fn lock(&self, handle: LockHandle) -> &HashLock {
        &self.locks[handle.0 as usize]
    }

    pub fn lock_mut(&mut self, handle: LockHandle) -> &mut HashLock {
        &mut self.locks[handle.0 as usize]
    }

    /// Look up the lock currently covering `name`.
    #[must_use]
    pub fn find(&self, name: &ChunkName) -> Option<LockHandle> {
        self.map.get(name).map(|index| LockHandle(*index))
    }

    fn recycle(&mut self, index: u32) {
        self.locks[index as usize].reset();
        self.free.push(index);
    }

    /// Borrow a lock for `name`. If the name is already covered, the
    /// borrowed lock is recycled and the existing lock returned — unless
    /// `replace` names that existing lock, in which case the new lock takes
    /// its place in the map.
    pub fn acquire(
        &mut self,
        name: ChunkName,
        replace: Option<LockHandle>,
    ) -> Result<LockHandle> {
        self.check_thread()?;

        // Borrow and prepare a lock up front so the common no-contention
        // case does a single map access.
        let Some(new_index) = self.free.pop() else {
            return Err(DvolError::Assertion("never need to wait for a free hash lock"));
        };
        self.locks[new_index as usize].name = name;

        match self.map.get(&name).copied() {
            Some(existing) => {
                if let Some(replace) = replace {
                    if replace.0 != existing || !self.locks[existing as usize].registered {
                        self.recycle(new_index);
                        return Err(DvolError::Assertion(
                            "replaced hash lock must be the registered map entry",
                        ));
                    }
                    self.locks[existing as usize].registered = false;
                    self.map.insert(name, new_index);
                    self.locks[new_index as usize].registered = true;
                    Ok(LockHandle(new_index))
                } else {
                    // Someone else already holds the name; hand back the
                    // borrowed lock.
                    self.recycle(new_index);
                    Ok(LockHandle(existing))
                }
            }
            None => {
                if replace.is_some() {
                    self.recycle(new_index);
                    return Err(DvolError::Assertion(
                        "replaced hash lock was not in the lock map",
                    ));
                }
                self.map.insert(name, new_index);
                self.locks[new_index as usize].registered = true;
                Ok(LockHandle(new_index))
            }
        }
    }

    /// Return a lock to the pool. The lock must be in `Destroying` state,
    /// with no waiters and no duplicate PBN lock.
    pub fn return_lock(&mut self, handle: LockHandle) -> Result<()> {
        self.check_thread()?;
        let index = handle.0 as usize;
        let lock = &self.locks[index];

        if lock.state != HashLockState::Destroying {
            return Err(DvolError::Assertion("returned hash lock must not be in use"));
        }
        if lock.waiter_count != 0 {
            return Err(DvolError::Assertion(
                "hash lock returned to zone must have no waiters",
            ));
        }
        if lock.duplicate_lock.is_some() {
            return Err(DvolError::Assertion(
                "hash lock returned to zone must not reference a PBN lock",
            ));
        }

        if lock.registered {
            let removed = self.map.remove(&lock.name);
            if removed != Some(handle.0) {
                return Err(DvolError::Assertion(
                    "hash lock being released must have been mapped",
                ));
            }
        } else if self.map.get(&lock.name) == Some(&handle.0) {
            return Err(DvolError::Assertion(
                "unregistered hash lock must not be in the lock map",
            ));
        }

        self.recycle(handle.0);
        Ok(())
    }

    // Single-writer statistic bumps; observers read relaxed snapshots.

    pub fn bump_valid_advice(&self) {
        self.statistics.dedupe_advice_valid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_stale_advice(&self) {
        self.statistics.dedupe_advice_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_data_match(&self) {
        self.statistics.concurrent_data_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_collision(&self) {
        self.statistics.concurrent_hash_collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Log a terse description of every lock not sitting in the pool.
    pub fn dump(&self) {
        info!(
            target: "dvol::dedup",
            zone = self.zone_number,
            mapped = self.map.len(),
            free = self.free.len(),
            "hash zone"
        );
        for (index, lock) in self.locks.iter().enumerate() {
            if self.free.contains(&(index as u32)) {
                continue;
            }
            info!(
                target: "dvol::dedup",
                index,
                state = ?lock.state,
                registered = lock.registered,
                references = lock.reference_count,
                waiters = lock.waiter_count,
                "hash lock"
            );
        }
    }
}
