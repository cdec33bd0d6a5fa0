//! Actor, worker and service identifiers.
//!
//! An [`ActorId`] packs a `(ServiceId, WorkerId)` pair into one `u32`.
//! Service ids in `[1, NB_RESERVED_SERVICE_IDS]` name singleton service
//! actors; everything above that (up to the broadcast sentinel) is handed
//! out by the owning worker's free pool and recycled on that worker only.

use std::fmt;

use thiserror::Error;

/// Service slot on a worker; the low half of an [`ActorId`].
pub type ServiceId = u16;

/// Index of a worker (one per selected CPU); the high half of an [`ActorId`].
pub type WorkerId = u16;

/// Service ids `[1, NB_RESERVED_SERVICE_IDS]` are reserved for service
/// actors and never recycled.
pub const NB_RESERVED_SERVICE_IDS: ServiceId = 10_000;

/// Destination service id meaning "every actor on that worker".
pub const BROADCAST_SID: ServiceId = u16::MAX;

/// Upper bound on workers per engine, kept well under the startup-barrier
/// failure sentinel.
pub const MAX_WORKERS: usize = 256;

/// Unique address of an actor: `(service_id, worker)` packed as a `u32`.
///
/// Unique across the lifetime of the engine for its actor; a dead actor's
/// non-reserved service id may be reused on the same worker only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ActorId(u32);

impl ActorId {
    /// Sentinel for "no such actor"; returned on allocation failure and
    /// rejected constructions.
    pub const NOT_FOUND: ActorId = ActorId(0);

    #[inline]
    pub fn new(service_id: ServiceId, worker: WorkerId) -> Self {
        ActorId((worker as u32) << 16 | service_id as u32)
    }

    /// The per-worker broadcast address.
    #[inline]
    pub fn broadcast(worker: WorkerId) -> Self {
        ActorId::new(BROADCAST_SID, worker)
    }

    #[inline]
    pub fn service_id(self) -> ServiceId {
        self.0 as u16
    }

    #[inline]
    pub fn worker(self) -> WorkerId {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub fn is_broadcast(self) -> bool {
        self.service_id() == BROADCAST_SID
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self != ActorId::NOT_FOUND
    }

    /// Raw packed value.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.worker(), self.service_id())
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({}.{})", self.worker(), self.service_id())
    }
}

// ---------------------------------------------------------------------------
// CoreSet
// ---------------------------------------------------------------------------

/// Invalid [`CoreSet`] construction.
#[derive(Debug, Error)]
pub enum CoreSetError {
    #[error("core set must not be empty")]
    Empty,
    #[error("worker id {0} exceeds the supported cpu range")]
    OutOfRange(WorkerId),
    #[error("too many workers: {0} (max {MAX_WORKERS})")]
    TooMany(usize),
}

/// Highest accepted physical cpu index.
const MAX_CPU_ID: WorkerId = 1023;

/// The subset of CPUs the engine runs on: one worker per entry.
///
/// Worker ids are physical cpu indices; `resolve` maps them to the dense
/// index used for mailbox and pipe arrays.
#[derive(Clone)]
pub struct CoreSet {
    raw: Vec<WorkerId>,
    resolve: Vec<u16>,
}

impl CoreSet {
    /// Build from an explicit set of cpu indices. Duplicates are collapsed;
    /// the dense order is ascending cpu index.
    pub fn new<I: IntoIterator<Item = WorkerId>>(ids: I) -> Result<Self, CoreSetError> {
        let mut raw: Vec<WorkerId> = ids.into_iter().collect();
        raw.sort_unstable();
        raw.dedup();
        if raw.is_empty() {
            return Err(CoreSetError::Empty);
        }
        if raw.len() > MAX_WORKERS {
            return Err(CoreSetError::TooMany(raw.len()));
        }
        let max = *raw.last().unwrap();
        if max > MAX_CPU_ID {
            return Err(CoreSetError::OutOfRange(max));
        }

        let mut resolve = vec![u16::MAX; max as usize + 1];
        for (idx, &id) in raw.iter().enumerate() {
            resolve[id as usize] = idx as u16;
        }
        Ok(CoreSet { raw, resolve })
    }

    /// One worker per available CPU.
    pub fn auto() -> Self {
        let n = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS);
        CoreSet::new(0..n as WorkerId).expect("non-empty bounded set")
    }

    /// Number of workers.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Dense index of `worker`, or `None` if it is not part of the set.
    #[inline]
    pub fn resolve(&self, worker: WorkerId) -> Option<usize> {
        match self.resolve.get(worker as usize) {
            Some(&idx) if idx != u16::MAX => Some(idx as usize),
            _ => None,
        }
    }

    #[inline]
    pub fn contains(&self, worker: WorkerId) -> bool {
        self.resolve(worker).is_some()
    }

    /// Worker ids in dense order.
    #[inline]
    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.raw.iter().copied()
    }
}

impl fmt::Debug for CoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CoreSet").field(&self.raw).finish()
    }
}

// ---------------------------------------------------------------------------
// IdPool
// ---------------------------------------------------------------------------

/// Per-worker free pool of non-reserved service ids.
///
/// Seeded with `(NB_RESERVED_SERVICE_IDS, BROADCAST_SID)` exclusive;
/// allocation hands out the lowest ids first. Reserved ids never enter the
/// pool.
pub(crate) struct IdPool {
    free: Vec<ServiceId>,
}

impl IdPool {
    pub(crate) fn new() -> Self {
        // Reversed so `pop` yields NB_RESERVED_SERVICE_IDS + 1 first.
        let free = (NB_RESERVED_SERVICE_IDS + 1..BROADCAST_SID).rev().collect();
        IdPool { free }
    }

    /// O(1) allocation; `None` when exhausted.
    pub(crate) fn allocate(&mut self) -> Option<ServiceId> {
        self.free.pop()
    }

    /// Return a service id to the pool. Reserved ids are kept out so a
    /// re-`require` of a service always finds the same id.
    pub(crate) fn release(&mut self, sid: ServiceId) {
        if sid > NB_RESERVED_SERVICE_IDS && sid < BROADCAST_SID {
            self.free.push(sid);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_id_packing() {
        let id = ActorId::new(42, 3);
        assert_eq!(id.service_id(), 42);
        assert_eq!(id.worker(), 3);
        assert!(id.is_valid());
        assert!(!id.is_broadcast());
        assert_eq!(format!("{}", id), "3.42");
    }

    #[test]
    fn test_broadcast_and_not_found() {
        let b = ActorId::broadcast(7);
        assert!(b.is_broadcast());
        assert_eq!(b.worker(), 7);

        assert!(!ActorId::NOT_FOUND.is_valid());
        assert_eq!(ActorId::NOT_FOUND.service_id(), 0);
    }

    #[test]
    fn test_core_set_resolution() {
        let set = CoreSet::new([2, 0, 5, 2]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.resolve(0), Some(0));
        assert_eq!(set.resolve(2), Some(1));
        assert_eq!(set.resolve(5), Some(2));
        assert_eq!(set.resolve(1), None);
        assert_eq!(set.resolve(100), None);
        assert_eq!(set.workers().collect::<Vec<_>>(), vec![0, 2, 5]);
    }

    #[test]
    fn test_core_set_rejects_bad_input() {
        assert!(matches!(
            CoreSet::new([0u16; 0]),
            Err(CoreSetError::Empty)
        ));
        assert!(matches!(
            CoreSet::new([5000]),
            Err(CoreSetError::OutOfRange(5000))
        ));
        assert!(matches!(
            CoreSet::new(0..300),
            Err(CoreSetError::TooMany(300))
        ));
    }

    #[test]
    fn test_id_pool_allocates_lowest_first() {
        let mut pool = IdPool::new();
        assert_eq!(pool.allocate(), Some(NB_RESERVED_SERVICE_IDS + 1));
        assert_eq!(pool.allocate(), Some(NB_RESERVED_SERVICE_IDS + 2));
    }

    #[test]
    fn test_id_pool_release_rules() {
        let mut pool = IdPool::new();
        let a = pool.allocate().unwrap();
        pool.release(a);
        assert_eq!(pool.allocate(), Some(a));

        // Reserved ids never enter the pool.
        let before = pool.free.len();
        pool.release(5);
        pool.release(NB_RESERVED_SERVICE_IDS);
        assert_eq!(pool.free.len(), before);
    }

    #[test]
    fn test_id_pool_exhaustion() {
        let mut pool = IdPool::new();
        let mut count = 0usize;
        while pool.allocate().is_some() {
            count += 1;
        }
        // (NB_RESERVED, BROADCAST) exclusive on both ends.
        assert_eq!(
            count,
            (BROADCAST_SID - NB_RESERVED_SERVICE_IDS - 1) as usize
        );
        assert_eq!(pool.allocate(), None);
    }
}
