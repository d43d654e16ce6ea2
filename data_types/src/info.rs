//! Introspection snapshots. Plain owned data, safe to hold after the
//! component that produced them has moved on.

use crate::{BackendId, CacheParams, EntityKind, QueueParams};

/// A backend's self-description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    /// Driver name, e.g. `"mem"` or `"debug-file"`.
    pub name: String,
    /// The entity kind the backend persists.
    pub kind: EntityKind,
    /// Objects currently held by the backend.
    pub object_count: usize,
}

/// Point-in-time state of one write-back cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    /// Queue-assigned backend id of the cache.
    pub id: BackendId,
    /// Entity kind served.
    pub kind: EntityKind,
    /// Active configuration.
    pub params: CacheParams,
    /// Objects in the object table.
    pub cached_objects: usize,
    /// Entries in the age table.
    pub age_entries: usize,
    /// Mutations awaiting the next commit cycle.
    pub pending_mutations: usize,
    /// Current global age.
    pub global_age: u64,
    /// Intakes waiting for the request worker.
    pub pending_cache_requests: usize,
    /// Caller reads forwarded downstream and not yet completed.
    pub pending_downstream_requests: usize,
    /// Commit submissions not yet confirmed by the downstream backend.
    pub pending_commits: usize,
    /// Whether the automatic commit cycle is paused.
    pub commit_disabled: bool,
    /// Reads served from the object table.
    pub hits: u64,
    /// Reads forwarded downstream.
    pub misses: u64,
    /// Whether the cache has been asked to stop.
    pub stopped: bool,
}

/// Point-in-time state of one dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    /// Entity kind served.
    pub kind: EntityKind,
    /// Active configuration.
    pub params: QueueParams,
    /// Attached backends, in routing order (head is primary).
    pub backends: Vec<BackendId>,
    /// Completed or failed read completions observed.
    pub total_read_requests: u64,
    /// Completed or failed write completions observed.
    pub total_write_requests: u64,
    /// Read failures observed.
    pub total_read_failures: u64,
    /// Write failures observed.
    pub total_write_failures: u64,
    /// Intakes not yet routed.
    pub new_requests: usize,
    /// Routed requests still owing at least one backend completion.
    pub pending_requests: usize,
    /// Whether the queue has been asked to stop.
    pub stopped: bool,
}

/// Per-backend view held by a dispatch queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedBackendInfo {
    /// Queue-assigned backend id.
    pub id: BackendId,
    /// Consecutive read failures.
    pub read_failures: u32,
    /// Consecutive write failures.
    pub write_failures: u32,
    /// Whether the queue wrapped this backend in a write-back cache.
    pub wraps_cache: bool,
    /// The backend's self-description.
    pub info: BackendInfo,
}
