//! Enumerated configuration for the write-back cache and the dispatch
//! queues. New knobs require extending these structs; there are no dynamic
//! parameter maps.

use std::time::Duration;

/// Configuration of one write-back cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheParams {
    /// Maximum time between automatic commit cycles.
    pub max_commit_interval: Duration,

    /// Pending-mutation count that forces an immediate commit cycle.
    /// 0 disables the overflow trigger.
    pub max_commit_updates: usize,

    /// Minimum pending mutations below which an automatic commit is
    /// skipped. A forced commit bypasses this.
    pub min_commit_updates: usize,

    /// Soft bound on cached objects; eviction runs once reached.
    /// 0 means unbounded.
    pub max_cache_size: usize,

    /// Evict eligible objects on every cycle, even below the size bound.
    pub always_evict: bool,

    /// Drop an object's age-table entry when the object leaves the cache.
    pub clear_object_age: bool,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            max_commit_interval: Duration::from_secs(5),
            max_commit_updates: 128,
            min_commit_updates: 1,
            max_cache_size: 1024,
            always_evict: false,
            clear_object_age: false,
        }
    }
}

/// Which backends receive a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Reads and writes go to the primary backend only.
    PrimaryReadPrimaryWrite,
    /// Reads go to the primary backend; writes go to every backend in
    /// order.
    PrimaryReadAllWrite,
    /// Reads and writes go to every backend in order.
    AllReadAllWrite,
}

/// What a dispatch queue does to a backend whose consecutive-failure
/// counter crosses its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// No structural change.
    Ignore,
    /// Remove the backend from the queue unconditionally.
    Drop,
    /// Remove the backend unless it is the only one left.
    DropUnlessLast,
    /// Move the backend to the tail of the order, demoting it from
    /// primary.
    PushToBack,
    /// Cycle the backend's `disconnect`/`connect` lifecycle hooks in
    /// place. Ordering of requests in flight across the reconnect is
    /// undefined.
    Reconnect,
}

/// Configuration of one dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueParams {
    /// Replication mode applied to every routed request.
    pub mode: ReplicationMode,

    /// Remediation applied when a failure counter crosses its threshold.
    pub failure_action: FailureAction,

    /// Consecutive read failures a backend may accumulate before the
    /// failure action fires.
    pub max_read_failures: u32,

    /// Consecutive write failures a backend may accumulate before the
    /// failure action fires.
    pub max_write_failures: u32,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::PrimaryReadAllWrite,
            failure_action: FailureAction::DropUnlessLast,
            max_read_failures: 3,
            max_write_failures: 3,
        }
    }
}
