//! Shared vocabulary of the storage access layer: typed identifiers, entity
//! kinds, records, read constraints, the error taxonomy and the enumerated
//! configuration structs used by the cache, the dispatch queues and the
//! manager facade.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod constraint;
mod error;
mod info;
mod params;
mod record;

pub use constraint::*;
pub use error::*;
pub use info::*;
pub use params::*;
pub use record::*;

/// The closed set of entity kinds handled by the storage layer.
///
/// Every dispatch queue serves exactly one kind; object identifiers never
/// collide across kinds. [`EntityKind::Batch`] is internal and wraps a
/// sequence of records produced by a multi-object read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A registered device.
    Device,
    /// A user account.
    User,
    /// A command/data/admin session.
    Session,
    /// A sync-job schedule.
    Schedule,
    /// A file-synchronization job.
    SyncJob,
    /// A server event-log entry.
    Log,
    /// A server statistic.
    Statistic,
    /// A system configuration setting.
    SystemSetting,
    /// Internal: an ordered sequence of records treated as one payload.
    Batch,
}

impl EntityKind {
    /// Every kind that owns a dispatch queue ([`EntityKind::Batch`] does
    /// not; batches only ever travel as read results).
    pub const STORABLE: [Self; 8] = [
        Self::Device,
        Self::User,
        Self::Session,
        Self::Schedule,
        Self::SyncJob,
        Self::Log,
        Self::Statistic,
        Self::SystemSetting,
    ];
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Device => "device",
            Self::User => "user",
            Self::Session => "session",
            Self::Schedule => "schedule",
            Self::SyncJob => "sync-job",
            Self::Log => "log",
            Self::Statistic => "statistic",
            Self::SystemSetting => "system-setting",
            Self::Batch => "batch",
        };
        write!(f, "{name}")
    }
}

/// Immutable 128-bit identifier of a stored object, unique across the whole
/// system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The "unknown / not applicable" identifier used by failure
    /// completions that cannot name an object.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns true for [`ObjectId::nil`].
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Access the underlying UUID.
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::nil()
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a request within one allocation space.
///
/// The system runs three disjoint spaces at once (caller ids in the manager,
/// intake ids per dispatch queue, commit ids per cache); an id is only
/// meaningful together with the layer that allocated it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct RequestId(u64);

impl RequestId {
    /// Sentinel for "no request id assigned yet".
    pub const UNSET: Self = Self(0);

    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Access the raw id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates [`RequestId`]s from a private monotonic counter, starting at 1
/// so [`RequestId::UNSET`] is never handed out.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Create a generator with an empty history.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a back-end adapter within one dispatch queue, assigned when
/// the adapter is attached and stable thereafter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BackendId(u32);

impl BackendId {
    /// Sentinel for "not attached to a queue yet".
    pub const UNSET: Self = Self(0);

    /// Wrap a raw id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Access the raw id.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for BackendId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
