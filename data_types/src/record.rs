//! Record types persisted through the storage layer.
//!
//! [`Record`] is a closed sum over the per-kind payload structs plus the
//! internal batch payload. The pipeline treats records as opaque values: the
//! only fields it ever touches are the object id, the kind and the
//! `modified` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{EntityKind, ObjectId};

/// Seconds since the UNIX epoch; precise enough for sync bookkeeping.
pub type Timestamp = u64;

/// A record shared between the cache and its callers.
///
/// The cache holds one strong reference per cached object and treats
/// `Arc::strong_count == 1` as "no outside borrow", which gates eviction and
/// rollback.
pub type SharedRecord = Arc<Record>;

/// Dirty-state marker embedded in every record.
///
/// Set by record mutators, cleared by the write-back cache once the commit
/// submission for the record has been accepted downstream. A set flag makes
/// the record ineligible for eviction.
#[derive(Debug, Default)]
pub struct ModifiedFlag(AtomicBool);

impl ModifiedFlag {
    /// Mark the owning record dirty.
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Mark the owning record clean.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Current dirty state.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Clone for ModifiedFlag {
    fn clone(&self) -> Self {
        Self(AtomicBool::new(self.is_set()))
    }
}

impl PartialEq for ModifiedFlag {
    fn eq(&self, other: &Self) -> bool {
        self.is_set() == other.is_set()
    }
}

/// How a device moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    /// The device pushes data to the server.
    Push,
    /// The device pulls data from the server.
    Pull,
}

/// Coarse user privilege tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Full administrative access.
    Admin,
    /// Regular user.
    User,
}

/// Flavour of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    /// Control-channel session.
    Command,
    /// Bulk data session.
    Data,
    /// Administrative session.
    Admin,
}

/// Unit of a schedule interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Months,
}

/// Severity of an event-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
    Debug,
}

/// The statistics the server tracks about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatisticType {
    InstallTimestamp,
    StartTimestamp,
    TotalTransferredData,
    TotalTransferredFiles,
    TotalFailedTransfers,
    TotalRetriedTransfers,
}

/// The system settings persisted through the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemParameter {
    DataAddress,
    DataPort,
    CommandAddress,
    CommandPort,
    ForceCommandEncryption,
    ForceDataEncryption,
    ForceDataCompression,
    SessionTimeout,
    SessionKeepAlive,
    DbOperationMode,
    DbMaxReadRetries,
    DbMaxWriteRetries,
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Object identifier.
    pub id: ObjectId,
    /// Owning user.
    pub owner: ObjectId,
    /// Human-readable device name.
    pub name: String,
    pub transfer_type: TransferType,
    pub address: String,
    pub port: u16,
    pub provisioned_at: Timestamp,
    pub locked: bool,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl DeviceRecord {
    /// Build a new device record with a fresh object id.
    pub fn new(
        owner: ObjectId,
        name: impl Into<String>,
        transfer_type: TransferType,
        address: impl Into<String>,
        port: u16,
        provisioned_at: Timestamp,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            owner,
            name: name.into(),
            transfer_type,
            address: address.into(),
            port,
            provisioned_at,
            locked: false,
            modified: ModifiedFlag::default(),
        }
    }

    /// Rename the device.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.modified.set();
    }

    /// Lock or unlock the device.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
        self.modified.set();
    }
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: ObjectId,
    pub name: String,
    pub password_hash: String,
    pub access_level: AccessLevel,
    pub locked: bool,
    pub created_at: Timestamp,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl UserRecord {
    /// Build a new user record with a fresh object id.
    pub fn new(
        name: impl Into<String>,
        password_hash: impl Into<String>,
        access_level: AccessLevel,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            name: name.into(),
            password_hash: password_hash.into(),
            access_level,
            locked: false,
            created_at,
            modified: ModifiedFlag::default(),
        }
    }

    /// Replace the stored password hash.
    pub fn set_password_hash(&mut self, hash: impl Into<String>) {
        self.password_hash = hash.into();
        self.modified.set();
    }

    /// Lock or unlock the account.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
        self.modified.set();
    }
}

/// A client session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: ObjectId,
    pub session_type: SessionType,
    pub device: ObjectId,
    pub user: ObjectId,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub persistent: bool,
    pub active: bool,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl SessionRecord {
    /// Build a new, active session record with a fresh object id.
    pub fn new(
        session_type: SessionType,
        device: ObjectId,
        user: ObjectId,
        opened_at: Timestamp,
        persistent: bool,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            session_type,
            device,
            user,
            opened_at,
            closed_at: None,
            persistent,
            active: true,
            modified: ModifiedFlag::default(),
        }
    }

    /// Close the session.
    pub fn close(&mut self, at: Timestamp) {
        self.closed_at = Some(at);
        self.active = false;
        self.modified.set();
    }
}

/// A sync-job schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: ObjectId,
    pub sync_job: ObjectId,
    pub interval_unit: IntervalUnit,
    pub interval_length: u32,
    pub next_run: Timestamp,
    pub active: bool,
    /// Run immediately if the scheduled point was missed while offline.
    pub run_if_missed: bool,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl ScheduleRecord {
    /// Build a new schedule record with a fresh object id.
    pub fn new(
        sync_job: ObjectId,
        interval_unit: IntervalUnit,
        interval_length: u32,
        next_run: Timestamp,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            sync_job,
            interval_unit,
            interval_length,
            next_run,
            active: true,
            run_if_missed: false,
            modified: ModifiedFlag::default(),
        }
    }

    /// Move the schedule to its next firing point.
    pub fn set_next_run(&mut self, next_run: Timestamp) {
        self.next_run = next_run;
        self.modified.set();
    }

    /// Enable or disable the schedule.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.modified.set();
    }
}

/// A file-synchronization job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobRecord {
    pub id: ObjectId,
    pub owner: ObjectId,
    pub source_device: ObjectId,
    pub destination_device: ObjectId,
    pub source_path: String,
    pub destination_path: String,
    pub one_way: bool,
    pub encrypted: bool,
    pub compressed: bool,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl SyncJobRecord {
    /// Build a new sync-job record with a fresh object id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner: ObjectId,
        source_device: ObjectId,
        destination_device: ObjectId,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        one_way: bool,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            owner,
            source_device,
            destination_device,
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            one_way,
            encrypted: false,
            compressed: false,
            modified: ModifiedFlag::default(),
        }
    }

    /// Toggle transport encryption for the job.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.encrypted = encrypted;
        self.modified.set();
    }
}

/// A server event-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: ObjectId,
    pub severity: LogSeverity,
    pub source: String,
    pub logged_at: Timestamp,
    pub message: String,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl LogRecord {
    /// Build a new log record with a fresh object id.
    pub fn new(
        severity: LogSeverity,
        source: impl Into<String>,
        logged_at: Timestamp,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            severity,
            source: source.into(),
            logged_at,
            message: message.into(),
            modified: ModifiedFlag::default(),
        }
    }
}

/// A server statistic sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticRecord {
    pub id: ObjectId,
    pub statistic: StatisticType,
    pub value: u64,
    pub updated_at: Timestamp,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl StatisticRecord {
    /// Build a new statistic record with a fresh object id.
    pub fn new(statistic: StatisticType, value: u64, updated_at: Timestamp) -> Self {
        Self {
            id: ObjectId::new(),
            statistic,
            value,
            updated_at,
            modified: ModifiedFlag::default(),
        }
    }

    /// Overwrite the sample value.
    pub fn set_value(&mut self, value: u64, updated_at: Timestamp) {
        self.value = value;
        self.updated_at = updated_at;
        self.modified.set();
    }
}

/// A system configuration setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettingRecord {
    pub id: ObjectId,
    pub parameter: SystemParameter,
    pub value: String,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl SystemSettingRecord {
    /// Build a new setting record with a fresh object id.
    pub fn new(parameter: SystemParameter, value: impl Into<String>) -> Self {
        Self {
            id: ObjectId::new(),
            parameter,
            value: value.into(),
            modified: ModifiedFlag::default(),
        }
    }

    /// Overwrite the setting value.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
        self.modified.set();
    }
}

/// An ordered sequence of records returned by a multi-object read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: ObjectId,
    /// Constituent records, in backend iteration order.
    pub records: Vec<SharedRecord>,
    #[serde(skip)]
    modified: ModifiedFlag,
}

impl BatchRecord {
    /// Wrap `records` into a batch with a fresh object id.
    pub fn new(records: Vec<SharedRecord>) -> Self {
        Self {
            id: ObjectId::new(),
            records,
            modified: ModifiedFlag::default(),
        }
    }
}

/// A record persisted through the storage layer, one variant per entity
/// kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Device(DeviceRecord),
    User(UserRecord),
    Session(SessionRecord),
    Schedule(ScheduleRecord),
    SyncJob(SyncJobRecord),
    Log(LogRecord),
    Statistic(StatisticRecord),
    SystemSetting(SystemSettingRecord),
    Batch(BatchRecord),
}

impl Record {
    /// Wrap constituent records into a batch record.
    pub fn batch(records: Vec<SharedRecord>) -> Self {
        Self::Batch(BatchRecord::new(records))
    }

    /// The record's object identifier.
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::Device(r) => r.id,
            Self::User(r) => r.id,
            Self::Session(r) => r.id,
            Self::Schedule(r) => r.id,
            Self::SyncJob(r) => r.id,
            Self::Log(r) => r.id,
            Self::Statistic(r) => r.id,
            Self::SystemSetting(r) => r.id,
            Self::Batch(r) => r.id,
        }
    }

    /// The record's entity kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Device(_) => EntityKind::Device,
            Self::User(_) => EntityKind::User,
            Self::Session(_) => EntityKind::Session,
            Self::Schedule(_) => EntityKind::Schedule,
            Self::SyncJob(_) => EntityKind::SyncJob,
            Self::Log(_) => EntityKind::Log,
            Self::Statistic(_) => EntityKind::Statistic,
            Self::SystemSetting(_) => EntityKind::SystemSetting,
            Self::Batch(_) => EntityKind::Batch,
        }
    }

    /// The batch payload, if this record is a batch.
    pub fn as_batch(&self) -> Option<&BatchRecord> {
        match self {
            Self::Batch(b) => Some(b),
            _ => None,
        }
    }

    fn modified_flag(&self) -> &ModifiedFlag {
        match self {
            Self::Device(r) => &r.modified,
            Self::User(r) => &r.modified,
            Self::Session(r) => &r.modified,
            Self::Schedule(r) => &r.modified,
            Self::SyncJob(r) => &r.modified,
            Self::Log(r) => &r.modified,
            Self::Statistic(r) => &r.modified,
            Self::SystemSetting(r) => &r.modified,
            Self::Batch(r) => &r.modified,
        }
    }

    /// Whether the record carries uncommitted mutations.
    pub fn is_modified(&self) -> bool {
        self.modified_flag().is_set()
    }

    /// Mark the record dirty; callers must do this before handing a mutated
    /// record back to the cache so eviction skips it.
    pub fn set_modified(&self) {
        self.modified_flag().set();
    }

    /// Mark the record clean; only the write-back cache calls this, after
    /// the record's commit submission was accepted.
    pub fn clear_modified(&self) {
        self.modified_flag().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn modified_flag_roundtrip() {
        let record = Record::User(UserRecord::new("a", "h", AccessLevel::User, 10));
        assert!(!record.is_modified());
        record.set_modified();
        assert!(record.is_modified());
        record.clear_modified();
        assert!(!record.is_modified());
    }

    #[test]
    fn mutators_set_the_flag() {
        let mut device = DeviceRecord::new(
            ObjectId::new(),
            "laptop",
            TransferType::Push,
            "10.0.0.2",
            9000,
            0,
        );
        assert!(!Record::Device(device.clone()).is_modified());
        device.set_locked(true);
        assert!(Record::Device(device).is_modified());
    }

    #[test]
    fn batch_exposes_constituents() {
        let a = Arc::new(Record::Log(LogRecord::new(
            LogSeverity::Info,
            "core",
            1,
            "started",
        )));
        let b = Arc::new(Record::Log(LogRecord::new(
            LogSeverity::Error,
            "net",
            2,
            "refused",
        )));
        let batch = Record::batch(vec![Arc::clone(&a), Arc::clone(&b)]);
        assert_eq!(batch.kind(), EntityKind::Batch);
        let constituents = &batch.as_batch().expect("is a batch").records;
        assert_eq!(constituents.len(), 2);
        assert_eq!(constituents[0].object_id(), a.object_id());
    }

    #[test]
    fn records_serialize_without_the_flag() {
        let mut stat = StatisticRecord::new(StatisticType::TotalTransferredFiles, 3, 7);
        stat.set_value(4, 8);
        let record = Record::Statistic(stat);
        let json = serde_json::to_string(&record).expect("serializes");
        let back: Record = serde_json::from_str(&json).expect("deserializes");
        // the dirty flag is transport-local state and must not round-trip
        assert!(!back.is_modified());
        record.clear_modified();
        assert_eq!(back, record);
    }
}
