//! Synchronous storage facade, see [`StoreManager`].
//!
//! The manager owns one [`DispatchQueue`] per storable entity kind and turns
//! every caller operation into an intake on the right queue plus a bounded
//! wait for the queue's aggregated completion. Callers never see the
//! asynchronous pipeline underneath; they get a record or a
//! [`StoreError`], within the configured call timeout.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use data_types::{
    AttachedBackendInfo, BackendId, CacheInfo, CacheParams, EntityKind, ObjectId, QueueInfo,
    QueueParams, ReadConstraint, RequestId, RequestIdGenerator, SharedRecord, StoreError,
};
use dispatcher::{DispatchQueue, QueueError};
use observability_deps::tracing::debug;
use parking_lot::{Condvar, Mutex};
use store_backend::StoreBackend;

mod instructions;
pub use instructions::*;

/// Configuration of the manager facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Upper bound every synchronous wrapper waits for its completion.
    pub call_timeout: Duration,
    /// Cache parameters applied when a backend is attached with a default
    /// cache wrap.
    pub default_cache_params: CacheParams,
    /// Queue parameters every per-kind queue starts with.
    pub default_queue_params: QueueParams,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            default_cache_params: CacheParams::default(),
            default_queue_params: QueueParams::default(),
        }
    }
}

/// Shared state of one in-flight synchronous call.
#[derive(Debug, Default)]
struct CallState {
    /// The queue-assigned request id, filled by the submitter while it
    /// holds the call lock; hooks treat an unset slot as "not mine".
    filter: Option<RequestId>,
    outcome: Option<Result<Option<SharedRecord>, StoreError>>,
}

#[derive(Debug, Default)]
struct SyncCall {
    state: Mutex<CallState>,
    done: Condvar,
}

impl SyncCall {
    /// Deliver a queue completion to the waiting caller if it matches the
    /// published request id. The submitter holds the call lock from before
    /// submission until the id is published, so an unset slot can only
    /// mean a foreign completion.
    fn complete(&self, request: RequestId, outcome: Result<Option<SharedRecord>, StoreError>) {
        let mut state = self.state.lock();
        if state.filter == Some(request) && state.outcome.is_none() {
            state.outcome = Some(outcome);
            self.done.notify_all();
        }
    }
}

/// One queue per entity kind plus the synchronous caller surface of the
/// storage layer.
#[derive(Debug)]
pub struct StoreManager {
    queues: HashMap<EntityKind, Arc<DispatchQueue>>,
    config: Mutex<ManagerConfig>,
    caller_ids: RequestIdGenerator,
}

impl StoreManager {
    /// Build a manager with one dispatch queue per storable kind.
    pub fn new(config: ManagerConfig) -> Self {
        let queues = EntityKind::STORABLE
            .iter()
            .map(|kind| {
                (
                    *kind,
                    Arc::new(DispatchQueue::new(*kind, config.default_queue_params)),
                )
            })
            .collect();
        Self {
            queues,
            config: Mutex::new(config),
            caller_ids: RequestIdGenerator::new(),
        }
    }

    fn queue(&self, kind: EntityKind) -> Result<&Arc<DispatchQueue>, QueueError> {
        self.queues
            .get(&kind)
            .ok_or(QueueError::UnsupportedKind { kind })
    }

    fn call_queue(&self, kind: EntityKind) -> Result<&Arc<DispatchQueue>, StoreError> {
        self.queues.get(&kind).ok_or(StoreError::Rejected {
            id: ObjectId::nil(),
        })
    }

    /// The synchronous call core: register completion hooks, submit while
    /// holding the call lock so the hooks cannot observe a half-published
    /// request id, then wait out the bounded completion.
    fn call(
        &self,
        kind: EntityKind,
        submit: impl FnOnce(&DispatchQueue) -> Result<RequestId, StoreError>,
    ) -> Result<Option<SharedRecord>, StoreError> {
        let queue = self.call_queue(kind)?;
        let caller_id = self.caller_ids.next_id();
        let timeout = self.config.lock().call_timeout;

        let call = Arc::new(SyncCall::default());
        let _on_success = {
            let call = Arc::clone(&call);
            queue.completions().on_success(move |_backend, request, record| {
                call.complete(request, Ok(record));
            })
        };
        let _on_failure = {
            let call = Arc::clone(&call);
            queue.completions().on_failure(move |_backend, request, error| {
                call.complete(request, Err(error));
            })
        };

        let outcome = {
            let mut state = call.state.lock();
            let request = submit(queue)?;
            state.filter = Some(request);
            debug!(%caller_id, %request, %kind, "caller waiting for completion");

            let deadline = Instant::now() + timeout;
            while state.outcome.is_none() {
                if call.done.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.outcome.take()
        };

        // the hooks drop on return; completions arriving after a timeout
        // find no subscriber and are discarded by the hub
        match outcome {
            Some(result) => result,
            None => {
                debug!(%caller_id, %kind, "caller timed out");
                Err(StoreError::Timeout)
            }
        }
    }

    /// Fetch the single record with `id`.
    pub fn get(&self, kind: EntityKind, id: ObjectId) -> Result<SharedRecord, StoreError> {
        let record = self.call(kind, |queue| queue.submit_read(ReadConstraint::ById(id)))?;
        record.ok_or(StoreError::NotFound { id })
    }

    /// Fetch the records matching `constraint`; multi-object constraints
    /// resolve to a batch record.
    pub fn query(
        &self,
        kind: EntityKind,
        constraint: ReadConstraint,
    ) -> Result<SharedRecord, StoreError> {
        let record = self.call(kind, move |queue| queue.submit_read(constraint))?;
        record.ok_or(StoreError::NotFound {
            id: ObjectId::nil(),
        })
    }

    /// Insert `record` under its own kind's queue.
    pub fn add(&self, record: SharedRecord) -> Result<(), StoreError> {
        let kind = record.kind();
        self.call(kind, move |queue| queue.submit_insert(record))
            .map(|_| ())
    }

    /// Update `record` under its own kind's queue.
    pub fn update(&self, record: SharedRecord) -> Result<(), StoreError> {
        let kind = record.kind();
        self.call(kind, move |queue| queue.submit_update(record))
            .map(|_| ())
    }

    /// Delete the record with `id`.
    pub fn remove(&self, kind: EntityKind, id: ObjectId) -> Result<(), StoreError> {
        self.call(kind, move |queue| queue.submit_delete(id))
            .map(|_| ())
    }

    fn add_checked(&self, kind: EntityKind, record: SharedRecord) -> Result<(), StoreError> {
        if record.kind() != kind {
            return Err(StoreError::Rejected {
                id: record.object_id(),
            });
        }
        self.add(record)
    }

    fn update_checked(&self, kind: EntityKind, record: SharedRecord) -> Result<(), StoreError> {
        if record.kind() != kind {
            return Err(StoreError::Rejected {
                id: record.object_id(),
            });
        }
        self.update(record)
    }

    /// Attach `backend` to the queue of its own kind; `with_cache` wraps it
    /// in a write-back cache using the default cache parameters.
    pub fn attach_backend(
        &self,
        backend: Arc<dyn StoreBackend>,
        with_cache: bool,
    ) -> Result<BackendId, QueueError> {
        let cache_params = with_cache.then(|| self.config.lock().default_cache_params);
        self.queue(backend.kind())?.attach_backend(backend, cache_params)
    }

    /// Attach `backend` wrapped in a write-back cache configured by
    /// `params`.
    pub fn attach_backend_with_cache_params(
        &self,
        backend: Arc<dyn StoreBackend>,
        params: CacheParams,
    ) -> Result<BackendId, QueueError> {
        self.queue(backend.kind())?.attach_backend(backend, Some(params))
    }

    /// Detach backend `id` from the queue serving `kind`.
    pub fn detach_backend(&self, kind: EntityKind, id: BackendId) -> Result<(), QueueError> {
        self.queue(kind)?.detach_backend(id)
    }

    /// The wrapper timeout.
    pub fn call_timeout(&self) -> Duration {
        self.config.lock().call_timeout
    }

    /// Replace the wrapper timeout; applies to calls started afterwards.
    pub fn set_call_timeout(&self, timeout: Duration) {
        self.config.lock().call_timeout = timeout;
    }

    /// The cache parameters used by default cache wraps.
    pub fn default_cache_params(&self) -> CacheParams {
        self.config.lock().default_cache_params
    }

    /// Replace the default cache parameters; applies to backends attached
    /// afterwards.
    pub fn set_default_cache_params(&self, params: CacheParams) {
        self.config.lock().default_cache_params = params;
    }

    /// The queue parameters for `kind`.
    pub fn queue_params(&self, kind: EntityKind) -> Result<QueueParams, QueueError> {
        Ok(self.queue(kind)?.params())
    }

    /// Replace the queue parameters for `kind`.
    pub fn set_queue_params(&self, kind: EntityKind, params: QueueParams) -> Result<(), QueueError> {
        self.queue(kind)?.set_params(params);
        Ok(())
    }

    /// The cache parameters of backend `id` under `kind`.
    pub fn cache_params(&self, kind: EntityKind, id: BackendId) -> Result<CacheParams, QueueError> {
        self.queue(kind)?.cache_params(id)
    }

    /// Replace the cache parameters of backend `id` under `kind`.
    pub fn set_cache_params(
        &self,
        kind: EntityKind,
        id: BackendId,
        params: CacheParams,
    ) -> Result<(), QueueError> {
        self.queue(kind)?.set_cache_params(id, params)
    }

    /// Snapshot of the queue serving `kind`.
    pub fn queue_info(&self, kind: EntityKind) -> Result<QueueInfo, QueueError> {
        Ok(self.queue(kind)?.queue_info())
    }

    /// Snapshots of the cache-wrapped backends under `kind`.
    pub fn caches_info(&self, kind: EntityKind) -> Result<Vec<CacheInfo>, QueueError> {
        Ok(self.queue(kind)?.caches_info())
    }

    /// Snapshots of the backends attached under `kind`.
    pub fn backends_info(&self, kind: EntityKind) -> Result<Vec<AttachedBackendInfo>, QueueError> {
        Ok(self.queue(kind)?.backends_info())
    }
}

/// Generates the per-kind caller wrappers: the same call core under
/// kind-specific names, with the record kind checked on the write paths.
macro_rules! kind_api {
    (
        $kind:ident,
        $get:ident,
        $query:ident,
        $get_all:ident,
        $add:ident,
        $update:ident,
        $remove:ident
    ) => {
        impl StoreManager {
            #[doc = concat!("Fetch the ", stringify!($kind), " record with `id`.")]
            pub fn $get(&self, id: ObjectId) -> Result<SharedRecord, StoreError> {
                self.get(EntityKind::$kind, id)
            }

            #[doc = concat!(
                "Fetch the ",
                stringify!($kind),
                " records matching `constraint`."
            )]
            pub fn $query(&self, constraint: ReadConstraint) -> Result<SharedRecord, StoreError> {
                self.query(EntityKind::$kind, constraint)
            }

            #[doc = concat!("Fetch every ", stringify!($kind), " record.")]
            pub fn $get_all(&self) -> Result<SharedRecord, StoreError> {
                self.query(EntityKind::$kind, ReadConstraint::All)
            }

            #[doc = concat!("Insert a new ", stringify!($kind), " record.")]
            pub fn $add(&self, record: SharedRecord) -> Result<(), StoreError> {
                self.add_checked(EntityKind::$kind, record)
            }

            #[doc = concat!("Update an existing ", stringify!($kind), " record.")]
            pub fn $update(&self, record: SharedRecord) -> Result<(), StoreError> {
                self.update_checked(EntityKind::$kind, record)
            }

            #[doc = concat!("Delete the ", stringify!($kind), " record with `id`.")]
            pub fn $remove(&self, id: ObjectId) -> Result<(), StoreError> {
                self.remove(EntityKind::$kind, id)
            }
        }
    };
}

kind_api!(
    Device,
    get_device,
    get_devices_by,
    get_all_devices,
    add_device,
    update_device,
    remove_device
);
kind_api!(
    User,
    get_user,
    get_users_by,
    get_all_users,
    add_user,
    update_user,
    remove_user
);
kind_api!(
    Session,
    get_session,
    get_sessions_by,
    get_all_sessions,
    add_session,
    update_session,
    remove_session
);
kind_api!(
    Schedule,
    get_schedule,
    get_schedules_by,
    get_all_schedules,
    add_schedule,
    update_schedule,
    remove_schedule
);
kind_api!(
    SyncJob,
    get_sync_job,
    get_sync_jobs_by,
    get_all_sync_jobs,
    add_sync_job,
    update_sync_job,
    remove_sync_job
);
kind_api!(
    Log,
    get_log,
    get_logs_by,
    get_all_logs,
    add_log,
    update_log,
    remove_log
);
kind_api!(
    Statistic,
    get_statistic,
    get_statistics_by,
    get_all_statistics,
    add_statistic,
    update_statistic,
    remove_statistic
);
kind_api!(
    SystemSetting,
    get_system_setting,
    get_system_settings_by,
    get_all_system_settings,
    add_system_setting,
    update_system_setting,
    remove_system_setting
);

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::{AccessLevel, LogRecord, LogSeverity, Record, UserRecord};
    use store_backend::mem::MemBackend;
    use store_backend::test_util::MockBackend;

    fn user(name: &str) -> SharedRecord {
        Arc::new(Record::User(UserRecord::new(
            name,
            "hash",
            AccessLevel::User,
            0,
        )))
    }

    fn manager_with_mem_users(with_cache: bool) -> StoreManager {
        let manager = StoreManager::new(ManagerConfig::default());
        manager
            .attach_backend(
                Arc::new(MemBackend::new(EntityKind::User)) as Arc<dyn StoreBackend>,
                with_cache,
            )
            .expect("attaches");
        manager
    }

    #[test]
    fn read_after_write_returns_the_new_record() {
        test_helpers::maybe_start_logging();
        let manager = manager_with_mem_users(true);

        let record = user("ana");
        let id = record.object_id();
        manager.add_user(record).expect("insert succeeds");

        let read = manager.get_user(id).expect("read succeeds");
        assert_matches!(&*read, Record::User(u) if u.name == "ana");
    }

    #[test]
    fn missing_objects_surface_not_found() {
        let manager = manager_with_mem_users(false);
        let id = ObjectId::new();
        assert_matches!(
            manager.get_user(id),
            Err(StoreError::NotFound { id: missing }) if missing == id
        );
    }

    #[test]
    fn get_all_resolves_to_a_batch() {
        let manager = manager_with_mem_users(false);
        manager.add_user(user("ana")).expect("inserts");
        manager.add_user(user("bo")).expect("inserts");

        let batch = manager.get_all_users().expect("reads");
        assert_eq!(batch.as_batch().expect("is a batch").records.len(), 2);
    }

    #[test]
    fn update_then_read_observes_the_update() {
        let manager = manager_with_mem_users(true);

        let original = UserRecord::new("cay", "hash", AccessLevel::User, 0);
        let id = original.id;
        manager
            .add_user(Arc::new(Record::User(original.clone())))
            .expect("inserts");

        let mut rotated = original;
        rotated.set_password_hash("rotated");
        manager
            .update_user(Arc::new(Record::User(rotated)))
            .expect("updates");

        let read = manager.get_user(id).expect("reads");
        assert_matches!(&*read, Record::User(u) if u.password_hash == "rotated");
    }

    #[test]
    fn remove_hides_the_record_from_reads() {
        let manager = manager_with_mem_users(true);

        let record = user("gone");
        let id = record.object_id();
        manager.add_user(record).expect("inserts");
        manager.remove_user(id).expect("removes");

        assert_matches!(manager.get_user(id), Err(StoreError::NotFound { .. }));
    }

    #[test]
    fn wrappers_check_the_record_kind() {
        let manager = manager_with_mem_users(false);
        let log = Arc::new(Record::Log(LogRecord::new(
            LogSeverity::Info,
            "core",
            0,
            "not a user",
        )));
        assert_matches!(
            manager.add_user(log),
            Err(StoreError::Rejected { .. })
        );
    }

    #[test]
    fn calls_time_out_and_late_completions_are_dropped() {
        let manager = StoreManager::new(ManagerConfig {
            call_timeout: Duration::from_secs(1),
            ..ManagerConfig::default()
        });
        let mock = Arc::new(MockBackend::new(EntityKind::User));
        manager
            .attach_backend(Arc::clone(&mock) as Arc<dyn StoreBackend>, false)
            .expect("attaches");

        let started = Instant::now();
        let outcome = manager.add_user(user("slow"));
        let elapsed = started.elapsed();

        assert_matches!(outcome, Err(StoreError::Timeout));
        assert!(elapsed >= Duration::from_millis(900));
        assert!(elapsed < Duration::from_secs(4));

        // the stale completion finds no hook and is dropped silently
        assert_eq!(mock.complete_pending(), 1);
        assert!(test_helpers::wait_for(
            || {
                manager
                    .queue_info(EntityKind::User)
                    .expect("queue exists")
                    .pending_requests
                    == 0
            },
            Duration::from_secs(5),
        ));
    }

    #[test]
    fn a_completion_racing_the_submission_is_not_lost() {
        // drive the mock from another thread while the caller blocks; the
        // completion may arrive arbitrarily close to the submission
        let manager = StoreManager::new(ManagerConfig::default());
        let mock = Arc::new(MockBackend::new(EntityKind::User));
        manager
            .attach_backend(Arc::clone(&mock) as Arc<dyn StoreBackend>, false)
            .expect("attaches");

        let driver = {
            let mock = Arc::clone(&mock);
            std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if mock.complete_pending() > 0 {
                        return;
                    }
                    std::thread::yield_now();
                }
            })
        };

        manager.add_user(user("racer")).expect("insert succeeds");
        driver.join().expect("driver thread exits");
    }

    #[test]
    fn configuration_roundtrips() {
        let manager = StoreManager::new(ManagerConfig::default());

        manager.set_call_timeout(Duration::from_secs(9));
        assert_eq!(manager.call_timeout(), Duration::from_secs(9));

        let cache_params = CacheParams {
            max_cache_size: 7,
            ..CacheParams::default()
        };
        manager.set_default_cache_params(cache_params);
        assert_eq!(manager.default_cache_params().max_cache_size, 7);

        let queue_params = QueueParams {
            max_read_failures: 11,
            ..QueueParams::default()
        };
        manager
            .set_queue_params(EntityKind::Log, queue_params)
            .expect("kind is storable");
        assert_eq!(
            manager
                .queue_params(EntityKind::Log)
                .expect("kind is storable")
                .max_read_failures,
            11
        );

        assert_matches!(
            manager.queue_params(EntityKind::Batch),
            Err(QueueError::UnsupportedKind { .. })
        );
    }

    #[test]
    fn attach_and_detach_backends_per_kind() {
        let manager = StoreManager::new(ManagerConfig::default());
        let a = Arc::new(MemBackend::new(EntityKind::Log));
        let b = Arc::new(MemBackend::new(EntityKind::Log));

        let id_a = manager
            .attach_backend(a as Arc<dyn StoreBackend>, false)
            .expect("attaches");
        let id_b = manager
            .attach_backend(b as Arc<dyn StoreBackend>, true)
            .expect("attaches");

        let info = manager.backends_info(EntityKind::Log).expect("kind exists");
        assert_eq!(info.len(), 2);
        assert!(!info[0].wraps_cache);
        assert!(info[1].wraps_cache);
        assert_eq!(manager.caches_info(EntityKind::Log).expect("kind exists").len(), 1);

        manager
            .detach_backend(EntityKind::Log, id_a)
            .expect("detaches");
        let info = manager.backends_info(EntityKind::Log).expect("kind exists");
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].id, id_b);
    }
}
