//! Shared plumbing for the in-process drivers: the operation queue, the
//! worker loop and the object-map semantics both drivers agree on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use data_types::{
    BackendId, EntityKind, ObjectId, ReadConstraint, Record, RequestId, SharedRecord, StoreError,
};
use hashbrown::HashMap;
use observability_deps::tracing::debug;
use parking_lot::{Condvar, Mutex};

/// One accepted submission awaiting the driver worker.
#[derive(Debug)]
pub(crate) enum BackendOp {
    Read(ReadConstraint),
    Insert(SharedRecord),
    Update(SharedRecord),
    Delete(ObjectId),
}

pub(crate) struct DriverState {
    pub(crate) objects: HashMap<ObjectId, Record>,
    pub(crate) queue: VecDeque<(RequestId, BackendOp)>,
}

/// State shared between a driver handle and its worker thread.
pub(crate) struct DriverCore {
    pub(crate) kind: EntityKind,
    pub(crate) id: AtomicU32,
    pub(crate) connected: AtomicBool,
    pub(crate) stop: AtomicBool,
    pub(crate) completions: crate::CompletionHub,
    pub(crate) state: Mutex<DriverState>,
    pub(crate) work_ready: Condvar,
}

impl DriverCore {
    pub(crate) fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            id: AtomicU32::new(BackendId::UNSET.get()),
            connected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            completions: crate::CompletionHub::new(),
            state: Mutex::new(DriverState {
                objects: HashMap::new(),
                queue: VecDeque::new(),
            }),
            work_ready: Condvar::new(),
        }
    }

    pub(crate) fn backend_id(&self) -> BackendId {
        BackendId::new(self.id.load(Ordering::Acquire))
    }

    /// Enqueue an operation for the worker. Returns false once stopped.
    pub(crate) fn enqueue(&self, request: RequestId, op: BackendOp) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.state.lock();
        state.queue.push_back((request, op));
        self.work_ready.notify_all();
        true
    }

    pub(crate) fn shutdown(&self, worker: &Mutex<Option<JoinHandle<()>>>) {
        self.stop.store(true, Ordering::Release);
        {
            let _guard = self.state.lock();
            self.work_ready.notify_all();
        }
        if let Some(handle) = worker.lock().take() {
            handle.join().ok();
        }
    }
}

/// Drains the operation queue, applying each operation to the object map
/// and emitting exactly one completion per accepted submission.
pub(crate) fn worker_loop(core: Arc<DriverCore>) {
    debug!(kind = %core.kind, "driver worker started");
    loop {
        let (request, outcome) = {
            let mut state = core.state.lock();
            let (request, op) = loop {
                if core.stop.load(Ordering::Acquire) {
                    debug!(kind = %core.kind, "driver worker stopped");
                    return;
                }
                if let Some(item) = state.queue.pop_front() {
                    break item;
                }
                core.work_ready.wait(&mut state);
            };
            let outcome = apply_op(&mut state.objects, op);
            (request, outcome)
        };

        let id = core.backend_id();
        match outcome {
            Ok(record) => core.completions.emit_success(id, request, record),
            Err(error) => core.completions.emit_failure(id, request, error),
        }
    }
}

/// The object-map semantics of the adapter contract: at-most-once apply,
/// deep copies on the way in, fresh allocations on the way out.
pub(crate) fn apply_op(
    objects: &mut HashMap<ObjectId, Record>,
    op: BackendOp,
) -> Result<Option<SharedRecord>, StoreError> {
    match op {
        BackendOp::Read(constraint) => match constraint.object_id() {
            Some(id) => objects
                .get(&id)
                .map(|record| Some(Arc::new(record.clone())))
                .ok_or(StoreError::NotFound { id }),
            None => {
                let matches: Vec<SharedRecord> = objects
                    .values()
                    .filter(|record| record_matches(record, &constraint))
                    .map(|record| Arc::new(record.clone()))
                    .collect();
                Ok(Some(Arc::new(Record::batch(matches))))
            }
        },
        BackendOp::Insert(record) => {
            let id = record.object_id();
            if objects.contains_key(&id) {
                return Err(StoreError::AlreadyExists { id });
            }
            objects.insert(id, (*record).clone());
            Ok(Some(record))
        }
        BackendOp::Update(record) => {
            let id = record.object_id();
            if !objects.contains_key(&id) {
                return Err(StoreError::NotFound { id });
            }
            objects.insert(id, (*record).clone());
            Ok(Some(record))
        }
        BackendOp::Delete(id) => objects
            .remove(&id)
            .map(|removed| Some(Arc::new(removed)))
            .ok_or(StoreError::NotFound { id }),
    }
}

/// Whether `record` satisfies a non-identity `constraint`.
pub(crate) fn record_matches(record: &Record, constraint: &ReadConstraint) -> bool {
    match constraint {
        ReadConstraint::All => true,
        ReadConstraint::ById(id) => record.object_id() == *id,
        ReadConstraint::ByName(name) => match record {
            Record::Device(r) => r.name == *name,
            Record::User(r) => r.name == *name,
            _ => false,
        },
        ReadConstraint::ByOwner(owner) => match record {
            Record::Device(r) => r.owner == *owner,
            Record::SyncJob(r) => r.owner == *owner,
            _ => false,
        },
        ReadConstraint::ByDevice(device) => match record {
            Record::Session(r) => r.device == *device,
            Record::SyncJob(r) => r.source_device == *device || r.destination_device == *device,
            _ => false,
        },
        ReadConstraint::ByUser(user) => match record {
            Record::Session(r) => r.user == *user,
            _ => false,
        },
        ReadConstraint::BySeverity(severity) => match record {
            Record::Log(r) => r.severity == *severity,
            _ => false,
        },
        ReadConstraint::ByStatistic(statistic) => match record {
            Record::Statistic(r) => r.statistic == *statistic,
            _ => false,
        },
        ReadConstraint::ByParameter(parameter) => match record {
            Record::SystemSetting(r) => r.parameter == *parameter,
            _ => false,
        },
    }
}
