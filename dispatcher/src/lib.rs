//! Request dispatch across an ordered list of storage backends, see
//! [`DispatchQueue`].
//!
//! One queue serves one entity kind. Intakes are routed to one or more
//! attached backends according to the configured [`ReplicationMode`];
//! per-backend consecutive-failure counters drive the configured
//! [`FailureAction`]; every routed request produces exactly one aggregated
//! caller completion.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use data_types::{
    AttachedBackendInfo, BackendId, CacheInfo, CacheParams, EntityKind, FailureAction, ObjectId,
    QueueInfo, QueueParams, ReadConstraint, ReplicationMode, RequestId, RequestIdGenerator,
    SharedRecord, StoreError,
};
use hashbrown::HashMap;
use observability_deps::tracing::{debug, warn};
use parking_lot::{Condvar, Mutex};
use store_backend::{CompletionHub, StoreBackend, Subscription};
use thiserror::Error;
use write_cache::WriteBackCache;

/// Errors of the queue's attach/detach and configuration surface.
#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    /// The backend persists a different entity kind than the queue serves.
    #[error("backend kind {actual} does not match queue kind {expected}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    /// No backend with the given id is attached.
    #[error("unknown backend <{id}>")]
    UnknownBackend { id: BackendId },

    /// No dispatch queue serves the given kind (e.g. the internal batch
    /// kind).
    #[error("no queue serves kind {kind}")]
    UnsupportedKind { kind: EntityKind },

    /// The backend exists but is not wrapped in a write-back cache.
    #[error("backend <{id}> is not wrapped in a cache")]
    NotACache { id: BackendId },

    /// The queue has been asked to stop.
    #[error("queue is shutting down")]
    Shutdown,
}

/// An intake waiting to be routed.
#[derive(Debug)]
enum QueueOp {
    Read(ReadConstraint),
    Insert(SharedRecord),
    Update(SharedRecord),
    Delete(ObjectId),
}

impl QueueOp {
    fn is_read(&self) -> bool {
        matches!(self, Self::Read(_))
    }

    fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Read(constraint) => constraint.object_id(),
            Self::Insert(record) | Self::Update(record) => Some(record.object_id()),
            Self::Delete(id) => Some(*id),
        }
    }
}

#[derive(Debug)]
struct BackendSlot {
    backend: Arc<dyn StoreBackend>,
    /// Typed handle kept when the queue wrapped the backend itself, for
    /// cache introspection and parameter updates.
    cache: Option<Arc<WriteBackCache>>,
    read_failures: u32,
    write_failures: u32,
    _subs: Vec<Subscription>,
}

/// A routed request still owing backend completions.
#[derive(Debug)]
struct PendingRequest {
    is_read: bool,
    remaining: Vec<BackendId>,
    /// Set once the caller completion fired (first success wins).
    done: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct QueueStats {
    read_requests: u64,
    write_requests: u64,
    read_failures: u64,
    write_failures: u64,
}

#[derive(Debug)]
struct QueueState {
    params: QueueParams,
    /// Routing order; the head is the primary backend.
    order: VecDeque<BackendId>,
    slots: HashMap<BackendId, BackendSlot>,
    next_backend_id: u32,
    new_requests: VecDeque<(RequestId, QueueOp)>,
    pending: HashMap<RequestId, PendingRequest>,
    stats: QueueStats,
}

struct QueueShared {
    kind: EntityKind,
    completions: CompletionHub,
    state: Mutex<QueueState>,
    cond: Condvar,
    stop: AtomicBool,
    intake_ids: RequestIdGenerator,
}

impl QueueShared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Route one intake to its target set, recording the pending entry.
    /// Runs under the queue lock; backends complete asynchronously, so
    /// submitting here cannot re-enter the queue.
    fn route(
        &self,
        state: &mut QueueState,
        request: RequestId,
        op: QueueOp,
        emissions: &mut Vec<(BackendId, RequestId, StoreError)>,
        reconnects: &mut Vec<Arc<dyn StoreBackend>>,
    ) {
        let is_read = op.is_read();
        let targets: Vec<BackendId> = match (state.params.mode, is_read) {
            (ReplicationMode::PrimaryReadPrimaryWrite, _)
            | (ReplicationMode::PrimaryReadAllWrite, true) => {
                state.order.front().copied().into_iter().collect()
            }
            _ => state.order.iter().copied().collect(),
        };

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for backend_id in targets {
            let slot = match state.slots.get(&backend_id) {
                Some(slot) => slot,
                None => continue,
            };
            let ok = match &op {
                QueueOp::Read(constraint) => slot.backend.submit_read(request, constraint.clone()),
                QueueOp::Insert(record) => slot.backend.submit_insert(request, Arc::clone(record)),
                QueueOp::Update(record) => slot.backend.submit_update(request, Arc::clone(record)),
                QueueOp::Delete(id) => slot.backend.submit_delete(request, *id),
            };
            if ok {
                accepted.push(backend_id);
            } else {
                warn!(kind = %self.kind, %request, backend = %backend_id, "backend rejected submission");
                rejected.push(backend_id);
            }
        }

        for backend_id in &rejected {
            if let Some(backend) = note_failure(state, *backend_id, is_read) {
                reconnects.push(backend);
            }
        }

        if accepted.is_empty() {
            let error = StoreError::Rejected {
                id: op.object_id().unwrap_or_else(ObjectId::nil),
            };
            let backend = rejected.last().copied().unwrap_or(BackendId::UNSET);
            emissions.push((backend, request, error));
        } else {
            state.pending.insert(
                request,
                PendingRequest {
                    is_read,
                    remaining: accepted,
                    done: false,
                },
            );
        }
    }

    fn handle_success(&self, backend: BackendId, request: RequestId, record: Option<SharedRecord>) {
        if self.stopped() {
            return;
        }
        let emit = {
            let mut state = self.state.lock();
            let (is_read, first, finished) = match state.pending.get_mut(&request) {
                None => {
                    warn!(kind = %self.kind, %request, backend = %backend, "dropping stale success completion");
                    return;
                }
                Some(entry) => {
                    let first = !entry.done;
                    entry.done = true;
                    entry.remaining.retain(|id| *id != backend);
                    (entry.is_read, first, entry.remaining.is_empty())
                }
            };
            if finished {
                state.pending.remove(&request);
            }
            if is_read {
                state.stats.read_requests += 1;
            } else {
                state.stats.write_requests += 1;
            }
            if let Some(slot) = state.slots.get_mut(&backend) {
                if is_read {
                    slot.read_failures = 0;
                } else {
                    slot.write_failures = 0;
                }
            }
            first
        };
        if emit {
            self.completions.emit_success(backend, request, record);
        }
    }

    fn handle_failure(&self, backend: BackendId, request: RequestId, error: StoreError) {
        if self.stopped() {
            return;
        }
        let (emit, reconnect) = {
            let mut state = self.state.lock();
            let (is_read, done, finished) = match state.pending.get_mut(&request) {
                None => {
                    warn!(kind = %self.kind, %request, backend = %backend, %error, "dropping stale failure completion");
                    return;
                }
                Some(entry) => {
                    entry.remaining.retain(|id| *id != backend);
                    (entry.is_read, entry.done, entry.remaining.is_empty())
                }
            };
            let reconnect = note_failure(&mut state, backend, is_read);
            let emit = if finished {
                state.pending.remove(&request);
                !done
            } else {
                false
            };
            (emit, reconnect)
        };

        if let Some(backend_handle) = reconnect {
            backend_handle.disconnect();
            backend_handle.connect();
        }
        if emit {
            self.completions.emit_failure(backend, request, error);
        }
    }
}

impl std::fmt::Debug for QueueShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueShared")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Bump the failure counter for `backend` and apply the configured failure
/// action when the threshold is crossed. Returns the backend handle when a
/// reconnect must run after the queue lock is released.
fn note_failure(
    state: &mut QueueState,
    backend: BackendId,
    is_read: bool,
) -> Option<Arc<dyn StoreBackend>> {
    if is_read {
        state.stats.read_requests += 1;
        state.stats.read_failures += 1;
    } else {
        state.stats.write_requests += 1;
        state.stats.write_failures += 1;
    }

    let params = state.params;
    let crossed = {
        let slot = state.slots.get_mut(&backend)?;
        if is_read {
            slot.read_failures += 1;
            slot.read_failures >= params.max_read_failures
        } else {
            slot.write_failures += 1;
            slot.write_failures >= params.max_write_failures
        }
    };
    if !crossed {
        return None;
    }

    debug!(backend = %backend, action = ?params.failure_action, "failure threshold crossed");
    match params.failure_action {
        FailureAction::Ignore => None,
        FailureAction::Drop => {
            remove_slot(state, backend);
            None
        }
        FailureAction::DropUnlessLast => {
            if state.slots.len() > 1 {
                remove_slot(state, backend);
            } else {
                reset_counters(state, backend, is_read);
            }
            None
        }
        FailureAction::PushToBack => {
            if state.order.len() > 1 {
                state.order.retain(|id| *id != backend);
                state.order.push_back(backend);
            }
            reset_counters(state, backend, is_read);
            None
        }
        FailureAction::Reconnect => {
            // a fresh connection starts with a clean slate on both paths
            if let Some(slot) = state.slots.get_mut(&backend) {
                slot.read_failures = 0;
                slot.write_failures = 0;
            }
            state
                .slots
                .get(&backend)
                .map(|slot| Arc::clone(&slot.backend))
        }
    }
}

fn remove_slot(state: &mut QueueState, backend: BackendId) {
    state.order.retain(|id| *id != backend);
    if state.slots.remove(&backend).is_some() {
        debug!(backend = %backend, "backend removed from queue");
    }
}

fn reset_counters(state: &mut QueueState, backend: BackendId, is_read: bool) {
    if let Some(slot) = state.slots.get_mut(&backend) {
        if is_read {
            slot.read_failures = 0;
        } else {
            slot.write_failures = 0;
        }
    }
}

fn router_worker(shared: Arc<QueueShared>) {
    debug!(kind = %shared.kind, "router worker started");
    loop {
        let emissions = {
            let mut state = shared.state.lock();
            loop {
                if shared.stopped() {
                    debug!(kind = %shared.kind, "router worker stopped");
                    return;
                }
                if !state.order.is_empty() && !state.new_requests.is_empty() {
                    break;
                }
                shared.cond.wait(&mut state);
            }

            let mut emissions = Vec::new();
            let mut reconnects = Vec::new();
            while let Some((request, op)) = state.new_requests.pop_front() {
                shared.route(&mut state, request, op, &mut emissions, &mut reconnects);
            }
            drop(state);

            for backend in reconnects {
                backend.disconnect();
                backend.connect();
            }
            emissions
        };

        for (backend, request, error) in emissions {
            shared.completions.emit_failure(backend, request, error);
        }
    }
}

/// Ordered-backend request router for one entity kind.
///
/// Attach backends with [`DispatchQueue::attach_backend`], optionally
/// wrapping each in a [`WriteBackCache`]; submit requests with the
/// `submit_*` methods and observe the single aggregated outcome per request
/// on [`DispatchQueue::completions`].
#[derive(Debug)]
pub struct DispatchQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchQueue {
    /// Create a queue for `kind` and start its router worker.
    pub fn new(kind: EntityKind, params: QueueParams) -> Self {
        let shared = Arc::new(QueueShared {
            kind,
            completions: CompletionHub::new(),
            state: Mutex::new(QueueState {
                params,
                order: VecDeque::new(),
                slots: HashMap::new(),
                next_backend_id: 1,
                new_requests: VecDeque::new(),
                pending: HashMap::new(),
                stats: QueueStats::default(),
            }),
            cond: Condvar::new(),
            stop: AtomicBool::new(false),
            intake_ids: RequestIdGenerator::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("dispatch-queue-{kind}"))
                .spawn(move || router_worker(shared))
                .expect("queue router worker spawns")
        };

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The entity kind this queue serves.
    pub fn kind(&self) -> EntityKind {
        self.shared.kind
    }

    /// The queue's aggregated completion surface.
    pub fn completions(&self) -> &CompletionHub {
        &self.shared.completions
    }

    /// Attach `backend` at the tail of the routing order, optionally
    /// wrapping it in a [`WriteBackCache`] configured by `cache_params`.
    /// Assigns and returns the backend id.
    pub fn attach_backend(
        &self,
        backend: Arc<dyn StoreBackend>,
        cache_params: Option<CacheParams>,
    ) -> Result<BackendId, QueueError> {
        if self.shared.stopped() {
            return Err(QueueError::Shutdown);
        }
        if backend.kind() != self.shared.kind {
            return Err(QueueError::KindMismatch {
                expected: self.shared.kind,
                actual: backend.kind(),
            });
        }

        let (erased, cache) = match cache_params {
            Some(params) => {
                let cache = Arc::new(WriteBackCache::new(backend, params));
                (
                    Arc::clone(&cache) as Arc<dyn StoreBackend>,
                    Some(cache),
                )
            }
            None => (backend, None),
        };

        let mut state = self.shared.state.lock();
        let id = BackendId::new(state.next_backend_id);
        state.next_backend_id += 1;
        erased.set_id(id);

        let subs = {
            let success = Arc::clone(&self.shared);
            let failure = Arc::clone(&self.shared);
            vec![
                erased
                    .completions()
                    .on_success(move |backend, request, record| {
                        success.handle_success(backend, request, record)
                    }),
                erased
                    .completions()
                    .on_failure(move |backend, request, error| {
                        failure.handle_failure(backend, request, error)
                    }),
            ]
        };
        erased.connect();
        state.order.push_back(id);
        state.slots.insert(
            id,
            BackendSlot {
                backend: erased,
                cache,
                read_failures: 0,
                write_failures: 0,
                _subs: subs,
            },
        );
        if state.order.len() == 1 {
            self.shared.cond.notify_all();
        }
        debug!(kind = %self.shared.kind, backend = %id, "backend attached");
        Ok(id)
    }

    /// Detach the backend with `id`, disconnecting it.
    pub fn detach_backend(&self, id: BackendId) -> Result<(), QueueError> {
        if self.shared.stopped() {
            return Err(QueueError::Shutdown);
        }
        let slot = {
            let mut state = self.shared.state.lock();
            let slot = state
                .slots
                .remove(&id)
                .ok_or(QueueError::UnknownBackend { id })?;
            state.order.retain(|backend| *backend != id);
            slot
        };
        slot.backend.disconnect();
        debug!(kind = %self.shared.kind, backend = %id, "backend detached");
        Ok(())
    }

    /// Enqueue a read intake; returns the queue-assigned request id.
    pub fn submit_read(&self, constraint: ReadConstraint) -> Result<RequestId, StoreError> {
        self.submit(QueueOp::Read(constraint))
    }

    /// Enqueue an insert intake; returns the queue-assigned request id.
    pub fn submit_insert(&self, record: SharedRecord) -> Result<RequestId, StoreError> {
        self.submit(QueueOp::Insert(record))
    }

    /// Enqueue an update intake; returns the queue-assigned request id.
    pub fn submit_update(&self, record: SharedRecord) -> Result<RequestId, StoreError> {
        self.submit(QueueOp::Update(record))
    }

    /// Enqueue a delete intake; returns the queue-assigned request id.
    pub fn submit_delete(&self, id: ObjectId) -> Result<RequestId, StoreError> {
        self.submit(QueueOp::Delete(id))
    }

    fn submit(&self, op: QueueOp) -> Result<RequestId, StoreError> {
        if self.shared.stopped() {
            return Err(StoreError::Shutdown);
        }
        let request = self.shared.intake_ids.next_id();
        let mut state = self.shared.state.lock();
        state.new_requests.push_back((request, op));
        self.shared.cond.notify_all();
        Ok(request)
    }

    /// Replace the queue configuration.
    pub fn set_params(&self, params: QueueParams) -> bool {
        if self.shared.stopped() {
            return false;
        }
        self.shared.state.lock().params = params;
        true
    }

    /// The active configuration.
    pub fn params(&self) -> QueueParams {
        self.shared.state.lock().params
    }

    /// Update the cache parameters of the cache-wrapped backend `id`.
    pub fn set_cache_params(&self, id: BackendId, params: CacheParams) -> Result<(), QueueError> {
        self.cache_handle(id)?.set_params(params);
        Ok(())
    }

    /// The cache parameters of the cache-wrapped backend `id`.
    pub fn cache_params(&self, id: BackendId) -> Result<CacheParams, QueueError> {
        Ok(self.cache_handle(id)?.params())
    }

    fn cache_handle(&self, id: BackendId) -> Result<Arc<WriteBackCache>, QueueError> {
        let state = self.shared.state.lock();
        match state.slots.get(&id) {
            None => Err(QueueError::UnknownBackend { id }),
            Some(slot) => slot
                .cache
                .as_ref()
                .map(Arc::clone)
                .ok_or(QueueError::NotACache { id }),
        }
    }

    /// Point-in-time queue state.
    pub fn queue_info(&self) -> QueueInfo {
        let state = self.shared.state.lock();
        QueueInfo {
            kind: self.shared.kind,
            params: state.params,
            backends: state.order.iter().copied().collect(),
            total_read_requests: state.stats.read_requests,
            total_write_requests: state.stats.write_requests,
            total_read_failures: state.stats.read_failures,
            total_write_failures: state.stats.write_failures,
            new_requests: state.new_requests.len(),
            pending_requests: state.pending.len(),
            stopped: self.shared.stopped(),
        }
    }

    /// Snapshots of every cache-wrapped backend, in routing order.
    pub fn caches_info(&self) -> Vec<CacheInfo> {
        let caches: Vec<Arc<WriteBackCache>> = {
            let state = self.shared.state.lock();
            state
                .order
                .iter()
                .filter_map(|id| state.slots.get(id))
                .filter_map(|slot| slot.cache.as_ref().map(Arc::clone))
                .collect()
        };
        caches.iter().map(|cache| cache.cache_info()).collect()
    }

    /// Snapshots of every attached backend, in routing order.
    pub fn backends_info(&self) -> Vec<AttachedBackendInfo> {
        let state = self.shared.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.slots.get(id).map(|slot| (*id, slot)))
            .map(|(id, slot)| AttachedBackendInfo {
                id,
                read_failures: slot.read_failures,
                write_failures: slot.write_failures,
                wraps_cache: slot.cache.is_some(),
                info: slot.backend.info(),
            })
            .collect()
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        debug!(kind = %self.shared.kind, "queue shutting down");
        self.shared.stop.store(true, Ordering::Release);
        {
            let _guard = self.shared.state.lock();
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            handle.join().ok();
        }

        let (pending, slots) = {
            let mut state = self.shared.state.lock();
            let pending: Vec<(RequestId, PendingRequest)> = state.pending.drain().collect();
            let slots: Vec<(BackendId, BackendSlot)> = state.slots.drain().collect();
            state.order.clear();
            state.new_requests.clear();
            (pending, slots)
        };
        for (_, slot) in slots {
            slot.backend.disconnect();
        }
        for (request, entry) in pending {
            if !entry.done {
                self.shared
                    .completions
                    .emit_failure(BackendId::UNSET, request, StoreError::Shutdown);
            }
        }
    }
}
