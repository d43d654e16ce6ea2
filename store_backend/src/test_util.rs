//! Scriptable backend mock and completion capture, shared by the test
//! suites of the layers above.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use data_types::{
    BackendId, BackendInfo, EntityKind, ObjectId, ReadConstraint, Record, RequestId, SharedRecord,
    StoreError,
};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::ops::record_matches;
use crate::{CompletionHub, StoreBackend, Subscription};

/// One operation accepted by a [`MockBackend`].
#[derive(Debug, Clone)]
pub enum MockOp {
    Read(ReadConstraint),
    Insert(SharedRecord),
    Update(SharedRecord),
    Delete(ObjectId),
}

impl MockOp {
    /// Whether the operation mutates state.
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read(_))
    }

    /// The object the operation targets, when derivable.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::Read(constraint) => constraint.object_id(),
            Self::Insert(record) | Self::Update(record) => Some(record.object_id()),
            Self::Delete(id) => Some(*id),
        }
    }
}

/// A submission recorded by a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockSubmission {
    /// The id the submitter chose.
    pub request: RequestId,
    /// The operation payload.
    pub op: MockOp,
}

#[derive(Default)]
struct MockState {
    history: Vec<MockSubmission>,
    pending: VecDeque<MockSubmission>,
    served: HashMap<ObjectId, SharedRecord>,
    fail_next_reads: u32,
    fail_next_writes: u32,
    reject_submissions: bool,
    connects: u32,
    disconnects: u32,
}

/// A [`StoreBackend`] that completes nothing on its own.
///
/// Tests drive it explicitly: submissions are recorded and parked until the
/// test calls [`MockBackend::complete_pending`], which applies scripted
/// failures first and otherwise completes against the `served` record set.
/// Because completions are emitted from the test's thread, they are
/// asynchronous with respect to every worker under test, and a test that
/// never drives the mock models a backend that never answers.
pub struct MockBackend {
    kind: EntityKind,
    id: AtomicU32,
    completions: CompletionHub,
    state: Mutex<MockState>,
}

impl MockBackend {
    /// Create a mock for `kind`.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            id: AtomicU32::new(BackendId::UNSET.get()),
            completions: CompletionHub::new(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every submission accepted so far, in order.
    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.state.lock().history.clone()
    }

    /// Number of submissions accepted so far.
    pub fn submission_count(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Number of accepted submissions not yet completed.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Preload a record for reads and delete payloads to resolve against.
    pub fn serve_record(&self, record: SharedRecord) {
        self.state.lock().served.insert(record.object_id(), record);
    }

    /// Fail the next `n` write completions with
    /// [`StoreError::BackendFailed`].
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().fail_next_writes = n;
    }

    /// Fail the next `n` read completions with
    /// [`StoreError::BackendFailed`].
    pub fn fail_next_reads(&self, n: u32) {
        self.state.lock().fail_next_reads = n;
    }

    /// Make `submit_*` refuse new work (synchronous rejection).
    pub fn set_reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    /// Times `connect()` was called.
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Times `disconnect()` was called.
    pub fn disconnect_count(&self) -> u32 {
        self.state.lock().disconnects
    }

    /// Complete every parked submission, emitting from the calling thread.
    /// Returns how many completions fired.
    pub fn complete_pending(&self) -> usize {
        let completions = {
            let mut state = self.state.lock();
            let mut out = Vec::new();
            while let Some(submission) = state.pending.pop_front() {
                let outcome = Self::outcome_for(&mut state, &submission);
                out.push((submission.request, outcome));
            }
            out
        };

        let id = self.id();
        let fired = completions.len();
        for (request, outcome) in completions {
            match outcome {
                Ok(record) => self.completions.emit_success(id, request, record),
                Err(error) => self.completions.emit_failure(id, request, error),
            }
        }
        fired
    }

    fn outcome_for(
        state: &mut MockState,
        submission: &MockSubmission,
    ) -> Result<Option<SharedRecord>, StoreError> {
        let scripted_failure = if submission.op.is_write() {
            if state.fail_next_writes > 0 {
                state.fail_next_writes -= 1;
                true
            } else {
                false
            }
        } else if state.fail_next_reads > 0 {
            state.fail_next_reads -= 1;
            true
        } else {
            false
        };
        if scripted_failure {
            return Err(StoreError::BackendFailed {
                id: submission.op.object_id().unwrap_or_else(ObjectId::nil),
            });
        }

        match &submission.op {
            MockOp::Read(constraint) => match constraint.object_id() {
                Some(id) => state
                    .served
                    .get(&id)
                    .map(|record| Some(Arc::clone(record)))
                    .ok_or(StoreError::NotFound { id }),
                None => {
                    let matches: Vec<SharedRecord> = state
                        .served
                        .values()
                        .filter(|record| record_matches(record, constraint))
                        .map(Arc::clone)
                        .collect();
                    Ok(Some(Arc::new(Record::batch(matches))))
                }
            },
            MockOp::Insert(record) | MockOp::Update(record) => {
                state
                    .served
                    .insert(record.object_id(), Arc::clone(record));
                Ok(Some(Arc::clone(record)))
            }
            MockOp::Delete(id) => state
                .served
                .remove(id)
                .map(Some)
                .ok_or(StoreError::NotFound { id: *id }),
        }
    }

    fn accept(&self, submission: MockSubmission) -> bool {
        let mut state = self.state.lock();
        if state.reject_submissions {
            return false;
        }
        state.history.push(submission.clone());
        state.pending.push_back(submission);
        true
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("kind", &self.kind)
            .field("submissions", &self.submission_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl StoreBackend for MockBackend {
    fn submit_read(&self, request: RequestId, constraint: ReadConstraint) -> bool {
        self.accept(MockSubmission {
            request,
            op: MockOp::Read(constraint),
        })
    }

    fn submit_insert(&self, request: RequestId, record: SharedRecord) -> bool {
        // deep-copy, like a real driver: the submitter keeps sole
        // ownership of its allocation
        self.accept(MockSubmission {
            request,
            op: MockOp::Insert(Arc::new((*record).clone())),
        })
    }

    fn submit_update(&self, request: RequestId, record: SharedRecord) -> bool {
        self.accept(MockSubmission {
            request,
            op: MockOp::Update(Arc::new((*record).clone())),
        })
    }

    fn submit_delete(&self, request: RequestId, id: ObjectId) -> bool {
        self.accept(MockSubmission {
            request,
            op: MockOp::Delete(id),
        })
    }

    fn completions(&self) -> &CompletionHub {
        &self.completions
    }

    fn connect(&self) -> bool {
        self.state.lock().connects += 1;
        true
    }

    fn disconnect(&self) -> bool {
        self.state.lock().disconnects += 1;
        true
    }

    fn build(&self) -> bool {
        true
    }

    fn clear(&self) -> bool {
        self.state.lock().served.clear();
        true
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "mock".to_string(),
            kind: self.kind,
            object_count: self.state.lock().served.len(),
        }
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn set_id(&self, id: BackendId) {
        self.id.store(id.get(), Ordering::Release);
    }

    fn id(&self) -> BackendId {
        BackendId::new(self.id.load(Ordering::Acquire))
    }
}

/// A completion observed by a [`CompletionCapture`].
#[derive(Debug, Clone)]
pub enum Captured {
    Success {
        backend: BackendId,
        request: RequestId,
        record: Option<SharedRecord>,
    },
    Failure {
        backend: BackendId,
        request: RequestId,
        error: StoreError,
    },
}

impl Captured {
    /// The request this completion answers.
    pub fn request(&self) -> RequestId {
        match self {
            Self::Success { request, .. } | Self::Failure { request, .. } => *request,
        }
    }

    /// Whether this is a success completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The success payload, if any.
    pub fn record(&self) -> Option<&SharedRecord> {
        match self {
            Self::Success { record, .. } => record.as_ref(),
            Self::Failure { .. } => None,
        }
    }

    /// The failure error, if this is a failure.
    pub fn error(&self) -> Option<&StoreError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }
}

#[derive(Default)]
struct CaptureState {
    completions: Mutex<Vec<Captured>>,
    arrived: Condvar,
}

/// Subscribes to a [`CompletionHub`] and lets a test block until enough
/// completions have arrived.
pub struct CompletionCapture {
    state: Arc<CaptureState>,
    _subs: Vec<Subscription>,
}

impl CompletionCapture {
    /// Attach to `hub`.
    pub fn attach(hub: &CompletionHub) -> Self {
        let state = Arc::new(CaptureState::default());

        let s = Arc::clone(&state);
        let success = hub.on_success(move |backend, request, record| {
            s.completions.lock().push(Captured::Success {
                backend,
                request,
                record,
            });
            s.arrived.notify_all();
        });
        let s = Arc::clone(&state);
        let failure = hub.on_failure(move |backend, request, error| {
            s.completions.lock().push(Captured::Failure {
                backend,
                request,
                error,
            });
            s.arrived.notify_all();
        });

        Self {
            state,
            _subs: vec![success, failure],
        }
    }

    /// Block until at least `count` completions have arrived or `timeout`
    /// elapses; returns whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completions = self.state.completions.lock();
        while completions.len() < count {
            if self
                .state
                .arrived
                .wait_until(&mut completions, deadline)
                .timed_out()
            {
                break;
            }
        }
        completions.len() >= count
    }

    /// Every completion observed so far, in arrival order.
    pub fn all(&self) -> Vec<Captured> {
        self.state.completions.lock().clone()
    }

    /// Completions observed so far.
    pub fn count(&self) -> usize {
        self.state.completions.lock().len()
    }

    /// The first completion observed for `request`, if any.
    pub fn for_request(&self, request: RequestId) -> Option<Captured> {
        self.state
            .completions
            .lock()
            .iter()
            .find(|captured| captured.request() == request)
            .cloned()
    }
}

impl std::fmt::Debug for CompletionCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCapture")
            .field("completions", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{AccessLevel, UserRecord};

    fn user(name: &str) -> SharedRecord {
        Arc::new(Record::User(UserRecord::new(
            name,
            "hash",
            AccessLevel::User,
            0,
        )))
    }

    #[test]
    fn scripted_write_failures_fire_in_order() {
        let mock = MockBackend::new(EntityKind::User);
        mock.set_id(BackendId::new(3));
        let capture = CompletionCapture::attach(mock.completions());
        mock.fail_next_writes(1);

        assert!(mock.submit_insert(RequestId::new(1), user("a")));
        assert!(mock.submit_insert(RequestId::new(2), user("b")));
        assert_eq!(mock.complete_pending(), 2);

        let completions = capture.all();
        assert!(!completions[0].is_success());
        assert!(completions[1].is_success());
    }

    #[test]
    fn rejection_refuses_submissions_synchronously() {
        let mock = MockBackend::new(EntityKind::User);
        mock.set_reject_submissions(true);
        assert!(!mock.submit_read(RequestId::new(1), ReadConstraint::All));
        assert_eq!(mock.submission_count(), 0);
    }

    #[test]
    fn delete_resolves_against_served_records() {
        let mock = MockBackend::new(EntityKind::User);
        let capture = CompletionCapture::attach(mock.completions());
        let record = user("a");
        let id = record.object_id();
        mock.serve_record(record);

        assert!(mock.submit_delete(RequestId::new(1), id));
        assert!(mock.submit_delete(RequestId::new(2), id));
        mock.complete_pending();

        assert!(capture.for_request(RequestId::new(1)).expect("fired").is_success());
        assert!(!capture.for_request(RequestId::new(2)).expect("fired").is_success());
    }
}
