//! In-memory storage driver.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use data_types::{
    BackendId, BackendInfo, EntityKind, ObjectId, ReadConstraint, RequestId, SharedRecord,
};
use parking_lot::Mutex;

use crate::ops::{worker_loop, BackendOp, DriverCore};
use crate::{CompletionHub, StoreBackend};

/// A [`StoreBackend`] holding records in memory only.
///
/// Submissions enqueue onto a private worker thread, which applies them and
/// emits the completion; never inline on the submitter's thread. Records
/// are deep-copied on insert/update, so callers keep sole ownership of the
/// values they submitted.
pub struct MemBackend {
    core: Arc<DriverCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemBackend {
    /// Create a backend for `kind` and start its worker.
    pub fn new(kind: EntityKind) -> Self {
        let core = Arc::new(DriverCore::new(kind));
        let worker = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name(format!("mem-backend-{kind}"))
                .spawn(move || worker_loop(core))
                .expect("backend worker thread spawns")
        };
        Self {
            core,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.core.state.lock().objects.len()
    }

    /// Whether an object is currently stored.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.core.state.lock().objects.contains_key(&id)
    }
}

impl std::fmt::Debug for MemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBackend")
            .field("kind", &self.core.kind)
            .field("id", &self.core.backend_id())
            .field("objects", &self.object_count())
            .finish()
    }
}

impl StoreBackend for MemBackend {
    fn submit_read(&self, request: RequestId, constraint: ReadConstraint) -> bool {
        self.core.enqueue(request, BackendOp::Read(constraint))
    }

    fn submit_insert(&self, request: RequestId, record: SharedRecord) -> bool {
        self.core.enqueue(request, BackendOp::Insert(record))
    }

    fn submit_update(&self, request: RequestId, record: SharedRecord) -> bool {
        self.core.enqueue(request, BackendOp::Update(record))
    }

    fn submit_delete(&self, request: RequestId, id: ObjectId) -> bool {
        self.core.enqueue(request, BackendOp::Delete(id))
    }

    fn completions(&self) -> &CompletionHub {
        &self.core.completions
    }

    fn connect(&self) -> bool {
        self.core.connected.store(true, Ordering::Release);
        true
    }

    fn disconnect(&self) -> bool {
        self.core.connected.store(false, Ordering::Release);
        true
    }

    fn build(&self) -> bool {
        true
    }

    fn clear(&self) -> bool {
        self.core.state.lock().objects.clear();
        true
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "mem".to_string(),
            kind: self.core.kind,
            object_count: self.object_count(),
        }
    }

    fn kind(&self) -> EntityKind {
        self.core.kind
    }

    fn set_id(&self, id: BackendId) {
        self.core.id.store(id.get(), Ordering::Release);
    }

    fn id(&self) -> BackendId {
        self.core.backend_id()
    }
}

impl Drop for MemBackend {
    fn drop(&mut self) {
        self.core.shutdown(&self.worker);
    }
}
