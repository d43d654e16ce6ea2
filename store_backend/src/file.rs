//! Debug storage driver persisting records as JSON lines.
//!
//! Intended for development and debugging of the layers above: the object
//! map lives in memory, `build()` loads the backing file, `disconnect()`
//! saves it. Not a durable production store.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use data_types::{
    BackendId, BackendInfo, EntityKind, ObjectId, ReadConstraint, Record, RequestId, SharedRecord,
};
use observability_deps::tracing::{error, info};
use parking_lot::Mutex;

use crate::ops::{worker_loop, BackendOp, DriverCore};
use crate::{CompletionHub, StoreBackend};

/// A [`StoreBackend`] with [`MemBackend`](crate::mem::MemBackend) semantics
/// plus JSON-lines persistence, one record per line.
pub struct DebugFileBackend {
    core: Arc<DriverCore>,
    path: PathBuf,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DebugFileBackend {
    /// Create a backend for `kind` persisting to `path`, and start its
    /// worker. The file is not read until [`StoreBackend::build`] is
    /// called.
    pub fn new(kind: EntityKind, path: impl Into<PathBuf>) -> Self {
        let core = Arc::new(DriverCore::new(kind));
        let worker = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name(format!("debug-file-backend-{kind}"))
                .spawn(move || worker_loop(core))
                .expect("backend worker thread spawns")
        };
        Self {
            core,
            path: path.into(),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.core.state.lock().objects.len()
    }

    fn load(&self) -> bool {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(e) => {
                error!(path = %self.path.display(), %e, "failed to read backing file");
                return false;
            }
        };

        let mut loaded = 0usize;
        let mut state = self.core.state.lock();
        for line in contents.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<Record>(line) {
                Ok(record) => {
                    state.objects.insert(record.object_id(), record);
                    loaded += 1;
                }
                Err(e) => {
                    error!(path = %self.path.display(), %e, "skipping malformed record line");
                }
            }
        }
        info!(path = %self.path.display(), loaded, "loaded backing file");
        true
    }

    fn save(&self) -> bool {
        let lines: Vec<String> = {
            let state = self.core.state.lock();
            state
                .objects
                .values()
                .filter_map(|record| match serde_json::to_string(record) {
                    Ok(line) => Some(line),
                    Err(e) => {
                        error!(%e, "failed to serialize record; skipping");
                        None
                    }
                })
                .collect()
        };

        let result = std::fs::File::create(&self.path).and_then(|mut file| {
            for line in &lines {
                writeln!(file, "{line}")?;
            }
            file.flush()
        });
        match result {
            Ok(()) => {
                info!(path = %self.path.display(), saved = lines.len(), "saved backing file");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), %e, "failed to write backing file");
                false
            }
        }
    }
}

impl std::fmt::Debug for DebugFileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugFileBackend")
            .field("kind", &self.core.kind)
            .field("id", &self.core.backend_id())
            .field("path", &self.path)
            .field("objects", &self.object_count())
            .finish()
    }
}

impl StoreBackend for DebugFileBackend {
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
        self.save()
    }

    fn build(&self) -> bool {
        self.load()
    }

    fn clear(&self) -> bool {
        self.core.state.lock().objects.clear();
        self.save()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "debug-file".to_string(),
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

impl Drop for DebugFileBackend {
    fn drop(&mut self) {
        self.core.shutdown(&self.worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::CompletionCapture;
    use data_types::{LogRecord, LogSeverity};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn log(message: &str) -> SharedRecord {
        Arc::new(Record::Log(LogRecord::new(
            LogSeverity::Info,
            "test",
            1,
            message,
        )))
    }

    #[test]
    fn records_survive_a_disconnect_build_cycle() {
        test_helpers::maybe_start_logging();
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("logs.jsonl");

        let first = DebugFileBackend::new(EntityKind::Log, &path);
        let capture = CompletionCapture::attach(first.completions());
        let record = log("started");
        let id = record.object_id();
        assert!(first.submit_insert(RequestId::new(1), record));
        assert!(capture.wait_for(1, WAIT));
        assert!(first.disconnect());
        drop(capture);
        drop(first);

        let second = DebugFileBackend::new(EntityKind::Log, &path);
        assert!(second.build());
        assert_eq!(second.object_count(), 1);

        let capture = CompletionCapture::attach(second.completions());
        assert!(second.submit_read(RequestId::new(1), ReadConstraint::ById(id)));
        assert!(capture.wait_for(1, WAIT));
        assert!(capture.for_request(RequestId::new(1)).expect("completed").is_success());
    }

    #[test]
    fn clear_truncates_the_backing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("logs.jsonl");

        let backend = DebugFileBackend::new(EntityKind::Log, &path);
        let capture = CompletionCapture::attach(backend.completions());
        assert!(backend.submit_insert(RequestId::new(1), log("one")));
        assert!(capture.wait_for(1, WAIT));
        assert!(backend.disconnect());
        assert!(backend.clear());

        assert_eq!(backend.object_count(), 0);
        let contents = std::fs::read_to_string(&path).expect("file exists");
        assert!(contents.trim().is_empty());
    }

    #[test]
    fn build_without_a_file_is_clean() {
        let dir = tempfile::tempdir().expect("temp dir");
        let backend = DebugFileBackend::new(EntityKind::Log, dir.path().join("missing.jsonl"));
        assert!(backend.build());
        assert_eq!(backend.object_count(), 0);
    }
}
