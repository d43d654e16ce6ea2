//! Write-back object cache, see [`WriteBackCache`].
//!
//! The cache wraps exactly one downstream [`StoreBackend`] and presents the
//! same contract upward, adding an in-memory object table, a coalescing
//! pending-mutation table, an age table driving eviction, and a commit
//! scheduler that drains mutations downstream at most once per object per
//! cycle.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use data_types::{
    BackendId, BackendInfo, CacheInfo, CacheParams, EntityKind, ObjectId, ReadConstraint,
    RequestId, RequestIdGenerator, SharedRecord, StoreError,
};
use hashbrown::{HashMap, HashSet};
use observability_deps::tracing::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use store_backend::{CompletionHub, StoreBackend, Subscription};

/// The collapsed mutation recorded for an object between two commit
/// cycles. At most one entry exists per object; transitions are explicit
/// rewrites, never a second entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingMutation {
    Insert,
    Update,
    Delete,
}

/// One unit of work for the request worker.
#[derive(Debug)]
enum CacheIntake {
    Read(ReadConstraint),
    Insert(SharedRecord),
    Update(SharedRecord),
    Delete(ObjectId),
    /// Install records produced by a downstream read.
    CacheObject(SharedRecord),
    /// Emit a failure that never touches the downstream backend.
    SendFailure(StoreError),
}

/// State guarded by the cache mutex.
#[derive(Debug)]
struct CacheState {
    objects: HashMap<ObjectId, SharedRecord>,
    ages: HashMap<ObjectId, u64>,
    pending: HashMap<ObjectId, PendingMutation>,
    global_age: u64,
    params: CacheParams,
}

/// State guarded by the request mutex.
#[derive(Debug)]
struct RequestState {
    queue: VecDeque<(RequestId, CacheIntake)>,
    downstream_pending: HashSet<RequestId>,
}

struct CacheShared {
    downstream: Arc<dyn StoreBackend>,
    kind: EntityKind,
    id: AtomicU32,
    completions: CompletionHub,

    cache: Mutex<CacheState>,
    cache_cond: Condvar,
    requests: Mutex<RequestState>,
    requests_cond: Condvar,
    /// commit-id → object-id for in-flight commit submissions; keyed by a
    /// separate id space, disambiguated from caller reads by the object-id
    /// match in the completion filter.
    commits: Mutex<HashMap<RequestId, ObjectId>>,
    commit_ids: RequestIdGenerator,

    stop: AtomicBool,
    force_commit: AtomicBool,
    commit_disabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheShared {
    fn backend_id(&self) -> BackendId {
        BackendId::new(self.id.load(Ordering::Acquire))
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn enqueue_intake(&self, request: RequestId, intake: CacheIntake) {
        let mut requests = self.requests.lock();
        requests.queue.push_back((request, intake));
        self.requests_cond.notify_all();
    }

    fn is_cached(&self, id: ObjectId) -> bool {
        self.cache.lock().objects.contains_key(&id)
    }

    /// Raise the recorded age for `id` to at least `age`.
    fn raise_age(ages: &mut HashMap<ObjectId, u64>, id: ObjectId, age: u64) {
        let entry = ages.entry(id).or_insert(age);
        if *entry < age {
            *entry = age;
        }
    }

    fn process_intake(&self, request: RequestId, intake: CacheIntake) {
        match intake {
            CacheIntake::Read(constraint) => self.process_read(request, constraint),
            CacheIntake::Insert(record) => self.process_write(request, record, true),
            CacheIntake::Update(record) => self.process_write(request, record, false),
            CacheIntake::Delete(id) => self.process_delete(request, id),
            CacheIntake::CacheObject(record) => self.process_cache_object(record),
            CacheIntake::SendFailure(error) => {
                self.completions
                    .emit_failure(self.backend_id(), request, error);
            }
        }
    }

    fn process_read(&self, request: RequestId, constraint: ReadConstraint) {
        let target = constraint.object_id();
        let mut hit = None;
        if let Some(id) = target {
            let mut cache = self.cache.lock();
            if let Some(record) = cache.objects.get(&id) {
                let record = Arc::clone(record);
                let delete_pending =
                    matches!(cache.pending.get(&id), Some(PendingMutation::Delete));
                let age = cache.global_age;
                Self::raise_age(&mut cache.ages, id, age);
                hit = Some((id, record, delete_pending));
            }
        }

        match hit {
            Some((id, _record, true)) => {
                // the queued delete wins over the cached value
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%request, object = %id, "read hit on object pending delete");
                self.completions
                    .emit_failure(self.backend_id(), request, StoreError::NotFound { id });
            }
            Some((_id, record, false)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.completions
                    .emit_success(self.backend_id(), request, Some(record));
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.requests.lock().downstream_pending.insert(request);
                if !self.downstream.submit_read(request, constraint) {
                    self.requests.lock().downstream_pending.remove(&request);
                    self.completions.emit_failure(
                        self.backend_id(),
                        request,
                        StoreError::Rejected {
                            id: target.unwrap_or_else(ObjectId::nil),
                        },
                    );
                }
            }
        }
    }

    fn process_write(&self, request: RequestId, record: SharedRecord, is_insert: bool) {
        let id = record.object_id();
        let outcome = {
            let mut cache = self.cache.lock();
            match cache.pending.get(&id) {
                Some(PendingMutation::Delete) => {
                    Err(StoreError::ConflictPendingDelete { id })
                }
                Some(_) => {
                    // coalesce with the queued mutation; an update still
                    // refreshes the cached value so later reads observe it
                    if !is_insert {
                        let age = cache.global_age;
                        cache.objects.insert(id, Arc::clone(&record));
                        Self::raise_age(&mut cache.ages, id, age);
                    }
                    Ok(record)
                }
                None => {
                    let age = cache.global_age;
                    cache.objects.insert(id, Arc::clone(&record));
                    Self::raise_age(&mut cache.ages, id, age);
                    cache.pending.insert(
                        id,
                        if is_insert {
                            PendingMutation::Insert
                        } else {
                            PendingMutation::Update
                        },
                    );
                    self.maybe_signal_high_water(&cache);
                    Ok(record)
                }
            }
        };

        match outcome {
            Ok(record) => {
                self.completions
                    .emit_success(self.backend_id(), request, Some(record))
            }
            Err(error) => {
                debug!(%request, object = %id, %error, "write refused by cache");
                self.completions
                    .emit_failure(self.backend_id(), request, error)
            }
        }
    }

    fn process_delete(&self, request: RequestId, id: ObjectId) {
        let outcome = {
            let mut cache = self.cache.lock();
            let existing = cache.objects.get(&id).map(Arc::clone);
            match cache.pending.get(&id).copied() {
                Some(PendingMutation::Delete) => Err(StoreError::NotFound { id }),
                Some(PendingMutation::Insert) => {
                    // the object never reached the backend; net no-op
                    cache.pending.remove(&id);
                    cache.objects.remove(&id);
                    if cache.params.clear_object_age {
                        cache.ages.remove(&id);
                    }
                    Ok(existing)
                }
                Some(PendingMutation::Update) => {
                    cache.pending.insert(id, PendingMutation::Delete);
                    Ok(existing)
                }
                None => {
                    if existing.is_none() {
                        Err(StoreError::NotFound { id })
                    } else {
                        cache.pending.insert(id, PendingMutation::Delete);
                        self.maybe_signal_high_water(&cache);
                        Ok(existing)
                    }
                }
            }
        };

        match outcome {
            Ok(record) => self
                .completions
                .emit_success(self.backend_id(), request, record),
            Err(error) => {
                debug!(%request, object = %id, %error, "delete refused by cache");
                self.completions
                    .emit_failure(self.backend_id(), request, error)
            }
        }
    }

    fn process_cache_object(&self, record: SharedRecord) {
        let mut cache = self.cache.lock();
        let age = cache.global_age;
        let records: Vec<SharedRecord> = match record.as_batch() {
            Some(batch) => batch.records.clone(),
            None => vec![record],
        };
        for record in records {
            let id = record.object_id();
            cache
                .objects
                .entry(id)
                .or_insert_with(|| Arc::clone(&record));
            Self::raise_age(&mut cache.ages, id, age);
        }
    }

    fn maybe_signal_high_water(&self, cache: &CacheState) {
        let max = cache.params.max_commit_updates;
        if max > 0 && cache.pending.len() >= max {
            self.cache_cond.notify_all();
        }
    }

    /// Drain the pending-mutation table downstream. Runs under the cache
    /// lock; the downstream completes asynchronously, so submitting here
    /// cannot re-enter the cache.
    fn run_commit_cycle(&self, cache: &mut CacheState) {
        let entries: Vec<(ObjectId, PendingMutation)> = cache.pending.drain().collect();
        if !entries.is_empty() {
            debug!(mutations = entries.len(), "starting commit cycle");
        }

        let mut retries = Vec::new();
        for (id, mutation) in entries {
            let commit_id = self.commit_ids.next_id();
            self.commits.lock().insert(commit_id, id);

            let accepted = match mutation {
                PendingMutation::Insert => match cache.objects.get(&id) {
                    Some(record) => self.downstream.submit_insert(commit_id, Arc::clone(record)),
                    None => false,
                },
                PendingMutation::Update => match cache.objects.get(&id) {
                    Some(record) => self.downstream.submit_update(commit_id, Arc::clone(record)),
                    None => false,
                },
                PendingMutation::Delete => {
                    let accepted = self.downstream.submit_delete(commit_id, id);
                    if accepted {
                        cache.objects.remove(&id);
                        if cache.params.clear_object_age {
                            cache.ages.remove(&id);
                        }
                    }
                    accepted
                }
            };

            if accepted {
                if !matches!(mutation, PendingMutation::Delete) {
                    if let Some(record) = cache.objects.get(&id) {
                        record.clear_modified();
                    }
                }
            } else {
                warn!(object = %id, "commit submission rejected; retrying next cycle");
                self.commits.lock().remove(&commit_id);
                retries.push((id, mutation));
            }
        }

        for (id, mutation) in retries {
            cache.pending.insert(id, mutation);
        }
        cache.global_age += 1;
    }

    /// Drop every evictable object older than the global age, or the
    /// single least-recently-used evictable when none is older. An object
    /// is evictable only while the cache holds the sole reference, the
    /// record is clean and no mutation is pending for it.
    fn evict(&self, cache: &mut CacheState) {
        let mut expired = Vec::new();
        let mut lru: Option<(ObjectId, u64)> = None;
        for (id, record) in &cache.objects {
            if Arc::strong_count(record) != 1 || record.is_modified() {
                continue;
            }
            if cache.pending.contains_key(id) {
                continue;
            }
            let age = cache.ages.get(id).copied().unwrap_or(0);
            if age < cache.global_age {
                expired.push(*id);
            } else if lru.map_or(true, |(_, best)| age < best) {
                lru = Some((*id, age));
            }
        }

        if !expired.is_empty() {
            for id in &expired {
                cache.objects.remove(id);
                if cache.params.clear_object_age {
                    cache.ages.remove(id);
                }
            }
            debug!(evicted = expired.len(), "evicted aged objects");
        } else if let Some((id, _)) = lru {
            cache.objects.remove(&id);
            if cache.params.clear_object_age {
                cache.ages.remove(&id);
            }
            debug!(object = %id, "evicted least-recently-used object");
        } else {
            debug!("nothing evictable");
        }
    }

    fn handle_downstream_success(&self, request: RequestId, record: Option<SharedRecord>) {
        if self.stopped() {
            return;
        }

        {
            let mut commits = self.commits.lock();
            if let Some(expected) = commits.get(&request).copied() {
                let completed = record.as_ref().map(|r| r.object_id());
                if completed == Some(expected) {
                    commits.remove(&request);
                    debug!(%request, object = %expected, "commit confirmed downstream");
                    return;
                }
            }
        }

        let forwarded = {
            let requests = self.requests.lock();
            requests.downstream_pending.contains(&request)
        };
        if forwarded {
            // repost outside the request lock; the intake queue takes it
            // again
            if let Some(record) = &record {
                self.enqueue_intake(request, CacheIntake::CacheObject(Arc::clone(record)));
            }
            self.requests.lock().downstream_pending.remove(&request);
            self.completions
                .emit_success(self.backend_id(), request, record);
        } else {
            warn!(%request, "dropping unexpected success completion");
        }
    }

    fn handle_downstream_failure(&self, request: RequestId, error: StoreError) {
        if self.stopped() {
            return;
        }

        {
            let mut commits = self.commits.lock();
            if let Some(expected) = commits.get(&request).copied() {
                if error.object_id() == expected {
                    commits.remove(&request);
                    warn!(%request, object = %expected, "commit failed downstream; dropping");
                    return;
                }
            }
        }

        let forwarded = self.requests.lock().downstream_pending.remove(&request);
        if forwarded {
            self.completions
                .emit_failure(self.backend_id(), request, error);
        } else {
            warn!(%request, %error, "dropping unexpected failure completion");
        }
    }
}

impl std::fmt::Debug for CacheShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheShared")
            .field("kind", &self.kind)
            .field("id", &self.backend_id())
            .finish()
    }
}

fn request_worker(shared: Arc<CacheShared>) {
    debug!(kind = %shared.kind, "request worker started");
    loop {
        let (request, intake) = {
            let mut requests = shared.requests.lock();
            loop {
                if shared.stopped() {
                    debug!(kind = %shared.kind, "request worker stopped");
                    return;
                }
                if let Some(item) = requests.queue.pop_front() {
                    break item;
                }
                shared.requests_cond.wait(&mut requests);
            }
        };
        shared.process_intake(request, intake);
    }
}

fn commit_worker(shared: Arc<CacheShared>) {
    debug!(kind = %shared.kind, "commit worker started");
    loop {
        let mut cache = shared.cache.lock();
        let force = shared.force_commit.load(Ordering::Acquire);
        if shared.stopped() && !force {
            break;
        }

        if !shared.commit_disabled.load(Ordering::Acquire) {
            let pending = cache.pending.len();
            if force || (pending > 0 && pending >= cache.params.min_commit_updates) {
                shared.run_commit_cycle(&mut cache);
                shared.force_commit.store(false, Ordering::Release);
            } else if pending > 0 {
                debug!(pending, "skipping commit cycle, below minimum");
            }
        }

        let size_limit = cache.params.max_cache_size;
        if cache.params.always_evict || (size_limit > 0 && cache.objects.len() >= size_limit) {
            shared.evict(&mut cache);
        }

        if shared.stopped() {
            // loop once more if a final forced commit arrived meanwhile
            continue;
        }

        let deadline = Instant::now() + cache.params.max_commit_interval;
        loop {
            if shared.stopped() {
                break;
            }
            let disabled = shared.commit_disabled.load(Ordering::Acquire);
            if !disabled && shared.force_commit.load(Ordering::Acquire) {
                break;
            }
            let max = cache.params.max_commit_updates;
            if !disabled && max > 0 && cache.pending.len() >= max {
                break;
            }
            if shared
                .cache_cond
                .wait_until(&mut cache, deadline)
                .timed_out()
            {
                break;
            }
        }
    }
    debug!(kind = %shared.kind, "commit worker stopped");
}

/// A write-back cache in front of a single downstream backend.
///
/// Implements [`StoreBackend`] itself, so a dispatch queue can hold a cache
/// wherever it would hold a raw driver. Two private workers do all the
/// work: the request worker drains caller intakes, the commit worker wakes
/// on a timer, the high-water mark, a forced commit or shutdown, and
/// drains the pending-mutation table downstream.
#[derive(Debug)]
pub struct WriteBackCache {
    shared: Arc<CacheShared>,
    request_worker: Mutex<Option<JoinHandle<()>>>,
    commit_worker: Mutex<Option<JoinHandle<()>>>,
    _downstream_subs: Vec<Subscription>,
}

impl WriteBackCache {
    /// Wrap `downstream` with a cache configured by `params` and start the
    /// workers.
    pub fn new(downstream: Arc<dyn StoreBackend>, params: CacheParams) -> Self {
        let kind = downstream.kind();
        let shared = Arc::new(CacheShared {
            downstream,
            kind,
            id: AtomicU32::new(BackendId::UNSET.get()),
            completions: CompletionHub::new(),
            cache: Mutex::new(CacheState {
                objects: HashMap::new(),
                ages: HashMap::new(),
                pending: HashMap::new(),
                global_age: 0,
                params,
            }),
            cache_cond: Condvar::new(),
            requests: Mutex::new(RequestState {
                queue: VecDeque::new(),
                downstream_pending: HashSet::new(),
            }),
            requests_cond: Condvar::new(),
            commits: Mutex::new(HashMap::new()),
            commit_ids: RequestIdGenerator::new(),
            stop: AtomicBool::new(false),
            force_commit: AtomicBool::new(false),
            commit_disabled: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });

        let subs = {
            let success = Arc::clone(&shared);
            let failure = Arc::clone(&shared);
            vec![
                shared
                    .downstream
                    .completions()
                    .on_success(move |_backend, request, record| {
                        success.handle_downstream_success(request, record)
                    }),
                shared
                    .downstream
                    .completions()
                    .on_failure(move |_backend, request, error| {
                        failure.handle_downstream_failure(request, error)
                    }),
            ]
        };

        let request_handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("cache-requests-{kind}"))
                .spawn(move || request_worker(shared))
                .expect("cache request worker spawns")
        };
        let commit_handle = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("cache-commits-{kind}"))
                .spawn(move || commit_worker(shared))
                .expect("cache commit worker spawns")
        };

        Self {
            shared,
            request_worker: Mutex::new(Some(request_handle)),
            commit_worker: Mutex::new(Some(commit_handle)),
            _downstream_subs: subs,
        }
    }

    /// Force a commit cycle, ignoring the minimum-updates threshold.
    /// Refused while commits are disabled or the cache is stopping.
    pub fn commit(&self) -> bool {
        if self.shared.stopped() || self.shared.commit_disabled.load(Ordering::Acquire) {
            return false;
        }
        self.shared.force_commit.store(true, Ordering::Release);
        let _guard = self.shared.cache.lock();
        self.shared.cache_cond.notify_all();
        true
    }

    /// Drop every record with a pending mutation, provided no outside
    /// borrow is held on it; never touches the downstream backend.
    pub fn rollback(&self) -> bool {
        if self.shared.stopped() {
            return false;
        }
        let mut cache = self.shared.cache.lock();
        let ids: Vec<ObjectId> = cache.pending.keys().copied().collect();
        for id in ids {
            let sole_owner = cache
                .objects
                .get(&id)
                .map(|record| Arc::strong_count(record) == 1);
            match sole_owner {
                Some(true) => {
                    cache.objects.remove(&id);
                    cache.pending.remove(&id);
                    if cache.params.clear_object_age {
                        cache.ages.remove(&id);
                    }
                }
                Some(false) => {
                    error!(object = %id, "rollback skipped object, outside borrow held");
                }
                None => {
                    cache.pending.remove(&id);
                }
            }
        }
        true
    }

    /// Pause automatic commit cycles; caller writes keep accumulating in
    /// the pending-mutation table.
    pub fn disable_commit(&self) -> bool {
        if self.shared.stopped() {
            return false;
        }
        self.shared.commit_disabled.store(true, Ordering::Release);
        true
    }

    /// Resume automatic commit cycles after [`WriteBackCache::disable_commit`].
    pub fn enable_commit(&self) -> bool {
        if self.shared.stopped() || !self.shared.commit_disabled.load(Ordering::Acquire) {
            return false;
        }
        self.shared.commit_disabled.store(false, Ordering::Release);
        let _guard = self.shared.cache.lock();
        self.shared.cache_cond.notify_all();
        true
    }

    /// Replace the cache configuration; takes effect on the next worker
    /// wakeup.
    pub fn set_params(&self, params: CacheParams) -> bool {
        if self.shared.stopped() {
            return false;
        }
        self.shared.cache.lock().params = params;
        true
    }

    /// The active configuration.
    pub fn params(&self) -> CacheParams {
        self.shared.cache.lock().params
    }

    /// Point-in-time cache state.
    pub fn cache_info(&self) -> CacheInfo {
        let (cached_objects, age_entries, pending_mutations, global_age, params) = {
            let cache = self.shared.cache.lock();
            (
                cache.objects.len(),
                cache.ages.len(),
                cache.pending.len(),
                cache.global_age,
                cache.params,
            )
        };
        let (pending_cache_requests, pending_downstream_requests) = {
            let requests = self.shared.requests.lock();
            (requests.queue.len(), requests.downstream_pending.len())
        };
        CacheInfo {
            id: self.shared.backend_id(),
            kind: self.shared.kind,
            params,
            cached_objects,
            age_entries,
            pending_mutations,
            global_age,
            pending_cache_requests,
            pending_downstream_requests,
            pending_commits: self.shared.commits.lock().len(),
            commit_disabled: self.shared.commit_disabled.load(Ordering::Acquire),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            stopped: self.shared.stopped(),
        }
    }
}

impl StoreBackend for WriteBackCache {
    fn submit_read(&self, request: RequestId, constraint: ReadConstraint) -> bool {
        if self.shared.stopped() {
            return false;
        }
        self.shared
            .enqueue_intake(request, CacheIntake::Read(constraint));
        true
    }

    fn submit_insert(&self, request: RequestId, record: SharedRecord) -> bool {
        if self.shared.stopped() {
            return false;
        }
        let id = record.object_id();
        if self.shared.is_cached(id) {
            debug!(%request, object = %id, "insert refused, object already cached");
            self.shared
                .enqueue_intake(request, CacheIntake::SendFailure(StoreError::AlreadyExists { id }));
        } else {
            self.shared
                .enqueue_intake(request, CacheIntake::Insert(record));
        }
        true
    }

    fn submit_update(&self, request: RequestId, record: SharedRecord) -> bool {
        if self.shared.stopped() {
            return false;
        }
        let id = record.object_id();
        if self.shared.is_cached(id) {
            self.shared
                .enqueue_intake(request, CacheIntake::Update(record));
        } else {
            debug!(%request, object = %id, "update refused, object not cached");
            self.shared
                .enqueue_intake(request, CacheIntake::SendFailure(StoreError::NotFound { id }));
        }
        true
    }

    fn submit_delete(&self, request: RequestId, id: ObjectId) -> bool {
        if self.shared.stopped() {
            return false;
        }
        if self.shared.is_cached(id) {
            self.shared.enqueue_intake(request, CacheIntake::Delete(id));
        } else {
            debug!(%request, object = %id, "delete refused, object not cached");
            self.shared
                .enqueue_intake(request, CacheIntake::SendFailure(StoreError::NotFound { id }));
        }
        true
    }

    fn completions(&self) -> &CompletionHub {
        &self.shared.completions
    }

    fn connect(&self) -> bool {
        self.shared.downstream.connect()
    }

    fn disconnect(&self) -> bool {
        // flush what we have; the downstream stays connected for the
        // resulting commit submissions
        self.commit()
    }

    fn build(&self) -> bool {
        self.shared.downstream.build()
    }

    fn clear(&self) -> bool {
        self.shared.downstream.clear()
    }

    fn info(&self) -> BackendInfo {
        self.shared.downstream.info()
    }

    fn kind(&self) -> EntityKind {
        self.shared.kind
    }

    fn set_id(&self, id: BackendId) {
        self.shared.id.store(id.get(), Ordering::Release);
        self.shared.downstream.set_id(id);
    }

    fn id(&self) -> BackendId {
        self.shared.backend_id()
    }
}

impl Drop for WriteBackCache {
    fn drop(&mut self) {
        debug!(kind = %self.shared.kind, "cache shutting down");
        // a final flush overrides a left-over commit pause
        self.shared.commit_disabled.store(false, Ordering::Release);
        self.shared.stop.store(true, Ordering::Release);
        self.shared.force_commit.store(true, Ordering::Release);
        {
            let _guard = self.shared.cache.lock();
            self.shared.cache_cond.notify_all();
        }
        {
            let _guard = self.shared.requests.lock();
            self.shared.requests_cond.notify_all();
        }
        if let Some(handle) = self.commit_worker.lock().take() {
            handle.join().ok();
        }
        if let Some(handle) = self.request_worker.lock().take() {
            handle.join().ok();
        }

        let mut cache = self.shared.cache.lock();
        cache.objects.clear();
        cache.ages.clear();
        cache.pending.clear();
        drop(cache);
        let mut requests = self.shared.requests.lock();
        requests.queue.clear();
        requests.downstream_pending.clear();
        drop(requests);
        self.shared.commits.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::{AccessLevel, Record, UserRecord};
    use std::time::Duration;
    use store_backend::test_util::{Captured, CompletionCapture, MockBackend, MockOp};

    const WAIT: Duration = Duration::from_secs(5);

    fn quiet_params() -> CacheParams {
        CacheParams {
            max_commit_interval: Duration::from_secs(3600),
            max_commit_updates: 0,
            min_commit_updates: 1,
            max_cache_size: 0,
            always_evict: false,
            clear_object_age: false,
        }
    }

    fn test_cache(params: CacheParams) -> (WriteBackCache, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new(EntityKind::User));
        let cache = WriteBackCache::new(Arc::clone(&mock) as Arc<dyn StoreBackend>, params);
        (cache, mock)
    }

    fn user(name: &str) -> UserRecord {
        UserRecord::new(name, "hash", AccessLevel::User, 0)
    }

    fn shared(record: UserRecord) -> SharedRecord {
        Arc::new(Record::User(record))
    }

    /// Waits until the commit worker has run at least `age` cycles.
    fn wait_for_age(cache: &WriteBackCache, age: u64) {
        assert!(test_helpers::wait_for(
            || cache.cache_info().global_age >= age,
            WAIT
        ));
    }

    #[test]
    fn insert_then_delete_commits_nothing() {
        test_helpers::maybe_start_logging();
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("o1"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), record));
        assert!(capture.wait_for(1, WAIT));
        assert!(cache.submit_delete(RequestId::new(2), id));
        assert!(capture.wait_for(2, WAIT));
        assert!(capture.all().iter().all(Captured::is_success));

        assert!(cache.commit());
        wait_for_age(&cache, 1);

        assert_eq!(mock.submission_count(), 0);
        assert_eq!(cache.cache_info().cached_objects, 0);
    }

    #[test]
    fn update_then_delete_commits_a_single_delete() {
        test_helpers::maybe_start_logging();
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        // preload o2 through a committed insert
        let record = shared(user("o2"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), record));
        assert!(capture.wait_for(1, WAIT));
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        assert_eq!(mock.submission_count(), 1);
        mock.complete_pending();

        let rewritten = {
            let mut u = user("o2-v2");
            u.id = id;
            shared(u)
        };
        assert!(cache.submit_update(RequestId::new(2), rewritten));
        assert!(capture.wait_for(2, WAIT));
        assert!(cache.submit_delete(RequestId::new(3), id));
        assert!(capture.wait_for(3, WAIT));

        assert!(cache.commit());
        wait_for_age(&cache, 2);

        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 2);
        assert_matches!(&submissions[1].op, MockOp::Delete(deleted) if *deleted == id);
    }

    #[test]
    fn read_hit_after_insert_stays_local() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("o3"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), record));
        assert!(cache.submit_read(RequestId::new(2), ReadConstraint::ById(id)));
        assert!(capture.wait_for(2, WAIT));

        assert_matches!(
            capture.for_request(RequestId::new(2)),
            Some(Captured::Success { record: Some(r), .. }) if r.object_id() == id
        );
        assert_eq!(mock.submission_count(), 0);
        let info = cache.cache_info();
        assert_eq!(info.hits, 1);
        assert_eq!(info.misses, 0);
    }

    #[test]
    fn read_miss_populates_the_cache_from_downstream() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("remote"));
        let id = record.object_id();
        mock.serve_record(record);

        assert!(cache.submit_read(RequestId::new(1), ReadConstraint::ById(id)));
        assert!(test_helpers::wait_for(|| mock.pending_count() == 1, WAIT));
        mock.complete_pending();
        assert!(capture.wait_for(1, WAIT));
        assert!(capture.for_request(RequestId::new(1)).expect("fired").is_success());

        // the record is now cached; a second read must not go downstream
        assert!(test_helpers::wait_for(
            || cache.cache_info().cached_objects == 1,
            WAIT
        ));
        assert!(cache.submit_read(RequestId::new(2), ReadConstraint::ById(id)));
        assert!(capture.wait_for(2, WAIT));
        assert_eq!(mock.submission_count(), 1);
        assert_eq!(cache.cache_info().hits, 1);
    }

    #[test]
    fn batch_read_populates_every_constituent() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let a = shared(user("a"));
        let b = shared(user("b"));
        let (id_a, id_b) = (a.object_id(), b.object_id());
        mock.serve_record(a);
        mock.serve_record(b);

        assert!(cache.submit_read(RequestId::new(1), ReadConstraint::All));
        assert!(test_helpers::wait_for(|| mock.pending_count() == 1, WAIT));
        mock.complete_pending();
        assert!(capture.wait_for(1, WAIT));

        assert!(test_helpers::wait_for(
            || cache.cache_info().cached_objects == 2,
            WAIT
        ));
        // both constituents answer from the cache now
        assert!(cache.submit_read(RequestId::new(2), ReadConstraint::ById(id_a)));
        assert!(cache.submit_read(RequestId::new(3), ReadConstraint::ById(id_b)));
        assert!(capture.wait_for(3, WAIT));
        assert_eq!(mock.submission_count(), 1);
    }

    #[test]
    fn read_of_object_pending_delete_fails() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        // commit the insert first so the later delete stays pending
        // instead of collapsing the insert away
        let record = shared(user("doomed"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), record));
        assert!(capture.wait_for(1, WAIT));
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        mock.complete_pending();

        assert!(cache.submit_delete(RequestId::new(2), id));
        assert!(capture.wait_for(2, WAIT));
        assert!(cache.submit_read(RequestId::new(3), ReadConstraint::ById(id)));
        assert!(capture.wait_for(3, WAIT));
        assert_matches!(
            capture.for_request(RequestId::new(3)),
            Some(Captured::Failure { error: StoreError::NotFound { id: failed }, .. }) if failed == id
        );
        // the delete shadow counts as a hit, not a miss
        assert_eq!(cache.cache_info().hits, 1);
        assert_eq!(cache.cache_info().misses, 0);
    }

    #[test]
    fn writes_conflict_with_a_pending_delete() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("victim"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), Arc::clone(&record)));
        assert!(capture.wait_for(1, WAIT));
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        mock.complete_pending();

        assert!(cache.submit_delete(RequestId::new(2), id));
        assert!(capture.wait_for(2, WAIT));
        assert!(cache.submit_update(RequestId::new(3), record));
        assert!(capture.wait_for(3, WAIT));
        assert_matches!(
            capture.for_request(RequestId::new(3)),
            Some(Captured::Failure {
                error: StoreError::ConflictPendingDelete { .. },
                ..
            })
        );
    }

    #[test]
    fn second_delete_fails() {
        let (cache, _mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("once"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), record));
        assert!(capture.wait_for(1, WAIT));

        // first delete folds the pending insert away but keeps nothing to
        // delete twice: the insert+delete pair already collapsed, so the
        // object is gone and a second delete is refused at intake
        assert!(cache.submit_delete(RequestId::new(2), id));
        assert!(capture.wait_for(2, WAIT));
        assert!(cache.submit_delete(RequestId::new(3), id));
        assert!(capture.wait_for(3, WAIT));
        assert_matches!(
            capture.for_request(RequestId::new(3)),
            Some(Captured::Failure { error: StoreError::NotFound { .. }, .. })
        );
    }

    #[test]
    fn update_refreshes_the_cached_record() {
        let (cache, _mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let original = user("ana");
        let id = original.id;
        assert!(cache.submit_insert(RequestId::new(1), shared(original.clone())));
        assert!(capture.wait_for(1, WAIT));

        let mut rebuilt = original;
        rebuilt.set_password_hash("rotated");
        assert!(cache.submit_update(RequestId::new(2), shared(rebuilt)));
        assert!(capture.wait_for(2, WAIT));

        assert!(cache.submit_read(RequestId::new(3), ReadConstraint::ById(id)));
        assert!(capture.wait_for(3, WAIT));
        let read = capture.for_request(RequestId::new(3)).expect("fired");
        assert_matches!(
            read.record().map(|r| &**r),
            Some(Record::User(u)) if u.password_hash == "rotated"
        );
    }

    #[test]
    fn commit_confirmations_stay_internal() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        assert!(cache.submit_insert(RequestId::new(1), shared(user("quiet"))));
        assert!(capture.wait_for(1, WAIT));
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        assert_eq!(mock.submission_count(), 1);

        // completions fire on this thread, so filtering is already done
        // once complete_pending returns; nothing new may surface
        mock.complete_pending();
        assert_eq!(capture.count(), 1);
        assert!(test_helpers::wait_for(
            || cache.cache_info().pending_commits == 0,
            WAIT
        ));
    }

    #[test]
    fn rejected_commit_submissions_retry_next_cycle() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        assert!(cache.submit_insert(RequestId::new(1), shared(user("sticky"))));
        assert!(capture.wait_for(1, WAIT));

        mock.set_reject_submissions(true);
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        assert_eq!(mock.submission_count(), 0);
        assert_eq!(cache.cache_info().pending_mutations, 1);

        mock.set_reject_submissions(false);
        assert!(cache.commit());
        wait_for_age(&cache, 2);
        assert_eq!(mock.submission_count(), 1);
        assert_eq!(cache.cache_info().pending_mutations, 0);
    }

    #[test]
    fn rollback_drops_unborrowed_pending_records() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        // o6: fresh insert; o7: update over a committed preload
        let o7 = shared(user("o7"));
        let id7 = o7.object_id();
        assert!(cache.submit_insert(RequestId::new(1), o7));
        assert!(capture.wait_for(1, WAIT));
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        mock.complete_pending();
        let preload_submissions = mock.submission_count();

        let o6 = shared(user("o6"));
        assert!(cache.submit_insert(RequestId::new(2), o6));
        let rewrite = {
            let mut u = user("o7-v2");
            u.id = id7;
            shared(u)
        };
        assert!(cache.submit_update(RequestId::new(3), rewrite));
        assert!(capture.wait_for(3, WAIT));
        assert_eq!(cache.cache_info().pending_mutations, 2);

        // the capture still holds the completion payloads; drop it so the
        // cache owns the records exclusively
        drop(capture);
        assert!(test_helpers::wait_for(
            || {
                cache.rollback();
                cache.cache_info().pending_mutations == 0
            },
            WAIT
        ));
        assert_eq!(cache.cache_info().cached_objects, 0);

        assert!(cache.commit());
        wait_for_age(&cache, 2);
        assert_eq!(mock.submission_count(), preload_submissions);
    }

    #[test]
    fn rollback_skips_borrowed_records() {
        let (cache, _mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("held"));
        assert!(cache.submit_insert(RequestId::new(1), Arc::clone(&record)));
        assert!(capture.wait_for(1, WAIT));
        drop(capture);

        // the test still borrows `record`
        assert!(cache.rollback());
        assert_eq!(cache.cache_info().cached_objects, 1);
        assert_eq!(cache.cache_info().pending_mutations, 1);
    }

    #[test]
    fn disabled_commit_rejects_forced_commits() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        assert!(cache.disable_commit());
        assert!(cache.submit_insert(RequestId::new(1), shared(user("parked"))));
        assert!(capture.wait_for(1, WAIT));
        assert!(!cache.commit());
        assert_eq!(mock.submission_count(), 0);
        assert_eq!(cache.cache_info().pending_mutations, 1);

        assert!(cache.enable_commit());
        assert!(cache.commit());
        wait_for_age(&cache, 1);
        assert_eq!(mock.submission_count(), 1);
    }

    #[test]
    fn eviction_drops_aged_unborrowed_objects() {
        let params = CacheParams {
            max_cache_size: 1,
            ..quiet_params()
        };
        let (cache, mock) = test_cache(params);
        let capture = CompletionCapture::attach(cache.completions());

        let record = shared(user("aged"));
        let id = record.object_id();
        assert!(cache.submit_insert(RequestId::new(1), record));
        assert!(capture.wait_for(1, WAIT));
        drop(capture);

        // first commit persists the object and advances the age past it;
        // the same cycle's eviction pass then drops it
        assert!(cache.commit());
        assert!(test_helpers::wait_for(
            || cache.cache_info().cached_objects == 0,
            WAIT
        ));
        assert_eq!(mock.submission_count(), 1);

        // a fresh read now misses and goes downstream
        let capture = CompletionCapture::attach(cache.completions());
        assert!(cache.submit_read(RequestId::new(2), ReadConstraint::ById(id)));
        assert!(test_helpers::wait_for(|| mock.submission_count() == 2, WAIT));
        drop(capture);
    }

    #[test]
    fn eviction_spares_borrowed_records() {
        let params = CacheParams {
            max_cache_size: 1,
            ..quiet_params()
        };
        let (cache, _mock) = test_cache(params);
        let capture = CompletionCapture::attach(cache.completions());

        assert!(cache.submit_insert(RequestId::new(1), shared(user("pinned"))));
        assert!(capture.wait_for(1, WAIT));
        // keep the success payload borrowed through `capture`

        assert!(cache.commit());
        wait_for_age(&cache, 1);
        assert!(cache.commit());
        wait_for_age(&cache, 2);
        assert_eq!(cache.cache_info().cached_objects, 1);
    }

    #[test]
    fn shutdown_flushes_pending_mutations() {
        let (cache, mock) = test_cache(quiet_params());
        let capture = CompletionCapture::attach(cache.completions());

        assert!(cache.submit_insert(RequestId::new(1), shared(user("flushed"))));
        assert!(capture.wait_for(1, WAIT));
        drop(capture);
        drop(cache);

        assert_eq!(mock.submission_count(), 1);
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let (cache, _mock) = test_cache(quiet_params());
        cache.shared.stop.store(true, Ordering::Release);
        assert!(!cache.submit_read(RequestId::new(1), ReadConstraint::All));
        assert!(!cache.commit());
        assert!(!cache.rollback());
    }

    #[test]
    fn high_water_mark_triggers_a_commit() {
        let params = CacheParams {
            max_commit_updates: 2,
            ..quiet_params()
        };
        let (cache, mock) = test_cache(params);
        let capture = CompletionCapture::attach(cache.completions());

        assert!(cache.submit_insert(RequestId::new(1), shared(user("w1"))));
        assert!(cache.submit_insert(RequestId::new(2), shared(user("w2"))));
        assert!(capture.wait_for(2, WAIT));

        // no forced commit; the overflow signal alone must drain the table
        assert!(test_helpers::wait_for(|| mock.submission_count() == 2, WAIT));
    }
}
