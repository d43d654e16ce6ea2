//! The adapter contract: [`StoreBackend`] and the [`CompletionHub`]
//! publish-subscribe completion surface.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use data_types::{
    BackendId, BackendInfo, EntityKind, ObjectId, ReadConstraint, RequestId, SharedRecord,
    StoreError,
};
use observability_deps::tracing::debug;
use parking_lot::Mutex;

/// Handler invoked for every success completion.
pub type SuccessHandler = Arc<dyn Fn(BackendId, RequestId, Option<SharedRecord>) + Send + Sync>;

/// Handler invoked for every failure completion.
pub type FailureHandler = Arc<dyn Fn(BackendId, RequestId, StoreError) + Send + Sync>;

/// A polymorphic storage driver for one entity kind.
///
/// The four submit operations are asynchronous: the returned `bool` only
/// acknowledges that the request was accepted. Exactly one completion
/// (success or failure) later fires on the backend's [`CompletionHub`] for
/// every accepted request, carrying the id the submitter chose.
///
/// Implementations must never emit a completion inline on the submitter's
/// thread: upstream components submit while holding their own state locks
/// and subscribe to the hub with handlers that take those locks again.
pub trait StoreBackend: Debug + Send + Sync {
    /// Schedule a read. Completes with a single record for an identity
    /// constraint, a batch record otherwise.
    fn submit_read(&self, request: RequestId, constraint: ReadConstraint) -> bool;

    /// Schedule an insert; the completion fails if the object already
    /// exists.
    fn submit_insert(&self, request: RequestId, record: SharedRecord) -> bool;

    /// Schedule an update; the completion fails if the object does not
    /// exist.
    fn submit_update(&self, request: RequestId, record: SharedRecord) -> bool;

    /// Schedule a delete; the completion fails if the object does not
    /// exist. A successful delete completes with the removed record.
    fn submit_delete(&self, request: RequestId, id: ObjectId) -> bool;

    /// The completion surface for requests submitted to this backend.
    fn completions(&self) -> &CompletionHub;

    /// Open the backend for traffic.
    fn connect(&self) -> bool;

    /// Close the backend; implementations may flush state here.
    fn disconnect(&self) -> bool;

    /// Create or load the backing store.
    fn build(&self) -> bool;

    /// Drop every stored object.
    fn clear(&self) -> bool;

    /// Self-description snapshot.
    fn info(&self) -> BackendInfo;

    /// The entity kind this backend persists.
    fn kind(&self) -> EntityKind;

    /// Record the queue-assigned backend id. Stable once attached.
    fn set_id(&self, id: BackendId);

    /// The queue-assigned backend id, [`BackendId::UNSET`] before attach.
    fn id(&self) -> BackendId;
}

/// Identifier of one attached completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy)]
enum Channel {
    Success,
    Failure,
}

#[derive(Default)]
struct HubState {
    next_id: AtomicU64,
    success: Mutex<Vec<(SubscriptionId, SuccessHandler)>>,
    failure: Mutex<Vec<(SubscriptionId, FailureHandler)>>,
}

/// The pair of success/failure publish-subscribe channels a backend
/// exposes.
///
/// Handlers attach with [`CompletionHub::on_success`] /
/// [`CompletionHub::on_failure`] and stay attached until the returned
/// [`Subscription`] is dropped. Emission snapshots the handler list first,
/// so a handler may attach or detach subscriptions re-entrantly.
#[derive(Default)]
pub struct CompletionHub {
    state: Arc<HubState>,
}

impl CompletionHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a success handler.
    pub fn on_success(
        &self,
        handler: impl Fn(BackendId, RequestId, Option<SharedRecord>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscription_id();
        self.state.success.lock().push((id, Arc::new(handler)));
        Subscription {
            hub: Arc::downgrade(&self.state),
            id,
            channel: Channel::Success,
        }
    }

    /// Attach a failure handler.
    pub fn on_failure(
        &self,
        handler: impl Fn(BackendId, RequestId, StoreError) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscription_id();
        self.state.failure.lock().push((id, Arc::new(handler)));
        Subscription {
            hub: Arc::downgrade(&self.state),
            id,
            channel: Channel::Failure,
        }
    }

    /// Publish a success completion to every attached handler.
    pub fn emit_success(
        &self,
        backend: BackendId,
        request: RequestId,
        record: Option<SharedRecord>,
    ) {
        let handlers: Vec<SuccessHandler> = {
            let guard = self.state.success.lock();
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        if handlers.is_empty() {
            debug!(%backend, %request, "success completion with no subscribers");
        }
        for handler in handlers {
            handler(backend, request, record.clone());
        }
    }

    /// Publish a failure completion to every attached handler.
    pub fn emit_failure(&self, backend: BackendId, request: RequestId, error: StoreError) {
        let handlers: Vec<FailureHandler> = {
            let guard = self.state.failure.lock();
            guard.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        if handlers.is_empty() {
            debug!(%backend, %request, "failure completion with no subscribers");
        }
        for handler in handlers {
            handler(backend, request, error.clone());
        }
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.state.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Debug for CompletionHub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHub")
            .field("success_handlers", &self.state.success.lock().len())
            .field("failure_handlers", &self.state.failure.lock().len())
            .finish()
    }
}

/// Handle for one attached completion handler; the handler stays attached
/// until this is dropped or [`Subscription::detach`] is called.
#[derive(Debug)]
pub struct Subscription {
    hub: Weak<HubState>,
    id: SubscriptionId,
    channel: Channel,
}

impl Subscription {
    /// Detach the handler now instead of at drop time.
    pub fn detach(self) {
        // dropping does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.hub.upgrade() {
            match self.channel {
                Channel::Success => state.success.lock().retain(|(id, _)| *id != self.id),
                Channel::Failure => state.failure.lock().retain(|(id, _)| *id != self.id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emission_reaches_every_subscriber() {
        let hub = CompletionHub::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let _a = hub.on_success(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&calls);
        let _b = hub.on_success(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit_success(BackendId::new(1), RequestId::new(7), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_subscription_detaches() {
        let hub = CompletionHub::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let sub = hub.on_failure(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        hub.emit_failure(BackendId::new(1), RequestId::new(1), StoreError::Timeout);
        sub.detach();
        hub.emit_failure(BackendId::new(1), RequestId::new(2), StoreError::Timeout);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_may_resubscribe_reentrantly() {
        let hub = Arc::new(CompletionHub::new());
        let later = Arc::new(Mutex::new(Vec::new()));

        let hub_captured = Arc::clone(&hub);
        let later_captured = Arc::clone(&later);
        let _sub = hub.on_success(move |_, _, _| {
            let sub = hub_captured.on_success(|_, _, _| {});
            later_captured.lock().push(sub);
        });

        // must not deadlock against the handler registering a new
        // subscription on the same channel
        hub.emit_success(BackendId::new(1), RequestId::new(1), None);
        assert_eq!(later.lock().len(), 1);
    }
}
