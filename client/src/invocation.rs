//! The invocation director.
//!
//! Correlates client-originated service requests with their responses and
//! routes server-initiated notifications to registered receivers. The
//! director rides the client object: it subscribes to it at logon, listens
//! for invocation events on it, and publishes receiver registrations
//! through it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use log::{debug, info, warn};

use tether_shared::{DEvent, DValue, Oid, ReceiverId, RequestId, Transport};

use crate::dobj::{DObject, EventListener, Subscriber};
use crate::dobj_manager::ClientDObjectMgr;
use crate::error::ObjectAccessError;

/// Message event name publishing one receiver registration.
pub const RECEIVER_ADDED: &str = "receivers.add";
/// Message event name withdrawing one receiver registration.
pub const RECEIVER_REMOVED: &str = "receivers.remove";
/// Client-object attribute holding the published registration set.
pub const RECEIVERS_ATTR: &str = "receivers";

/// Listeners older than this are presumed abandoned and purged.
const LISTENER_MAX_AGE_SECS: u64 = 90;

/// Minimum interval between expiry sweeps; purging is amortized over
/// response handling instead of running a timer per listener.
const LISTENER_SWEEP_INTERVAL_SECS: u64 = 15;

/// Hears the answer to one invocation request. At most one call arrives
/// per mapped listener.
pub trait ResponseListener: Send + Sync {
    fn response_received(&self, method_id: u8, args: &[DValue]);
}

/// Receives server-initiated notifications published under a code string.
pub trait NotificationReceiver: Send + Sync {
    fn notification_received(&self, method_id: u8, args: &[DValue]);
}

/// The director's view of the session facade.
pub trait DirectorHost: Send + Sync + 'static {
    /// The client object is in hand; this completes the logon.
    fn got_client_object(&self, object: &Arc<DObject>);

    /// The client object was swapped mid-session.
    fn client_object_changed(&self, object: &Arc<DObject>);

    /// The client object could not be obtained; the session cannot
    /// complete its logon.
    fn client_object_failed(&self, cause: &ObjectAccessError);
}

struct ListenerRecord {
    listener: Arc<dyn ResponseListener>,
    mapped: Instant,
}

struct DirState {
    client_object: Option<Arc<DObject>>,
    /// The live subscription handle, kept so a swap can release the old
    /// object, and the not-yet-resolved handle of a subscription in flight.
    client_subscriber: Option<Arc<dyn Subscriber>>,
    pending_subscriber: Option<Arc<dyn Subscriber>>,
    listeners: HashMap<RequestId, ListenerRecord>,
    next_request_id: RequestId,
    /// Registered receivers by code, kept across sessions.
    receivers: HashMap<String, Arc<dyn NotificationReceiver>>,
    /// Published id assignments for the current session.
    receiver_ids: HashMap<ReceiverId, String>,
    next_receiver_id: ReceiverId,
    last_sweep: Instant,
}

impl DirState {
    /// Ids wrap; an id still mapped to an outstanding listener is skipped.
    fn next_free_request_id(&mut self) -> RequestId {
        loop {
            self.next_request_id = self.next_request_id.wrapping_add(1);
            if !self.listeners.contains_key(&self.next_request_id) {
                return self.next_request_id;
            }
        }
    }

    fn assign_receiver_id(&mut self, code: &str) -> ReceiverId {
        self.next_receiver_id = self.next_receiver_id.wrapping_add(1);
        self.receiver_ids
            .insert(self.next_receiver_id, code.to_string());
        self.next_receiver_id
    }
}

pub struct InvocationDirector {
    manager: Arc<ClientDObjectMgr>,
    host: Arc<dyn DirectorHost>,
    state: Mutex<DirState>,
}

impl InvocationDirector {
    pub fn new(manager: Arc<ClientDObjectMgr>, host: Arc<dyn DirectorHost>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            host,
            state: Mutex::new(DirState {
                client_object: None,
                client_subscriber: None,
                pending_subscriber: None,
                listeners: HashMap::new(),
                next_request_id: 0,
                receivers: HashMap::new(),
                receiver_ids: HashMap::new(),
                next_receiver_id: 0,
                last_sweep: Instant::now(),
            }),
        })
    }

    /// Begins the post-bootstrap handoff: subscribes to the client object.
    /// Logon completes when it arrives.
    pub fn init(self: &Arc<Self>, client_oid: Oid) {
        self.manager
            .subscribe_to_object(client_oid, self.subscriber());
    }

    /// The facade heard that the session's client object moved; chase the
    /// new one.
    pub fn client_object_will_change(self: &Arc<Self>, new_oid: Oid) {
        info!("Client object changing [new_oid={new_oid}].");
        self.manager.subscribe_to_object(new_oid, self.subscriber());
    }

    fn subscriber(self: &Arc<Self>) -> Arc<dyn Subscriber> {
        let subscriber: Arc<dyn Subscriber> = Arc::new(ClientObjectSubscriber {
            director: Arc::downgrade(self),
        });
        self.lock().pending_subscriber = Some(subscriber.clone());
        subscriber
    }

    /// Sends an invocation request through the addressed object. A request
    /// carrying a listener is mapped before anything hits the wire.
    pub fn send_request(
        &self,
        oid: Oid,
        inv_code: i32,
        method_id: u8,
        args: Vec<DValue>,
        listener: Option<Arc<dyn ResponseListener>>,
    ) {
        let request_id = {
            let mut state = self.lock();
            if state.client_object.is_none() {
                warn!("Dropping invocation request before logon [oid={oid}, code={inv_code}].");
                return;
            }
            listener.map(|listener| {
                let id = state.next_free_request_id();
                state.listeners.insert(
                    id,
                    ListenerRecord {
                        listener,
                        mapped: Instant::now(),
                    },
                );
                id
            })
        };
        self.manager.post_event(
            DEvent::InvocationRequest {
                target_oid: oid,
                inv_code,
                method_id,
                request_id,
                args,
            },
            Transport::default(),
        );
    }

    /// Registers a notification receiver under its code. Remembered across
    /// sessions; published to the client object immediately when one is in
    /// hand.
    pub fn register_receiver(&self, code: impl Into<String>, receiver: Arc<dyn NotificationReceiver>) {
        let code = code.into();
        let publication = {
            let mut state = self.lock();
            if state.receivers.insert(code.clone(), receiver).is_some() {
                warn!("Replacing receiver registration [code={code}].");
            }
            state
                .client_object
                .is_some()
                .then(|| (state.assign_receiver_id(&code), state.client_object.clone()))
        };
        if let Some((receiver_id, Some(object))) = publication {
            self.manager.post_event(
                registration_added(object.oid(), &code, receiver_id),
                Transport::default(),
            );
        }
    }

    pub fn unregister_receiver(&self, code: &str) {
        let withdrawal = {
            let mut state = self.lock();
            if state.receivers.remove(code).is_none() {
                info!("Unregister of unknown receiver [code={code}].");
                return;
            }
            state.receiver_ids.retain(|_, mapped| mapped != code);
            state.client_object.clone()
        };
        if let Some(object) = withdrawal {
            self.manager.post_event(
                DEvent::Message {
                    target_oid: object.oid(),
                    name: RECEIVER_REMOVED.to_string(),
                    args: vec![DValue::Str(code.to_string())],
                },
                Transport::default(),
            );
        }
    }

    /// Drops session-scoped state. Registered receivers survive for the
    /// next session; id assignments and outstanding listeners do not.
    pub fn cleanup(&self) {
        let mut state = self.lock();
        let outstanding = state.listeners.len();
        if outstanding > 0 {
            debug!("Dropping outstanding invocation listeners [count={outstanding}].");
        }
        state.client_object = None;
        state.client_subscriber = None;
        state.pending_subscriber = None;
        state.listeners.clear();
        state.receiver_ids.clear();
        state.next_request_id = 0;
        state.next_receiver_id = 0;
    }

    // ===== client object arrival =====

    fn adopt_client_object(self: &Arc<Self>, object: &Arc<DObject>) {
        object.add_listener(self.clone() as Arc<dyn EventListener>);

        let (previous, released, batch) = {
            let mut state = self.lock();
            let previous = state.client_object.replace(object.clone());
            let released = state.client_subscriber.take();
            state.client_subscriber = state.pending_subscriber.take();
            // wipe whatever an earlier session published, then publish the
            // current receiver set as one transaction
            state.receiver_ids.clear();
            let mut events = vec![DEvent::AttributeChanged {
                target_oid: object.oid(),
                name: RECEIVERS_ATTR.to_string(),
                value: DValue::List(Vec::new()),
            }];
            let codes: Vec<String> = state.receivers.keys().cloned().collect();
            for code in codes {
                let receiver_id = state.assign_receiver_id(&code);
                events.push(registration_added(object.oid(), &code, receiver_id));
            }
            (
                previous,
                released,
                DEvent::Compound {
                    target_oid: object.oid(),
                    events,
                },
            )
        };
        self.manager.post_event(batch, Transport::default());

        match previous {
            None => self.host.got_client_object(object),
            Some(old) => {
                if let Some(released) = released {
                    self.manager.unsubscribe_from_object(old.oid(), released);
                }
                self.host.client_object_changed(object);
            }
        }
    }

    // ===== inbound invocation traffic =====

    fn handle_response(&self, request_id: RequestId, method_id: u8, args: &[DValue]) {
        let record = self.lock().listeners.remove(&request_id);
        match record {
            Some(record) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    record.listener.response_received(method_id, args);
                }));
                if result.is_err() {
                    warn!("Response listener panicked [req_id={request_id}].");
                }
            }
            // the listener may simply have aged out
            None => warn!("Received response for unmapped listener [req_id={request_id}]."),
        }
        self.maybe_sweep();
    }

    fn handle_notification(&self, receiver_id: ReceiverId, method_id: u8, args: &[DValue]) {
        let receiver = {
            let state = self.lock();
            state
                .receiver_ids
                .get(&receiver_id)
                .and_then(|code| state.receivers.get(code).cloned())
        };
        match receiver {
            Some(receiver) => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    receiver.notification_received(method_id, args);
                }));
                if result.is_err() {
                    warn!("Notification receiver panicked [recv_id={receiver_id}].");
                }
            }
            None => warn!("Notification for unregistered receiver [recv_id={receiver_id}]."),
        }
    }

    /// Purges listeners nobody will ever answer. Amortized: runs at most
    /// once per sweep interval, piggybacked on response handling.
    fn maybe_sweep(&self) {
        let mut state = self.lock();
        if state.last_sweep.elapsed().as_secs() < LISTENER_SWEEP_INTERVAL_SECS {
            return;
        }
        state.last_sweep = Instant::now();
        let before = state.listeners.len();
        state
            .listeners
            .retain(|_, record| record.mapped.elapsed().as_secs() < LISTENER_MAX_AGE_SECS);
        let purged = before - state.listeners.len();
        if purged > 0 {
            warn!("Purged expired invocation listeners [count={purged}].");
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn outstanding_listeners(&self) -> usize {
        self.lock().listeners.len()
    }
}

/// The director's subscription to the client object, held weakly so a torn
/// down director does not linger in the manager's tables.
struct ClientObjectSubscriber {
    director: Weak<InvocationDirector>,
}

impl Subscriber for ClientObjectSubscriber {
    fn object_available(&self, object: &Arc<DObject>) {
        if let Some(director) = self.director.upgrade() {
            director.adopt_client_object(object);
        }
    }

    fn request_failed(&self, oid: Oid, cause: &ObjectAccessError) {
        warn!("Failed to subscribe to client object [oid={oid}, cause={cause}].");
        if let Some(director) = self.director.upgrade() {
            director.host.client_object_failed(cause);
        }
    }
}

impl EventListener for InvocationDirector {
    fn event_received(&self, _object: &Arc<DObject>, event: &DEvent) {
        match event {
            DEvent::InvocationResponse {
                request_id,
                method_id,
                args,
                ..
            } => self.handle_response(*request_id, *method_id, args),
            DEvent::InvocationNotification {
                receiver_id,
                method_id,
                args,
                ..
            } => self.handle_notification(*receiver_id, *method_id, args),
            _ => {}
        }
    }
}

fn registration_added(target_oid: Oid, code: &str, receiver_id: ReceiverId) -> DEvent {
    DEvent::Message {
        target_oid,
        name: RECEIVER_ADDED.to_string(),
        args: vec![
            DValue::Str(code.to_string()),
            DValue::Int(i32::from(receiver_id)),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MessageSender;
    use crate::dispatch::ImmediateDispatcher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_shared::{DObjectSnapshot, UpstreamMessage};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<UpstreamMessage>>,
    }

    impl RecordingSender {
        fn forwarded_events(&self) -> Vec<DEvent> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|message| match message {
                    UpstreamMessage::ForwardEvent { event } => Some(event.clone()),
                    _ => None,
                })
                .collect()
        }

        fn request_ids(&self) -> Vec<RequestId> {
            self.forwarded_events()
                .into_iter()
                .filter_map(|event| match event {
                    DEvent::InvocationRequest { request_id, .. } => request_id,
                    _ => None,
                })
                .collect()
        }
    }

    impl MessageSender for RecordingSender {
        fn send(&self, message: UpstreamMessage, _transport: Transport) {
            self.sent.lock().unwrap().push(message);
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        got: Mutex<Vec<Oid>>,
        changed: Mutex<Vec<Oid>>,
        failed: AtomicUsize,
    }

    impl DirectorHost for RecordingHost {
        fn got_client_object(&self, object: &Arc<DObject>) {
            self.got.lock().unwrap().push(object.oid());
        }

        fn client_object_changed(&self, object: &Arc<DObject>) {
            self.changed.lock().unwrap().push(object.oid());
        }

        fn client_object_failed(&self, _cause: &ObjectAccessError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    impl ResponseListener for CountingListener {
        fn response_received(&self, _method_id: u8, _args: &[DValue]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingReceiver {
        calls: AtomicUsize,
    }

    impl NotificationReceiver for CountingReceiver {
        fn notification_received(&self, _method_id: u8, _args: &[DValue]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn harness() -> (
        Arc<InvocationDirector>,
        Arc<ClientDObjectMgr>,
        Arc<RecordingSender>,
        Arc<RecordingHost>,
    ) {
        let sender = Arc::new(RecordingSender::default());
        let manager = ClientDObjectMgr::new(sender.clone(), Arc::new(ImmediateDispatcher));
        let host = Arc::new(RecordingHost::default());
        let director = InvocationDirector::new(manager.clone(), host.clone());
        (director, manager, sender, host)
    }

    fn client_object(oid: Oid) -> DObjectSnapshot {
        DObjectSnapshot {
            oid,
            category: "session/body".into(),
            attributes: Vec::new(),
        }
    }

    fn log_on(director: &Arc<InvocationDirector>, manager: &Arc<ClientDObjectMgr>, oid: Oid) {
        director.init(oid);
        manager.got_object_response(client_object(oid));
    }

    #[test]
    fn logon_completes_when_the_client_object_arrives() {
        let (director, manager, sender, host) = harness();
        log_on(&director, &manager, 1);

        assert_eq!(*host.got.lock().unwrap(), vec![1]);
        // the adoption batch wipes stale publications first
        let events = sender.forwarded_events();
        let batch = events
            .iter()
            .find_map(|event| match event {
                DEvent::Compound { events, .. } => Some(events.clone()),
                _ => None,
            })
            .unwrap();
        assert!(matches!(
            &batch[0],
            DEvent::AttributeChanged { name, .. } if name == RECEIVERS_ATTR
        ));
    }

    #[test]
    fn requests_before_logon_are_dropped() {
        let (director, _manager, sender, _host) = harness();
        let listener = Arc::new(CountingListener::default());
        director.send_request(4, 17, 1, vec![], Some(listener));
        assert!(sender.forwarded_events().is_empty());
        assert_eq!(director.outstanding_listeners(), 0);
    }

    #[test]
    fn listener_requests_get_unique_ids_and_bare_requests_get_none() {
        let (director, manager, sender, _host) = harness();
        log_on(&director, &manager, 1);

        for _ in 0..50 {
            director.send_request(4, 17, 1, vec![], Some(Arc::new(CountingListener::default())));
        }
        director.send_request(4, 17, 2, vec![], None);

        let mut ids = sender.request_ids();
        assert_eq!(ids.len(), 50);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50, "request ids must be unique while mapped");
        assert_eq!(director.outstanding_listeners(), 50);
    }

    #[test]
    fn request_id_wrap_skips_a_still_outstanding_id() {
        let (director, manager, _sender, _host) = harness();
        log_on(&director, &manager, 1);

        let mut state = director.lock();
        state.next_request_id = RequestId::MAX - 1;
        state.listeners.insert(
            RequestId::MAX,
            ListenerRecord {
                listener: Arc::new(CountingListener::default()),
                mapped: Instant::now(),
            },
        );
        assert_eq!(state.next_free_request_id(), 0, "occupied id is skipped");
    }

    #[test]
    fn responses_fire_their_listener_at_most_once() {
        let (director, manager, sender, _host) = harness();
        log_on(&director, &manager, 1);

        let listener = Arc::new(CountingListener::default());
        director.send_request(1, 17, 1, vec![], Some(listener.clone()));
        let request_id = sender.request_ids()[0];

        let object = manager.cached_object(1).unwrap();
        let response = DEvent::InvocationResponse {
            target_oid: 1,
            request_id,
            method_id: 2,
            args: vec![],
        };
        director.event_received(&object, &response);
        director.event_received(&object, &response);

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(director.outstanding_listeners(), 0);
    }

    #[test]
    fn a_response_delivered_inside_a_compound_still_fires_its_listener() {
        let (director, manager, sender, _host) = harness();
        log_on(&director, &manager, 1);

        let listener = Arc::new(CountingListener::default());
        director.send_request(1, 17, 1, vec![], Some(listener.clone()));
        let request_id = sender.request_ids()[0];

        manager.got_event(DEvent::Compound {
            target_oid: 1,
            events: vec![
                DEvent::AttributeChanged {
                    target_oid: 1,
                    name: "status".into(),
                    value: DValue::Str("ok".into()),
                },
                DEvent::InvocationResponse {
                    target_oid: 1,
                    request_id,
                    method_id: 2,
                    args: vec![],
                },
            ],
        });

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(director.outstanding_listeners(), 0);
    }

    #[test]
    fn notifications_route_by_published_receiver_id() {
        let (director, manager, sender, _host) = harness();
        let receiver = Arc::new(CountingReceiver::default());
        director.register_receiver("chat", receiver.clone());
        log_on(&director, &manager, 1);

        // the adoption batch carries the id assignment
        let assigned = sender
            .forwarded_events()
            .into_iter()
            .find_map(|event| match event {
                DEvent::Compound { events, .. } => events.into_iter().find_map(|inner| {
                    match inner {
                        DEvent::Message { name, args, .. } if name == RECEIVER_ADDED => {
                            match &args[1] {
                                DValue::Int(id) => Some(*id as ReceiverId),
                                _ => None,
                            }
                        }
                        _ => None,
                    }
                }),
                _ => None,
            })
            .unwrap();

        let object = manager.cached_object(1).unwrap();
        director.event_received(
            &object,
            &DEvent::InvocationNotification {
                target_oid: 1,
                receiver_id: assigned,
                method_id: 3,
                args: vec![],
            },
        );
        director.event_received(
            &object,
            &DEvent::InvocationNotification {
                target_oid: 1,
                receiver_id: assigned.wrapping_add(40),
                method_id: 3,
                args: vec![],
            },
        );
        assert_eq!(receiver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_drops_session_state_but_keeps_registered_receivers() {
        let (director, manager, sender, host) = harness();
        let receiver = Arc::new(CountingReceiver::default());
        director.register_receiver("chat", receiver);
        log_on(&director, &manager, 1);
        director.send_request(1, 17, 1, vec![], Some(Arc::new(CountingListener::default())));
        assert_eq!(director.outstanding_listeners(), 1);

        director.cleanup();
        manager.cleanup();
        assert_eq!(director.outstanding_listeners(), 0);

        // next session republishes the surviving receiver
        sender.sent.lock().unwrap().clear();
        log_on(&director, &manager, 2);
        assert_eq!(*host.got.lock().unwrap(), vec![1, 2]);
        let republished = sender.forwarded_events().into_iter().any(|event| {
            matches!(
                &event,
                DEvent::Compound { events, .. } if events.iter().any(|inner| matches!(
                    inner,
                    DEvent::Message { name, .. } if name == RECEIVER_ADDED
                ))
            )
        });
        assert!(republished);
    }
}
