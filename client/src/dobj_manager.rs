//! The client-side distributed object manager.
//!
//! Owns the proxy cache and every subscription in flight. All cache
//! mutation happens on the dispatch context: application-facing calls post
//! a job for it, while the `got_*` entry points are invoked from the
//! session host's routing job and run inline, one message resolved per
//! job. Subscriber callbacks always run with the manager lock released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use tether_shared::{DEvent, DObjectSnapshot, Oid, Transport, UpstreamMessage};

use crate::connection::MessageSender;
use crate::dispatch::DispatchQueue;
use crate::dobj::{DObject, Subscriber};
use crate::error::ObjectAccessError;

struct CacheEntry {
    object: Arc<DObject>,
    subscribers: Vec<Arc<dyn Subscriber>>,
}

/// A subscription request on the wire. Its presence guarantees at most one
/// outstanding request per oid; arrivals while it exists just join the
/// waiter list.
struct PendingRequest {
    waiters: Vec<Arc<dyn Subscriber>>,
}

struct MgrState {
    ocache: HashMap<Oid, CacheEntry>,
    /// Oids unsubscribed on the wire but not yet acknowledged. Events for
    /// these are an expected race, not an anomaly.
    dead: HashSet<Oid>,
    penders: HashMap<Oid, PendingRequest>,
    /// Category-prefix keyed eviction grace periods.
    flush_delays: Vec<(String, Duration)>,
    /// Subscriber-less proxies awaiting eviction, by deadline.
    flushes: HashMap<Oid, Instant>,
}

pub struct ClientDObjectMgr {
    sender: Arc<dyn MessageSender>,
    dispatch: Arc<dyn DispatchQueue>,
    state: Mutex<MgrState>,
}

impl ClientDObjectMgr {
    pub fn new(sender: Arc<dyn MessageSender>, dispatch: Arc<dyn DispatchQueue>) -> Arc<Self> {
        Arc::new(Self {
            sender,
            dispatch,
            state: Mutex::new(MgrState {
                ocache: HashMap::new(),
                dead: HashSet::new(),
                penders: HashMap::new(),
                flush_delays: Vec::new(),
                flushes: HashMap::new(),
            }),
        })
    }

    /// Requests proxy access to an object. An invalid oid fails that
    /// subscriber immediately without touching the network; everything else
    /// is resolved on the dispatch context.
    pub fn subscribe_to_object(self: &Arc<Self>, oid: Oid, subscriber: Arc<dyn Subscriber>) {
        if oid <= 0 {
            subscriber.request_failed(oid, &ObjectAccessError::InvalidOid { oid });
            return;
        }
        let manager = self.clone();
        self.dispatch
            .post(Box::new(move || manager.do_subscribe(oid, subscriber)));
    }

    /// Withdraws one subscriber's interest in an object.
    pub fn unsubscribe_from_object(self: &Arc<Self>, oid: Oid, subscriber: Arc<dyn Subscriber>) {
        let manager = self.clone();
        self.dispatch
            .post(Box::new(move || manager.do_unsubscribe(oid, &subscriber)));
    }

    /// Forwards a locally generated event to the server for application.
    pub fn post_event(&self, event: DEvent, transport: Transport) {
        self.sender
            .send(UpstreamMessage::ForwardEvent { event }, transport);
    }

    /// Registers an eviction grace period for objects whose category falls
    /// under `prefix`. The most specific registration wins.
    pub fn register_flush_delay(&self, prefix: impl Into<String>, delay: Duration) {
        self.lock().flush_delays.push((prefix.into(), delay));
    }

    // ===== downstream entry points =====
    //
    // These run on the dispatch context already: the session host routes
    // each inbound message as a single posted job and calls straight in,
    // so a message is fully resolved before the next job runs.

    pub fn got_object_response(self: &Arc<Self>, snapshot: DObjectSnapshot) {
        self.register_and_notify(snapshot);
    }

    pub fn got_failure_response(self: &Arc<Self>, oid: Oid, reason: String) {
        self.notify_failure(oid, reason);
    }

    pub fn got_unsubscribe_response(self: &Arc<Self>, oid: Oid) {
        if !self.lock().dead.remove(&oid) {
            warn!("Unsubscribe acknowledged for unexpected object [oid={oid}].");
        }
    }

    pub fn got_event(self: &Arc<Self>, event: DEvent) {
        self.dispatch_event(event);
    }

    /// Periodic eviction of subscriber-less proxies whose grace period has
    /// run out.
    pub fn sweep(self: &Arc<Self>) {
        let manager = self.clone();
        self.dispatch.post(Box::new(move || {
            let now = Instant::now();
            let mut state = manager.lock();
            let expired: Vec<Oid> = state
                .flushes
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(oid, _)| *oid)
                .collect();
            for oid in expired {
                manager.flush_object(&mut state, oid);
            }
        }));
    }

    /// Fails everything outstanding and drops all proxy state. Runs on the
    /// dispatch context as part of session teardown, so any resolution
    /// still queued behind it finds no pending request to satisfy.
    pub fn cleanup(self: &Arc<Self>) {
        let (penders, count) = {
            let mut state = self.lock();
            let penders: Vec<(Oid, PendingRequest)> = state.penders.drain().collect();
            let count = state.ocache.len();
            state.ocache.clear();
            state.dead.clear();
            state.flushes.clear();
            (penders, count)
        };
        debug!(
            "Cleared object cache [objects={count}, penders={}].",
            penders.len()
        );
        for (oid, pender) in penders {
            let cause = ObjectAccessError::ConnectionClosed { oid };
            for waiter in pender.waiters {
                waiter.request_failed(oid, &cause);
            }
        }
    }

    // ===== dispatch-context internals =====

    fn do_subscribe(self: &Arc<Self>, oid: Oid, subscriber: Arc<dyn Subscriber>) {
        let cached = {
            let mut state = self.lock();
            if let Some(entry) = state.ocache.get_mut(&oid) {
                entry.subscribers.push(subscriber.clone());
                let object = entry.object.clone();
                // a flush-pending object comes back with zero traffic
                if state.flushes.remove(&oid).is_some() {
                    debug!("Resurrected flush-pending object [oid={oid}].");
                }
                Some(object)
            } else if let Some(pender) = state.penders.get_mut(&oid) {
                pender.waiters.push(subscriber.clone());
                return;
            } else {
                state.penders.insert(
                    oid,
                    PendingRequest {
                        waiters: vec![subscriber.clone()],
                    },
                );
                None
            }
        };
        match cached {
            Some(object) => subscriber.object_available(&object),
            None => self
                .sender
                .send(UpstreamMessage::Subscribe { oid }, Transport::default()),
        }
    }

    fn do_unsubscribe(self: &Arc<Self>, oid: Oid, subscriber: &Arc<dyn Subscriber>) {
        let mut state = self.lock();
        let Some(entry) = state.ocache.get_mut(&oid) else {
            info!("Requested to unsubscribe from unproxied object [oid={oid}].");
            return;
        };
        let before = entry.subscribers.len();
        entry
            .subscribers
            .retain(|existing| !Arc::ptr_eq(existing, subscriber));
        if entry.subscribers.len() == before {
            info!("Unsubscribe from object without subscription [oid={oid}].");
            return;
        }
        if entry.subscribers.is_empty() {
            self.removed_last_subscriber(&mut state, oid);
        }
    }

    /// Either defers eviction by the registered grace period or flushes the
    /// proxy immediately.
    fn removed_last_subscriber(&self, state: &mut MgrState, oid: Oid) {
        let category = match state.ocache.get(&oid) {
            Some(entry) => entry.object.category().to_string(),
            None => return,
        };
        match most_specific_delay(&state.flush_delays, &category) {
            Some(delay) => {
                state.flushes.insert(oid, Instant::now() + delay);
            }
            None => self.flush_object(state, oid),
        }
    }

    /// Evicts a proxy: cache to dead set plus an unsubscribe on the wire.
    /// The dead-set entry only clears on the server's acknowledgment.
    fn flush_object(&self, state: &mut MgrState, oid: Oid) {
        if state.ocache.remove(&oid).is_none() {
            return;
        }
        state.flushes.remove(&oid);
        state.dead.insert(oid);
        self.sender
            .send(UpstreamMessage::Unsubscribe { oid }, Transport::default());
    }

    fn register_and_notify(self: &Arc<Self>, snapshot: DObjectSnapshot) {
        let oid = snapshot.oid;
        let (object, waiters) = {
            let mut state = self.lock();
            let Some(pender) = state.penders.remove(&oid) else {
                // every waiter bailed before the answer came back; put the
                // server's view back in line
                warn!("Got object response with no request outstanding [oid={oid}].");
                state.dead.insert(oid);
                drop(state);
                self.sender
                    .send(UpstreamMessage::Unsubscribe { oid }, Transport::default());
                return;
            };
            let object = Arc::new(DObject::from_snapshot(snapshot));
            state.ocache.insert(
                oid,
                CacheEntry {
                    object: object.clone(),
                    subscribers: pender.waiters.clone(),
                },
            );
            (object, pender.waiters)
        };
        // waiters hear about it in the order they asked
        for waiter in waiters {
            waiter.object_available(&object);
        }
    }

    fn notify_failure(self: &Arc<Self>, oid: Oid, reason: String) {
        let waiters = {
            let mut state = self.lock();
            match state.penders.remove(&oid) {
                Some(pender) => pender.waiters,
                None => {
                    warn!("Got failure response with no request outstanding [oid={oid}].");
                    return;
                }
            }
        };
        let cause = ObjectAccessError::AccessDenied {
            oid,
            reason: reason.clone(),
        };
        info!("Subscription refused [oid={oid}, reason={reason}].");
        for waiter in waiters {
            waiter.request_failed(oid, &cause);
        }
    }

    fn dispatch_event(self: &Arc<Self>, event: DEvent) {
        // compounds are a transport envelope: each contained event is
        // applied and heard individually, in order
        if let DEvent::Compound { events, .. } = event {
            for contained in events {
                self.dispatch_event(contained);
            }
            return;
        }
        let oid = event.target_oid();
        let destroys = matches!(event, DEvent::ObjectDestroyed { .. });
        let object = {
            let mut state = self.lock();
            match state.ocache.get(&oid) {
                Some(entry) => {
                    let object = entry.object.clone();
                    if destroys {
                        // gone from the cache before its listeners hear
                        // the destruction
                        state.ocache.remove(&oid);
                        state.flushes.remove(&oid);
                        state.dead.remove(&oid);
                    }
                    object
                }
                None => {
                    if state.dead.contains(&oid) {
                        // expected race with our own unsubscribe
                        debug!("Dropping event for dead object [oid={oid}].");
                    } else {
                        warn!("Got event for unknown object [oid={oid}, event={event:?}].");
                    }
                    return;
                }
            }
        };
        object.apply_event(&event);
    }

    fn lock(&self) -> MutexGuard<'_, MgrState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Peeks at the proxy cache without subscribing. The returned proxy may
    /// be evicted at any time; hold a subscription to keep it.
    pub fn cached_object(&self, oid: Oid) -> Option<Arc<DObject>> {
        self.lock().ocache.get(&oid).map(|entry| entry.object.clone())
    }

    #[cfg(test)]
    pub(crate) fn is_dead(&self, oid: Oid) -> bool {
        self.lock().dead.contains(&oid)
    }
}

/// The registration whose prefix covers `category` with the most segments
/// wins. A prefix covers a category when it equals it or is a
/// `/`-terminated ancestor.
fn most_specific_delay(delays: &[(String, Duration)], category: &str) -> Option<Duration> {
    delays
        .iter()
        .filter(|(prefix, _)| {
            category == prefix || category.starts_with(&format!("{prefix}/"))
        })
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, delay)| *delay)
}
