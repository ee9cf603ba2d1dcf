//! Local proxies of server-hosted distributed objects.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use tether_shared::{DEvent, DObjectSnapshot, DValue, Oid};

/// Receives subscription outcomes. Exactly one of the two callbacks fires
/// per subscription request.
pub trait Subscriber: Send + Sync {
    fn object_available(&self, object: &Arc<DObject>);
    fn request_failed(&self, oid: Oid, cause: &crate::error::ObjectAccessError);
}

/// Receives events applied to a proxy the listener is attached to.
pub trait EventListener: Send + Sync {
    fn event_received(&self, object: &Arc<DObject>, event: &DEvent);
}

struct DObjectState {
    attributes: BTreeMap<String, DValue>,
    listeners: Vec<Arc<dyn EventListener>>,
}

/// A local proxy of a server-hosted object. Attribute state is only ever
/// mutated on the dispatch context, by applying downstream events in
/// arrival order.
pub struct DObject {
    oid: Oid,
    category: String,
    state: Mutex<DObjectState>,
}

impl DObject {
    pub fn from_snapshot(snapshot: DObjectSnapshot) -> Self {
        Self {
            oid: snapshot.oid,
            category: snapshot.category,
            state: Mutex::new(DObjectState {
                attributes: snapshot.attributes.into_iter().collect(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// The current value of an attribute, if set.
    pub fn get(&self, name: &str) -> Option<DValue> {
        self.lock().attributes.get(name).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        let mut state = self.lock();
        if state
            .listeners
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &listener))
        {
            warn!("Refusing duplicate listener registration [oid={}].", self.oid);
            return;
        }
        state.listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) {
        self.lock()
            .listeners
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Applies one event to this proxy's state, then notifies listeners.
    /// The manager unwraps compound envelopes before this point; every
    /// event arriving here stands alone.
    pub(crate) fn apply_event(self: &Arc<Self>, event: &DEvent) {
        self.apply_state(event);
        self.notify_listeners(event);
    }

    fn apply_state(&self, event: &DEvent) {
        match event {
            DEvent::AttributeChanged { name, value, .. } => {
                self.lock().attributes.insert(name.clone(), value.clone());
            }
            // Destruction, messages and invocation traffic carry no
            // attribute state.
            _ => {}
        }
    }

    fn notify_listeners(self: &Arc<Self>, event: &DEvent) {
        let listeners = self.lock().listeners.clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener.event_received(self, event);
            }));
            if result.is_err() {
                warn!("Listener panicked [oid={}].", self.oid);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, DObjectState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn proxy(oid: Oid) -> Arc<DObject> {
        Arc::new(DObject::from_snapshot(DObjectSnapshot {
            oid,
            category: "test".into(),
            attributes: vec![("count".into(), DValue::Int(1))],
        }))
    }

    struct CountingListener {
        calls: AtomicUsize,
    }

    impl EventListener for CountingListener {
        fn event_received(&self, _object: &Arc<DObject>, _event: &DEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn attribute_changed_updates_state_before_listeners_run() {
        let object = proxy(5);

        struct AssertingListener;
        impl EventListener for AssertingListener {
            fn event_received(&self, object: &Arc<DObject>, _event: &DEvent) {
                assert_eq!(object.get("count"), Some(DValue::Int(2)));
            }
        }
        object.add_listener(Arc::new(AssertingListener));

        object.apply_event(&DEvent::AttributeChanged {
            target_oid: 5,
            name: "count".into(),
            value: DValue::Int(2),
        });
        assert_eq!(object.get("count"), Some(DValue::Int(2)));
    }

    #[test]
    fn each_applied_event_reaches_every_listener_once() {
        let object = proxy(7);
        let listener = Arc::new(CountingListener {
            calls: AtomicUsize::new(0),
        });
        object.add_listener(listener.clone());

        object.apply_event(&DEvent::AttributeChanged {
            target_oid: 7,
            name: "a".into(),
            value: DValue::Int(1),
        });
        object.apply_event(&DEvent::AttributeChanged {
            target_oid: 7,
            name: "b".into(),
            value: DValue::Int(2),
        });

        assert_eq!(object.get("a"), Some(DValue::Int(1)));
        assert_eq!(object.get("b"), Some(DValue::Int(2)));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_listener_is_refused() {
        let object = proxy(9);
        let listener: Arc<dyn EventListener> = Arc::new(CountingListener {
            calls: AtomicUsize::new(0),
        });
        object.add_listener(listener.clone());
        object.add_listener(listener.clone());

        object.apply_event(&DEvent::Message {
            target_oid: 9,
            name: "tick".into(),
            args: vec![],
        });

        let counting = object.lock().listeners.len();
        assert_eq!(counting, 1);
    }
}
