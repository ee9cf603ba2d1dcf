//! Session observers.
//!
//! State changes surface to the application exclusively through observer
//! notifications, never as errors thrown across the network-thread
//! boundary. Notification passes iterate a snapshot of the registered
//! observers, so registration or removal during a pass does not affect the
//! pass already in flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::client::Client;
use crate::error::LogonError;

/// A session state change delivered to observers.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// A logon attempt has begun.
    WillLogon,
    /// The session is fully established (client object in hand).
    DidLogon,
    /// The client object was replaced mid-session.
    ObjectChanged,
    /// The session ended; always fired exactly once per ended session,
    /// whether the end was clean or a failure.
    DidLogoff,
    /// The connection failed after logon. Always followed by `DidLogoff`.
    ConnectionFailed { cause: String },
    /// A logon attempt failed. Terminal unless the cause is still in
    /// progress.
    FailedToLogon { cause: LogonError },
    /// Session references have been cleared; a fresh logon may begin.
    DidClear,
}

/// Receives session state change notifications. `will_logoff` is the one
/// vetoable callback: returning `false` aborts an abortable logoff request.
pub trait SessionObserver: Send + Sync {
    fn notify(&self, client: &Client, notice: &SessionNotice);

    fn will_logoff(&self, _client: &Client) -> bool {
        true
    }
}

/// An ordered observer collection with snapshot-iteration semantics.
pub struct ObserverList {
    observers: Mutex<Vec<Arc<dyn SessionObserver>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers an observer. Refuses an already registered observer.
    pub fn add(&self, observer: Arc<dyn SessionObserver>) {
        let mut observers = self.lock();
        if observers
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &observer))
        {
            warn!("Refusing to re-register observer.");
            return;
        }
        observers.push(observer);
    }

    pub fn remove(&self, observer: &Arc<dyn SessionObserver>) {
        self.lock()
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }

    /// Applies a notice to a snapshot of the registered observers, in
    /// registration order. A panicking observer is logged and skipped.
    pub fn notify(&self, client: &Client, notice: &SessionNotice) {
        for observer in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                observer.notify(client, notice);
            }));
            if result.is_err() {
                warn!("Observer panicked handling {notice:?}.");
            }
        }
    }

    /// Polls every observer's logoff veto; returns `true` if any observer
    /// rejected the logoff.
    pub fn poll_will_logoff(&self, client: &Client) -> bool {
        let mut rejected = false;
        for observer in self.snapshot() {
            let result = catch_unwind(AssertUnwindSafe(|| observer.will_logoff(client)));
            match result {
                Ok(allowed) => {
                    if !allowed {
                        rejected = true;
                    }
                }
                Err(_) => warn!("Observer panicked in will_logoff."),
            }
        }
        rejected
    }

    fn snapshot(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn SessionObserver>>> {
        self.observers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ObserverList {
    fn default() -> Self {
        Self::new()
    }
}
