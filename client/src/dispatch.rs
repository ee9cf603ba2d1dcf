//! The single dispatch context.
//!
//! Every inbound message and every subscribe/unsubscribe action is funneled
//! through one `DispatchQueue` and drained on one designated thread. That is
//! the sole synchronization discipline for the object proxy cache and the
//! invocation correlation maps: their state is only ever mutated from jobs
//! running on this context.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::Mutex;
use std::thread;

use log::warn;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An execution context onto which event-dispatch work is queued. The
/// application may supply its own (for example one that drains on its main
/// loop); [`ThreadDispatcher`] is the stock standalone-thread realization.
pub trait DispatchQueue: Send + Sync {
    fn post(&self, job: Job);
}

/// Runs a job, logging a panic instead of unwinding further, so one
/// misbehaving listener must not stall the shared dispatch queue.
pub fn run_guarded(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("Dispatch job panicked; continuing.");
    }
}

/// A dedicated thread draining posted jobs in order.
pub struct ThreadDispatcher {
    sender: Mutex<Option<Sender<Job>>>,
}

impl ThreadDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = channel::<Job>();
        let builder = thread::Builder::new().name("tether-dispatch".to_string());
        // a failure to spawn leaves a dispatcher that drops all jobs; the
        // warning on every post makes that loudly visible
        if let Err(error) = builder.spawn(move || {
            while let Ok(job) = receiver.recv() {
                run_guarded(job);
            }
        }) {
            warn!("Failed to spawn dispatch thread [error={error}].");
            return Self {
                sender: Mutex::new(None),
            };
        }
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Stops the dispatch thread once all queued jobs have run.
    pub fn shutdown(&self) {
        let mut sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *sender = None;
    }
}

impl Default for ThreadDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue for ThreadDispatcher {
    fn post(&self, job: Job) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Dropping job posted to stopped dispatcher.");
                }
            }
            None => warn!("Dropping job posted to stopped dispatcher."),
        }
    }
}

/// Runs jobs inline on the posting thread. Used by tests and by embedded
/// setups where the caller's thread *is* the dispatch context.
pub struct ImmediateDispatcher;

impl DispatchQueue for ImmediateDispatcher {
    fn post(&self, job: Job) {
        run_guarded(job);
    }
}
