//! The shared outgoing-rate throttle.
//!
//! One throttle instance gates every outbound path of a session: the
//! reliable writer blocks until an operation is permitted, while the
//! datagram writer drops its message when none is, since datagrams are
//! best-effort, so waiting for a permit would only add latency.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct ThrottleState {
    /// Permitted operations per window.
    ops: u32,
    window: Duration,
    /// Timestamps of the operations granted in the trailing window.
    history: VecDeque<Instant>,
}

impl ThrottleState {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn would_throttle(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.history.len() >= self.ops as usize
    }

    fn note_op(&mut self, now: Instant) {
        self.history.push_back(now);
    }
}

/// An internally-synchronized message-rate limiter, shared by handle between
/// the reliable and datagram writers. The rate may be reconfigured at any
/// time (the server pushes updates), under the same lock as the throttling
/// check.
pub struct OutgoingThrottle {
    state: Mutex<ThrottleState>,
    relieved: Condvar,
}

impl OutgoingThrottle {
    /// Creates a throttle permitting `ops` operations per `window`.
    pub fn new(ops: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                ops: ops.max(1),
                window,
                history: VecDeque::new(),
            }),
            relieved: Condvar::new(),
        }
    }

    /// Reconfigures the permitted rate, keeping the existing window.
    pub fn update_rate(&self, ops: u32) {
        let mut state = lock_recovering(&self.state);
        state.ops = ops.max(1);
        self.relieved.notify_all();
    }

    /// Blocks until an operation is permitted, then records it.
    pub fn acquire(&self) {
        let mut state = lock_recovering(&self.state);
        loop {
            let now = Instant::now();
            if !state.would_throttle(now) {
                state.note_op(now);
                return;
            }
            // sleep until the oldest recorded op falls out of the window
            let wait = state
                .history
                .front()
                .map(|oldest| {
                    state
                        .window
                        .saturating_sub(now.duration_since(*oldest))
                })
                .unwrap_or(state.window);
            let (next, _timeout) = self
                .relieved
                .wait_timeout(state, wait.max(Duration::from_millis(1)))
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
    }

    /// Records an operation if one is permitted right now; returns whether
    /// it was. The datagram writer drops its message on `false`.
    pub fn try_acquire(&self) -> bool {
        let mut state = lock_recovering(&self.state);
        let now = Instant::now();
        if state.would_throttle(now) {
            return false;
        }
        state.note_op(now);
        true
    }
}

fn lock_recovering(mutex: &Mutex<ThrottleState>) -> std::sync::MutexGuard<'_, ThrottleState> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
