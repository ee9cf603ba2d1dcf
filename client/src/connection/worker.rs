//! Named worker threads for the session's blocking loops.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{Builder, JoinHandle};

use log::{error, warn};

/// Spawns a named thread that calls `iterate` until it returns `false`,
/// then runs `on_exit`. The exit hook runs even if an iteration panics, so
/// channel accounting stays correct.
pub fn spawn_loop<I, E>(name: &str, mut iterate: I, on_exit: E) -> JoinHandle<()>
where
    I: FnMut() -> bool + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let thread_name = name.to_string();
    let builder = Builder::new().name(thread_name.clone());
    let handle = builder.spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| while iterate() {}));
        if result.is_err() {
            warn!("Worker loop panicked [worker={thread_name}].");
        }
        on_exit();
    });
    match handle {
        Ok(handle) => handle,
        Err(cause) => {
            // Thread spawn only fails on resource exhaustion; there is no
            // session to run without the worker.
            error!("Failed to spawn worker [worker={name}, cause={cause}].");
            panic!("failed to spawn worker thread {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn loop_runs_until_iterate_returns_false() {
        let count = Arc::new(AtomicUsize::new(0));
        let exited = Arc::new(AtomicUsize::new(0));
        let loop_count = count.clone();
        let loop_exited = exited.clone();
        let handle = spawn_loop(
            "test-loop",
            move || loop_count.fetch_add(1, Ordering::SeqCst) < 4,
            move || {
                loop_exited.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.join().ok();
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exit_hook_runs_after_a_panicking_iteration() {
        let exited = Arc::new(AtomicUsize::new(0));
        let loop_exited = exited.clone();
        let handle = spawn_loop(
            "test-panic",
            || panic!("boom"),
            move || {
                loop_exited.fetch_add(1, Ordering::SeqCst);
            },
        );
        handle.join().ok();
        assert_eq!(exited.load(Ordering::SeqCst), 1);
    }
}
