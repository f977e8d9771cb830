//! Serial execution queues.
//!
//! Several parts of the daemon need strict one-at-a-time ordering without
//! holding locks across I/O: outbound protocol writes (a multi-part message
//! must never interleave with another client's traffic) and symbol patching
//! (two scans must not rewrite the same object file concurrently). A
//! [`SerialQueue`] owns a dedicated worker thread and runs submitted closures
//! in submission order.

use crossbeam_channel::{bounded, unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use tracing::error;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct SerialQueue {
    label: &'static str,
    tx: Sender<Task>,
}

impl SerialQueue {
    /// Spawns the worker thread. The queue drains until it is dropped.
    pub fn new(label: &'static str) -> Self {
        let (tx, rx) = unbounded::<Task>();
        thread::spawn(move || {
            for task in rx {
                // A panicking task must not kill the queue: later messages
                // to other clients still have to go out.
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(queue = label, "task panicked on serial queue");
                }
            }
        });
        Self { label, tx }
    }

    /// Enqueues `task` and returns immediately.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.tx.send(Box::new(task));
    }

    /// Enqueues `task` and blocks until it has run, returning its result.
    pub fn dispatch_sync<R, F>(&self, task: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (done_tx, done_rx) = bounded(1);
        self.dispatch(move || {
            let _ = done_tx.send(task());
        });
        match done_rx.recv() {
            Ok(result) => result,
            // The worker caught a panic inside `task`; surface it here the
            // way running inline would have.
            Err(_) => panic!("task panicked on serial queue '{}'", self.label),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue").field("label", &self.label).finish()
    }
}
