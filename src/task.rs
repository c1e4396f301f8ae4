//! Background I/O dispatch.
//!
//! Long-running I/O (file serialization, materialization, unlinks) is
//! handed to an [`IoPool`]: a dispatcher thread that owns a tokio runtime
//! and fans tasks out to its blocking pool. Completion is observed through
//! the per-state [`ReadyEvent`](crate::state::ReadyEvent), not through the
//! pool; the pool only tracks failures.
//!
//! Tasks are not cancellable. Failures are recorded in the pool's failure
//! monitor and logged; they are never retried.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::Result;

type IoTask = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum IoRequest {
    Task(IoTask),
    Shutdown,
}

/// Records background task failures for later inspection.
///
/// The engine does not undo partial state on a background failure; the
/// monitor is how callers find out a ref may be unusable.
#[derive(Default)]
pub struct FailureMonitor {
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl FailureMonitor {
    /// Number of failed background tasks since pool creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Message of the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record(&self, message: String) {
        warn!("background I/O task failed: {message}");
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message);
    }
}

struct PendingTasks {
    count: Mutex<u64>,
    idle: Condvar,
}

impl PendingTasks {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Worker pool for background I/O tasks.
pub struct IoPool {
    tx: Sender<IoRequest>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
    monitor: Arc<FailureMonitor>,
    pending: Arc<PendingTasks>,
}

impl IoPool {
    /// Create a pool with the given number of runtime worker threads.
    pub fn new(worker_threads: usize) -> Self {
        let (tx, rx) = unbounded::<IoRequest>();
        let monitor = Arc::new(FailureMonitor::default());
        let pending = Arc::new(PendingTasks::new());

        let dispatcher = {
            let monitor = Arc::clone(&monitor);
            let pending = Arc::clone(&pending);
            thread::spawn(move || dispatcher_loop(rx, monitor, pending, worker_threads))
        };

        Self {
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            monitor,
            pending,
        }
    }

    /// The process-wide shared pool.
    pub fn global() -> &'static IoPool {
        static GLOBAL: OnceLock<IoPool> = OnceLock::new();
        GLOBAL.get_or_init(|| IoPool::new(2))
    }

    /// Dispatch a task. Falls back to running inline if the pool has shut
    /// down.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.pending.increment();
        if let Err(rejected) = self.tx.send(IoRequest::Task(Box::new(task))) {
            warn!("I/O pool stopped; running task inline");
            if let IoRequest::Task(task) = rejected.0 {
                if let Err(e) = task() {
                    self.monitor.record(e.to_string());
                }
            }
            self.pending.decrement();
        }
    }

    /// The pool's failure monitor.
    pub fn monitor(&self) -> &FailureMonitor {
        &self.monitor
    }

    /// Block until every submitted task has finished. Test hook.
    pub fn wait_idle(&self) {
        self.pending.wait_idle();
    }

    /// Stop the dispatcher and join it. Queued tasks finish first.
    pub fn stop(&self) {
        if let Some(worker) = self.dispatcher.lock().take() {
            let _ = self.tx.send(IoRequest::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatcher_loop(
    rx: Receiver<IoRequest>,
    monitor: Arc<FailureMonitor>,
    pending: Arc<PendingTasks>,
    worker_threads: usize,
) {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name("oxipool-io")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("failed to start I/O runtime: {e}");
            return;
        }
    };

    while let Ok(req) = rx.recv() {
        match req {
            IoRequest::Task(task) => {
                let monitor = Arc::clone(&monitor);
                let pending = Arc::clone(&pending);
                rt.spawn_blocking(move || {
                    match catch_unwind(AssertUnwindSafe(task)) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => monitor.record(e.to_string()),
                        Err(_) => monitor.record("task panicked".to_string()),
                    }
                    pending.decrement();
                });
            }
            IoRequest::Shutdown => break,
        }
    }

    rt.shutdown_timeout(Duration::from_secs(1));
}
