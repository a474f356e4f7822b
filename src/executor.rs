//! Adaptive executor with a caller-runs overflow policy.
//!
//! ```text
//!   submit ──> idle worker? ──yes──> channel ──> worker thread
//!                 │
//!                 no ──> room to spawn? ──yes──> new worker
//!                              │
//!                              no ──> run on the caller's thread
//! ```
//!
//! Tasks never wait in a queue for a busy worker. Every task sent down the
//! channel is matched by a reservation on an idle (or freshly spawned)
//! worker, so a recursive task that submits children cannot block on work
//! nobody will pick up. When the pool is saturated the submitting thread
//! simply runs the task itself.
//!
//! Workers are spawned lazily up to `max_workers` and then live until
//! [`AdaptiveExecutor::shutdown`]. A panic inside a task is caught and logged;
//! the worker keeps serving.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{ClusterError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for [`AdaptiveExecutor`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutorConfig {
    /// Upper bound on worker threads. Zero runs everything inline.
    pub max_workers: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Stack size for worker threads. `None` uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name: "exactk-worker".to_string(),
            stack_size: None,
        }
    }
}

impl ExecutorConfig {
    /// Config with exactly `max_workers` workers and default naming.
    pub fn with_workers(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Self::default()
        }
    }
}

/// Where a submitted task ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Handed to a worker thread.
    Worker,
    /// Run synchronously on the submitting thread.
    Inline,
}

/// Executor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutorStats {
    pub workers_spawned: usize,
    pub tasks_dispatched: u64,
    pub tasks_inline: u64,
    pub worker_faults: u64,
}

/// Counters shared between the executor handle and its workers.
#[derive(Debug, Default)]
struct PoolState {
    idle: AtomicUsize,
    faults: AtomicU64,
}

/// Bounded worker pool that runs tasks inline instead of queueing.
pub struct AdaptiveExecutor {
    config: ExecutorConfig,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: Arc<PoolState>,
    closed: AtomicBool,
    spawned: AtomicUsize,
    dispatched: AtomicU64,
    inline: AtomicU64,
}

impl AdaptiveExecutor {
    /// Create an executor. No threads are started until work arrives.
    pub fn new(config: ExecutorConfig) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            handles: Mutex::new(Vec::new()),
            state: Arc::new(PoolState::default()),
            closed: AtomicBool::new(false),
            spawned: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            inline: AtomicU64::new(0),
        }
    }

    /// Executor with at most `max_workers` workers.
    pub fn with_workers(max_workers: usize) -> Self {
        Self::new(ExecutorConfig::with_workers(max_workers))
    }

    /// Run `task` on an idle worker, or on the calling thread if none is free.
    ///
    /// Fails with [`ClusterError::ExecutorClosed`] after shutdown; the task is
    /// dropped unrun.
    pub fn execute<F>(&self, task: F) -> Result<Placement>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(ClusterError::ExecutorClosed);
        }
        match self.try_dispatch(task) {
            Ok(()) => Ok(Placement::Worker),
            Err(task) => {
                self.record_inline();
                task();
                Ok(Placement::Inline)
            }
        }
    }

    /// Hand `task` to a worker, or give it back if no worker can take it now.
    ///
    /// A returned task is expected to be run by the caller. After shutdown
    /// every task is returned.
    pub fn try_dispatch<F>(&self, task: F) -> std::result::Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(task);
        };
        if !self.reserve_idle() && !self.spawn_worker() {
            return Err(task);
        }
        // `self.receiver` keeps the channel connected, so this cannot fail.
        if sender.send(Box::new(task)).is_err() {
            error!("executor channel disconnected with a reserved worker");
            return Ok(());
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Count a task the caller ran itself after [`Self::try_dispatch`] refused it.
    pub fn record_inline(&self) {
        self.inline.fetch_add(1, Ordering::Relaxed);
    }

    fn reserve_idle(&self) -> bool {
        self.state
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Start one more worker. The new worker starts busy, reserved for the
    /// job the caller is about to send.
    fn spawn_worker(&self) -> bool {
        let max = self.config.max_workers;
        let slot = self
            .spawned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        let Ok(index) = slot else {
            return false;
        };

        let mut builder =
            thread::Builder::new().name(format!("{}-{index}", self.config.thread_name));
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }
        let receiver = self.receiver.clone();
        let state = Arc::clone(&self.state);
        match builder.spawn(move || worker_loop(&receiver, &state)) {
            Ok(handle) => {
                debug!(worker = index, "spawned executor worker");
                self.handles.lock().push(handle);
                true
            }
            Err(e) => {
                error!("failed to spawn executor worker: {e}");
                self.spawned.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Idle workers plus workers that may still be spawned.
    pub fn available_capacity(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let spawned = self.spawned.load(Ordering::Acquire);
        self.state.idle.load(Ordering::Acquire) + self.config.max_workers.saturating_sub(spawned)
    }

    /// Workers started so far.
    pub fn num_workers(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            workers_spawned: self.spawned.load(Ordering::Acquire),
            tasks_dispatched: self.dispatched.load(Ordering::Relaxed),
            tasks_inline: self.inline.load(Ordering::Relaxed),
            worker_faults: self.state.faults.load(Ordering::Relaxed),
        }
    }

    /// Refuse new work, let workers finish what they were handed, and join them.
    ///
    /// Idempotent. When called from a worker thread that worker is not joined;
    /// it exits on its own once its current task returns.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.sender.lock().take());
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("executor worker terminated abnormally");
            }
        }
    }
}

impl Drop for AdaptiveExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AdaptiveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveExecutor")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(receiver: &Receiver<Job>, state: &PoolState) {
    while let Ok(job) = receiver.recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            state.faults.fetch_add(1, Ordering::Relaxed);
            error!(
                "task panicked on executor worker: {}",
                panic_message(&*payload)
            );
        }
        state.idle.fetch_add(1, Ordering::AcqRel);
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
