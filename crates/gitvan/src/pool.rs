//! Worker pool: bounded concurrent job execution with per-key
//! serialization and deadlines.
//!
//! A fixed set of OS worker threads drains a bounded pending queue.
//! Submitting with a `key` gives at-most-one-in-flight semantics per key:
//! while a keyed task runs, further submissions with the same key do not
//! enqueue work at all, they attach to the running task and observe its
//! outcome. Each task runs under a deadline; on expiry the cancel flag is
//! raised, the outcome records `TIMEOUT`, and the worker abandons the task
//! (cancellation is cooperative for in-process work).
//!
//! Shutdown stops intake immediately (`PoolClosed`), then waits for
//! in-flight tasks up to a grace deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorDetail, GitvanError};

/// Cooperative cancellation flag handed to every task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Terminal state of one pool execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Ok(Value),
    Error(ErrorDetail),
    TimedOut { timeout_ms: u64 },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Ok(_))
    }
}

type TaskFn = Box<dyn FnOnce(&CancelToken) -> Result<Value> + Send + 'static>;

struct Task {
    label: String,
    key: Option<String>,
    timeout: Duration,
    work: TaskFn,
    shared: Arc<Shared>,
}

/// Published outcome a handle (and keyed followers) wait on.
#[derive(Debug, Default)]
struct Shared {
    outcome: Mutex<Option<JobOutcome>>,
    cv: Condvar,
}

impl Shared {
    fn publish(&self, outcome: JobOutcome) {
        let mut slot = self.outcome.lock().expect("outcome poisoned");
        *slot = Some(outcome);
        self.cv.notify_all();
    }

    fn wait(&self) -> JobOutcome {
        let mut slot = self.outcome.lock().expect("outcome poisoned");
        loop {
            if let Some(outcome) = slot.clone() {
                return outcome;
            }
            slot = self.cv.wait(slot).expect("outcome poisoned");
        }
    }

    fn wait_timeout(&self, dur: Duration) -> Option<JobOutcome> {
        let deadline = Instant::now() + dur;
        let mut slot = self.outcome.lock().expect("outcome poisoned");
        loop {
            if let Some(outcome) = slot.clone() {
                return Some(outcome);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(slot, left)
                .expect("outcome poisoned");
            slot = guard;
        }
    }
}

/// Handle for one submission; `wait` blocks for the terminal outcome.
#[derive(Debug)]
pub struct JobHandle {
    shared: Arc<Shared>,
}

impl JobHandle {
    pub fn wait(&self) -> JobOutcome {
        self.shared.wait()
    }

    pub fn wait_for(&self, dur: Duration) -> Option<JobOutcome> {
        self.shared.wait_timeout(dur)
    }

    pub fn try_outcome(&self) -> Option<JobOutcome> {
        self.shared.outcome.lock().expect("outcome poisoned").clone()
    }
}

struct PoolState {
    queue: VecDeque<Task>,
    /// Keyed tasks currently queued or running.
    in_flight_keys: HashMap<String, Arc<Shared>>,
    closing: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Queue went non-empty or the pool is closing.
    work_cv: Condvar,
    /// Queue has room again.
    room_cv: Condvar,
    /// Running + queued tasks, for drain accounting.
    active: AtomicUsize,
    idle_cv: Condvar,
    queue_capacity: usize,
}

/// Fixed pool of N workers over a bounded queue of M pending tasks.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                in_flight_keys: HashMap::new(),
                closing: false,
            }),
            work_cv: Condvar::new(),
            room_cv: Condvar::new(),
            active: AtomicUsize::new(0),
            idle_cv: Condvar::new(),
            queue_capacity: queue_capacity.max(1),
        });

        let handles = (0..workers.max(1))
            .map(|n| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("gitvan-worker-{n}"))
                    .spawn(move || worker_loop(inner))
                    .expect("spawn worker")
            })
            .collect();

        Self {
            inner,
            workers: handles,
        }
    }

    /// Submit a task. Blocks while the pending queue is full. With a `key`,
    /// a task already queued or running under the same key absorbs this
    /// submission: the returned handle observes that task's outcome.
    pub fn execute(
        &self,
        label: &str,
        key: Option<&str>,
        timeout: Duration,
        work: impl FnOnce(&CancelToken) -> Result<Value> + Send + 'static,
    ) -> Result<JobHandle> {
        let mut state = self.inner.state.lock().expect("pool poisoned");

        loop {
            if state.closing {
                return Err(GitvanError::PoolClosed.into());
            }
            if let Some(key) = key {
                if let Some(shared) = state.in_flight_keys.get(key) {
                    // Same key in flight: follow it instead of queueing.
                    debug!(target: "gitvan::pool", label, key, "attached to in-flight key");
                    return Ok(JobHandle {
                        shared: Arc::clone(shared),
                    });
                }
            }
            if state.queue.len() < self.inner.queue_capacity {
                break;
            }
            state = self.inner.room_cv.wait(state).expect("pool poisoned");
        }

        let shared = Arc::new(Shared::default());
        if let Some(key) = key {
            state
                .in_flight_keys
                .insert(key.to_string(), Arc::clone(&shared));
        }
        state.queue.push_back(Task {
            label: label.to_string(),
            key: key.map(str::to_string),
            timeout,
            work: Box::new(work),
            shared: Arc::clone(&shared),
        });
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        drop(state);
        self.inner.work_cv.notify_one();

        Ok(JobHandle { shared })
    }

    /// Stop intake, then wait up to `grace` for in-flight tasks. Tasks still
    /// running afterwards are abandoned.
    pub fn shutdown(&mut self, grace: Duration) {
        {
            let mut state = self.inner.state.lock().expect("pool poisoned");
            state.closing = true;
            // Pending tasks that never started resolve as PoolClosed.
            while let Some(task) = state.queue.pop_front() {
                if let Some(key) = &task.key {
                    state.in_flight_keys.remove(key);
                }
                task.shared.publish(JobOutcome::Error(ErrorDetail {
                    kind: crate::error::ErrorKind::PoolClosed,
                    message: "pool shut down before the task started".to_string(),
                    attempt: None,
                }));
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.inner.work_cv.notify_all();
        self.inner.room_cv.notify_all();

        let deadline = Instant::now() + grace;
        let mut state = self.inner.state.lock().expect("pool poisoned");
        while self.inner.active.load(Ordering::SeqCst) > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                warn!(target: "gitvan::pool", "grace period elapsed with tasks still running");
                break;
            }
            let (guard, _) = self
                .inner
                .idle_cv
                .wait_timeout(state, left)
                .expect("pool poisoned");
            state = guard;
        }
        drop(state);

        let workers = std::mem::take(&mut self.workers);
        for handle in workers {
            // Workers exit once the queue drains under `closing`.
            let _ = handle.join();
        }
    }

    /// Queued-but-not-started task count.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().expect("pool poisoned").queue.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown(Duration::from_secs(1));
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock().expect("pool poisoned");
            loop {
                if let Some(task) = state.queue.pop_front() {
                    inner.room_cv.notify_one();
                    break task;
                }
                if state.closing {
                    return;
                }
                state = inner.work_cv.wait(state).expect("pool poisoned");
            }
        };

        run_task(&inner, task);
    }
}

fn run_task(inner: &Arc<PoolInner>, task: Task) {
    let token = CancelToken::default();
    let (tx, rx) = mpsc::channel();
    let work = task.work;
    let runner_token = token.clone();

    // The task body runs on a helper thread so the deadline can fire even
    // when the body never checks the cancel token.
    let label = task.label.clone();
    thread::Builder::new()
        .name(format!("gitvan-task-{label}"))
        .spawn(move || {
            let result = work(&runner_token);
            let _ = tx.send(result);
        })
        .expect("spawn task thread");

    let outcome = match rx.recv_timeout(task.timeout) {
        Ok(Ok(value)) => JobOutcome::Ok(value),
        Ok(Err(err)) => JobOutcome::Error(ErrorDetail::from_error(&err)),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            token.cancel();
            warn!(target: "gitvan::pool", label = %task.label, timeout_ms = task.timeout.as_millis() as u64, "task deadline expired");
            JobOutcome::TimedOut {
                timeout_ms: task.timeout.as_millis() as u64,
            }
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => JobOutcome::Error(ErrorDetail {
            kind: crate::error::ErrorKind::Other,
            message: "task thread terminated without a result".to_string(),
            attempt: None,
        }),
    };

    {
        let mut state = inner.state.lock().expect("pool poisoned");
        if let Some(key) = &task.key {
            state.in_flight_keys.remove(key);
        }
        drop(state);
    }

    task.shared.publish(outcome);
    inner.active.fetch_sub(1, Ordering::SeqCst);
    inner.idle_cv.notify_all();
}
