//! Automation daemon: the long-lived scheduler tying cron ticks and Git
//! signals to job execution.
//!
//! Lifecycle is `STOPPED -> STARTING -> RUNNING <-> DRAINING -> STOPPED`.
//! Each tick computes due cron jobs, polls the repository for HEAD
//! movement, evaluates event bindings, and dispatches the surviving
//! invocations onto the worker pool (one in-flight execution per
//! idempotency key). Outcomes are reaped into receipts; receipt writes go
//! through the pool under the notes key-lock so the contended notes ref has
//! one writer at a time. In `DRAINING` no new signals are accepted,
//! in-flight jobs finish within the grace period, then the pool shuts down.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::apply::guarded_join;
use crate::compose::{Composer, NullReporter};
use crate::config::Runtime;
use crate::error::{ErrorDetail, ErrorKind, GitvanError};
use crate::git::GitContext;
use crate::jobs::{JobRegistry, RunAction};
use crate::pool::{JobHandle, JobOutcome, WorkerPool};
use crate::receipt::{ReceiptStore, notes_lock_key};
use crate::signal::{GitWatcher, SignalEngine, due_cron_jobs};
use crate::template::TemplateRenderer;
use crate::types::{
    ComposeOptions, JobInvocation, Receipt, ReceiptAction, RunStatus, SignalEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// What one tick did; returned for observability and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub cron_fired: usize,
    pub signals: usize,
    pub dispatched: usize,
    pub receipts_written: usize,
}

struct InFlight {
    invocation: JobInvocation,
    handle: JobHandle,
}

pub struct Daemon {
    runtime: Arc<Runtime>,
    target_dir: PathBuf,
    cache_root: PathBuf,
    registry: JobRegistry,
    receipts: Arc<ReceiptStore>,
    watcher: GitWatcher,
    pool: WorkerPool,
    state: DaemonState,
    in_flight: VecDeque<InFlight>,
    /// Last minute for which cron fired, to keep ticks idempotent within a
    /// minute.
    last_cron_minute: Option<DateTime<Utc>>,
}

impl Daemon {
    /// Build a daemon over a target repository. Discovery runs here so a
    /// malformed job definition fails construction, not the first tick.
    pub fn new(runtime: Arc<Runtime>, target_dir: &Path, cache_root: &Path) -> Result<Self> {
        let registry = JobRegistry::discover(target_dir)?;
        for binding in registry.bindings() {
            if let Some(when) = &binding.when {
                when.validate()
                    .with_context(|| format!("binding for job {}", binding.job))?;
            }
        }

        let ctx = GitContext::new(target_dir);
        let pool = WorkerPool::new(
            runtime.config.daemon.workers,
            runtime.config.daemon.queue_capacity,
        );

        Ok(Self {
            runtime,
            target_dir: target_dir.to_path_buf(),
            cache_root: cache_root.to_path_buf(),
            receipts: Arc::new(ReceiptStore::new(ctx.clone())),
            watcher: GitWatcher::new(ctx),
            registry,
            pool,
            state: DaemonState::Stopped,
            in_flight: VecDeque::new(),
            last_cron_minute: None,
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// `STOPPED -> STARTING -> RUNNING`. Primes the watcher so only commits
    /// made after startup signal.
    pub fn start(&mut self) -> Result<()> {
        if self.state != DaemonState::Stopped {
            bail!("daemon is not stopped (state: {:?})", self.state);
        }
        self.state = DaemonState::Starting;
        self.watcher.prime()?;
        self.state = DaemonState::Running;
        info!(
            target: "gitvan::daemon",
            jobs = self.registry.len(),
            bindings = self.registry.bindings().len(),
            "daemon running"
        );
        Ok(())
    }

    /// One scheduler iteration at `now`: cron, git poll, match, dedup,
    /// dispatch, reap.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        if self.state != DaemonState::Running {
            return Ok(summary);
        }

        // Cron fires once per minute boundary.
        let minute = now
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        if self.last_cron_minute != Some(minute) {
            self.last_cron_minute = Some(minute);
            for (job_id, event) in due_cron_jobs(&self.registry, now) {
                summary.cron_fired += 1;
                let invocation = JobInvocation {
                    job_id,
                    signal: event,
                    commit: None,
                    payload: Value::Null,
                    attempt: 1,
                };
                if self.dispatch(invocation)? {
                    summary.dispatched += 1;
                }
            }
        }

        let events = self.watcher.poll()?;
        summary.signals = events.len();
        if !events.is_empty() {
            let invocations = {
                let engine = SignalEngine::new(&self.registry, Some(&self.receipts));
                engine.evaluate(&events)?
            };
            for invocation in invocations {
                if self.dispatch(invocation)? {
                    summary.dispatched += 1;
                }
            }
        }

        summary.receipts_written = self.reap(false)?;
        Ok(summary)
    }

    /// Submit one invocation to the pool. Returns false when the pool
    /// absorbed it into an already-running execution with the same key.
    fn dispatch(&mut self, invocation: JobInvocation) -> Result<bool> {
        let Some(definition) = self.registry.job(&invocation.job_id) else {
            warn!(target: "gitvan::daemon", job = %invocation.job_id, "invocation for unknown job dropped");
            return Ok(false);
        };

        let action = definition.run.clone();
        let runtime = Arc::clone(&self.runtime);
        let target_dir = self.target_dir.clone();
        let cache_root = self.cache_root.clone();
        let payload = invocation.payload.clone();
        let signal = invocation.signal.clone();
        let label = invocation.job_id.clone();
        let key = invocation.idempotency_key();

        debug!(target: "gitvan::daemon", job = %label, key = %key, "dispatching");
        let handle = self.pool.execute(
            &label,
            Some(&key),
            self.runtime.config.daemon.job_timeout,
            move |_token| run_action(&action, &runtime, &target_dir, &cache_root, &payload, &signal),
        )?;

        self.in_flight.push_back(InFlight { invocation, handle });
        Ok(true)
    }

    /// Collect finished executions and write their receipts. With `block`,
    /// waits for everything currently in flight.
    fn reap(&mut self, block: bool) -> Result<usize> {
        let mut written = 0;
        let mut still_running = VecDeque::new();

        while let Some(entry) = self.in_flight.pop_front() {
            let outcome = if block {
                Some(entry.handle.wait())
            } else {
                entry.handle.try_outcome()
            };

            match outcome {
                Some(outcome) => {
                    self.write_job_receipt(&entry.invocation, &outcome)?;
                    written += 1;
                }
                None => still_running.push_back(entry),
            }
        }

        self.in_flight = still_running;
        Ok(written)
    }

    /// Receipts for cron invocations have no commit to attach to; they are
    /// only written when the invocation carries one.
    fn write_job_receipt(&self, invocation: &JobInvocation, outcome: &JobOutcome) -> Result<()> {
        let Some(commit) = invocation.commit.clone() else {
            return Ok(());
        };

        let (status, artifact, error) = match outcome {
            JobOutcome::Ok(value) => (
                RunStatus::Ok,
                value.get("artifact").and_then(Value::as_str).map(str::to_string),
                None,
            ),
            JobOutcome::Error(detail) => (RunStatus::Error, None, Some(detail.clone())),
            JobOutcome::TimedOut { timeout_ms } => (
                RunStatus::Error,
                None,
                Some(ErrorDetail {
                    kind: ErrorKind::JobTimeout,
                    message: format!("timed out after {timeout_ms}ms"),
                    attempt: Some(invocation.attempt),
                }),
            ),
        };

        let receipt = Receipt {
            fingerprint: invocation.idempotency_key(),
            artifact,
            error: error.map(|e| e.with_attempt(invocation.attempt)),
            ..Receipt::new(&invocation.job_id, status, ReceiptAction::Job, &commit)
        };

        // The notes ref is contended; serialize through the pool key-lock.
        let receipts = Arc::clone(&self.receipts);
        let handle = self.pool.execute(
            "receipt-write",
            Some(&notes_lock_key()),
            Duration::from_secs(30),
            move |_| {
                receipts.write(&receipt)?;
                Ok(Value::Null)
            },
        )?;
        match handle.wait() {
            JobOutcome::Ok(_) => Ok(()),
            JobOutcome::Error(detail) => Err(GitvanError::ReceiptWriteFailed {
                commit,
                reason: detail.message,
            }
            .into()),
            JobOutcome::TimedOut { .. } => Err(GitvanError::ReceiptWriteFailed {
                commit,
                reason: "notes write timed out".to_string(),
            }
            .into()),
        }
    }

    /// `RUNNING -> DRAINING -> STOPPED`. Stops intake, waits for in-flight
    /// jobs within the grace period, then shuts the pool down.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == DaemonState::Stopped {
            return Ok(());
        }
        self.state = DaemonState::Draining;
        info!(target: "gitvan::daemon", in_flight = self.in_flight.len(), "draining");

        let reaped = self.reap(true)?;
        debug!(target: "gitvan::daemon", reaped, "drained in-flight jobs");
        self.pool.shutdown(self.runtime.config.daemon.grace_period);
        self.state = DaemonState::Stopped;
        Ok(())
    }

    /// Blocking scheduler loop; `stop` flips the daemon into draining.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<()> {
        if self.state == DaemonState::Stopped {
            self.start()?;
        }
        while !stop.load(Ordering::SeqCst) {
            let summary = self.tick(Utc::now())?;
            if summary.dispatched > 0 {
                debug!(target: "gitvan::daemon", dispatched = summary.dispatched, "tick dispatched work");
            }
            std::thread::sleep(self.runtime.config.daemon.poll_interval);
        }
        self.shutdown()
    }
}

/// Execute one job action. The returned JSON is recorded on the receipt.
fn run_action(
    action: &RunAction,
    runtime: &Arc<Runtime>,
    target_dir: &Path,
    cache_root: &Path,
    payload: &Value,
    signal: &SignalEvent,
) -> Result<Value> {
    match action {
        RunAction::Shell { command } => {
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(target_dir)
                .env("TZ", "UTC")
                .env("LANG", "C")
                .output()
                .with_context(|| format!("spawning shell for {command:?}"))?;

            let code = output.status.code().unwrap_or(-1);
            if code != 0 {
                bail!(
                    "command {command:?} exited with {code}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(json!({
                "exit_code": code,
                "stdout_tail": tail(&String::from_utf8_lossy(&output.stdout), 20),
            }))
        }
        RunAction::Template { template, target } => {
            let template_path = guarded_join(target_dir, template)?;
            let text = std::fs::read_to_string(&template_path).map_err(|e| {
                GitvanError::FileSystemError {
                    path: template_path.display().to_string(),
                    message: e.to_string(),
                }
            })?;

            let renderer = TemplateRenderer::new(runtime.config.template.clone());
            let mut data = payload.clone();
            if !data.is_object() {
                data = json!({});
            }
            crate::template::sanitize_context(&mut data);
            if let Some(map) = data.as_object_mut() {
                map.insert("signal".to_string(), serde_json::to_value(signal)?);
            }

            let rendered = renderer.render(template, &text, &data)?;
            let out_path = guarded_join(target_dir, target)?;
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out_path, rendered)?;
            Ok(json!({"artifact": target}))
        }
        RunAction::Apply { packs } => {
            let composer = Composer::new(runtime, target_dir, cache_root)?;
            let outcome = composer.compose(
                packs,
                target_dir,
                &ComposeOptions::default(),
                None,
                &mut NullReporter,
            )?;
            if outcome.status == RunStatus::Error {
                bail!("pack application failed");
            }
            Ok(serde_json::to_value(&outcome)?)
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
