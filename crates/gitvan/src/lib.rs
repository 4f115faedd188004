//! # GitVan
//!
//! A Git-native automation core: repository-local pack composition plus a
//! daemon that reacts to Git history and time.
//!
//! GitVan discovers reusable "packs" (template + job + event bundles),
//! resolves their dependencies into a conflict-free, deterministically
//! ordered plan, applies the plan idempotently to a working tree, and then
//! keeps running: a scheduler fires jobs from cron specs and Git signals
//! (commits, merges, tags, message and path patterns), executing them on a
//! bounded worker pool and writing durable receipts into Git notes.
//!
//! ## Pipeline
//!
//! The apply flow is **resolve → plan → apply → receipt**:
//!
//! 1. [`resolve::resolve`] walks requested pack ids across every source
//!    (builtin, local, cache, forge, registry), deduplicates, orders by
//!    `(compose.order, id)`, and reports conflicts and cycles as data.
//! 2. [`compose::Composer`] gates on conflicts, takes the per-target apply
//!    lock, and drives packs through the applier in plan order.
//! 3. [`apply::Applier`] checks constraints, validates inputs, and skips
//!    work when the pack fingerprint already has a receipt; otherwise it
//!    materializes templates, files, jobs, and manifest merges.
//! 4. [`receipt::ReceiptStore`] records the outcome under
//!    `refs/notes/gitvan/results`, one JSON line per receipt.
//!
//! The daemon flow is **signal → match → dedup → dispatch → receipt**:
//! [`signal::GitWatcher`] and the cron ticker produce normalized events,
//! event bindings map them to jobs, the receipt store suppresses duplicate
//! `(job, commit)` pairs, and [`pool::WorkerPool`] runs what remains under
//! per-key locks and deadlines.
//!
//! ## Key Types
//!
//! - `Plan` — ordered pack refs plus conflict and cycle reports
//! - `Receipt` — durable apply/job record, stored in Git notes
//! - `SignalEvent` / `JobInvocation` — normalized daemon work items
//! - `Runtime` — explicit ambient state (config, tokens, cache, limits)
//! - `ErrorKind` — failure taxonomy shared by receipts, logs, and retries
//!
//! ## Modules
//!
//! - [`git`] — subprocess git adapter (porcelain, notes, clone)
//! - [`manifest`] — `pack.json` loading, validation, fingerprints
//! - [`fetch`] — pack source fetchers and forge id parsing
//! - [`cache`] — two-tier (memory LRU + disk) pack cache
//! - [`resolve`] — dependency resolution and conflict analysis
//! - [`graph`] — dependency graph views: cycles, topo, SCC, metrics
//! - [`compose`] — compose/layer/preview/validate orchestration
//! - [`apply`] — idempotent pack application
//! - [`template`] — sandboxed template rendering facade
//! - [`jobs`] — job and event-binding discovery
//! - [`pool`] — bounded worker pool with key-locks and timeouts
//! - [`signal`] — git watching and event-binding evaluation
//! - [`daemon`] — scheduler lifecycle and dispatch
//! - [`receipt`] — notes-backed receipt store
//! - [`lock`] — per-target apply lock
//! - [`config`] — `.gitvan.toml` and the [`config::Runtime`] value
//! - [`error`] — error taxonomy
//! - [`types`] — shared data model

pub mod apply;
pub mod cache;
pub mod compose;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fetch;
pub mod git;
pub mod graph;
pub mod jobs;
pub mod lock;
pub mod manifest;
pub mod pool;
mod process;
pub mod receipt;
pub mod resolve;
pub mod signal;
pub mod template;
pub mod types;

#[cfg(test)]
mod stress_tests;

pub use compose::{Composer, Reporter};
pub use config::{GitvanConfig, Runtime};
pub use daemon::{Daemon, DaemonState};
pub use error::{ErrorKind, GitvanError};
pub use manifest::PackManifest;
pub use receipt::ReceiptStore;
pub use types::{ComposeOptions, Plan, Receipt, RunStatus};
