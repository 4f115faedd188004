use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ErrorDetail;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Terminal status of a pack application or job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Ok,
    Partial,
    Skip,
    Error,
}

impl RunStatus {
    /// Combine per-pack statuses into a compose aggregate. Any error with at
    /// least one success is PARTIAL; all-skip counts as OK.
    pub fn aggregate(statuses: &[RunStatus]) -> RunStatus {
        let any_err = statuses
            .iter()
            .any(|s| matches!(s, RunStatus::Error | RunStatus::Partial));
        let any_ok = statuses
            .iter()
            .any(|s| matches!(s, RunStatus::Ok | RunStatus::Skip | RunStatus::Partial));
        match (any_err, any_ok) {
            (false, _) => RunStatus::Ok,
            (true, true) => RunStatus::Partial,
            (true, false) => RunStatus::Error,
        }
    }
}

/// What produced a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptAction {
    Apply,
    Job,
    Event,
}

fn receipt_role() -> String {
    "receipt".to_string()
}

/// Immutable record of one pack application or job run, stored one per line
/// under the `refs/notes/gitvan/results` notes ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(default = "receipt_role")]
    pub role: String,
    /// Pack id or job id.
    pub id: String,
    pub status: RunStatus,
    pub action: ReceiptAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Pack fingerprint, or the `(job_id, commit)` idempotency key hash for jobs.
    pub fingerprint: String,
    /// 40-hex commit the receipt is attached to.
    pub commit: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Logical deletion marker; the store is append-only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstone: bool,
}

impl Receipt {
    pub fn new(id: &str, status: RunStatus, action: ReceiptAction, commit: &str) -> Self {
        Self {
            role: receipt_role(),
            id: id.to_string(),
            status,
            action,
            artifact: None,
            fingerprint: String::new(),
            commit: commit.to_string(),
            ts: Utc::now(),
            inputs: None,
            error: None,
            tombstone: false,
        }
    }
}

/// One pack in a resolved plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackRef {
    pub id: String,
    pub version: String,
    pub order: i64,
    /// On-disk pack root as resolved by the fetchers.
    pub source_path: PathBuf,
}

/// A pairwise incompatibility found in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub a: String,
    pub b: String,
    pub reason: String,
}

/// Resolver output: an ordered pack sequence plus everything the caller
/// needs to decide policy. Cycles are data here, never a thrown error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Plan {
    pub packs: Vec<PackRef>,
    pub conflicts: Vec<ConflictReport>,
    /// Each cycle as the id path that closed it.
    pub cycles: Vec<Vec<String>>,
    /// Ids in application order (mirrors `packs`).
    pub order: Vec<String>,
}

impl Plan {
    /// A plan is applicable when conflict-free (or conflicts are ignored).
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Source of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Commit,
    Merge,
    TagCreate,
    Push,
    MessageMatch,
    PathChange,
    CronTick,
    Manual,
}

/// A normalized event evaluated against job/event bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_paths: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SignalEvent {
    pub fn cron_tick(now: DateTime<Utc>) -> Self {
        Self {
            kind: SignalKind::CronTick,
            commit: None,
            r#ref: None,
            branch: None,
            message: None,
            changed_paths: Vec::new(),
            timestamp: now,
        }
    }
}

/// A job queued for execution. Born when a signal matches, dies when a
/// receipt is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInvocation {
    pub job_id: String,
    pub signal: SignalEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub attempt: u32,
}

impl JobInvocation {
    /// Idempotency key: at most one successful receipt per `(job_id, commit)`.
    pub fn idempotency_key(&self) -> String {
        job_idempotency_key(&self.job_id, self.commit.as_deref().unwrap_or("-"))
    }
}

/// Shared formatting for the `(job_id, commit)` idempotency key.
pub fn job_idempotency_key(job_id: &str, commit: &str) -> String {
    format!("{job_id}@{commit}")
}

/// Per-pack (or `"*"` global) template/input values.
pub type InputMap = BTreeMap<String, serde_json::Map<String, serde_json::Value>>;

/// Enumerated options for compose; no dynamic option bags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeOptions {
    #[serde(default)]
    pub ignore_conflicts: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub allow_overlap: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Keyed by pack id, with `"*"` applying to every pack.
    #[serde(default)]
    pub inputs: InputMap,
}

/// What a single applied artifact was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Template,
    File,
    Job,
    ManifestMerge,
}

/// One materialized artifact inside an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedItem {
    pub action: String,
    pub source: String,
    pub target: String,
    pub kind: ItemKind,
}

/// Result of applying one pack to a target tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub pack_id: String,
    pub status: RunStatus,
    pub fingerprint: String,
    pub applied: Vec<AppliedItem>,
    pub errors: Vec<ErrorDetail>,
}

/// Aggregate result of a compose call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeOutcome {
    pub status: RunStatus,
    pub results: Vec<ApplyResult>,
    pub conflicts: Vec<ConflictReport>,
}

/// One line of a preview timeline: what would apply, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewEntry {
    pub position: usize,
    pub id: String,
    pub version: String,
    pub order: i64,
    pub source_path: PathBuf,
    pub templates: usize,
    pub files: usize,
    pub jobs: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
}
