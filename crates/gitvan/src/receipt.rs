//! Receipt store: durable, append-only records in Git notes.
//!
//! Receipts live as newline-delimited JSON in a note per commit under
//! `refs/notes/gitvan/results`. The store owns that namespace exclusively
//! and is the sole authority for "already applied" (by pack fingerprint)
//! and "already fired" (by `(job_id, commit)`). Appends rewrite the whole
//! note in a single `notes add`, so a write is atomic from the caller's
//! perspective; an in-process mutex serializes writers, and daemon jobs
//! additionally funnel writes through the pool key-lock for the ref.
//!
//! The store is append-only: logical deletion is a tombstone record, and
//! malformed lines are skipped on read rather than failing the commit.

use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::error::GitvanError;
use crate::git::GitContext;
use crate::types::{Receipt, ReceiptAction, RunStatus, job_idempotency_key};

/// The notes namespace owned by the store.
pub const NOTES_REF: &str = "refs/notes/gitvan/results";

/// Pool key under which daemon receipt writes serialize.
pub fn notes_lock_key() -> String {
    format!("notes:{NOTES_REF}")
}

pub struct ReceiptStore {
    ctx: GitContext,
    write_lock: Mutex<()>,
}

impl ReceiptStore {
    pub fn new(ctx: GitContext) -> Self {
        Self {
            ctx,
            write_lock: Mutex::new(()),
        }
    }

    /// HEAD of the repository the store is attached to.
    pub fn head_commit(&self) -> Result<String> {
        self.ctx.rev_parse("HEAD")
    }

    /// Append one receipt to the note of its commit.
    pub fn write(&self, receipt: &Receipt) -> Result<()> {
        let _guard = self.write_lock.lock().expect("receipt lock poisoned");

        let line = serde_json::to_string(receipt).context("serializing receipt")?;
        let existing = self
            .ctx
            .notes_show(NOTES_REF, &receipt.commit)
            .map_err(|e| GitvanError::ReceiptWriteFailed {
                commit: receipt.commit.clone(),
                reason: format!("{e:#}"),
            })?;

        let payload = match existing {
            Some(prior) => {
                let mut body = prior.trim_end().to_string();
                body.push('\n');
                body.push_str(&line);
                body
            }
            None => line,
        };

        self.ctx
            .notes_add(NOTES_REF, &receipt.commit, &payload)
            .map_err(|e| {
                anyhow::Error::from(GitvanError::ReceiptWriteFailed {
                    commit: receipt.commit.clone(),
                    reason: format!("{e:#}"),
                })
            })?;
        debug!(target: "gitvan::receipt", id = %receipt.id, commit = %receipt.commit, status = ?receipt.status, "receipt written");
        Ok(())
    }

    /// Every receipt attached to a commit. Malformed lines are skipped.
    pub fn read_all(&self, commit: &str) -> Result<Vec<Receipt>> {
        let Some(note) = self.ctx.notes_show(NOTES_REF, commit)? else {
            return Ok(Vec::new());
        };

        let mut receipts = Vec::new();
        for line in note.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Receipt>(line) {
                Ok(r) => receipts.push(r),
                Err(e) => {
                    warn!(target: "gitvan::receipt", commit, error = %e, "skipping malformed receipt line");
                }
            }
        }
        Ok(receipts)
    }

    /// Whether a successful (OK or SKIP) receipt exists for `(job_id,
    /// commit)`. ERROR and TIMEOUT receipts do not count, so a failed job
    /// may run again.
    pub fn has_succeeded(&self, commit: &str, job_id: &str) -> Result<bool> {
        let receipts = self.read_all(commit)?;
        Ok(receipts.iter().any(|r| {
            r.id == job_id
                && !r.tombstone
                && matches!(r.status, RunStatus::Ok | RunStatus::Skip)
        }))
    }

    /// Whether `(job_id, commit)` should be suppressed, logging the key.
    pub fn is_duplicate_invocation(&self, commit: &str, job_id: &str) -> Result<bool> {
        let dup = self.has_succeeded(commit, job_id)?;
        if dup {
            debug!(
                target: "gitvan::receipt",
                key = %job_idempotency_key(job_id, commit),
                "duplicate invocation suppressed"
            );
        }
        Ok(dup)
    }

    /// Whether a pack with this fingerprint was already applied anywhere in
    /// the repository. A tombstone newer than the last successful apply
    /// reopens the fingerprint. Notes enumerate in no particular order, so
    /// recency is decided by receipt timestamps.
    pub fn has_fingerprint(&self, fingerprint: &str) -> Result<bool> {
        let mut last_applied = None;
        let mut last_tombstone = None;
        for receipt in self.list(None)? {
            if receipt.fingerprint != fingerprint || receipt.action != ReceiptAction::Apply {
                continue;
            }
            if receipt.tombstone {
                last_tombstone = last_tombstone.max(Some(receipt.ts));
            } else if matches!(receipt.status, RunStatus::Ok) {
                last_applied = last_applied.max(Some(receipt.ts));
            }
        }
        Ok(match (last_applied, last_tombstone) {
            (Some(applied), Some(tombstoned)) => applied > tombstoned,
            (Some(_), None) => true,
            _ => false,
        })
    }

    /// All receipts in the namespace, optionally filtered to ids with the
    /// given prefix.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<Receipt>> {
        let mut out = Vec::new();
        for (_note, object) in self.ctx.notes_list(NOTES_REF)? {
            for receipt in self.read_all(&object)? {
                if prefix.is_none_or(|p| receipt.id.starts_with(p)) {
                    out.push(receipt);
                }
            }
        }
        Ok(out)
    }

    /// Latest receipt per id, most recent timestamp winning.
    pub fn latest_by_id(&self, prefix: Option<&str>) -> Result<Vec<Receipt>> {
        let mut latest: std::collections::BTreeMap<String, Receipt> =
            std::collections::BTreeMap::new();
        for receipt in self.list(prefix)? {
            match latest.get(&receipt.id) {
                Some(existing) if existing.ts >= receipt.ts => {}
                _ => {
                    latest.insert(receipt.id.clone(), receipt);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    /// Append a tombstone cancelling earlier receipts for `id` at `commit`.
    pub fn tombstone(&self, commit: &str, id: &str, fingerprint: &str) -> Result<()> {
        let receipt = Receipt {
            fingerprint: fingerprint.to_string(),
            tombstone: true,
            ..Receipt::new(id, RunStatus::Ok, ReceiptAction::Apply, commit)
        };
        self.write(&receipt)
    }
}
