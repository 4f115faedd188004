//! Apply lock: one composer at a time per target tree.
//!
//! Applying a plan mutates the working tree item by item, so two
//! compositions interleaving on the same target would corrupt both. The
//! lock at `<target>/.gitvan/apply.lock` is taken for a specific plan and
//! is progress-aware: the holder records which pack of the plan it is on,
//! refreshing a heartbeat each time the composer advances. Staleness is
//! judged from that heartbeat, not from acquisition time - a composer
//! legitimately grinding through a large plan keeps its lock, while one
//! that died mid-pack goes silent and is taken over once the heartbeat is
//! older than the takeover window.
//!
//! This is the only lock in the system held across subprocess spawns; it
//! spans every per-pack application in a plan.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const GITVAN_DIR: &str = ".gitvan";
pub const LOCK_FILE: &str = "apply.lock";

/// Holder state persisted in the lock file. Everything a second composer
/// needs to report who is in the way and how far along they are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockState {
    /// The plan being applied under this lock.
    pub plan_id: String,
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
    /// Refreshed every time the composer advances to the next pack;
    /// staleness is judged from here.
    pub heartbeat_at: DateTime<Utc>,
    /// Plan size, for progress reporting.
    pub packs_total: usize,
    /// Packs fully applied so far.
    pub packs_done: usize,
    /// Pack currently being applied, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_pack: Option<String>,
}

/// Lock file path for a target directory.
pub fn lock_path(target_dir: &Path) -> PathBuf {
    target_dir.join(GITVAN_DIR).join(LOCK_FILE)
}

/// Held apply lock; releases on drop.
#[derive(Debug)]
pub struct ApplyLock {
    path: PathBuf,
    state: LockState,
}

impl ApplyLock {
    /// Take the lock for a plan of `packs_total` packs.
    ///
    /// A holder whose heartbeat is younger than `takeover_after` wins and
    /// this call fails with its progress in the message. A holder that has
    /// gone silent longer than that - or left a lock file that no longer
    /// parses - is presumed dead and replaced.
    pub fn acquire(
        target_dir: &Path,
        plan_id: &str,
        packs_total: usize,
        takeover_after: Duration,
    ) -> Result<Self> {
        let path = lock_path(target_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if path.exists() {
            match Self::peek(target_dir)? {
                Some(holder) => {
                    let silent_secs = (Utc::now() - holder.heartbeat_at).num_seconds();
                    if silent_secs < takeover_after.as_secs() as i64 {
                        bail!(
                            "target is busy: plan {} held by pid {}@{}, {}/{} packs applied{}, last progress {}s ago",
                            holder.plan_id,
                            holder.pid,
                            holder.host,
                            holder.packs_done,
                            holder.packs_total,
                            holder
                                .current_pack
                                .as_deref()
                                .map(|p| format!(" (applying {p})"))
                                .unwrap_or_default(),
                            silent_secs.max(0),
                        );
                    }
                    // Heartbeat went silent; the holder is presumed dead.
                }
                // Unparseable lock: whoever wrote it cannot be reported or
                // waited on, so it counts as dead too.
                None => {}
            }
            fs::remove_file(&path)
                .with_context(|| format!("failed to clear dead lock {}", path.display()))?;
        }

        let now = Utc::now();
        let state = LockState {
            plan_id: plan_id.to_string(),
            pid: std::process::id(),
            host: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: now,
            heartbeat_at: now,
            packs_total,
            packs_done: 0,
            current_pack: None,
        };
        persist(&path, &state)?;

        Ok(Self { path, state })
    }

    /// Record that the composer is moving on to `pack_id`. The previous
    /// current pack counts as done, and the heartbeat refreshes.
    pub fn advance(&mut self, pack_id: &str) -> Result<()> {
        if self.state.current_pack.take().is_some() {
            self.state.packs_done += 1;
        }
        self.state.current_pack = Some(pack_id.to_string());
        self.state.heartbeat_at = Utc::now();
        persist(&self.path, &self.state)
    }

    /// Snapshot of the holder's own state.
    pub fn state(&self) -> &LockState {
        &self.state
    }

    /// Read whoever holds the target's lock, without contending for it.
    /// `None` means unlocked, or a lock file too corrupt to describe.
    pub fn peek(target_dir: &Path) -> Result<Option<LockState>> {
        let path = lock_path(target_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read lock file {}", path.display()))?;
        Ok(serde_json::from_str(&content).ok())
    }

    /// Release explicitly; equivalent to dropping, but verifies the file
    /// actually went away.
    pub fn unlock(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        if path.exists() {
            bail!("failed to remove lock file {}", path.display());
        }
        Ok(())
    }
}

impl Drop for ApplyLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// All lock mutations funnel through this one atomic write.
fn persist(path: &Path, state: &LockState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("failed to serialize lock state")?;
    let tmp = path.with_extension("lock-tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move lock into place at {}", path.display()))?;
    Ok(())
}
