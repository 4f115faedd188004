//! Signal engine: turn Git history movement and cron ticks into job
//! invocations.
//!
//! The [`GitWatcher`] polls HEAD between daemon ticks and emits one
//! normalized [`SignalEvent`] per detected change category (commit, merge,
//! tag creation, path change). Event bindings from the registry are
//! evaluated against each event; binding patterns compose with an optional
//! `{all, any, not}` predicate tree. Matches become [`JobInvocation`]s,
//! deduplicated within the batch and against the receipt store, so one
//! `(job_id, commit)` pair never fires twice.

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::Glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::git::GitContext;
use crate::jobs::{EventBinding, EventKind, JobRegistry};
use crate::receipt::ReceiptStore;
use crate::types::{JobInvocation, SignalEvent, SignalKind};

/// Composable matching condition for event bindings.
///
/// Leaves regex-match tag names and commit messages, glob-match changed
/// paths, and compare branch names; `all`/`any`/`not` combine them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Predicate {
    All { all: Vec<Predicate> },
    Any { any: Vec<Predicate> },
    Not { not: Vec<Predicate> },
    TagCreate { tag_create: String },
    Message { message: String },
    PathChanged { path_changed: String },
    Branch { branch: String },
}

impl Predicate {
    /// Check the patterns compile; called once at daemon startup so a bad
    /// binding fails loudly instead of never matching.
    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::All { all } | Predicate::Any { any: all } | Predicate::Not { not: all } => {
                for p in all {
                    p.validate()?;
                }
                Ok(())
            }
            Predicate::TagCreate { tag_create: p } | Predicate::Message { message: p } => {
                Regex::new(p)?;
                Ok(())
            }
            Predicate::PathChanged { path_changed } => {
                Glob::new(path_changed)?;
                Ok(())
            }
            Predicate::Branch { .. } => Ok(()),
        }
    }

    pub fn matches(&self, event: &SignalEvent) -> bool {
        match self {
            Predicate::All { all } => all.iter().all(|p| p.matches(event)),
            Predicate::Any { any } => any.iter().any(|p| p.matches(event)),
            Predicate::Not { not } => !not.iter().any(|p| p.matches(event)),
            Predicate::TagCreate { tag_create } => {
                event.kind == SignalKind::TagCreate
                    && event
                        .r#ref
                        .as_deref()
                        .is_some_and(|tag| regex_matches(tag_create, tag))
            }
            Predicate::Message { message } => event
                .message
                .as_deref()
                .is_some_and(|m| regex_matches(message, m)),
            Predicate::PathChanged { path_changed } => {
                paths_match(path_changed, &event.changed_paths)
            }
            Predicate::Branch { branch } => event.branch.as_deref() == Some(branch.as_str()),
        }
    }
}

fn regex_matches(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            warn!(target: "gitvan::signal", pattern, error = %e, "unusable regex pattern");
            false
        }
    }
}

fn paths_match(pattern: &str, paths: &[String]) -> bool {
    let Ok(glob) = Glob::new(pattern) else {
        warn!(target: "gitvan::signal", pattern, "unusable glob pattern");
        return false;
    };
    let matcher = glob.compile_matcher();
    paths.iter().any(|p| matcher.is_match(p))
}

/// Polls a repository for HEAD movement and normalizes what changed.
pub struct GitWatcher {
    ctx: GitContext,
    last_seen: Option<String>,
}

impl GitWatcher {
    pub fn new(ctx: GitContext) -> Self {
        Self {
            ctx,
            last_seen: None,
        }
    }

    /// Start from the current HEAD so only future commits signal.
    pub fn prime(&mut self) -> Result<()> {
        self.last_seen = self.ctx.rev_parse("HEAD").ok();
        Ok(())
    }

    pub fn last_seen(&self) -> Option<&str> {
        self.last_seen.as_deref()
    }

    /// Detect movement since the last poll. One event per change category:
    /// every new HEAD emits a commit event; merges, tag creations, and path
    /// changes add their own.
    pub fn poll(&mut self) -> Result<Vec<SignalEvent>> {
        // An unborn branch has no HEAD yet; quietly nothing to report.
        let Ok(head) = self.ctx.rev_parse("HEAD") else {
            return Ok(Vec::new());
        };
        if self.last_seen.as_deref() == Some(head.as_str()) {
            return Ok(Vec::new());
        }

        let previous = self.last_seen.replace(head.clone());
        let now = Utc::now();
        let branch = self.ctx.current_branch()?;
        let message = self.ctx.head_message().ok().filter(|m| !m.is_empty());
        let parents = self.ctx.parents(&head)?;
        let tags = self.ctx.tags_at(&head)?;

        let changed_paths = match &previous {
            Some(prev) => self.ctx.diff_name_only(prev, &head).unwrap_or_default(),
            None => match parents.first() {
                Some(parent) => self.ctx.diff_name_only(parent, &head).unwrap_or_default(),
                None => Vec::new(),
            },
        };

        debug!(
            target: "gitvan::signal",
            head = %head,
            previous = previous.as_deref().unwrap_or("-"),
            changed = changed_paths.len(),
            "HEAD moved"
        );

        let base = SignalEvent {
            kind: SignalKind::Commit,
            commit: Some(head.clone()),
            r#ref: None,
            branch,
            message,
            changed_paths,
            timestamp: now,
        };

        let mut events = vec![base.clone()];
        if parents.len() > 1 {
            events.push(SignalEvent {
                kind: SignalKind::Merge,
                ..base.clone()
            });
        }
        for tag in tags {
            events.push(SignalEvent {
                kind: SignalKind::TagCreate,
                r#ref: Some(tag),
                ..base.clone()
            });
        }
        if !base.changed_paths.is_empty() {
            events.push(SignalEvent {
                kind: SignalKind::PathChange,
                ..base
            });
        }

        Ok(events)
    }
}

/// Jobs whose cron spec matches the given minute.
pub fn due_cron_jobs(registry: &JobRegistry, now: DateTime<Utc>) -> Vec<(String, SignalEvent)> {
    let local = now.naive_utc();
    registry
        .cron_jobs()
        .filter(|(_, spec)| spec.matches(local))
        .map(|(id, _)| (id.to_string(), SignalEvent::cron_tick(now)))
        .collect()
}

/// Does a binding's pattern (and optional predicate) accept an event?
fn binding_matches(binding: &EventBinding, event: &SignalEvent) -> bool {
    let pattern_hit = match binding.kind {
        EventKind::Message => event
            .message
            .as_deref()
            .is_some_and(|m| regex_matches(&binding.pattern, m)),
        EventKind::Path => paths_match(&binding.pattern, &event.changed_paths),
        EventKind::Tag => {
            event.kind == SignalKind::TagCreate
                && event
                    .r#ref
                    .as_deref()
                    .is_some_and(|tag| regex_matches(&binding.pattern, tag))
        }
        EventKind::Merge => event.kind == SignalKind::Merge,
        EventKind::Push => matches!(event.kind, SignalKind::Push | SignalKind::Commit),
    };

    pattern_hit
        && binding
            .when
            .as_ref()
            .is_none_or(|predicate| predicate.matches(event))
}

/// Evaluate bindings against a batch of events and enqueue invocations,
/// suppressing `(job_id, commit)` pairs that already have a successful
/// receipt.
pub struct SignalEngine<'a> {
    registry: &'a JobRegistry,
    receipts: Option<&'a ReceiptStore>,
}

impl<'a> SignalEngine<'a> {
    pub fn new(registry: &'a JobRegistry, receipts: Option<&'a ReceiptStore>) -> Self {
        Self { registry, receipts }
    }

    pub fn evaluate(&self, events: &[SignalEvent]) -> Result<Vec<JobInvocation>> {
        let mut invocations: Vec<JobInvocation> = Vec::new();
        let mut batch_keys = std::collections::HashSet::new();

        for event in events {
            for binding in self.registry.bindings() {
                if !binding_matches(binding, event) {
                    continue;
                }
                if self.registry.job(&binding.job).is_none() {
                    warn!(target: "gitvan::signal", job = %binding.job, "binding names an unknown job");
                    continue;
                }

                let invocation = JobInvocation {
                    job_id: binding.job.clone(),
                    signal: event.clone(),
                    commit: event.commit.clone(),
                    payload: binding.payload.clone().unwrap_or(serde_json::Value::Null),
                    attempt: 1,
                };

                // Dedup within the batch first, then against durable
                // receipts.
                if !batch_keys.insert(invocation.idempotency_key()) {
                    continue;
                }
                if let (Some(store), Some(commit)) = (self.receipts, &invocation.commit) {
                    if store.is_duplicate_invocation(commit, &invocation.job_id)? {
                        continue;
                    }
                }

                invocations.push(invocation);
            }
        }

        Ok(invocations)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::git::testutil::{commit_file, scratch_repo};
    use crate::types::{Receipt, ReceiptAction, RunStatus};

    fn event(kind: SignalKind) -> SignalEvent {
        SignalEvent {
            kind,
            commit: Some("c".repeat(40)),
            r#ref: None,
            branch: Some("main".to_string()),
            message: Some("release: v1.0.0\n\nnotes".to_string()),
            changed_paths: vec!["src/lib.rs".to_string(), "docs/guide.md".to_string()],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn predicate_leaves_match_their_fields() {
        let e = event(SignalKind::Commit);

        assert!(Predicate::Message { message: "^release:".to_string() }.matches(&e));
        assert!(!Predicate::Message { message: "^fix:".to_string() }.matches(&e));

        assert!(Predicate::PathChanged { path_changed: "src/**".to_string() }.matches(&e));
        assert!(!Predicate::PathChanged { path_changed: "tests/**".to_string() }.matches(&e));

        assert!(Predicate::Branch { branch: "main".to_string() }.matches(&e));
        assert!(!Predicate::Branch { branch: "develop".to_string() }.matches(&e));

        let mut tagged = event(SignalKind::TagCreate);
        tagged.r#ref = Some("v1.2.3".to_string());
        assert!(Predicate::TagCreate { tag_create: r"^v\d+".to_string() }.matches(&tagged));
        // Same pattern against a plain commit is no match.
        assert!(!Predicate::TagCreate { tag_create: r"^v\d+".to_string() }.matches(&e));
    }

    #[test]
    fn predicate_composition() {
        let e = event(SignalKind::Commit);

        let all = Predicate::All {
            all: vec![
                Predicate::Branch { branch: "main".to_string() },
                Predicate::Message { message: "release".to_string() },
            ],
        };
        assert!(all.matches(&e));

        let any = Predicate::Any {
            any: vec![
                Predicate::Branch { branch: "develop".to_string() },
                Predicate::Message { message: "release".to_string() },
            ],
        };
        assert!(any.matches(&e));

        let not = Predicate::Not {
            not: vec![Predicate::Message { message: "wip".to_string() }],
        };
        assert!(not.matches(&e));

        let refuted = Predicate::Not {
            not: vec![Predicate::Branch { branch: "main".to_string() }],
        };
        assert!(!refuted.matches(&e));
    }

    #[test]
    fn predicate_json_shapes_deserialize() {
        let p: Predicate = serde_json::from_value(json!({
            "all": [
                {"branch": "main"},
                {"any": [{"message": "^release:"}, {"tag_create": "^v"}]},
                {"not": [{"path_changed": "vendor/**"}]},
            ],
        }))
        .expect("parse");
        p.validate().expect("valid patterns");
        assert!(p.matches(&event(SignalKind::Commit)));
    }

    #[test]
    fn validate_rejects_bad_patterns() {
        let p = Predicate::Message { message: "([unclosed".to_string() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn watcher_reports_nothing_until_head_moves() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");

        let mut watcher = GitWatcher::new(ctx.at(td.path()));
        watcher.prime().expect("prime");
        assert!(watcher.poll().expect("poll").is_empty());
    }

    #[test]
    fn watcher_emits_commit_and_path_change() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");

        let mut watcher = GitWatcher::new(ctx.at(td.path()));
        watcher.prime().expect("prime");

        let sha = commit_file(&ctx, "src/lib.rs", "pub fn x() {}", "feat: add x");
        let events = watcher.poll().expect("poll");

        let kinds: Vec<SignalKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&SignalKind::Commit));
        assert!(kinds.contains(&SignalKind::PathChange));
        assert!(!kinds.contains(&SignalKind::Merge));

        let commit_event = events.iter().find(|e| e.kind == SignalKind::Commit).unwrap();
        assert_eq!(commit_event.commit.as_deref(), Some(sha.as_str()));
        assert!(commit_event.message.as_deref().unwrap().starts_with("feat: add x"));
        assert_eq!(commit_event.changed_paths, vec!["src/lib.rs".to_string()]);

        // Nothing more until the next commit.
        assert!(watcher.poll().expect("repoll").is_empty());
    }

    #[test]
    fn watcher_emits_merge_and_tag_events() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");

        let mut watcher = GitWatcher::new(ctx.at(td.path()));
        watcher.prime().expect("prime");

        // Build a merge commit with a tag at the new HEAD.
        let git = ctx.at(td.path());
        git_cmd(&git, &["checkout", "-b", "feature"]);
        commit_file(&git, "b.txt", "two", "feature work");
        git_cmd(&git, &["checkout", "main"]);
        commit_file(&git, "c.txt", "three", "main work");
        git.merge("feature").expect("merge");
        git_cmd(&git, &["tag", "v1.0.0"]);

        let events = watcher.poll().expect("poll");
        let kinds: Vec<SignalKind> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&SignalKind::Commit));
        assert!(kinds.contains(&SignalKind::Merge));
        assert!(kinds.contains(&SignalKind::TagCreate));

        let tag_event = events.iter().find(|e| e.kind == SignalKind::TagCreate).unwrap();
        assert_eq!(tag_event.r#ref.as_deref(), Some("v1.0.0"));
    }

    fn git_cmd(ctx: &GitContext, args: &[&str]) {
        // Tests drive a few plumbing commands not on the adapter surface.
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(&ctx.repo_dir)
            .env("TZ", "UTC")
            .env("LANG", "C")
            .output()
            .expect("git");
        assert!(out.status.success(), "git {args:?} failed: {}", String::from_utf8_lossy(&out.stderr));
    }

    #[test]
    fn due_cron_jobs_match_the_minute() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join("jobs")).expect("mkdir");
        fs::write(
            td.path().join("jobs/quarterly.json"),
            json!({"cron": "*/15 * * * *", "run": {"action": "shell", "command": "x"}}).to_string(),
        )
        .expect("write");
        fs::write(
            td.path().join("jobs/hourly.json"),
            json!({"cron": "0 * * * *", "run": {"action": "shell", "command": "y"}}).to_string(),
        )
        .expect("write");

        let registry = JobRegistry::discover(td.path()).expect("discover");

        let at_15 = "2024-03-04T09:15:00Z".parse().unwrap();
        let due = due_cron_jobs(&registry, at_15);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "quarterly");
        assert_eq!(due[0].1.kind, SignalKind::CronTick);

        let at_00 = "2024-03-04T09:00:00Z".parse().unwrap();
        let due = due_cron_jobs(&registry, at_00);
        assert_eq!(due.len(), 2);
    }

    fn registry_with_release_binding(dir: &std::path::Path) -> JobRegistry {
        fs::create_dir_all(dir.join("jobs/docs")).expect("mkdir");
        fs::write(
            dir.join("jobs/docs/changelog.json"),
            json!({"run": {"action": "shell", "command": "make changelog"}}).to_string(),
        )
        .expect("write job");
        fs::create_dir_all(dir.join("events/message")).expect("mkdir");
        fs::write(
            dir.join("events/message/^release:.json"),
            json!({"job": "docs/changelog"}).to_string(),
        )
        .expect("write binding");
        JobRegistry::discover(dir).expect("discover")
    }

    #[test]
    fn release_commit_fires_once_and_dedups_thereafter() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");

        let registry = registry_with_release_binding(td.path());
        let store = ReceiptStore::new(ctx.at(td.path()));

        let mut watcher = GitWatcher::new(ctx.at(td.path()));
        watcher.prime().expect("prime");
        let sha = commit_file(&ctx, "notes.md", "notes", "release: v1.0.0");

        let events = watcher.poll().expect("poll");
        let engine = SignalEngine::new(&registry, Some(&store));
        let invocations = engine.evaluate(&events).expect("evaluate");
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].job_id, "docs/changelog");
        assert_eq!(invocations[0].commit.as_deref(), Some(sha.as_str()));

        // Job completes and writes its receipt.
        store
            .write(&Receipt {
                fingerprint: invocations[0].idempotency_key(),
                ..Receipt::new("docs/changelog", RunStatus::Ok, ReceiptAction::Job, &sha)
            })
            .expect("receipt");

        // A daemon restart re-observes the same HEAD.
        let mut watcher = GitWatcher::new(ctx.at(td.path()));
        let events = watcher.poll().expect("poll after restart");
        assert!(!events.is_empty());
        let invocations = engine.evaluate(&events).expect("evaluate again");
        assert!(invocations.is_empty());
    }

    #[test]
    fn non_matching_commit_fires_nothing() {
        let td = tempdir().expect("tempdir");
        let ctx = scratch_repo(td.path());
        commit_file(&ctx, "a.txt", "one", "first");
        let registry = registry_with_release_binding(td.path());

        let mut watcher = GitWatcher::new(ctx.at(td.path()));
        watcher.prime().expect("prime");
        commit_file(&ctx, "b.txt", "two", "chore: tidy");

        let events = watcher.poll().expect("poll");
        let engine = SignalEngine::new(&registry, None);
        assert!(engine.evaluate(&events).expect("evaluate").is_empty());
    }

    #[test]
    fn binding_when_predicate_further_restricts() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join("jobs")).expect("mkdir");
        fs::write(
            td.path().join("jobs/deploy.json"),
            json!({"run": {"action": "shell", "command": "deploy"}}).to_string(),
        )
        .expect("write");
        fs::create_dir_all(td.path().join("events/message")).expect("mkdir");
        fs::write(
            td.path().join("events/message/^release:.json"),
            json!({"job": "deploy", "when": {"branch": "main"}}).to_string(),
        )
        .expect("write");
        let registry = JobRegistry::discover(td.path()).expect("discover");
        let engine = SignalEngine::new(&registry, None);

        let mut on_main = event(SignalKind::Commit);
        on_main.branch = Some("main".to_string());
        assert_eq!(engine.evaluate(&[on_main]).expect("eval").len(), 1);

        let mut on_branch = event(SignalKind::Commit);
        on_branch.branch = Some("feature".to_string());
        assert!(engine.evaluate(&[on_branch]).expect("eval").is_empty());
    }

    #[test]
    fn batch_dedup_suppresses_same_key_within_one_poll() {
        let td = tempdir().expect("tempdir");
        let registry = registry_with_release_binding(td.path());
        let engine = SignalEngine::new(&registry, None);

        // Commit and path-change events from the same HEAD both match a
        // message binding; only one invocation may emerge.
        let commit_event = event(SignalKind::Commit);
        let path_event = SignalEvent {
            kind: SignalKind::PathChange,
            ..commit_event.clone()
        };
        let invocations = engine
            .evaluate(&[commit_event, path_event])
            .expect("evaluate");
        assert_eq!(invocations.len(), 1);
    }
}
