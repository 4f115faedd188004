//! Job and event-binding discovery.
//!
//! Jobs are declarative definition files under `jobs/**`: the job id is the
//! file path relative to the jobs root without its extension (a trailing
//! `.job` marker is also stripped, so `jobs/docs/changelog.job.json` and an
//! installed `jobs/docs/changelog.json` name the same job). Event bindings
//! live under `events/<kind>/<pattern>.json`; the pattern is the file stem,
//! interpreted as a message regex when it starts with `^` and a path glob
//! otherwise.
//!
//! Bad definitions fail discovery with the offending file named, so a
//! malformed cron spec surfaces when the daemon starts, not when it first
//! ticks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gitvan_cron::CronSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::signal::Predicate;

pub const JOBS_DIR: &str = "jobs";
pub const EVENTS_DIR: &str = "events";

/// Descriptive metadata; everything optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// What a job does when invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RunAction {
    /// Run a shell command in the target directory.
    Shell { command: String },
    /// Render a template from the target's packs to a file.
    Template { template: String, target: String },
    /// Apply packs to the target.
    Apply { packs: Vec<String> },
}

/// A discovered job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(default)]
    pub meta: JobMeta,
    /// Minute-precision schedule; evaluated by the daemon's cron ticker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<CronSpec>,
    /// Lifecycle hook names this job participates in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<String>,
    pub run: RunAction,
}

/// Signal category an event binding listens to, taken from the directory
/// under `events/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Path,
    Tag,
    Merge,
    Push,
}

impl EventKind {
    fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "message" => Some(EventKind::Message),
            "path" => Some(EventKind::Path),
            "tag" => Some(EventKind::Tag),
            "merge" => Some(EventKind::Merge),
            "push" => Some(EventKind::Push),
            _ => None,
        }
    }
}

/// The file body of an event binding: the job to fire plus an optional
/// composite predicate refining the filename pattern.
#[derive(Debug, Clone, Deserialize)]
struct BindingFile {
    job: String,
    #[serde(default)]
    when: Option<Predicate>,
    #[serde(default)]
    payload: Option<Value>,
}

/// A discovered event binding.
#[derive(Debug, Clone)]
pub struct EventBinding {
    pub kind: EventKind,
    /// File-stem pattern: `^…` message regex, otherwise a path glob.
    pub pattern: String,
    pub job: String,
    /// Extra predicate composed with the pattern.
    pub when: Option<Predicate>,
    /// Opaque payload handed to the job invocation.
    pub payload: Option<Value>,
}

/// Everything discovered from a target's `jobs/` and `events/` trees.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, JobDefinition>,
    bindings: Vec<EventBinding>,
}

impl JobRegistry {
    /// Walk `<target>/jobs/**` and `<target>/events/**`.
    pub fn discover(target_dir: &Path) -> Result<Self> {
        let mut registry = JobRegistry::default();
        registry.discover_jobs(&target_dir.join(JOBS_DIR))?;
        registry.discover_bindings(&target_dir.join(EVENTS_DIR))?;
        debug!(
            target: "gitvan::jobs",
            jobs = registry.jobs.len(),
            bindings = registry.bindings.len(),
            "registry discovered"
        );
        Ok(registry)
    }

    fn discover_jobs(&mut self, jobs_root: &Path) -> Result<()> {
        if !jobs_root.is_dir() {
            return Ok(());
        }
        for entry in WalkDir::new(jobs_root).sort_by_file_name() {
            let entry = entry.context("walking jobs directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }

            let id = job_id_for(jobs_root, path)
                .with_context(|| format!("deriving job id for {}", path.display()))?;
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading job definition {}", path.display()))?;
            let definition: JobDefinition = serde_json::from_str(&text)
                .with_context(|| format!("parsing job definition {}", path.display()))?;

            self.jobs.insert(id, definition);
        }
        Ok(())
    }

    fn discover_bindings(&mut self, events_root: &Path) -> Result<()> {
        if !events_root.is_dir() {
            return Ok(());
        }
        for entry in WalkDir::new(events_root).min_depth(2).sort_by_file_name() {
            let entry = entry.context("walking events directory")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }

            let rel = path.strip_prefix(events_root).expect("under events root");
            let kind_dir = rel
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .unwrap_or_default();
            let Some(kind) = EventKind::from_dir(&kind_dir) else {
                debug!(target: "gitvan::jobs", dir = %kind_dir, "skipping unknown event kind");
                continue;
            };

            let pattern = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading event binding {}", path.display()))?;
            let body: BindingFile = serde_json::from_str(&text)
                .with_context(|| format!("parsing event binding {}", path.display()))?;

            self.bindings.push(EventBinding {
                kind,
                pattern,
                job: body.job,
                when: body.when,
                payload: body.payload,
            });
        }
        Ok(())
    }

    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = (&str, &JobDefinition)> {
        self.jobs.iter().map(|(id, def)| (id.as_str(), def))
    }

    pub fn bindings(&self) -> &[EventBinding] {
        &self.bindings
    }

    /// Jobs with a cron schedule.
    pub fn cron_jobs(&self) -> impl Iterator<Item = (&str, &CronSpec)> {
        self.jobs
            .iter()
            .filter_map(|(id, def)| def.cron.as_ref().map(|c| (id.as_str(), c)))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Job id: path relative to the jobs root, extension stripped, trailing
/// `.job` marker stripped.
fn job_id_for(jobs_root: &Path, path: &Path) -> Result<String> {
    let rel: PathBuf = path.strip_prefix(jobs_root)?.with_extension("");
    let mut id = rel.to_string_lossy().replace('\\', "/");
    if let Some(stripped) = id.strip_suffix(".job") {
        id = stripped.to_string();
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn write(path: &Path, value: &Value) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, serde_json::to_string_pretty(value).unwrap()).expect("write");
    }

    fn shell_job(command: &str) -> Value {
        json!({"run": {"action": "shell", "command": command}})
    }

    #[test]
    fn discovers_jobs_recursively_with_path_ids() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("jobs/docs/changelog.json"),
            &shell_job("generate-changelog"),
        );
        write(&td.path().join("jobs/ci/test.json"), &shell_job("run-tests"));
        write(&td.path().join("jobs/README.md").with_extension("md"), &json!({}));

        let registry = JobRegistry::discover(td.path()).expect("discover");
        assert_eq!(registry.len(), 2);
        assert!(registry.job("docs/changelog").is_some());
        assert!(registry.job("ci/test").is_some());
        assert!(registry.job("README").is_none());
    }

    #[test]
    fn job_marker_suffix_is_stripped() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("jobs/docs/changelog.job.json"),
            &shell_job("x"),
        );
        let registry = JobRegistry::discover(td.path()).expect("discover");
        assert!(registry.job("docs/changelog").is_some());
    }

    #[test]
    fn missing_directories_discover_empty() {
        let td = tempdir().expect("tempdir");
        let registry = JobRegistry::discover(td.path()).expect("discover");
        assert!(registry.is_empty());
        assert!(registry.bindings().is_empty());
    }

    #[test]
    fn cron_jobs_are_parsed_at_discovery() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("jobs/nightly.json"),
            &json!({
                "cron": "0 2 * * *",
                "run": {"action": "shell", "command": "backup"},
            }),
        );

        let registry = JobRegistry::discover(td.path()).expect("discover");
        let crons: Vec<(&str, &CronSpec)> = registry.cron_jobs().collect();
        assert_eq!(crons.len(), 1);
        assert_eq!(crons[0].0, "nightly");
        assert_eq!(crons[0].1.to_string(), "0 2 * * *");
    }

    #[test]
    fn invalid_cron_fails_discovery_naming_the_file() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("jobs/bad.json"),
            &json!({
                "cron": "99 * * * *",
                "run": {"action": "shell", "command": "x"},
            }),
        );

        let err = JobRegistry::discover(td.path()).expect_err("bad cron");
        let text = format!("{err:#}");
        assert!(text.contains("bad.json"));
        assert!(text.contains("minute"));
    }

    #[test]
    fn run_action_variants_deserialize() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("jobs/tmpl.json"),
            &json!({"run": {"action": "template", "template": "report.hbs", "target": "report.md"}}),
        );
        write(
            &td.path().join("jobs/applier.json"),
            &json!({"run": {"action": "apply", "packs": ["builtin/nodejs-basic"]}}),
        );

        let registry = JobRegistry::discover(td.path()).expect("discover");
        assert!(matches!(
            registry.job("tmpl").unwrap().run,
            RunAction::Template { .. }
        ));
        assert!(matches!(
            registry.job("applier").unwrap().run,
            RunAction::Apply { .. }
        ));
    }

    #[test]
    fn discovers_event_bindings_by_kind_and_pattern() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("events/message/^release:.json"),
            &json!({"job": "docs/changelog"}),
        );
        write(
            &td.path().join("events/path/src-glob.json"),
            &json!({"job": "ci/test", "payload": {"suite": "unit"}}),
        );
        write(
            &td.path().join("events/unknown-kind/x.json"),
            &json!({"job": "ignored"}),
        );

        let registry = JobRegistry::discover(td.path()).expect("discover");
        let bindings = registry.bindings();
        assert_eq!(bindings.len(), 2);

        let msg = bindings.iter().find(|b| b.kind == EventKind::Message).unwrap();
        assert_eq!(msg.pattern, "^release:");
        assert_eq!(msg.job, "docs/changelog");

        let path = bindings.iter().find(|b| b.kind == EventKind::Path).unwrap();
        assert_eq!(path.payload.as_ref().unwrap()["suite"], "unit");
    }

    #[test]
    fn binding_when_predicate_parses() {
        let td = tempdir().expect("tempdir");
        write(
            &td.path().join("events/message/^release:.json"),
            &json!({
                "job": "docs/changelog",
                "when": {"all": [
                    {"branch": "main"},
                    {"not": [{"message": "wip"}]},
                ]},
            }),
        );

        let registry = JobRegistry::discover(td.path()).expect("discover");
        assert!(registry.bindings()[0].when.is_some());
    }

    #[test]
    fn malformed_binding_fails_with_file_named() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events/message/broken.json");
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(&path, "{not json").expect("write");

        let err = JobRegistry::discover(td.path()).expect_err("broken");
        assert!(format!("{err:#}").contains("broken.json"));
    }
}
