//! Pack applier: idempotent materialization of one pack onto a target tree.
//!
//! Application is a small state machine: runtime constraints, then input
//! resolution, then the fingerprint lookup, and only then side effects.
//! A prior OK receipt with the same fingerprint short-circuits to SKIP
//! without touching the tree. Items apply in a fixed order (templates,
//! files, jobs, manifest merges) and item failures are collected rather
//! than aborting, so a partial apply still produces a receipt that records
//! exactly which artifacts landed.
//!
//! Every target path is checked to stay strictly under the target directory
//! before any write, and writes are atomic (temp file + rename).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{ErrorDetail, GitvanError};
use crate::manifest::{InputKind, InputSpec, MergeSpec, PackManifest, WriteMode};
use crate::receipt::ReceiptStore;
use crate::template::{TemplateRenderer, sanitize_context, split_front_matter};
use crate::types::{AppliedItem, ApplyResult, ItemKind, Receipt, ReceiptAction, RunStatus};

/// Directory jobs are installed into under the target.
pub const TARGET_JOBS_DIR: &str = "jobs";

static TEMPLATE_SYNTAX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{|\{\{").expect("template syntax regex"));

pub struct Applier<'rt> {
    renderer: &'rt TemplateRenderer,
}

pub struct ApplyRequest<'a> {
    pub pack_path: &'a Path,
    pub target_dir: &'a Path,
    pub inputs: &'a Map<String, Value>,
    /// Receipt store for fingerprint lookup and the terminal receipt.
    /// `None` means no commit context exists; the result alone records the
    /// outcome.
    pub receipts: Option<&'a ReceiptStore>,
    pub dry_run: bool,
}

impl<'rt> Applier<'rt> {
    pub fn new(renderer: &'rt TemplateRenderer) -> Self {
        Self { renderer }
    }

    /// Apply one pack. Returns the result and writes one receipt when a
    /// commit context exists.
    pub fn apply(&self, req: &ApplyRequest<'_>) -> Result<ApplyResult> {
        let manifest = PackManifest::load(req.pack_path)?;
        let pack_id = manifest.id.clone();

        check_requires(&manifest)?;
        let inputs = resolve_inputs(&manifest.inputs, req.inputs)?;
        let fingerprint = manifest.fingerprint(req.pack_path)?;

        if let Some(store) = req.receipts {
            if store.has_fingerprint(&fingerprint)? {
                debug!(target: "gitvan::apply", pack = %pack_id, "fingerprint match; skipping");
                let result = ApplyResult {
                    pack_id: pack_id.clone(),
                    status: RunStatus::Skip,
                    fingerprint: fingerprint.clone(),
                    applied: Vec::new(),
                    errors: Vec::new(),
                };
                self.write_receipt(req, &result, &inputs)?;
                return Ok(result);
            }
        }

        let mut applied = Vec::new();
        let mut errors = Vec::new();

        let mut run_item = |kind: ItemKind, action: &str, source: String, target: String,
                            work: &mut dyn FnMut() -> Result<bool>| {
            match work() {
                Ok(true) => applied.push(AppliedItem {
                    action: action.to_string(),
                    source,
                    target,
                    kind,
                }),
                Ok(false) => {
                    debug!(target: "gitvan::apply", source = %source, dest = %target, "existing target kept (skip mode)");
                }
                Err(err) => errors.push(ErrorDetail::from_error(&err)),
            }
        };

        for t in &manifest.provides.templates {
            let source = Path::new("templates").join(&t.src);
            run_item(
                ItemKind::Template,
                "render",
                t.src.clone(),
                t.target.clone(),
                &mut || {
                    self.apply_template(req, &manifest, &inputs, &source, t)
                },
            );
        }

        for f in &manifest.provides.files {
            let source = Path::new("assets").join(&f.src);
            run_item(
                ItemKind::File,
                "copy",
                f.src.clone(),
                f.target.clone(),
                &mut || apply_file(req, &source, &f.target, f.mode),
            );
        }

        for j in &manifest.provides.jobs {
            let source = Path::new("jobs").join(&j.src);
            let id = j
                .id
                .clone()
                .unwrap_or_else(|| Path::new(&j.src).file_stem().unwrap_or_default().to_string_lossy().to_string());
            let ext = Path::new(&j.src)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let target = format!("{TARGET_JOBS_DIR}/{id}{ext}");
            run_item(
                ItemKind::Job,
                "install",
                j.src.clone(),
                target.clone(),
                &mut || apply_file(req, &source, &target, WriteMode::Overwrite),
            );
        }

        for m in &manifest.provides.merges {
            run_item(
                ItemKind::ManifestMerge,
                "merge",
                m.target.clone(),
                m.target.clone(),
                &mut || apply_merge(req, m),
            );
        }

        let status = match (applied.is_empty(), errors.is_empty()) {
            (_, true) => RunStatus::Ok,
            (false, false) => RunStatus::Partial,
            (true, false) => RunStatus::Error,
        };

        let result = ApplyResult {
            pack_id,
            status,
            fingerprint,
            applied,
            errors,
        };
        self.write_receipt(req, &result, &inputs)?;
        Ok(result)
    }

    fn write_receipt(
        &self,
        req: &ApplyRequest<'_>,
        result: &ApplyResult,
        inputs: &Map<String, Value>,
    ) -> Result<()> {
        let Some(store) = req.receipts else {
            return Ok(());
        };
        if req.dry_run {
            return Ok(());
        }
        let commit = store.head_commit()?;
        let receipt = Receipt {
            fingerprint: result.fingerprint.clone(),
            artifact: result.applied.first().map(|a| a.target.clone()),
            inputs: (!inputs.is_empty()).then(|| inputs.clone()),
            error: result.errors.first().cloned(),
            ..Receipt::new(&result.pack_id, result.status, ReceiptAction::Apply, &commit)
        };
        store.write(&receipt)
    }

    fn apply_template(
        &self,
        req: &ApplyRequest<'_>,
        manifest: &PackManifest,
        inputs: &Map<String, Value>,
        source: &Path,
        spec: &crate::manifest::TemplateSpec,
    ) -> Result<bool> {
        let target = guarded_join(req.target_dir, &spec.target)?;
        if target.exists() && spec.mode == WriteMode::Skip {
            return Ok(false);
        }

        let path = req.pack_path.join(source);
        let text = fs::read_to_string(&path).map_err(|e| GitvanError::FileSystemError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let (front_matter, body) = split_front_matter(&text)?;

        let mut context = Value::Object(inputs.clone());
        sanitize_context(&mut context);
        if let Value::Object(map) = &mut context {
            if let Some(fm) = front_matter {
                map.insert("frontMatter".to_string(), fm);
            }
            map.insert(
                "__system".to_string(),
                json!({
                    "pack": manifest.id,
                    "version": manifest.version,
                    "target": spec.target,
                    "ts": Utc::now().to_rfc3339(),
                }),
            );
        }

        let rendered = self.renderer.render(&spec.src, body, &context)?;
        if req.dry_run {
            return Ok(true);
        }
        write_atomic(&target, rendered.as_bytes(), spec.executable)?;
        Ok(true)
    }
}

/// Runtime constraints: only the `gitvan` range is enforced; other tools
/// are advisory.
fn check_requires(manifest: &PackManifest) -> Result<()> {
    if let Some(range) = manifest.requires.get("gitvan") {
        let own = env!("CARGO_PKG_VERSION");
        let own_release = own.split('-').next().unwrap_or(own);
        if !crate::resolve::satisfies(own_release, range)? {
            return Err(GitvanError::VersionConstraintUnsatisfied {
                pack_id: "gitvan".to_string(),
                version: own.to_string(),
                constraint: range.clone(),
                required_by: manifest.id.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Resolve and validate inputs against the manifest's prompt schemas.
/// Unknown provided keys pass through untouched (they are template data).
pub fn resolve_inputs(
    specs: &[InputSpec],
    provided: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut resolved = provided.clone();

    for spec in specs {
        let value = match provided.get(&spec.key) {
            Some(v) => v.clone(),
            None => match &spec.default {
                Some(d) => d.clone(),
                None if spec.required => {
                    return Err(GitvanError::InputValidationFailed {
                        name: spec.key.clone(),
                        reason: "required input missing".to_string(),
                    }
                    .into());
                }
                None => continue,
            },
        };

        validate_input(spec, &value)?;
        resolved.insert(spec.key.clone(), value);
    }

    // Security checks run over every string that will reach a template.
    for (key, value) in &resolved {
        if let Value::String(s) = value {
            check_string_input(key, s)?;
        }
    }

    Ok(resolved)
}

fn validate_input(spec: &InputSpec, value: &Value) -> Result<()> {
    let fail = |reason: String| -> anyhow::Error {
        GitvanError::InputValidationFailed {
            name: spec.key.clone(),
            reason,
        }
        .into()
    };

    match spec.kind {
        InputKind::String => {
            let Value::String(s) = value else {
                return Err(fail("expected a string".to_string()));
            };
            if let Some(pattern) = &spec.pattern {
                let re = Regex::new(pattern).map_err(|e| fail(format!("bad pattern: {e}")))?;
                if !re.is_match(s) {
                    return Err(fail(format!("{s:?} does not match {pattern:?}")));
                }
            }
        }
        InputKind::Boolean => {
            if !value.is_boolean() {
                return Err(fail("expected a boolean".to_string()));
            }
        }
        InputKind::Select => {
            let Value::String(s) = value else {
                return Err(fail("expected one of the listed options".to_string()));
            };
            if !spec.options.iter().any(|o| o == s) {
                return Err(fail(format!(
                    "{s:?} is not one of {:?}",
                    spec.options
                )));
            }
        }
        InputKind::Multiselect => {
            let Value::Array(items) = value else {
                return Err(fail("expected a list of options".to_string()));
            };
            for item in items {
                let Value::String(s) = item else {
                    return Err(fail("expected string options".to_string()));
                };
                if !spec.options.iter().any(|o| o == s) {
                    return Err(fail(format!("{s:?} is not one of {:?}", spec.options)));
                }
            }
        }
    }
    Ok(())
}

/// Reject traversal and template syntax in a user-provided string.
fn check_string_input(key: &str, s: &str) -> Result<()> {
    if s.contains("..") || Path::new(s).is_absolute() {
        return Err(GitvanError::PathTraversal {
            path: format!("{key}={s}"),
        }
        .into());
    }
    if TEMPLATE_SYNTAX.is_match(s) {
        return Err(GitvanError::TemplateInjection {
            name: key.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Join a manifest-declared relative path onto the target, rejecting
/// absolute paths and any `..` component before a single byte is written.
pub fn guarded_join(target_dir: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(GitvanError::PathTraversal {
            path: rel.to_string(),
        }
        .into());
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(GitvanError::PathTraversal {
                    path: rel.to_string(),
                }
                .into());
            }
        }
    }
    Ok(target_dir.join(rel_path))
}

/// Write via a temp file in the same directory plus rename, optionally
/// setting the executable bit.
fn write_atomic(target: &Path, bytes: &[u8], executable: bool) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| GitvanError::FileSystemError {
            path: parent.display().to_string(),
            message: e.to_string(),
        })?;
    }

    let tmp = target.with_extension("gvtmp");
    fs::write(&tmp, bytes).map_err(|e| GitvanError::FileSystemError {
        path: tmp.display().to_string(),
        message: e.to_string(),
    })?;

    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&tmp)
            .map_err(|e| GitvanError::FileSystemError {
                path: tmp.display().to_string(),
                message: e.to_string(),
            })?
            .permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(&tmp, perms).map_err(|e| GitvanError::FileSystemError {
            path: tmp.display().to_string(),
            message: e.to_string(),
        })?;
    }
    #[cfg(not(unix))]
    let _ = executable;

    fs::rename(&tmp, target).map_err(|e| GitvanError::FileSystemError {
        path: target.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(())
}

/// Copy a pack asset to the target, preserving mode bits. Returns false when
/// an existing target is kept under skip mode.
fn apply_file(
    req: &ApplyRequest<'_>,
    source: &Path,
    target_rel: &str,
    mode: WriteMode,
) -> Result<bool> {
    let target = guarded_join(req.target_dir, target_rel)?;
    if target.exists() && mode == WriteMode::Skip {
        return Ok(false);
    }
    if req.dry_run {
        return Ok(true);
    }

    let source_path = req.pack_path.join(source);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| GitvanError::FileSystemError {
            path: parent.display().to_string(),
            message: e.to_string(),
        })?;
    }
    // fs::copy carries permission bits with the content.
    fs::copy(&source_path, &target).map_err(|e| GitvanError::FileSystemError {
        path: source_path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(true)
}

/// npm-style additive merge: absent keys in `dependencies`,
/// `devDependencies`, and `scripts` are added; present keys are left alone.
/// Output has stable key ordering and a trailing newline.
fn apply_merge(req: &ApplyRequest<'_>, spec: &MergeSpec) -> Result<bool> {
    let target = guarded_join(req.target_dir, &spec.target)?;
    if req.dry_run {
        return Ok(true);
    }

    let mut doc: Value = if target.exists() {
        let text = fs::read_to_string(&target).map_err(|e| GitvanError::FileSystemError {
            path: target.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| GitvanError::ManifestInvalid {
            reason: format!("{} is not valid JSON: {e}", spec.target),
        })?
    } else {
        json!({})
    };

    let root = doc.as_object_mut().ok_or_else(|| GitvanError::ManifestInvalid {
        reason: format!("{} is not a JSON object", spec.target),
    })?;

    for (section, additions) in [
        ("dependencies", &spec.dependencies),
        ("devDependencies", &spec.dev_dependencies),
        ("scripts", &spec.scripts),
    ] {
        if additions.is_empty() {
            continue;
        }
        let entry = root
            .entry(section.to_string())
            .or_insert_with(|| json!({}));
        let Some(map) = entry.as_object_mut() else {
            return Err(GitvanError::ManifestInvalid {
                reason: format!("{section} in {} is not an object", spec.target),
            }
            .into());
        };
        // Add-only, then rewrite the section sorted for a stable diff.
        let mut merged: BTreeMap<String, Value> = map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in additions {
            merged
                .entry(k.clone())
                .or_insert_with(|| Value::String(v.clone()));
        }
        *entry = serde_json::to_value(merged).context("reserializing merged section")?;
    }

    let mut text = serde_json::to_string_pretty(&doc).context("serializing merged manifest")?;
    text.push('\n');
    write_atomic(&target, text.as_bytes(), false)?;
    Ok(true)
}
