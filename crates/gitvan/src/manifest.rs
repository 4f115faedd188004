//! Pack manifest (`pack.json`) loading, validation, and fingerprinting.
//!
//! A manifest is normalized on load: missing lists become empty, the compose
//! order defaults to 999, unknown fields are preserved untouched. The
//! fingerprint is a SHA-256 over the canonicalized manifest core plus the
//! content hash of every provided artifact file, so two packs with the same
//! identity and bytes fingerprint identically across machines and runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::GitvanError;

pub const MANIFEST_FILE: &str = "pack.json";

/// Default compose order for packs that do not declare one.
pub const DEFAULT_ORDER: i64 = 999;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9._/-]+$").expect("id regex"));
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version regex"));
static HASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("hash regex"));

/// Composition metadata: ordering and compatibility constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeMeta {
    pub order: Option<i64>,
    pub depends_on: Vec<String>,
    pub conflicts_with: Vec<String>,
    pub incompatible_with: Vec<Incompatibility>,
    /// Pack id -> semver range that must hold for that pack in the plan.
    pub dependencies: BTreeMap<String, String>,
    /// Opt out of the capability-overlap conflict for this pack.
    pub allow_overlap: bool,
}

impl ComposeMeta {
    pub fn effective_order(&self) -> i64 {
        self.order.unwrap_or(DEFAULT_ORDER)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incompatibility {
    pub pack: String,
    pub version_range: String,
}

/// How an existing target file is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Replace whatever is there (default).
    #[default]
    Overwrite,
    /// Leave an existing file alone.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Path under `templates/` in the pack.
    pub src: String,
    /// Path under the target directory.
    pub target: String,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Path under `assets/` in the pack.
    pub src: String,
    pub target: String,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Path under `jobs/` in the pack.
    pub src: String,
    /// Installed id; defaults to the source file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// npm-style additive merge into a JSON manifest at the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSpec {
    /// Target file, e.g. `package.json`.
    pub target: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Provides {
    pub templates: Vec<TemplateSpec>,
    pub files: Vec<FileSpec>,
    pub jobs: Vec<JobSpec>,
    pub events: Vec<Value>,
    pub scaffolds: Vec<Value>,
    pub commands: Vec<Value>,
    pub merges: Vec<MergeSpec>,
}

impl Provides {
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
            && self.files.is_empty()
            && self.jobs.is_empty()
            && self.merges.is_empty()
    }
}

/// Input prompt kind; validation happens in the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    #[default]
    String,
    Boolean,
    Select,
    Multiselect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: InputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    /// Choices for select/multiselect.
    #[serde(default)]
    pub options: Vec<String>,
    /// Regex a string value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// 64-hex content hash asserted by the publisher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// A validated, normalized `pack.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackManifest {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Runtime constraints, tool name -> semver range (`gitvan` is checked
    /// by the applier; unknown tools are advisory).
    #[serde(default)]
    pub requires: BTreeMap<String, String>,
    #[serde(default)]
    pub compose: ComposeMeta,
    #[serde(default)]
    pub provides: Provides,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMeta>,
    /// Metadata merged in after a forge fetch (stars, topics, license,
    /// default branch). Reserved; never set by pack authors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forge: Option<Value>,
    /// Unknown fields, preserved but ignored.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PackManifest {
    /// Parse and validate manifest text.
    pub fn parse(text: &str) -> Result<Self> {
        let manifest: PackManifest = serde_json::from_str(text).map_err(|e| {
            GitvanError::ManifestInvalid {
                reason: format!("not valid manifest JSON: {e}"),
            }
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load `pack.json` from a pack directory.
    pub fn load(pack_dir: &Path) -> Result<Self> {
        let path = pack_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path).map_err(|e| GitvanError::ManifestInvalid {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(&text)
            .with_context(|| format!("loading manifest from {}", pack_dir.display()))
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> anyhow::Error {
            GitvanError::ManifestInvalid { reason }.into()
        };

        if !ID_RE.is_match(&self.id) {
            return Err(invalid(format!(
                "id {:?} must be lowercase [a-z0-9._/-]+",
                self.id
            )));
        }
        if !VERSION_RE.is_match(&self.version) {
            return Err(invalid(format!(
                "version {:?} must be MAJOR.MINOR.PATCH",
                self.version
            )));
        }
        if let Some(src) = &self.source {
            if let Some(hash) = &src.hash {
                if !HASH_RE.is_match(hash) {
                    return Err(invalid(format!("source.hash {hash:?} must be 64 hex chars")));
                }
            }
        }
        for spec in &self.inputs {
            if spec.key.is_empty() {
                return Err(invalid("input key must not be empty".to_string()));
            }
            if let Some(p) = &spec.pattern {
                Regex::new(p).map_err(|e| {
                    invalid(format!("input {:?} pattern is not a valid regex: {e}", spec.key))
                })?;
            }
            if matches!(spec.kind, InputKind::Select | InputKind::Multiselect)
                && spec.options.is_empty()
            {
                return Err(invalid(format!(
                    "input {:?} is a selection but lists no options",
                    spec.key
                )));
            }
        }
        Ok(())
    }

    /// Relative paths of every artifact file this pack provides, with the
    /// pack-root-relative location each is loaded from.
    pub fn artifact_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for t in &self.provides.templates {
            paths.push(Path::new("templates").join(&t.src));
        }
        for f in &self.provides.files {
            paths.push(Path::new("assets").join(&f.src));
        }
        for j in &self.provides.jobs {
            paths.push(Path::new("jobs").join(&j.src));
        }
        paths.sort();
        paths
    }

    /// The manifest core that identifies a pack for fingerprinting: id,
    /// version, compose constraints, and provides, all canonically ordered.
    fn fingerprint_core(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "version": self.version,
            "compose": serde_json::to_value(&self.compose).unwrap_or(Value::Null),
            "provides": serde_json::to_value(&self.provides).unwrap_or(Value::Null),
        })
    }

    /// Deterministic 64-hex fingerprint over the manifest core and the
    /// content of every provided artifact under `pack_dir`.
    pub fn fingerprint(&self, pack_dir: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&self.fingerprint_core()).as_bytes());
        hasher.update(b"\n");

        for rel in self.artifact_paths() {
            let path = pack_dir.join(&rel);
            let content = fs::read(&path).map_err(|e| GitvanError::ManifestInvalid {
                reason: format!("provided artifact {} unreadable: {e}", rel.display()),
            })?;
            let mut file_hasher = Sha256::new();
            file_hasher.update(&content);
            let digest = hex::encode(file_hasher.finalize());

            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(b"=");
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Serialize JSON with object keys sorted recursively and no insignificant
/// whitespace. Numbers keep serde_json's shortest-roundtrip formatting, so
/// equal values always canonicalize to equal text.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string key"));
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).expect("scalar")),
    }
}
