//! Pack source fetchers: resolve a requested pack id to an on-disk tree.
//!
//! Sources are tried in a fixed order: seeded builtin packs, local packs
//! under the target, a prior cached fetch, a forge clone, and finally the
//! HTTPS registry. Forge clones are depth-1 over https only; tokens from the
//! runtime go into the clone URL userinfo and are never written to the cache
//! or logs. Registry lookups retry transient failures with bounded backoff,
//! and negative results are cached with a short TTL so a burst of resolves
//! for a missing pack costs one round trip.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::cache::{NS_FORGE_PACK, NS_PACK_RESOLVE};
use crate::config::Runtime;
use crate::error::{ErrorKind, GitvanError};
use crate::git::GitContext;
use crate::manifest::{MANIFEST_FILE, PackManifest};

/// Subdirectory of a target holding user packs, and the nested builtin seed.
pub const PACKS_DIR: &str = "packs";
pub const BUILTIN_DIR: &str = "builtin";

/// How deep below a clone root the manifest search goes.
const MANIFEST_SEARCH_DEPTH: usize = 3;

/// A forge hosting provider, inferred from an id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeProvider {
    Github,
    Gitlab,
    Bitbucket,
    Sourcehut,
}

impl ForgeProvider {
    pub fn name(self) -> &'static str {
        match self {
            ForgeProvider::Github => "github",
            ForgeProvider::Gitlab => "gitlab",
            ForgeProvider::Bitbucket => "bitbucket",
            ForgeProvider::Sourcehut => "sourcehut",
        }
    }

    pub fn host(self) -> &'static str {
        match self {
            ForgeProvider::Github => "github.com",
            ForgeProvider::Gitlab => "gitlab.com",
            ForgeProvider::Bitbucket => "bitbucket.org",
            ForgeProvider::Sourcehut => "git.sr.ht",
        }
    }
}

/// A parsed forge pack id: `owner/repo[#ref][/subpath]`, optionally prefixed
/// with a provider (`gitlab:owner/repo`). GitHub is the default provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeSpec {
    pub provider: ForgeProvider,
    pub owner: String,
    pub repo: String,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub subpath: Option<String>,
}

impl ForgeSpec {
    /// Parse an id into a forge spec, or `None` when the id does not look
    /// like `owner/repo[...]`.
    pub fn parse(id: &str) -> Option<ForgeSpec> {
        let (provider, rest) = match id.split_once(':') {
            Some(("github", rest)) => (ForgeProvider::Github, rest),
            Some(("gitlab", rest)) => (ForgeProvider::Gitlab, rest),
            Some(("bitbucket", rest)) => (ForgeProvider::Bitbucket, rest),
            Some(("sourcehut", rest)) => (ForgeProvider::Sourcehut, rest),
            Some(_) => return None,
            None => (ForgeProvider::Github, id),
        };

        let (owner, after_owner) = rest.split_once('/')?;
        if owner.is_empty() || after_owner.is_empty() {
            return None;
        }

        // `repo[#ref][/sub/path]`; the ref ends at the first slash after `#`.
        let (repo_and_ref, subpath) = match after_owner.split_once('#') {
            Some((repo, ref_and_sub)) => match ref_and_sub.split_once('/') {
                Some((r, sub)) => ((repo, Some(r)), Some(sub)),
                None => ((repo, Some(ref_and_sub)), None),
            },
            None => match after_owner.split_once('/') {
                Some((repo, sub)) => ((repo, None), Some(sub)),
                None => ((after_owner, None), None),
            },
        };

        let (repo, reference) = repo_and_ref;
        if repo.is_empty() || reference.is_some_and(str::is_empty) {
            return None;
        }
        let valid_segment = |s: &str| {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
        };
        if !valid_segment(owner) || !valid_segment(repo) {
            return None;
        }

        Some(ForgeSpec {
            provider,
            owner: owner.to_string(),
            repo: repo.to_string(),
            reference: reference.map(str::to_string),
            subpath: subpath.map(str::to_string),
        })
    }

    /// Deterministic cache key, e.g.
    /// `forge-octocat-Hello-World-v1.0.0-packages-my-pack`.
    pub fn cache_key(&self) -> String {
        let mut key = format!(
            "forge-{}-{}-{}",
            self.owner,
            self.repo,
            self.reference.as_deref().unwrap_or("HEAD")
        );
        if let Some(sub) = &self.subpath {
            key.push('-');
            key.push_str(&sub.replace('/', "-"));
        }
        key
    }

    /// Clone URL; the token, when given, rides in the userinfo and must not
    /// be persisted anywhere.
    pub fn clone_url(&self, token: Option<&str>) -> String {
        match token {
            Some(t) => format!("https://{t}@{}/{}/{}.git", self.provider.host(), self.owner, self.repo),
            None => format!("https://{}/{}/{}.git", self.provider.host(), self.owner, self.repo),
        }
    }
}

/// Per-host token bucket guarding forge API traffic. When a bucket runs low
/// the caller waits for the window to reset, capped at 60 seconds.
pub struct RateLimits {
    buckets: Mutex<HashMap<String, Bucket>>,
    limit: u32,
    window: Duration,
}

struct Bucket {
    remaining: u32,
    reset_at: Instant,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(3600))
    }
}

impl RateLimits {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Take one unit for `host`, blocking until the window resets if the
    /// bucket is nearly empty. The wait is capped at 60 seconds.
    pub fn acquire(&self, host: &str) {
        let wait = {
            let mut buckets = self.buckets.lock().expect("rate limits poisoned");
            let bucket = buckets.entry(host.to_string()).or_insert_with(|| Bucket {
                remaining: self.limit,
                reset_at: Instant::now() + self.window,
            });

            if Instant::now() >= bucket.reset_at {
                bucket.remaining = self.limit;
                bucket.reset_at = Instant::now() + self.window;
            }

            if bucket.remaining < 10 {
                let wait = bucket
                    .reset_at
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_secs(60));
                bucket.remaining = self.limit;
                bucket.reset_at = Instant::now() + self.window;
                Some(wait)
            } else {
                bucket.remaining -= 1;
                None
            }
        };

        if let Some(wait) = wait {
            debug!(target: "gitvan::fetch", host, wait_ms = wait.as_millis() as u64, "rate limit low; waiting for reset");
            std::thread::sleep(wait);
        }
    }

    /// Remaining units for a host, for diagnostics.
    pub fn remaining(&self, host: &str) -> Option<u32> {
        let buckets = self.buckets.lock().expect("rate limits poisoned");
        buckets.get(host).map(|b| b.remaining)
    }
}

/// Registry answer for a pack id: where the pack lives and what it should
/// hash to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackDescriptor {
    pub id: String,
    pub version: String,
    pub source: DescriptorSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorSource {
    /// Git URL the pack is cloned from; must be https.
    pub url: String,
    /// Expected pack fingerprint, 64-hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Force a descriptor URL onto https. Anything else is replaced wholesale
/// with the configured secure registry base.
fn secure_source_url(url: &str, registry_base: &str) -> String {
    if url.starts_with("https://") {
        url.to_string()
    } else {
        format!("{}/packs/{}", registry_base.trim_end_matches('/'), url.rsplit('/').next().unwrap_or(""))
    }
}

/// Where a pack came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackSource {
    Builtin { name: String },
    Local { path: PathBuf },
    Registry { id: String },
    Forge(ForgeSpec),
}

/// A pack resolved to a directory on disk.
#[derive(Debug, Clone)]
pub struct ResolvedPack {
    pub id: String,
    pub path: PathBuf,
    pub source: PackSource,
    pub manifest: PackManifest,
}

/// Resolves pack ids against every source, caching what it learns.
pub struct Fetcher<'rt> {
    runtime: &'rt Runtime,
    /// Target working tree (for local and builtin packs).
    target_dir: PathBuf,
    /// Root for forge/registry clones.
    cache_root: PathBuf,
    http: reqwest::blocking::Client,
}

impl<'rt> Fetcher<'rt> {
    pub fn new(runtime: &'rt Runtime, target_dir: &Path, cache_root: &Path) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("gitvan/{}", env!("CARGO_PKG_VERSION")))
            .timeout(runtime.config.fetch.http_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            runtime,
            target_dir: target_dir.to_path_buf(),
            cache_root: cache_root.to_path_buf(),
            http,
        })
    }

    /// Resolve an id by trying builtin, local, cache, forge, registry.
    pub fn resolve(&self, id: &str) -> Result<ResolvedPack> {
        validate_requested_id(id)?;

        if let Some(resolved) = self.try_builtin(id)? {
            return Ok(resolved);
        }
        if let Some(resolved) = self.try_local(id)? {
            return Ok(resolved);
        }
        if let Some(resolved) = self.try_cached(id)? {
            return Ok(resolved);
        }

        // Negative cache: a recent failed remote resolve short-circuits the
        // forge and registry round trips.
        if let Some(v) = self.runtime.cache.get(NS_PACK_RESOLVE, id) {
            if v.get("found") == Some(&Value::Bool(false)) {
                return Err(GitvanError::PackNotFound { id: id.to_string() }.into());
            }
        }
        if let Some(spec) = ForgeSpec::parse(id) {
            match self.fetch_forge(id, &spec) {
                Ok(resolved) => return Ok(resolved),
                Err(err) => {
                    // A forge miss still falls through to the registry;
                    // anything structural surfaces immediately.
                    if ErrorKind::classify(&err) != ErrorKind::PackNotFound {
                        return Err(err);
                    }
                }
            }
        }
        match self.fetch_registry(id) {
            Ok(resolved) => Ok(resolved),
            Err(err) => {
                if ErrorKind::classify(&err) == ErrorKind::PackNotFound {
                    let _ = self.runtime.cache.set(
                        NS_PACK_RESOLVE,
                        id,
                        &json!({"found": false}),
                        Some(self.runtime.config.fetch.negative_ttl),
                    );
                }
                Err(err)
            }
        }
    }

    fn load_resolved(&self, id: &str, dir: &Path, source: PackSource) -> Result<ResolvedPack> {
        let manifest = PackManifest::load(dir)?;
        Ok(ResolvedPack {
            id: id.to_string(),
            path: dir.to_path_buf(),
            source,
            manifest,
        })
    }

    fn try_builtin(&self, id: &str) -> Result<Option<ResolvedPack>> {
        let name = id.strip_prefix("builtin/").unwrap_or(id);
        let dir = self
            .target_dir
            .join(PACKS_DIR)
            .join(BUILTIN_DIR)
            .join(name);
        if dir.join(MANIFEST_FILE).is_file() {
            debug!(target: "gitvan::fetch", id, "resolved as builtin pack");
            let source = PackSource::Builtin {
                name: name.to_string(),
            };
            return self.load_resolved(id, &dir, source).map(Some);
        }
        Ok(None)
    }

    fn try_local(&self, id: &str) -> Result<Option<ResolvedPack>> {
        let dir = self.target_dir.join(PACKS_DIR).join(id);
        if dir.join(MANIFEST_FILE).is_file() {
            debug!(target: "gitvan::fetch", id, "resolved as local pack");
            let source = PackSource::Local { path: dir.clone() };
            return self.load_resolved(id, &dir, source).map(Some);
        }
        Ok(None)
    }

    fn try_cached(&self, id: &str) -> Result<Option<ResolvedPack>> {
        let Some(v) = self.runtime.cache.get(NS_FORGE_PACK, id) else {
            return Ok(None);
        };
        let Some(path) = v.get("path").and_then(Value::as_str) else {
            return Ok(None);
        };
        let dir = PathBuf::from(path);
        if dir.join(MANIFEST_FILE).is_file() {
            debug!(target: "gitvan::fetch", id, path, "resolved from fetch cache");
            let source = match ForgeSpec::parse(id) {
                Some(spec) => PackSource::Forge(spec),
                None => PackSource::Registry { id: id.to_string() },
            };
            return self.load_resolved(id, &dir, source).map(Some);
        }
        // The cached tree is gone; forget it.
        self.runtime.cache.invalidate(Some(NS_FORGE_PACK), Some(id));
        Ok(None)
    }

    fn fetch_forge(&self, id: &str, spec: &ForgeSpec) -> Result<ResolvedPack> {
        self.runtime.limits.acquire(spec.provider.host());

        let dest = self.cache_root.join("forge").join(spec.cache_key());
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .with_context(|| format!("clearing stale clone at {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let token = self.runtime.tokens.for_provider(spec.provider.name());
        let url = spec.clone_url(token);
        let git = GitContext::new(&self.cache_root);
        git.clone_repo(&url, spec.reference.as_deref(), &dest)
            .map_err(|err| match ErrorKind::classify(&err) {
                // A failed clone of a plausible forge id is a missing pack,
                // not an infrastructure failure.
                ErrorKind::GitError => anyhow::Error::from(GitvanError::PackNotFound {
                    id: id.to_string(),
                }),
                _ => err,
            })?;

        if let Some(sub) = &spec.subpath {
            relocate_subpath(&dest, sub)?;
        }
        let pack_dir = find_manifest_dir(&dest, MANIFEST_SEARCH_DEPTH).ok_or_else(|| {
            GitvanError::ManifestInvalid {
                reason: format!("no {MANIFEST_FILE} within {MANIFEST_SEARCH_DEPTH} levels of {id}"),
            }
        })?;

        // Best-effort enrichment; the fetch stands without it.
        if let Err(err) = self.merge_forge_metadata(spec, &pack_dir) {
            debug!(target: "gitvan::fetch", id, error = %err, "forge metadata merge skipped");
        }

        self.runtime.cache.set(
            NS_FORGE_PACK,
            id,
            &json!({"path": pack_dir.to_string_lossy()}),
            None,
        )?;

        self.load_resolved(id, &pack_dir, PackSource::Forge(spec.clone()))
    }

    /// Pull repository metadata from the provider API and write it under the
    /// reserved `forge` manifest key.
    fn merge_forge_metadata(&self, spec: &ForgeSpec, pack_dir: &Path) -> Result<()> {
        let ForgeProvider::Github = spec.provider else {
            return Ok(());
        };
        let url = format!("https://api.github.com/repos/{}/{}", spec.owner, spec.repo);
        let mut req = self.http.get(&url);
        if let Some(token) = self.runtime.tokens.for_provider("github") {
            req = req.bearer_auth(token);
        }
        let body: Value = req.send()?.error_for_status()?.json()?;

        let meta = json!({
            "stars": body.get("stargazers_count"),
            "topics": body.get("topics"),
            "license": body.get("license").and_then(|l| l.get("spdx_id")),
            "default_branch": body.get("default_branch"),
        });

        let manifest_path = pack_dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&manifest_path)?;
        let mut manifest: Value = serde_json::from_str(&text)?;
        if let Some(obj) = manifest.as_object_mut() {
            obj.insert("forge".to_string(), meta);
        }
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }

    fn fetch_registry(&self, id: &str) -> Result<ResolvedPack> {
        let base = &self.runtime.config.fetch.registry_base;
        // An empty registry base disables registry fetches entirely.
        if base.is_empty() {
            return Err(GitvanError::PackNotFound { id: id.to_string() }.into());
        }
        let url = format!("{}/api/packs/{}", base.trim_end_matches('/'), id);

        let descriptor = gitvan_retry::retry(
            &self.runtime.config.fetch.retry,
            |_attempt| self.registry_get(&url, id),
            |err| ErrorKind::classify(err).is_retryable(),
        )
        .map_err(|exhausted| exhausted.last_error)?;

        let source_url = secure_source_url(&descriptor.source.url, base);
        let dest = self
            .cache_root
            .join("registry")
            .join(id.replace('/', "-"));
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .with_context(|| format!("clearing stale clone at {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let git = GitContext::new(&self.cache_root);
        git.clone_repo(&source_url, None, &dest)?;

        let pack_dir = find_manifest_dir(&dest, MANIFEST_SEARCH_DEPTH).ok_or_else(|| {
            GitvanError::ManifestInvalid {
                reason: format!("registry source for {id} has no {MANIFEST_FILE}"),
            }
        })?;

        let resolved =
            self.load_resolved(id, &pack_dir, PackSource::Registry { id: id.to_string() })?;
        if let Some(expected) = &descriptor.source.hash {
            let actual = resolved.manifest.fingerprint(&resolved.path)?;
            if &actual != expected {
                return Err(GitvanError::IntegrityMismatch {
                    subject: id.to_string(),
                    expected: expected.clone(),
                    actual,
                }
                .into());
            }
        }

        self.runtime.cache.set(
            NS_FORGE_PACK,
            id,
            &json!({"path": pack_dir.to_string_lossy()}),
            None,
        )?;

        Ok(resolved)
    }

    fn registry_get(&self, url: &str, id: &str) -> Result<PackDescriptor> {
        let resp = self.http.get(url).send().map_err(|e| GitvanError::NetworkError {
            message: format!("registry request failed: {e}"),
        })?;

        match resp.status() {
            reqwest::StatusCode::OK => resp.json().map_err(|e| {
                GitvanError::NetworkError {
                    message: format!("bad registry payload: {e}"),
                }
                .into()
            }),
            reqwest::StatusCode::NOT_FOUND => {
                Err(GitvanError::PackNotFound { id: id.to_string() }.into())
            }
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(GitvanError::AuthError {
                    host: url.to_string(),
                }
                .into())
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(GitvanError::RateLimited {
                host: url.to_string(),
                reset_secs: 60,
            }
            .into()),
            s => Err(GitvanError::NetworkError {
                message: format!("unexpected registry status {s}"),
            }
            .into()),
        }
    }
}

/// Basic shape check on a requested id before any source is consulted.
fn validate_requested_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 256
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._/#:-".contains(c))
        && !id.contains("..");
    if !ok {
        return Err(GitvanError::PackIdInvalid { id: id.to_string() }.into());
    }
    Ok(())
}

/// Move `root/subpath` over `root`, discarding the rest of the clone.
fn relocate_subpath(root: &Path, subpath: &str) -> Result<()> {
    let sub = root.join(subpath);
    if !sub.is_dir() {
        return Err(GitvanError::ManifestInvalid {
            reason: format!("subpath {subpath:?} does not exist in the cloned repository"),
        }
        .into());
    }

    let staging = root.with_extension("relocating");
    if staging.exists() {
        fs::remove_dir_all(&staging).context("clearing relocation staging dir")?;
    }
    fs::rename(&sub, &staging).context("staging subtree")?;
    fs::remove_dir_all(root).context("removing clone root")?;
    fs::rename(&staging, root).context("promoting subtree")?;
    Ok(())
}

/// Breadth-first search for a directory containing `pack.json`, at most
/// `depth` levels below `root`.
fn find_manifest_dir(root: &Path, depth: usize) -> Option<PathBuf> {
    let mut frontier = vec![root.to_path_buf()];
    for _ in 0..=depth {
        let mut next = Vec::new();
        for dir in frontier {
            if dir.join(MANIFEST_FILE).is_file() {
                return Some(dir);
            }
            for entry in fs::read_dir(&dir).into_iter().flatten().flatten() {
                let path = entry.path();
                if path.is_dir() && path.file_name().is_some_and(|n| n != ".git") {
                    next.push(path);
                }
            }
        }
        frontier = next;
    }
    None
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::testutil::test_runtime;
    use crate::manifest::testutil::write_pack;

    fn manifest_json(id: &str) -> Value {
        json!({"id": id, "version": "1.0.0"})
    }

    #[test]
    fn parses_bare_owner_repo() {
        let spec = ForgeSpec::parse("octocat/Hello-World").expect("parse");
        assert_eq!(spec.provider, ForgeProvider::Github);
        assert_eq!(spec.owner, "octocat");
        assert_eq!(spec.repo, "Hello-World");
        assert_eq!(spec.reference, None);
        assert_eq!(spec.subpath, None);
    }

    #[test]
    fn parses_ref_and_subpath_forms() {
        let spec = ForgeSpec::parse("octocat/Hello-World#v1.0.0").expect("parse");
        assert_eq!(spec.reference.as_deref(), Some("v1.0.0"));
        assert_eq!(spec.subpath, None);

        let spec = ForgeSpec::parse("octocat/Hello-World/sub/dir").expect("parse");
        assert_eq!(spec.reference, None);
        assert_eq!(spec.subpath.as_deref(), Some("sub/dir"));

        let spec = ForgeSpec::parse("octocat/Hello-World#v1.0.0/packages/my-pack").expect("parse");
        assert_eq!(spec.owner, "octocat");
        assert_eq!(spec.repo, "Hello-World");
        assert_eq!(spec.reference.as_deref(), Some("v1.0.0"));
        assert_eq!(spec.subpath.as_deref(), Some("packages/my-pack"));
    }

    #[test]
    fn cache_key_matches_expected_shape() {
        let spec = ForgeSpec::parse("octocat/Hello-World#v1.0.0/packages/my-pack").expect("parse");
        assert_eq!(
            spec.cache_key(),
            "forge-octocat-Hello-World-v1.0.0-packages-my-pack"
        );

        let bare = ForgeSpec::parse("octocat/Hello-World").expect("parse");
        assert_eq!(bare.cache_key(), "forge-octocat-Hello-World-HEAD");
    }

    #[test]
    fn provider_prefixes_are_recognized() {
        let spec = ForgeSpec::parse("gitlab:group/project").expect("parse");
        assert_eq!(spec.provider, ForgeProvider::Gitlab);
        assert_eq!(spec.clone_url(None), "https://gitlab.com/group/project.git");

        let spec = ForgeSpec::parse("bitbucket:team/repo#main").expect("parse");
        assert_eq!(spec.provider, ForgeProvider::Bitbucket);

        assert!(ForgeSpec::parse("svn:owner/repo").is_none());
    }

    #[test]
    fn clone_url_embeds_token_in_userinfo() {
        let spec = ForgeSpec::parse("octocat/Hello-World").expect("parse");
        assert_eq!(
            spec.clone_url(Some("s3cret")),
            "https://s3cret@github.com/octocat/Hello-World.git"
        );
    }

    #[test]
    fn non_forge_shapes_do_not_parse() {
        assert!(ForgeSpec::parse("plain-name").is_none());
        assert!(ForgeSpec::parse("/leading").is_none());
        assert!(ForgeSpec::parse("trailing/").is_none());
        assert!(ForgeSpec::parse("owner/repo#").is_none());
    }

    #[test]
    fn requested_id_validation() {
        assert!(validate_requested_id("builtin/nodejs-basic").is_ok());
        assert!(validate_requested_id("octocat/Hello-World#v1.0.0/sub").is_ok());
        assert!(validate_requested_id("").is_err());
        assert!(validate_requested_id("has space").is_err());
        assert!(validate_requested_id("dot/../dot").is_err());
    }

    #[test]
    fn secure_source_url_overrides_plain_http() {
        assert_eq!(
            secure_source_url("https://example.com/p.git", DEFAULT_REGISTRY_TEST),
            "https://example.com/p.git"
        );
        assert_eq!(
            secure_source_url("http://evil.example/p.git", DEFAULT_REGISTRY_TEST),
            format!("{DEFAULT_REGISTRY_TEST}/packs/p.git")
        );
    }

    const DEFAULT_REGISTRY_TEST: &str = "https://registry.test";

    #[test]
    fn builtin_resolves_before_local() {
        let td = tempdir().expect("tempdir");
        let target = td.path().join("target");
        let builtin = target.join(PACKS_DIR).join(BUILTIN_DIR).join("nodejs-basic");
        write_pack(&builtin, &manifest_json("builtin/nodejs-basic"), &[]);

        let rt = test_runtime(td.path());
        let fetcher = Fetcher::new(&rt, &target, &td.path().join("cache-root")).expect("fetcher");

        let resolved = fetcher.resolve("builtin/nodejs-basic").expect("resolve");
        assert_eq!(resolved.path, builtin);
        assert_eq!(resolved.manifest.id, "builtin/nodejs-basic");
        assert_eq!(
            resolved.source,
            PackSource::Builtin {
                name: "nodejs-basic".to_string()
            }
        );
    }

    #[test]
    fn local_pack_resolves_by_id_path() {
        let td = tempdir().expect("tempdir");
        let target = td.path().join("target");
        let local = target.join(PACKS_DIR).join("auth/jwt");
        write_pack(&local, &manifest_json("auth/jwt"), &[]);

        let rt = test_runtime(td.path());
        let fetcher = Fetcher::new(&rt, &target, &td.path().join("cache-root")).expect("fetcher");

        let resolved = fetcher.resolve("auth/jwt").expect("resolve");
        assert_eq!(resolved.manifest.id, "auth/jwt");
        assert!(matches!(resolved.source, PackSource::Local { .. }));
    }

    #[test]
    fn cached_path_is_reused_and_dropped_when_stale() {
        let td = tempdir().expect("tempdir");
        let target = td.path().join("target");
        let cached_pack = td.path().join("somewhere/pack");
        write_pack(&cached_pack, &manifest_json("cachedpack"), &[]);

        let rt = test_runtime(td.path());
        rt.cache
            .set(
                NS_FORGE_PACK,
                "cachedpack",
                &json!({"path": cached_pack.to_string_lossy()}),
                None,
            )
            .expect("seed cache");

        let fetcher = Fetcher::new(&rt, &target, &td.path().join("cache-root")).expect("fetcher");
        let resolved = fetcher.resolve("cachedpack").expect("resolve");
        assert_eq!(resolved.path, cached_pack);

        // Remove the tree; the cached entry must be discarded, and the id
        // then falls through to the (disabled) registry.
        fs::remove_dir_all(&cached_pack).expect("remove");
        let err = fetcher.resolve("cachedpack").expect_err("stale");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::PackNotFound);
        assert!(rt.cache.get(NS_FORGE_PACK, "cachedpack").is_none());
    }

    #[test]
    fn relocate_subpath_promotes_subtree() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("clone");
        write_pack(
            &root.join("packages/my-pack"),
            &manifest_json("my-pack"),
            &[("templates/t.njk", "x")],
        );
        fs::write(root.join("toplevel.txt"), "noise").expect("write");

        relocate_subpath(&root, "packages/my-pack").expect("relocate");
        assert!(root.join(MANIFEST_FILE).is_file());
        assert!(root.join("templates/t.njk").is_file());
        assert!(!root.join("toplevel.txt").exists());
    }

    #[test]
    fn relocate_missing_subpath_is_manifest_invalid() {
        let td = tempdir().expect("tempdir");
        let root = td.path().join("clone");
        fs::create_dir_all(&root).expect("mkdir");
        let err = relocate_subpath(&root, "nope").expect_err("missing subpath");
        assert_eq!(ErrorKind::classify(&err), ErrorKind::ManifestInvalid);
    }

    #[test]
    fn find_manifest_dir_walks_limited_depth() {
        let td = tempdir().expect("tempdir");
        let nested = td.path().join("a/b/c");
        write_pack(&nested, &manifest_json("deep"), &[]);
        assert_eq!(find_manifest_dir(td.path(), 3), Some(nested));

        let td2 = tempdir().expect("tempdir");
        let too_deep = td2.path().join("a/b/c/d");
        write_pack(&too_deep, &manifest_json("deeper"), &[]);
        assert_eq!(find_manifest_dir(td2.path(), 3), None);
    }

    #[test]
    fn rate_limit_bucket_decrements_and_reports() {
        let limits = RateLimits::new(30, Duration::from_secs(3600));
        limits.acquire("github.com");
        limits.acquire("github.com");
        assert_eq!(limits.remaining("github.com"), Some(28));
        assert_eq!(limits.remaining("gitlab.com"), None);
    }

    #[test]
    fn rate_limit_waits_when_nearly_empty() {
        let limits = RateLimits::new(10, Duration::from_millis(80));
        limits.acquire("example.com"); // remaining 9 -> below threshold next time
        let start = Instant::now();
        limits.acquire("example.com"); // must wait out the short window
        assert!(start.elapsed() >= Duration::from_millis(40));
        // Bucket refilled after the wait.
        assert_eq!(limits.remaining("example.com"), Some(10));
    }

    mod registry {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        use super::*;
        use crate::config::{ForgeTokens, GitvanConfig, Runtime};

        #[test]
        fn unknown_pack_is_not_found_and_negatively_cached() {
            let hits = Arc::new(AtomicUsize::new(0));
            let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
            let addr = format!("http://{}", server.server_addr());
            let hits_bg = Arc::clone(&hits);
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    hits_bg.fetch_add(1, Ordering::SeqCst);
                    let _ = request.respond(tiny_http::Response::empty(404));
                }
            });

            let td = tempdir().expect("tempdir");
            let mut config = GitvanConfig::default();
            config.cache.disk_dir = Some(td.path().join("cache"));
            config.fetch.registry_base = addr;
            config.fetch.retry.max_attempts = 1;
            let rt = Runtime::with_config(config, ForgeTokens::default());

            let fetcher =
                Fetcher::new(&rt, &td.path().join("target"), &td.path().join("cache-root"))
                    .expect("fetcher");

            let err = fetcher.resolve("no-such-pack").expect_err("must miss");
            assert_eq!(ErrorKind::classify(&err), ErrorKind::PackNotFound);

            // Second resolve hits the negative cache, not the server.
            let err = fetcher.resolve("no-such-pack").expect_err("still missing");
            assert_eq!(ErrorKind::classify(&err), ErrorKind::PackNotFound);
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn auth_failures_surface_as_auth_error() {
            let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
            let addr = format!("http://{}", server.server_addr());
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    let _ = request.respond(tiny_http::Response::empty(403));
                }
            });

            let td = tempdir().expect("tempdir");
            let mut config = GitvanConfig::default();
            config.cache.disk_dir = Some(td.path().join("cache"));
            config.fetch.registry_base = addr;
            config.fetch.retry.max_attempts = 1;
            let rt = Runtime::with_config(config, ForgeTokens::default());

            let fetcher =
                Fetcher::new(&rt, &td.path().join("target"), &td.path().join("cache-root"))
                    .expect("fetcher");

            let err = fetcher.resolve("secret-pack").expect_err("forbidden");
            assert_eq!(ErrorKind::classify(&err), ErrorKind::AuthError);
        }
    }
}
