//! Configuration file support (`.gitvan.toml`) and the [`Runtime`] value.
//!
//! The runtime owns everything that used to be ambient: parsed config, forge
//! tokens read from the environment exactly once, the pack cache, and the
//! per-provider rate-limit buckets. It is threaded through constructors, so
//! tests get full isolation by building a fresh runtime over a temp
//! directory instead of mutating globals.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheConfig, PackCache};
use crate::fetch::RateLimits;
use crate::types::{deserialize_duration, serialize_duration};

pub const CONFIG_FILE: &str = ".gitvan.toml";

/// Secure default registry; non-HTTPS registry URLs are overridden to this.
pub const DEFAULT_REGISTRY_BASE: &str = "https://registry.gitvan.dev";

/// Nested daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bounded pending queue size
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Per-job deadline
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_job_timeout"
    )]
    pub job_timeout: Duration,
    /// How long shutdown waits for in-flight jobs
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_grace_period"
    )]
    pub grace_period: Duration,
    /// HEAD polling interval between minute ticks
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            job_timeout: default_job_timeout(),
            grace_period: default_grace_period(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

/// Nested fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Registry API base URL
    #[serde(default = "default_registry_base")]
    pub registry_base: String,
    /// HTTP request timeout
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_http_timeout"
    )]
    pub http_timeout: Duration,
    /// Backoff for transient fetch failures
    #[serde(default)]
    pub retry: gitvan_retry::BackoffConfig,
    /// TTL for cached negative lookups
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_negative_ttl"
    )]
    pub negative_ttl: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            registry_base: default_registry_base(),
            http_timeout: default_http_timeout(),
            retry: gitvan_retry::BackoffConfig::default(),
            negative_ttl: default_negative_ttl(),
        }
    }
}

fn default_registry_base() -> String {
    DEFAULT_REGISTRY_BASE.to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_negative_ttl() -> Duration {
    Duration::from_secs(60)
}

/// Nested template limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_max_template_bytes")]
    pub max_template_bytes: usize,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_render_timeout"
    )]
    pub render_timeout: Duration,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            max_template_bytes: default_max_template_bytes(),
            max_output_bytes: default_max_output_bytes(),
            render_timeout: default_render_timeout(),
        }
    }
}

fn default_max_template_bytes() -> usize {
    1024 * 1024
}

fn default_max_output_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_render_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Nested apply configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// An apply lock whose heartbeat has been silent this long is presumed
    /// dead and taken over
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_lock_timeout"
    )]
    pub lock_timeout: Duration,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            lock_timeout: default_lock_timeout(),
        }
    }
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600)
}

/// Top-level `.gitvan.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitvanConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub apply: ApplyConfig,
}

impl GitvanConfig {
    /// Load `.gitvan.toml` from the target directory; absent file means
    /// defaults.
    pub fn load(target_dir: &Path) -> Result<Self> {
        let path = target_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.daemon.workers == 0 {
            bail!("daemon.workers must be at least 1");
        }
        if self.daemon.queue_capacity == 0 {
            bail!("daemon.queue_capacity must be at least 1");
        }
        if self.template.max_output_bytes == 0 {
            bail!("template.max_output_bytes must be at least 1");
        }
        Ok(())
    }
}

/// Forge authentication tokens, captured from the environment once at
/// runtime construction. Never persisted into caches or logs.
#[derive(Debug, Clone, Default)]
pub struct ForgeTokens {
    pub github: Option<String>,
    pub gitlab: Option<String>,
    pub bitbucket: Option<String>,
    pub sourcehut: Option<String>,
    /// `FORGE_TOKEN` fallback for any provider.
    pub generic: Option<String>,
}

impl ForgeTokens {
    pub fn from_env() -> Self {
        Self {
            github: env::var("GITHUB_TOKEN").ok(),
            gitlab: env::var("GITLAB_TOKEN").ok(),
            bitbucket: env::var("BITBUCKET_TOKEN").ok(),
            sourcehut: env::var("SOURCEHUT_TOKEN").ok(),
            generic: env::var("FORGE_TOKEN").ok(),
        }
    }

    /// Token for a provider name, falling back to the generic token.
    pub fn for_provider(&self, provider: &str) -> Option<&str> {
        let specific = match provider {
            "github" => self.github.as_deref(),
            "gitlab" => self.gitlab.as_deref(),
            "bitbucket" => self.bitbucket.as_deref(),
            "sourcehut" => self.sourcehut.as_deref(),
            _ => None,
        };
        specific.or(self.generic.as_deref())
    }
}

/// User-global cache root: `~/.gitvan/packs`, or `.gitvan/cache` under the
/// current directory when no home is available.
pub fn default_cache_dir() -> PathBuf {
    match env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".gitvan").join("packs"),
        None => PathBuf::from(".gitvan").join("cache"),
    }
}

/// Everything ambient, made explicit. Constructed once and shared.
pub struct Runtime {
    pub config: GitvanConfig,
    pub tokens: ForgeTokens,
    pub cache: PackCache,
    pub limits: RateLimits,
}

impl Runtime {
    /// Production construction: config from the target, tokens from the
    /// environment, disk cache under the user-global cache dir unless the
    /// config names one.
    pub fn from_env(target_dir: &Path) -> Result<Arc<Self>> {
        let mut config = GitvanConfig::load(target_dir)?;
        if config.cache.disk_dir.is_none() {
            config.cache.disk_dir = Some(default_cache_dir());
        }
        Ok(Self::with_config(config, ForgeTokens::from_env()))
    }

    /// Explicit construction; used by tests for isolation.
    pub fn with_config(config: GitvanConfig, tokens: ForgeTokens) -> Arc<Self> {
        let cache = PackCache::new(config.cache.clone());
        Arc::new(Self {
            config,
            tokens,
            cache,
            limits: RateLimits::default(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;

    /// Runtime with its disk cache confined to `dir`, the registry
    /// disabled, and no tokens. Keeps tests fully offline.
    pub(crate) fn test_runtime(dir: &Path) -> Arc<Runtime> {
        let mut config = GitvanConfig {
            cache: CacheConfig {
                disk_dir: Some(dir.join("cache")),
                ..CacheConfig::default()
            },
            ..GitvanConfig::default()
        };
        config.fetch.registry_base = String::new();
        config.fetch.retry.max_attempts = 1;
        Runtime::with_config(config, ForgeTokens::default())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let td = tempdir().expect("tempdir");
        let config = GitvanConfig::load(td.path()).expect("load");
        assert_eq!(config.daemon.workers, 4);
        assert_eq!(config.fetch.registry_base, DEFAULT_REGISTRY_BASE);
        assert_eq!(config.template.render_timeout, Duration::from_secs(10));
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let td = tempdir().expect("tempdir");
        std::fs::write(
            td.path().join(CONFIG_FILE),
            r#"
[daemon]
workers = 8
job_timeout = "2m"

[fetch]
registry_base = "https://packs.example.com"
"#,
        )
        .expect("write config");

        let config = GitvanConfig::load(td.path()).expect("load");
        assert_eq!(config.daemon.workers, 8);
        assert_eq!(config.daemon.job_timeout, Duration::from_secs(120));
        assert_eq!(config.daemon.queue_capacity, 64);
        assert_eq!(config.fetch.registry_base, "https://packs.example.com");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let td = tempdir().expect("tempdir");
        std::fs::write(td.path().join(CONFIG_FILE), "[daemon]\nworkers = 0\n")
            .expect("write config");
        let err = GitvanConfig::load(td.path()).expect_err("invalid");
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let td = tempdir().expect("tempdir");
        std::fs::write(td.path().join(CONFIG_FILE), "not [valid toml").expect("write");
        assert!(GitvanConfig::load(td.path()).is_err());
    }

    #[test]
    fn tokens_fall_back_to_generic() {
        let tokens = ForgeTokens {
            github: Some("gh".to_string()),
            generic: Some("any".to_string()),
            ..ForgeTokens::default()
        };
        assert_eq!(tokens.for_provider("github"), Some("gh"));
        assert_eq!(tokens.for_provider("gitlab"), Some("any"));
        assert_eq!(tokens.for_provider("unknown"), Some("any"));

        assert_eq!(ForgeTokens::default().for_provider("github"), None);
    }

    #[test]
    fn runtime_is_isolated_per_construction() {
        let td = tempdir().expect("tempdir");
        let rt1 = testutil::test_runtime(td.path());
        rt1.cache
            .set(crate::cache::NS_PACK_INFO, "k", &serde_json::json!(1), None)
            .expect("set");

        let td2 = tempdir().expect("tempdir");
        let rt2 = testutil::test_runtime(td2.path());
        assert!(rt2.cache.get(crate::cache::NS_PACK_INFO, "k").is_none());
    }
}
