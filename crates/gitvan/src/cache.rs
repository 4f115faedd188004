//! Two-tier pack cache: an in-memory LRU bounded by bytes in front of an
//! on-disk content-addressed store.
//!
//! Values are JSON. Disk entries carry an integrity hash that is verified on
//! read; a mismatch drops the entry and counts as a miss, never a wrong
//! value. Entries over the compression threshold are gzipped. Concurrent
//! misses for the same key coalesce into a single fetch (singleflight), so
//! a burst of resolvers asking for one registry document produces one HTTP
//! request.
//!
//! Invalidation is logical on disk: the entry is tombstoned and reclaimed by
//! the next [`PackCache::compact`] pass.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Cache namespaces used by the core.
pub const NS_PACK_INFO: &str = "pack-info";
pub const NS_PACK_RESOLVE: &str = "pack-resolve";
pub const NS_REGISTRY_FETCH: &str = "registry-fetch";
pub const NS_FORGE_PACK: &str = "forge-pack";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// LRU capacity of the memory tier, in bytes of serialized JSON.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity_bytes: usize,
    /// TTL applied when `set` is called without one.
    #[serde(
        deserialize_with = "crate::types::deserialize_duration",
        serialize_with = "crate::types::serialize_duration",
        default = "default_ttl"
    )]
    pub default_ttl: Duration,
    /// Disk tier root; `None` disables the disk tier.
    #[serde(default)]
    pub disk_dir: Option<PathBuf>,
    /// Serialized payloads over this many bytes are gzipped on disk.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

fn default_memory_capacity() -> usize {
    16 * 1024 * 1024
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_compression_threshold() -> usize {
    8 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: default_memory_capacity(),
            default_ttl: default_ttl(),
            disk_dir: None,
            compression_threshold: default_compression_threshold(),
        }
    }
}

/// Counters exposed by [`PackCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub integrity_failures: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
}

struct MemEntry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemTier {
    entries: HashMap<String, MemEntry>,
    /// Least-recently-used first.
    recency: VecDeque<String>,
    bytes: usize,
    stats: CacheStats,
}

impl MemTier {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.bytes -= entry.payload.len();
        }
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
    }
}

/// Metadata line preceding the payload in every disk entry.
#[derive(Debug, Serialize, Deserialize)]
struct DiskMeta {
    integrity: String,
    compressed: bool,
    /// Unix seconds; absent means no expiry.
    expires_at: Option<i64>,
    #[serde(default)]
    tombstone: bool,
}

/// Two-tier cache; safe for concurrent callers.
pub struct PackCache {
    config: CacheConfig,
    mem: Mutex<MemTier>,
    inflight: Mutex<HashMap<String, Arc<Flight>>>,
}

#[derive(Default)]
struct Flight {
    done: Mutex<bool>,
    cv: Condvar,
}

fn compound_key(ns: &str, key: &str) -> String {
    format!("{ns}\u{1}{key}")
}

impl PackCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            mem: Mutex::new(MemTier::default()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a value, consulting memory then disk.
    pub fn get(&self, ns: &str, key: &str) -> Option<Value> {
        let ck = compound_key(ns, key);

        {
            let mut mem = self.mem.lock().expect("cache poisoned");
            let state = mem.entries.get(&ck).map(|entry| {
                (
                    entry.expires_at.is_none_or(|t| Instant::now() < t),
                    entry.payload.clone(),
                )
            });
            match state {
                Some((true, payload)) => {
                    mem.touch(&ck);
                    mem.stats.hits += 1;
                    return serde_json::from_slice(&payload).ok();
                }
                Some((false, _)) => {
                    mem.remove(&ck);
                    mem.stats.expirations += 1;
                }
                None => {}
            }
        }

        if let Some(value) = self.disk_get(ns, key) {
            // Promote to the memory tier with no extra TTL; the disk entry
            // keeps the authoritative expiry.
            self.mem_insert(&ck, serde_json::to_vec(&value).ok()?, None);
            let mut mem = self.mem.lock().expect("cache poisoned");
            mem.stats.hits += 1;
            return Some(value);
        }

        let mut mem = self.mem.lock().expect("cache poisoned");
        mem.stats.misses += 1;
        None
    }

    /// Store a value in both tiers. `ttl` defaults from the config.
    pub fn set(&self, ns: &str, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let payload = serde_json::to_vec(value).context("serializing cache value")?;

        let ck = compound_key(ns, key);
        self.mem_insert(&ck, payload.clone(), Some(Instant::now() + ttl));
        self.disk_set(ns, key, &payload, ttl)?;
        Ok(())
    }

    /// Drop entries: everything, a namespace, or one key.
    pub fn invalidate(&self, ns: Option<&str>, key: Option<&str>) {
        let mut mem = self.mem.lock().expect("cache poisoned");
        match (ns, key) {
            (Some(ns), Some(key)) => {
                let ck = compound_key(ns, key);
                mem.remove(&ck);
                drop(mem);
                self.disk_tombstone(ns, key);
            }
            (Some(ns), None) => {
                let prefix = compound_key(ns, "");
                let keys: Vec<String> = mem
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect();
                for k in keys {
                    mem.remove(&k);
                }
                drop(mem);
                self.disk_tombstone_ns(ns);
            }
            (None, _) => {
                mem.entries.clear();
                mem.recency.clear();
                mem.bytes = 0;
                drop(mem);
                if let Some(dir) = &self.config.disk_dir {
                    for ns in [NS_PACK_INFO, NS_PACK_RESOLVE, NS_REGISTRY_FETCH, NS_FORGE_PACK] {
                        let _ = fs::remove_dir_all(dir.join(ns));
                    }
                }
            }
        }
    }

    /// Current counters plus tier sizes.
    pub fn stats(&self) -> CacheStats {
        let mem = self.mem.lock().expect("cache poisoned");
        let mut stats = mem.stats.clone();
        stats.memory_entries = mem.entries.len();
        stats.memory_bytes = mem.bytes;
        stats
    }

    /// Pre-load disk entries into the memory tier.
    pub fn warmup(&self, keys: &[(&str, &str)]) {
        for (ns, key) in keys {
            let _ = self.get(ns, key);
        }
    }

    /// Reclaim tombstoned and expired disk entries. Returns how many files
    /// were removed.
    pub fn compact(&self) -> Result<usize> {
        let Some(dir) = &self.config.disk_dir else {
            return Ok(0);
        };
        let mut removed = 0;
        let now = Utc::now().timestamp();
        for ns_entry in fs::read_dir(dir).into_iter().flatten().flatten() {
            if !ns_entry.path().is_dir() {
                continue;
            }
            for file in fs::read_dir(ns_entry.path()).into_iter().flatten().flatten() {
                let path = file.path();
                let dead = match read_disk_meta(&path) {
                    Some(meta) => meta.tombstone || meta.expires_at.is_some_and(|t| t <= now),
                    // Unreadable entries are garbage either way.
                    None => true,
                };
                if dead && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        debug!(target: "gitvan::cache", removed, "compacted disk cache");
        Ok(removed)
    }

    /// Look up `key`, calling `fetch` on a miss. Concurrent misses for the
    /// same key block on the first caller's fetch and then observe its
    /// result instead of fetching again.
    pub fn get_or_fetch(
        &self,
        ns: &str,
        key: &str,
        ttl: Option<Duration>,
        fetch: impl FnOnce() -> Result<Value>,
    ) -> Result<Value> {
        if let Some(v) = self.get(ns, key) {
            return Ok(v);
        }

        let ck = compound_key(ns, key);
        let (flight, leader) = {
            let mut inflight = self.inflight.lock().expect("inflight poisoned");
            match inflight.get(&ck) {
                Some(f) => (Arc::clone(f), false),
                None => {
                    let f = Arc::new(Flight::default());
                    inflight.insert(ck.clone(), Arc::clone(&f));
                    (f, true)
                }
            }
        };

        if !leader {
            let mut done = flight.done.lock().expect("flight poisoned");
            while !*done {
                done = flight.cv.wait(done).expect("flight poisoned");
            }
            // The leader either cached the value or failed; re-check and
            // fall through to a fresh fetch on failure.
            if let Some(v) = self.get(ns, key) {
                return Ok(v);
            }
            return fetch();
        }

        let result = fetch();
        if let Ok(value) = &result {
            let _ = self.set(ns, key, value, ttl);
        }

        {
            let mut inflight = self.inflight.lock().expect("inflight poisoned");
            inflight.remove(&ck);
        }
        let mut done = flight.done.lock().expect("flight poisoned");
        *done = true;
        flight.cv.notify_all();
        drop(done);

        result
    }

    fn mem_insert(&self, ck: &str, payload: Vec<u8>, expires_at: Option<Instant>) {
        let mut mem = self.mem.lock().expect("cache poisoned");
        mem.remove(ck);

        let size = payload.len();
        // An entry larger than the whole tier never goes to memory.
        if size > self.config.memory_capacity_bytes {
            return;
        }

        while mem.bytes + size > self.config.memory_capacity_bytes {
            let Some(victim) = mem.recency.pop_front() else {
                break;
            };
            if let Some(entry) = mem.entries.remove(&victim) {
                mem.bytes -= entry.payload.len();
                mem.stats.evictions += 1;
            }
        }

        mem.entries.insert(ck.to_string(), MemEntry { payload, expires_at });
        mem.bytes += size;
        mem.recency.push_back(ck.to_string());
    }

    fn disk_path(&self, ns: &str, key: &str) -> Option<PathBuf> {
        let dir = self.config.disk_dir.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        Some(dir.join(ns).join(hex::encode(hasher.finalize())))
    }

    fn disk_set(&self, ns: &str, key: &str, payload: &[u8], ttl: Duration) -> Result<()> {
        let Some(path) = self.disk_path(ns, key) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating cache dir {}", parent.display()))?;
        }

        let compressed = payload.len() > self.config.compression_threshold;
        let body = if compressed {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(payload).context("gzip cache payload")?;
            enc.finish().context("gzip cache payload")?
        } else {
            payload.to_vec()
        };

        let mut hasher = Sha256::new();
        hasher.update(payload);
        let meta = DiskMeta {
            integrity: hex::encode(hasher.finalize()),
            compressed,
            expires_at: Some(Utc::now().timestamp() + ttl.as_secs() as i64),
            tombstone: false,
        };

        let mut out = serde_json::to_vec(&meta).context("serialize cache meta")?;
        out.push(b'\n');
        out.extend_from_slice(&body);

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &out).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }

    fn disk_get(&self, ns: &str, key: &str) -> Option<Value> {
        let path = self.disk_path(ns, key)?;
        let raw = fs::read(&path).ok()?;
        let split = raw.iter().position(|&b| b == b'\n')?;
        let meta: DiskMeta = serde_json::from_slice(&raw[..split]).ok()?;

        if meta.tombstone {
            return None;
        }
        if meta.expires_at.is_some_and(|t| t <= Utc::now().timestamp()) {
            return None;
        }

        let body = &raw[split + 1..];
        let payload = if meta.compressed {
            let mut dec = GzDecoder::new(body);
            let mut buf = Vec::new();
            dec.read_to_end(&mut buf).ok()?;
            buf
        } else {
            body.to_vec()
        };

        let mut hasher = Sha256::new();
        hasher.update(&payload);
        if hex::encode(hasher.finalize()) != meta.integrity {
            debug!(target: "gitvan::cache", ns, key, "integrity mismatch; dropping entry");
            let mut mem = self.mem.lock().expect("cache poisoned");
            mem.stats.integrity_failures += 1;
            drop(mem);
            let _ = fs::remove_file(&path);
            return None;
        }

        serde_json::from_slice(&payload).ok()
    }

    fn disk_tombstone(&self, ns: &str, key: &str) {
        let Some(path) = self.disk_path(ns, key) else {
            return;
        };
        if let Some(mut meta) = read_disk_meta(&path) {
            meta.tombstone = true;
            if let Ok(mut out) = serde_json::to_vec(&meta) {
                out.push(b'\n');
                let _ = fs::write(&path, out);
            }
        }
    }

    fn disk_tombstone_ns(&self, ns: &str) {
        let Some(dir) = self.config.disk_dir.as_ref() else {
            return;
        };
        for file in fs::read_dir(dir.join(ns)).into_iter().flatten().flatten() {
            let path = file.path();
            if let Some(mut meta) = read_disk_meta(&path) {
                meta.tombstone = true;
                if let Ok(mut out) = serde_json::to_vec(&meta) {
                    out.push(b'\n');
                    let _ = fs::write(&path, out);
                }
            }
        }
    }
}

fn read_disk_meta(path: &Path) -> Option<DiskMeta> {
    let raw = fs::read(path).ok()?;
    let split = raw.iter().position(|&b| b == b'\n')?;
    serde_json::from_slice(&raw[..split]).ok()
}
