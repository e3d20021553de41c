//! Embedding cache (C2).
//!
//! A bounded, TTL-expiring LRU map from `hash(model_id || text)` to a
//! computed vector. Reads and writes go through a single mutex (the
//! teacher's single-guarded-structure pattern, generalised from the
//! embedding/cache module it never had to the cache this spec requires);
//! the persistence writer holds that same lock while snapshotting so a
//! concurrent insert can never race a save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One cached vector plus the bookkeeping needed for LRU + TTL eviction.
struct Entry {
    vector: Vec<f32>,
    inserted_at: Instant,
    /// Monotonically increasing counter; the smallest value is evicted
    /// first under `max_size` pressure.
    last_used: u64,
}

/// Config for [`EmbeddingCache`] (§6: `cache:{enabled,max_size,ttl,persistent,persistent_path}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub persistent_path: Option<PathBuf>,
}

fn default_max_size() -> usize {
    10_000
}
fn default_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_max_size(),
            ttl_secs: default_ttl_secs(),
            persistent: false,
            persistent_path: None,
        }
    }
}

/// On-disk snapshot record, one per cached key.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    vector: Vec<f32>,
    inserted_at_unix: i64,
}

struct Inner {
    map: HashMap<String, Entry>,
    clock: u64,
}

/// Bounded TTL+LRU embedding cache, optionally persisted to disk.
pub struct EmbeddingCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

/// Compute the cache key for `(model_id, text)` per §4.2.
pub fn cache_key(model_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(b"||");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl EmbeddingCache {
    pub fn new(config: CacheConfig) -> Self {
        let mut cache = Self {
            config,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                clock: 0,
            }),
        };
        if cache.config.persistent {
            if let Some(path) = cache.config.persistent_path.clone() {
                let _ = cache.load(&path);
            }
        }
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Fetch a cached vector, honouring TTL. Expired entries are dropped
    /// on read rather than lazily swept.
    pub fn get(&self, model_id: &str, text: &str) -> Option<Vec<f32>> {
        if !self.config.enabled {
            return None;
        }
        let key = cache_key(model_id, text);
        let mut inner = self.inner.lock().unwrap();
        let ttl = Duration::from_secs(self.config.ttl_secs);
        let expired = inner
            .map
            .get(&key)
            .map(|e| e.inserted_at.elapsed() > ttl)
            .unwrap_or(false);
        if expired {
            inner.map.remove(&key);
            return None;
        }
        inner.clock += 1;
        let clock = inner.clock;
        if let Some(entry) = inner.map.get_mut(&key) {
            entry.last_used = clock;
            return Some(entry.vector.clone());
        }
        None
    }

    /// Insert a vector, evicting the least-recently-used entry if the
    /// cache is at `max_size`.
    pub fn put(&self, model_id: &str, text: &str, vector: Vec<f32>) {
        if !self.config.enabled {
            return;
        }
        let key = cache_key(model_id, text);
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let clock = inner.clock;
        if inner.map.len() >= self.config.max_size && !inner.map.contains_key(&key) {
            if let Some(lru_key) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&lru_key);
            }
        }
        inner.map.insert(
            key,
            Entry {
                vector,
                inserted_at: Instant::now(),
                last_used: clock,
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the whole map to `path` while holding the lock, so a
    /// concurrent writer can never observe a torn write.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let records: Vec<PersistedEntry> = inner
            .map
            .iter()
            .map(|(k, e)| PersistedEntry {
                key: k.clone(),
                vector: e.vector.clone(),
                inserted_at_unix: chrono::Utc::now().timestamp()
                    - now.duration_since(e.inserted_at).as_secs() as i64,
            })
            .collect();
        let json = serde_json::to_vec(&records).unwrap_or_default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
    }

    /// Load a snapshot, dropping expired entries and trimming the rest to
    /// `max_size` keeping the most recently inserted.
    pub fn load(&mut self, path: &Path) -> std::io::Result<()> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let records: Vec<PersistedEntry> = serde_json::from_slice(&bytes).unwrap_or_default();
        let now_unix = chrono::Utc::now().timestamp();
        let ttl = self.config.ttl_secs as i64;

        let mut fresh: Vec<PersistedEntry> = records
            .into_iter()
            .filter(|r| now_unix - r.inserted_at_unix <= ttl)
            .collect();
        fresh.sort_by_key(|r| std::cmp::Reverse(r.inserted_at_unix));
        fresh.truncate(self.config.max_size);

        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.clock = 0;
        for (i, r) in fresh.into_iter().enumerate() {
            inner.clock += 1;
            inner.map.insert(
                r.key,
                Entry {
                    vector: r.vector,
                    inserted_at: Instant::now(),
                    last_used: i as u64,
                },
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_size: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            max_size,
            ttl_secs: 3600,
            persistent: false,
            persistent_path: None,
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let cache = EmbeddingCache::new(cfg(10));
        cache.put("m1", "hello", vec![1.0, 2.0]);
        assert_eq!(cache.get("m1", "hello"), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn disabled_cache_never_hits() {
        let mut c = cfg(10);
        c.enabled = false;
        let cache = EmbeddingCache::new(c);
        cache.put("m1", "hello", vec![1.0]);
        assert_eq!(cache.get("m1", "hello"), None);
    }

    #[test]
    fn different_models_do_not_collide() {
        let cache = EmbeddingCache::new(cfg(10));
        cache.put("m1", "x", vec![1.0]);
        cache.put("m2", "x", vec![2.0]);
        assert_eq!(cache.get("m1", "x"), Some(vec![1.0]));
        assert_eq!(cache.get("m2", "x"), Some(vec![2.0]));
    }

    #[test]
    fn lru_eviction_drops_least_recently_used() {
        let cache = EmbeddingCache::new(cfg(2));
        cache.put("m", "a", vec![1.0]);
        cache.put("m", "b", vec![2.0]);
        // touch "a" so "b" becomes LRU
        let _ = cache.get("m", "a");
        cache.put("m", "c", vec![3.0]);
        assert_eq!(cache.get("m", "b"), None);
        assert!(cache.get("m", "a").is_some());
        assert!(cache.get("m", "c").is_some());
    }

    #[test]
    fn ttl_expiry_drops_on_read() {
        let mut c = cfg(10);
        c.ttl_secs = 0;
        let cache = EmbeddingCache::new(c);
        cache.put("m", "a", vec![1.0]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("m", "a"), None);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = EmbeddingCache::new(cfg(10));
        cache.put("m", "a", vec![1.0, 2.0, 3.0]);
        cache.save(&path).unwrap();

        let mut cache2 = EmbeddingCache::new(cfg(10));
        cache2.load(&path).unwrap();
        assert_eq!(cache2.get("m", "a"), Some(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn cache_key_is_stable_and_model_scoped() {
        assert_eq!(cache_key("m1", "x"), cache_key("m1", "x"));
        assert_ne!(cache_key("m1", "x"), cache_key("m2", "x"));
    }
}
