//! Result cache.
//!
//! In-memory TTL cache keyed by operation and content hash. Values are stored
//! as JSON so any serializable reply can be cached; entries past their TTL
//! are dropped lazily on read or when room is needed.
//!
//! ## Usage
//!
//! ```
//! use std::time::Duration;
//! use tokio_inference_gateway::edge::{cache_key, CacheLayer};
//!
//! let cache = CacheLayer::new(1000);
//! let key = cache_key("ocr", b"image bytes");
//! cache.set(&key, &vec!["STOP".to_string()], Duration::from_secs(60));
//! let hit: Option<Vec<String>> = cache.get(&key);
//! assert_eq!(hit, Some(vec!["STOP".to_string()]));
//! ```

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheSection;

/// Hex characters of the content hash kept in a key.
const KEY_HASH_CHARS: usize = 32;

/// Cache key for `op` applied to `content`: `ai:{op}:{sha256[..32]}`.
///
/// Hashes the whole payload; callers on a cooperative scheduler should run
/// this on the blocking pool.
pub fn cache_key(op: &str, content: &[u8]) -> String {
    cache_key_parts(op, &[content])
}

/// Like [`cache_key`], hashing several byte strings in order.
///
/// Used when the result depends on more than the payload (the question asked
/// about an image, the OCR language).
pub fn cache_key_parts(op: &str, parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(KEY_HASH_CHARS);
    for byte in digest.iter().take(KEY_HASH_CHARS / 2) {
        let _ = write!(hex, "{byte:02x}");
    }
    format!("ai:{op}:{hex}")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently stored (expired ones included until swept).
    pub entries: usize,
    /// Capacity.
    pub max_entries: usize,
    /// Successful lookups.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
}

#[derive(Debug)]
struct Store {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Bounded in-memory TTL cache. Cheap to clone; clones share entries.
#[derive(Debug, Clone)]
pub struct CacheLayer {
    store: Option<Arc<Store>>,
}

impl CacheLayer {
    /// Cache holding at most `max_entries` values.
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Some(Arc::new(Store {
                entries: DashMap::new(),
                max_entries: max_entries.max(1),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            })),
        }
    }

    /// A cache that stores nothing and never hits.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Build from the `[cache]` section.
    pub fn from_section(section: &CacheSection) -> Self {
        if section.enabled {
            Self::new(section.max_entries)
        } else {
            Self::disabled()
        }
    }

    /// Whether lookups can ever hit.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Fetch and decode a live entry.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        let value = match store.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(entry) => {
                drop(entry);
                store.entries.remove(key);
                debug!(key, "cache entry expired");
                None
            }
            None => None,
        };

        let Some(value) = value else {
            store.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        match serde_json::from_value(value) {
            Ok(decoded) => {
                store.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cache hit");
                Some(decoded)
            }
            Err(e) => {
                warn!(key, error = %e, "cached value has unexpected shape, dropping");
                store.entries.remove(key);
                store.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store `value` for `ttl`, evicting if the cache is full.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "value not cacheable");
                return;
            }
        };

        if !store.entries.contains_key(key) && store.entries.len() >= store.max_entries {
            self.make_room(store);
        }
        store.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(key, ttl_secs = ttl.as_secs(), "cached");
    }

    /// Drop expired entries; if none were expired, drop the one closest to expiry.
    fn make_room(&self, store: &Store) {
        let now = Instant::now();
        let before = store.entries.len();
        store.entries.retain(|_, entry| entry.expires_at > now);
        if store.entries.len() < before {
            return;
        }
        // Collect the key first so no shard guard is held during remove.
        let victim = store
            .entries
            .iter()
            .min_by_key(|e| e.value().expires_at)
            .map(|e| e.key().clone());
        if let Some(victim) = victim {
            store.entries.remove(&victim);
            debug!(key = %victim, "cache full, evicted");
        }
    }

    /// Remove one entry.
    pub fn delete(&self, key: &str) {
        if let Some(store) = &self.store {
            store.entries.remove(key);
        }
    }

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    pub fn clear_prefix(&self, prefix: &str) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let before = store.entries.len();
        store.entries.retain(|key, _| !key.starts_with(prefix));
        before - store.entries.len()
    }

    /// Counters and size.
    pub fn stats(&self) -> CacheStats {
        match &self.store {
            Some(store) => CacheStats {
                entries: store.entries.len(),
                max_entries: store.max_entries,
                hits: store.hits.load(Ordering::Relaxed),
                misses: store.misses.load(Ordering::Relaxed),
            },
            None => CacheStats::default(),
        }
    }
}

/// Per-operation TTLs from the `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    /// Object detection results.
    pub detection: Duration,
    /// Text extraction results.
    pub ocr: Duration,
    /// Transcripts.
    pub transcription: Duration,
    /// Visual question answers.
    pub vqa: Duration,
}

impl CacheTtls {
    /// Read the TTLs from config.
    pub fn from_section(section: &CacheSection) -> Self {
        Self {
            detection: Duration::from_secs(section.ttl_detection_s),
            ocr: Duration::from_secs(section.ttl_ocr_s),
            transcription: Duration::from_secs(section.ttl_transcription_s),
            vqa: Duration::from_secs(section.ttl_vqa_s),
        }
    }
}
