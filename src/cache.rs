//! # Cache Store
//! TTL key/value store used for provider fallback reads and for the snapshot
//! checkpoint. Nothing here returns an error: a broken cache only means a
//! miss, and I/O problems are logged.
//!
//! Two backends:
//! - [`MemoryCache`]: process-local map.
//! - [`FileCache`]: one JSON file per key (tmp-file + rename), survives restarts.
//!
//! Expired entries are kept until overwritten so that [`CacheStore::get_stale`]
//! can still serve them after a provider failure.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::model::EmissionFactor;

/// Key of the persisted snapshot checkpoint.
pub const CHECKPOINT_KEY: &str = "factors:checkpoint";

pub trait CacheStore: Send + Sync {
    /// Value if present and not yet expired.
    fn get(&self, key: &str) -> Option<serde_json::Value>;
    /// Value if present, regardless of expiry.
    fn get_stale(&self, key: &str) -> Option<serde_json::Value>;
    /// Last write wins.
    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
    fn remove(&self, key: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    expires_at: DateTime<Utc>,
    value: serde_json::Value,
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ------------------------------------------------------------
// In-memory backend
// ------------------------------------------------------------

pub struct MemoryCache {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now();
        let g = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        g.get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    fn get_stale(&self, key: &str) -> Option<serde_json::Value> {
        let g = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        g.get(key).map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let entry = Entry {
            expires_at: expiry(self.clock.now(), ttl),
            value,
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

// ------------------------------------------------------------
// File backend
// ------------------------------------------------------------

pub struct FileCache {
    clock: SharedClock,
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>, clock: SharedClock) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cache dir not created");
        }
        Self { clock, dir }
    }

    /// `_` only ever starts an escape, so distinct keys get distinct files.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len());
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' {
                name.push(b as char);
            } else {
                let _ = write!(name, "_{b:02X}");
            }
        }
        self.dir.join(format!("{name}.json"))
    }

    fn read_entry(&self, key: &str) -> Option<Entry> {
        let raw = fs::read_to_string(self.path_for(key)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(e) => Some(e),
            Err(e) => {
                tracing::warn!(key, error = %e, "unreadable cache entry");
                None
            }
        }
    }
}

/// Each write stages into its own tmp file, so concurrent writers of one key
/// never share a staging path.
fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()));
    let staged = fs::File::create(&tmp)
        .and_then(|mut f| f.write_all(body))
        .and_then(|_| fs::rename(&tmp, path));
    if staged.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    staged
}

impl CacheStore for FileCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now();
        self.read_entry(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value)
    }

    fn get_stale(&self, key: &str) -> Option<serde_json::Value> {
        self.read_entry(key).map(|e| e.value)
    }

    fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let entry = Entry {
            expires_at: expiry(self.clock.now(), ttl),
            value,
        };
        let body = match serde_json::to_vec(&entry) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache entry not serializable");
                return;
            }
        };
        if let Err(e) = write_atomic(&self.path_for(key), &body) {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    fn remove(&self, key: &str) {
        let _ = fs::remove_file(self.path_for(key));
    }
}

// ------------------------------------------------------------
// Typed helpers
// ------------------------------------------------------------

pub fn get_typed<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Option<T> {
    cache.get(key).and_then(|v| serde_json::from_value(v).ok())
}

pub fn get_stale_typed<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Option<T> {
    cache.get_stale(key).and_then(|v| serde_json::from_value(v).ok())
}

pub fn set_typed<T: Serialize>(cache: &dyn CacheStore, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_value(value) {
        Ok(v) => cache.set(key, v, ttl),
        Err(e) => tracing::warn!(key, error = %e, "cache value not serializable"),
    }
}

pub fn save_checkpoint(
    cache: &dyn CacheStore,
    factors: &HashMap<String, EmissionFactor>,
    ttl: Duration,
) {
    set_typed(cache, CHECKPOINT_KEY, factors, ttl);
}

pub fn load_checkpoint(cache: &dyn CacheStore) -> Option<HashMap<String, EmissionFactor>> {
    get_typed(cache, CHECKPOINT_KEY)
}
