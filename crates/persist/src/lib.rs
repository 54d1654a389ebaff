//! helmsync persistence: a tiny key/value store holding whole snapshots.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Key/value contract. A value is an opaque string written and read whole.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Read `key` as JSON, or `T::default()` when the key was never written.
pub fn get_or_default<T: DeserializeOwned + Default>(store: &dyn Store, key: &str) -> Result<T> {
    match store.get(key)? {
        Some(raw) => serde_json::from_str(&raw).with_context(|| format!("decoding stored value for {}", key)),
        None => Ok(T::default()),
    }
}

/// Serialize `value` as JSON and overwrite `key`.
pub fn set_json<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value).with_context(|| format!("encoding value for {}", key))?;
    store.set(key, &raw)
}

/// SQLite-backed store. Simple, synchronous; one upsert per pass.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let started = std::time::Instant::now();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                ts    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating kv table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Seconds since epoch of the last write to `key`.
    pub fn updated_at(&self, key: &str) -> Result<Option<i64>> {
        let db = self.db.lock().map_err(|_| anyhow!("sqlite store lock poisoned"))?;
        let mut stmt = db.prepare("SELECT ts FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        let ts = match rows.next()? {
            Some(row) => Some(row.get::<_, i64>(0)?),
            None => None,
        };
        Ok(ts)
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let started = std::time::Instant::now();
        let db = self.db.lock().map_err(|_| anyhow!("sqlite store lock poisoned"))?;
        let mut stmt = db.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        let out = match rows.next()? {
            Some(row) => Some(row.get::<_, String>(0)?),
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(key, found = out.is_some(), "persist: get");
        Ok(out)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().map_err(|_| anyhow!("sqlite store lock poisoned"))?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO kv(key, value, ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, ts = excluded.ts",
            (key, value, now_ts()),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.map.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.map.lock().map_err(|_| anyhow!("memory store lock poisoned"))?;
        map.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn temp_db() -> std::path::PathBuf {
        let f = format!("helmsync-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        std::env::temp_dir().join(f)
    }

    #[test]
    fn sqlite_set_overwrites_and_survives_reopen() {
        let path = temp_db();
        {
            let s = SqliteStore::open(&path).unwrap();
            assert_eq!(s.get("live-releases").unwrap(), None);
            s.set("live-releases", "{\"a\":1}").unwrap();
            s.set("live-releases", "{\"a\":2}").unwrap();
            assert!(s.updated_at("live-releases").unwrap().is_some());
        }
        let s = SqliteStore::open(&path).unwrap();
        assert_eq!(s.get("live-releases").unwrap().as_deref(), Some("{\"a\":2}"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn json_helpers_default_when_missing() {
        let s = MemoryStore::new();
        let empty: BTreeMap<String, u32> = get_or_default(&s, "k").unwrap();
        assert!(empty.is_empty());
        let mut m = BTreeMap::new();
        m.insert("x".to_string(), 3u32);
        set_json(&s, "k", &m).unwrap();
        let back: BTreeMap<String, u32> = get_or_default(&s, "k").unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn corrupt_value_is_an_error() {
        let s = MemoryStore::new();
        s.set("k", "not json").unwrap();
        let res: Result<BTreeMap<String, u32>> = get_or_default(&s, "k");
        assert!(res.is_err());
    }
}
