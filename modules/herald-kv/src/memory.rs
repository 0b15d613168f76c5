use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::KvStore;

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory store for tests and simulation. No database required.
///
/// Carries a logical clock offset so tests can expire TTLs without
/// sleeping: `advance()` shifts "now" forward for every subsequent read.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    skew: Mutex<chrono::Duration>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            skew: Mutex::new(chrono::Duration::zero()),
        }
    }

    /// Shift the store's notion of now forward.
    pub fn advance(&self, by: Duration) {
        let mut skew = self.skew.lock().unwrap();
        *skew += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Number of live entries (for test assertions).
    pub fn len(&self) -> usize {
        let now = self.now();
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.expires_at.is_none_or(|t| t > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + *self.skew.lock().unwrap()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now();
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at.is_none_or(|t| t > now))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| self.now() + d);
        self.entries.lock().unwrap().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let now = self.now();
        let entries = self.entries.lock().unwrap();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at.is_none_or(|t| t > now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}
