use std::sync::Arc;

use herald_common::keys;
use herald_kv::KvStore;
use tracing::warn;

/// KV-backed counters. Increments are read-modify-write and therefore lossy
/// under concurrency; these are operator-facing tallies, not billing data.
#[derive(Clone)]
pub struct Metrics {
    kv: Arc<dyn KvStore>,
}

impl Metrics {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Best-effort increment. Failures are logged and swallowed.
    pub async fn incr(&self, name: &str) {
        let key = keys::metric(name);
        let next = match self.kv.get(&key).await {
            Ok(v) => v.and_then(|s| s.parse::<u64>().ok()).unwrap_or(0) + 1,
            Err(e) => {
                warn!(metric = name, error = %e, "Failed to read metric");
                return;
            }
        };
        if let Err(e) = self.kv.put(&key, &next.to_string(), None).await {
            warn!(metric = name, error = %e, "Failed to write metric");
        }
    }

    /// All counters, sorted by name.
    pub async fn all(&self) -> Vec<(String, u64)> {
        let prefix = keys::metric("");
        let keys = match self.kv.list(&prefix, 1000).await {
            Ok(k) => k,
            Err(e) => {
                warn!(error = %e, "Failed to list metrics");
                return Vec::new();
            }
        };
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(Some(v)) = self.kv.get(&key).await {
                let name = key.trim_start_matches(&prefix).to_string();
                out.push((name, v.parse().unwrap_or(0)));
            }
        }
        out
    }

    pub async fn clear(&self) -> usize {
        let prefix = keys::metric("");
        let keys = self.kv.list(&prefix, 1000).await.unwrap_or_default();
        let mut removed = 0;
        for key in &keys {
            if self.kv.delete(key).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}
