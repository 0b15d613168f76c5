use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use herald_common::HeraldError;

/// Seam for upstream page fetches (the warmap document and player profile
/// pages). Production goes through reqwest; tests serve canned HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, HeraldError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            user_agent: "UthgardHeraldBot/1.0".to_string(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, HeraldError> {
        let resp = self
            .client
            .get(url)
            .header("user-agent", &self.user_agent)
            .header("cache-control", "no-cache")
            .send()
            .await
            .map_err(|e| HeraldError::Fetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HeraldError::Fetch(format!("HTTP {status} from {url}")));
        }

        resp.text()
            .await
            .map_err(|e| HeraldError::Fetch(e.to_string()))
    }
}

/// Append the cache-defeating query param: the value changes every 30 s, so
/// intermediary caches cannot serve a stale warmap for longer than that.
pub fn cache_busted(url: &str, now: DateTime<Utc>) -> String {
    let stamp = now.timestamp().div_euclid(30);
    if url.contains('?') {
        format!("{url}&_={stamp}")
    } else {
        format!("{url}?_={stamp}")
    }
}
