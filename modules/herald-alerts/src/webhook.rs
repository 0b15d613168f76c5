//! Webhook delivery with fallback, cooldown, pacing and penalty discipline.
//!
//! Each channel has an ordered endpoint list; a send walks the list until
//! one endpoint accepts the batch or every endpoint is exhausted or cooled
//! down. All pacing state (last-send stamps, cooldowns, penalties) lives in
//! the KV store so overlapping invocations observe each other.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use herald_common::types::short_hash;
use herald_common::{keys, Config};
use herald_kv::{try_claim, KvStore};

use crate::metrics::Metrics;

/// Minimum spacing between any two successful sends, across all endpoints.
const GLOBAL_FLOOR_MS: i64 = 6000;
/// Embeds per POST.
const CHUNK_SIZE: usize = 10;
/// Pause between consecutive chunks of one batch.
const CHUNK_GAP: Duration = Duration::from_millis(2500);
/// Cooldown applied on network errors and 5xx without Retry-After.
const SHORT_COOLDOWN_SECS: f64 = 5.0;
const MAX_PENALTY: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    UnderAttack,
    Capture,
    Players,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::UnderAttack => "ua",
            Channel::Capture => "capture",
            Channel::Players => "players",
        }
    }
}

/// One channel's delivery target: ordered endpoints plus the display name
/// used in the payload envelope.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel: Channel,
    pub endpoints: Vec<String>,
    pub username: String,
}

impl ChannelConfig {
    pub fn ua(config: &Config) -> Self {
        Self {
            channel: Channel::UnderAttack,
            endpoints: config.ua_webhooks.clone(),
            username: config.webhook_username.clone(),
        }
    }

    pub fn capture(config: &Config) -> Self {
        Self {
            channel: Channel::Capture,
            endpoints: config.capture_webhooks.clone(),
            username: config.webhook_username.clone(),
        }
    }

    pub fn players(config: &Config) -> Self {
        Self {
            channel: Channel::Players,
            endpoints: config.players_webhooks.clone(),
            username: config.webhook_username.clone(),
        }
    }
}

/// What one POST attempt came back with, normalized across header and body
/// variants of the rate-limit protocol.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    /// `Retry-After` header or JSON body `retry_after`, in seconds.
    pub retry_after_secs: Option<f64>,
    /// `X-RateLimit-Reset-After`, in seconds.
    pub reset_after_secs: Option<f64>,
    /// `X-RateLimit-Remaining`.
    pub remaining: Option<i64>,
    /// `X-RateLimit-Global` header or JSON body `global: true`.
    pub global: bool,
    /// First bytes of the response body, for logs.
    pub body_prefix: String,
}

impl TransportResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 429, or Cloudflare's 1015 ban page which can arrive under other
    /// status codes.
    pub fn rate_limited(&self) -> bool {
        self.status == 429 || self.body_prefix.contains("error code: 1015")
    }
}

/// Seam for the actual HTTP POST. Tests substitute a recording double.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Network-level failures are `Err`; any HTTP response is `Ok`.
    async fn post(&self, url: &str, payload: &Value) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, url: &str, payload: &Value) -> Result<TransportResponse> {
        let resp = self.client.post(url).json(payload).send().await?;

        let status = resp.status().as_u16();
        let header_f64 = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
        };
        let retry_after = header_f64("retry-after");
        let reset_after = header_f64("x-ratelimit-reset-after");
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let global_header = resp
            .headers()
            .get("x-ratelimit-global")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let body = resp.text().await.unwrap_or_default();
        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        let body_retry = parsed
            .as_ref()
            .and_then(|v| v.get("retry_after"))
            .and_then(|v| v.as_f64());
        let body_global = parsed
            .as_ref()
            .and_then(|v| v.get("global"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(TransportResponse {
            status,
            retry_after_secs: retry_after.or(body_retry),
            reset_after_secs: reset_after,
            remaining,
            global: global_header || body_global,
            body_prefix: body.chars().take(200).collect(),
        })
    }
}

enum SendOutcome {
    Sent,
    NextEndpoint,
    AbortAll,
}

/// Delivers embed batches for all channels.
#[derive(Clone)]
pub struct Dispatcher {
    kv: Arc<dyn KvStore>,
    transport: Arc<dyn WebhookTransport>,
    metrics: Metrics,
    base_interval_ms: u64,
}

impl Dispatcher {
    pub fn new(
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn WebhookTransport>,
        base_interval_ms: u64,
    ) -> Self {
        let metrics = Metrics::new(kv.clone());
        Self {
            kv,
            transport,
            metrics,
            base_interval_ms,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Deliver `embeds` to `cfg`'s endpoint list, chunked by 10 with a short
    /// pause between chunks. Returns how many embeds were delivered; a
    /// failed chunk stops the batch so callers can retry the tail next tick.
    pub async fn deliver(&self, cfg: &ChannelConfig, embeds: &[Value]) -> usize {
        if embeds.is_empty() || cfg.endpoints.is_empty() {
            return 0;
        }

        // Serialize overlapping invocations against the same channel.
        let gate = keys::channel_gate(cfg.channel.as_str());
        match try_claim(&*self.kv, &gate, Duration::from_secs(keys::GATE_TTL)).await {
            Ok(true) => {}
            Ok(false) => {
                info!(channel = cfg.channel.as_str(), "Channel gate held elsewhere, deferring");
                return 0;
            }
            Err(e) => {
                warn!(channel = cfg.channel.as_str(), error = %e, "Gate check failed");
            }
        }

        let mut delivered = 0;
        for (i, chunk) in embeds.chunks(CHUNK_SIZE).enumerate() {
            if i > 0 {
                tokio::time::sleep(CHUNK_GAP).await;
            }
            if self.send_chunk(cfg, chunk).await {
                delivered += chunk.len();
            } else {
                break;
            }
        }

        if let Err(e) = self.kv.delete(&gate).await {
            warn!(channel = cfg.channel.as_str(), error = %e, "Gate release failed");
        }

        delivered
    }

    async fn send_chunk(&self, cfg: &ChannelConfig, embeds: &[Value]) -> bool {
        let payload = json!({
            "username": cfg.username,
            "embeds": embeds,
        });

        for url in &cfg.endpoints {
            match self.try_endpoint(cfg.channel, url, &payload).await {
                SendOutcome::Sent => return true,
                SendOutcome::NextEndpoint => continue,
                SendOutcome::AbortAll => return false,
            }
        }
        false
    }

    async fn try_endpoint(&self, channel: Channel, url: &str, payload: &Value) -> SendOutcome {
        let hash = short_hash(url);
        let now = Utc::now();

        // 1. Global cooldown blocks everything.
        if let Some(until) = self.cooldown_until(keys::GLOBAL_COOLDOWN_UNTIL).await {
            if until > now {
                info!(channel = channel.as_str(), until = %until, "Global cooldown active");
                return SendOutcome::AbortAll;
            }
        }

        // 2. Per-endpoint cooldown falls through to the next endpoint.
        if let Some(until) = self.cooldown_until(&keys::endpoint_cooldown(&hash)).await {
            if until > now {
                self.metrics
                    .incr(&format!("{}:skipped_cooldown", channel.as_str()))
                    .await;
                return SendOutcome::NextEndpoint;
            }
        }

        // 3. Global pacing floor, then per-endpoint pacing with penalty.
        let now_ms = Utc::now().timestamp_millis();
        let global_last = self.stamp_ms(keys::GLOBAL_LAST).await;
        let wait = pacing_wait_ms(global_last, now_ms, GLOBAL_FLOOR_MS);
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }

        let penalty = self.penalty(&hash).await;
        let interval = endpoint_interval_ms(self.base_interval_ms, penalty) as i64;
        let now_ms = Utc::now().timestamp_millis();
        let endpoint_last = self.stamp_ms(&keys::endpoint_last(&hash)).await;
        let wait = pacing_wait_ms(endpoint_last, now_ms, interval);
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        }

        // 4. Jitter so synchronized invocations do not stampede.
        let jitter = rand::rng().random_range(200..700);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        // 5. POST and classify.
        let resp = match self.transport.post(url, payload).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(channel = channel.as_str(), error = %e, "Webhook network error");
                self.set_cooldown(&hash, SHORT_COOLDOWN_SECS).await;
                self.bump_penalty(&hash).await;
                return SendOutcome::NextEndpoint;
            }
        };

        if resp.rate_limited() {
            let secs = resp
                .retry_after_secs
                .or(resp.reset_after_secs)
                .unwrap_or(SHORT_COOLDOWN_SECS);
            warn!(
                channel = channel.as_str(),
                secs,
                global = resp.global,
                "Webhook rate limited"
            );
            if resp.global {
                self.set_global_cooldown(secs).await;
            }
            self.set_cooldown(&hash, secs).await;
            self.bump_penalty(&hash).await;
            self.metrics
                .incr(&format!("{}:rate_limited", channel.as_str()))
                .await;
            return SendOutcome::NextEndpoint;
        }

        if (500..600).contains(&resp.status) {
            let secs = resp.retry_after_secs.unwrap_or(SHORT_COOLDOWN_SECS);
            warn!(channel = channel.as_str(), status = resp.status, "Webhook server error");
            self.set_cooldown(&hash, secs).await;
            self.bump_penalty(&hash).await;
            return SendOutcome::NextEndpoint;
        }

        if !resp.ok() {
            warn!(
                channel = channel.as_str(),
                status = resp.status,
                body = %resp.body_prefix,
                "Webhook rejected payload"
            );
            return SendOutcome::NextEndpoint;
        }

        // Success. Proactively cool down when the bucket is nearly drained.
        if resp.remaining.is_some_and(|r| r <= 1) {
            if let Some(secs) = resp.reset_after_secs {
                self.set_cooldown(&hash, secs).await;
            }
        }

        let stamp = Utc::now().timestamp_millis().to_string();
        let ttl = Some(Duration::from_secs(keys::SEND_STAMP_TTL));
        let _ = self.kv.put(&keys::endpoint_last(&hash), &stamp, ttl).await;
        let _ = self.kv.put(keys::GLOBAL_LAST, &stamp, ttl).await;
        let _ = self.kv.delete(&keys::endpoint_penalty(&hash)).await;
        self.metrics.incr(&format!("{}:sent", channel.as_str())).await;
        SendOutcome::Sent
    }

    async fn cooldown_until(&self, key: &str) -> Option<DateTime<Utc>> {
        let value = self.kv.get(key).await.ok()??;
        DateTime::parse_from_rfc3339(&value)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    async fn stamp_ms(&self, key: &str) -> Option<i64> {
        self.kv.get(key).await.ok()?.and_then(|v| v.parse().ok())
    }

    async fn penalty(&self, hash: &str) -> u32 {
        self.kv
            .get(&keys::endpoint_penalty(hash))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<u32>().ok())
            .map(|p| p.min(MAX_PENALTY))
            .unwrap_or(0)
    }

    async fn bump_penalty(&self, hash: &str) {
        let next = (self.penalty(hash).await + 1).min(MAX_PENALTY);
        let ttl = Some(Duration::from_secs(keys::PENALTY_TTL));
        if let Err(e) = self
            .kv
            .put(&keys::endpoint_penalty(hash), &next.to_string(), ttl)
            .await
        {
            warn!(error = %e, "Failed to bump penalty");
        }
    }

    async fn set_cooldown(&self, hash: &str, secs: f64) {
        let secs = secs.max(1.0);
        let until = Utc::now() + chrono::Duration::milliseconds((secs * 1000.0) as i64);
        let ttl = Some(Duration::from_secs(secs.ceil() as u64));
        if let Err(e) = self
            .kv
            .put(&keys::endpoint_cooldown(hash), &until.to_rfc3339(), ttl)
            .await
        {
            warn!(error = %e, "Failed to set endpoint cooldown");
        }
    }

    async fn set_global_cooldown(&self, secs: f64) {
        let secs = secs.max(1.0);
        let until = Utc::now() + chrono::Duration::milliseconds((secs * 1000.0) as i64);
        let ttl = Some(Duration::from_secs(secs.ceil() as u64));
        if let Err(e) = self
            .kv
            .put(keys::GLOBAL_COOLDOWN_UNTIL, &until.to_rfc3339(), ttl)
            .await
        {
            warn!(error = %e, "Failed to set global cooldown");
        }
    }
}

/// How long to wait so that `now - last >= min_interval`.
fn pacing_wait_ms(last_ms: Option<i64>, now_ms: i64, min_interval_ms: i64) -> i64 {
    match last_ms {
        Some(last) => (last + min_interval_ms - now_ms).max(0),
        None => 0,
    }
}

/// Per-endpoint interval grows with the penalty counter:
/// `base · (1 + 0.5 · penalty)`.
fn endpoint_interval_ms(base_ms: u64, penalty: u32) -> u64 {
    base_ms * (2 + penalty as u64) / 2
}
