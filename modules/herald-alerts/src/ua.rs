//! Under-attack transition detection.
//!
//! The banner path tracks a per-keep session in `ua:state` (timestamp while
//! flaming, `"0"` when off). One alert per rising edge; claim keys thin out
//! concurrent invocations and the minute/session stamps written after a
//! successful send are the authoritative dedupe barrier. The fallback path
//! alerts on event rows for keeps whose banner is not visible.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use herald_common::types::{EventKind, Snapshot};
use herald_common::{keys, Config};
use herald_kv::{try_claim, KvStore};

use crate::embeds::ua_embed;
use crate::webhook::{ChannelConfig, Dispatcher};

pub struct UaAlerter {
    kv: Arc<dyn KvStore>,
    dispatcher: Dispatcher,
    channel: ChannelConfig,
    config: Arc<Config>,
}

#[derive(Debug, Default)]
pub struct UaOutcome {
    pub sent: usize,
    pub skipped: usize,
    /// Falling edges and suppressed banners cleared this pass.
    pub reset: usize,
}

impl fmt::Display for UaOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ua(sent={} skipped={} reset={})",
            self.sent, self.skipped, self.reset
        )
    }
}

struct Candidate {
    keep_id: String,
    minute: i64,
    /// Event-row path (no visible banner); stamps the nobanner suppressor
    /// instead of opening a banner session.
    fallback: bool,
    embed: Value,
}

impl UaAlerter {
    pub fn new(
        kv: Arc<dyn KvStore>,
        dispatcher: Dispatcher,
        channel: ChannelConfig,
        config: Arc<Config>,
    ) -> Self {
        Self {
            kv,
            dispatcher,
            channel,
            config,
        }
    }

    /// One keep's KV trouble never blocks the rest of the map: per-keep
    /// failures are logged and the pass moves on.
    pub async fn run(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> UaOutcome {
        let mut outcome = UaOutcome::default();
        let mut candidates = Vec::new();

        for keep in &snapshot.keeps {
            if let Err(e) = self
                .banner_transition(keep.id.as_str(), keep, now, &mut candidates, &mut outcome)
                .await
            {
                warn!(keep = keep.id.as_str(), error = %e, "Banner transition check failed");
            }
        }
        if let Err(e) = self
            .event_fallback(snapshot, now, &mut candidates, &mut outcome)
            .await
        {
            warn!(error = %e, "Event fallback sweep failed");
        }

        if candidates.is_empty() {
            return outcome;
        }

        let embeds: Vec<Value> = candidates.iter().map(|c| c.embed.clone()).collect();
        let delivered = self.dispatcher.deliver(&self.channel, &embeds).await;

        for (i, candidate) in candidates.iter().enumerate() {
            if i >= delivered {
                outcome.skipped += 1;
                continue;
            }
            match self.stamp_sent(candidate, now).await {
                Ok(()) => outcome.sent += 1,
                Err(e) => {
                    // A missed stamp means a possible duplicate next tick,
                    // which the minute dedupe usually absorbs.
                    warn!(keep = candidate.keep_id.as_str(), error = %e, "Dedupe stamp failed");
                    outcome.sent += 1;
                }
            }
        }

        info!(%outcome, "Under-attack pass complete");
        outcome
    }

    async fn stamp_sent(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<()> {
        let siege = Some(Duration::from_secs(self.config.siege_window_secs()));
        let id = candidate.keep_id.as_str();
        self.kv.put(&keys::ua_session(id), "1", siege).await?;
        self.kv
            .put(
                &keys::ua_minute(id, candidate.minute),
                "1",
                Some(Duration::from_secs(keys::ALERT_UNDER_TTL)),
            )
            .await?;
        if candidate.fallback {
            self.kv.put(&keys::ua_nobanner(id), "1", siege).await?;
        } else {
            self.kv
                .put(&keys::ua_state(id), &now.timestamp().to_string(), siege)
                .await?;
        }
        Ok(())
    }

    async fn banner_transition(
        &self,
        id: &str,
        keep: &herald_common::Keep,
        now: DateTime<Utc>,
        candidates: &mut Vec<Candidate>,
        outcome: &mut UaOutcome,
    ) -> Result<()> {
        let siege = Some(Duration::from_secs(self.config.siege_window_secs()));
        let session_on = matches!(
            self.kv.get(&keys::ua_state(id)).await?.as_deref(),
            Some(v) if v != "0" && !v.is_empty()
        );

        // A fresh capture mutes the flapping banner entirely.
        if self.kv.get(&keys::ua_suppress(id)).await?.is_some() {
            if keep.header_under_attack || session_on {
                self.kv.put(&keys::ua_state(id), "0", siege).await?;
                self.kv.delete(&keys::ua_session(id)).await?;
                outcome.reset += 1;
            }
            return Ok(());
        }

        match (session_on, keep.header_under_attack) {
            // Still flaming: refresh the session TTLs, never re-notify.
            (true, true) => {
                self.kv
                    .put(&keys::ua_state(id), &now.timestamp().to_string(), siege)
                    .await?;
                if self.kv.get(&keys::ua_session(id)).await?.is_some() {
                    self.kv.put(&keys::ua_session(id), "1", siege).await?;
                }
            }
            // Falling edge.
            (true, false) => {
                self.kv.put(&keys::ua_state(id), "0", siege).await?;
                self.kv.delete(&keys::ua_session(id)).await?;
                outcome.reset += 1;
                debug!(keep = id, "Siege banner dropped");
            }
            // Rising edge.
            (false, true) => {
                let minute = keys::minute_stamp(now);
                if !try_claim(
                    &*self.kv,
                    &keys::ua_claim(id, minute),
                    Duration::from_secs(keys::CLAIM_TTL),
                )
                .await?
                {
                    outcome.skipped += 1;
                    return Ok(());
                }
                if self.kv.get(&keys::ua_session(id)).await?.is_some()
                    || self.kv.get(&keys::ua_minute(id, minute)).await?.is_some()
                {
                    outcome.skipped += 1;
                    return Ok(());
                }
                candidates.push(Candidate {
                    keep_id: id.to_string(),
                    minute,
                    fallback: false,
                    embed: ua_embed(keep, now),
                });
            }
            (false, false) => {}
        }
        Ok(())
    }

    /// Event rows can report sieges the header never showed (short fights,
    /// page race). Alert once per siege window via the nobanner suppressor.
    async fn event_fallback(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        candidates: &mut Vec<Candidate>,
        outcome: &mut UaOutcome,
    ) -> Result<()> {
        let window = chrono::Duration::minutes(self.config.attack_window_min);

        for event in &snapshot.events {
            if event.kind != EventKind::UnderAttack || now - event.at > window {
                continue;
            }
            let Some(keep) = snapshot.keep(&event.keep_id) else {
                continue;
            };
            if keep.header_under_attack {
                continue;
            }
            let id = event.keep_id.as_str();
            if self.kv.get(&keys::ua_suppress(id)).await?.is_some()
                || self.kv.get(&keys::ua_nobanner(id)).await?.is_some()
            {
                continue;
            }
            if candidates.iter().any(|c| c.keep_id == id) {
                continue;
            }

            let minute = keys::minute_stamp(event.at);
            if !try_claim(
                &*self.kv,
                &keys::ua_claim(id, minute),
                Duration::from_secs(keys::CLAIM_TTL),
            )
            .await?
            {
                outcome.skipped += 1;
                continue;
            }
            if self.kv.get(&keys::ua_session(id)).await?.is_some()
                || self.kv.get(&keys::ua_minute(id, minute)).await?.is_some()
            {
                outcome.skipped += 1;
                continue;
            }
            candidates.push(Candidate {
                keep_id: id.to_string(),
                minute,
                fallback: true,
                embed: ua_embed(keep, now),
            });
        }
        Ok(())
    }

    /// Clear all session state for one keep (admin reset).
    pub async fn reset_keep(&self, id: &str) -> Result<()> {
        self.kv.delete(&keys::ua_state(id)).await?;
        self.kv.delete(&keys::ua_session(id)).await?;
        self.kv.delete(&keys::ua_suppress(id)).await?;
        self.kv.delete(&keys::ua_nobanner(id)).await?;
        for key in self.kv.list(&format!("ua:claim:{id}:"), 100).await? {
            self.kv.delete(&key).await?;
        }
        for key in self.kv.list(&format!("alert:under:{id}:"), 100).await? {
            self.kv.delete(&key).await?;
        }
        warn!(keep = id, "Under-attack state reset");
        Ok(())
    }
}
