//! Capture detection: two cooperating paths over one set of dedupe gates.
//!
//! The ownership path diffs each keep's owner against its `own:` baseline
//! and is the only writer of baselines. The event path walks fresh
//! `captured` rows directly, catching flips the panel diff missed (fast
//! recapture between ticks). Either path alerting stamps the shared gates,
//! so at most one alert escapes per (keep, new owner) within the gate TTLs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use herald_common::types::{EventKind, Realm, Snapshot};
use herald_common::{keys, Config};
use herald_kv::{try_claim, KvStore};

use crate::embeds::capture_embed;
use crate::webhook::{ChannelConfig, Dispatcher};

pub struct CaptureAlerter {
    kv: Arc<dyn KvStore>,
    dispatcher: Dispatcher,
    channel: ChannelConfig,
    config: Arc<Config>,
}

#[derive(Debug, Default)]
pub struct CaptureOutcome {
    pub sent: usize,
    pub seeded: usize,
    /// Baselines advanced without an alert (uncorroborated or deduped).
    pub advanced: usize,
    pub skipped: usize,
}

impl fmt::Display for CaptureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capture(sent={} seeded={} advanced={} skipped={})",
            self.sent, self.seeded, self.advanced, self.skipped
        )
    }
}

struct Candidate {
    keep_id: String,
    prev: Option<Realm>,
    new_owner: Realm,
    minute: i64,
    embed: Value,
}

impl CaptureAlerter {
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

    /// Both paths in order: ownership diff first (authoritative for
    /// baselines), then the raw event sweep. Per-keep failures are logged
    /// and skipped so one bad key never blocks the rest of the map.
    pub async fn run(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> CaptureOutcome {
        let mut outcome = CaptureOutcome::default();

        let mut candidates = Vec::new();
        for keep in &snapshot.keeps {
            match self.ownership_candidate(keep, snapshot, now, &mut outcome).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => {
                    warn!(keep = keep.id.as_str(), error = %e, "Ownership check failed");
                }
            }
        }
        self.deliver_and_stamp(candidates, &mut outcome, true).await;

        let mut candidates = Vec::new();
        for event in &snapshot.events {
            match self.event_candidate(event, &candidates, now, &mut outcome).await {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => {
                    warn!(keep = event.keep_id.as_str(), error = %e, "Capture event check failed");
                }
            }
        }
        self.deliver_and_stamp(candidates, &mut outcome, false).await;

        info!(%outcome, "Capture pass complete");
        outcome
    }

    async fn ownership_candidate(
        &self,
        keep: &herald_common::Keep,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
        outcome: &mut CaptureOutcome,
    ) -> Result<Option<Candidate>> {
        let window = chrono::Duration::minutes(self.config.capture_window_min);
        let id = keep.id.as_str();

        let baseline = match self
            .kv
            .get(&keys::own(id))
            .await?
            .and_then(|v| Realm::from_marker(&v))
        {
            Some(realm) => realm,
            None => {
                // First sighting seeds the baseline, never alerts.
                self.kv.put(&keys::own(id), &keep.owner.to_string(), None).await?;
                outcome.seeded += 1;
                return Ok(None);
            }
        };
        if baseline == keep.owner {
            return Ok(None);
        }

        // A flip with no fresh captured row is not trustworthy enough to
        // notify on; the baseline still advances.
        let Some(event) = snapshot.events.iter().find(|e| {
            e.kind == EventKind::Captured
                && e.keep_id == id
                && e.new_owner == Some(keep.owner)
                && now - e.at <= window
        }) else {
            debug!(keep = id, from = %baseline, to = %keep.owner, "Uncorroborated flip, advancing baseline");
            self.kv.put(&keys::own(id), &keep.owner.to_string(), None).await?;
            outcome.advanced += 1;
            return Ok(None);
        };

        let minute = keys::minute_stamp(event.at);
        if self.gates_closed(id, Some(baseline), keep.owner, minute).await? {
            self.kv.put(&keys::own(id), &keep.owner.to_string(), None).await?;
            outcome.advanced += 1;
            return Ok(None);
        }
        if !try_claim(
            &*self.kv,
            &keys::cap_claim(id, keep.owner, minute),
            Duration::from_secs(keys::CLAIM_TTL),
        )
        .await?
        {
            // Another invocation holds this capture.
            self.kv.put(&keys::own(id), &keep.owner.to_string(), None).await?;
            outcome.advanced += 1;
            return Ok(None);
        }

        Ok(Some(Candidate {
            keep_id: id.to_string(),
            prev: Some(baseline),
            new_owner: keep.owner,
            minute,
            embed: capture_embed(event),
        }))
    }

    async fn event_candidate(
        &self,
        event: &herald_common::WarEvent,
        pending: &[Candidate],
        now: DateTime<Utc>,
        outcome: &mut CaptureOutcome,
    ) -> Result<Option<Candidate>> {
        let window = chrono::Duration::minutes(self.config.capture_window_min);
        if event.kind != EventKind::Captured || now - event.at > window {
            return Ok(None);
        }
        let Some(new_owner) = event.new_owner else {
            return Ok(None);
        };
        let id = event.keep_id.as_str();
        if pending
            .iter()
            .any(|c| c.keep_id == id && c.new_owner == new_owner)
        {
            return Ok(None);
        }

        // Never alert before a baseline exists, and an event that merely
        // confirms the recorded owner is not news.
        match self
            .kv
            .get(&keys::own(id))
            .await?
            .and_then(|v| Realm::from_marker(&v))
        {
            None => return Ok(None),
            Some(baseline) if baseline == new_owner => return Ok(None),
            Some(_) => {}
        }

        let minute = keys::minute_stamp(event.at);
        if self.gates_closed(id, None, new_owner, minute).await? {
            return Ok(None);
        }
        if !try_claim(
            &*self.kv,
            &keys::cap_claim(id, new_owner, minute),
            Duration::from_secs(keys::CLAIM_TTL),
        )
        .await?
        {
            outcome.skipped += 1;
            return Ok(None);
        }

        Ok(Some(Candidate {
            keep_id: id.to_string(),
            prev: None,
            new_owner,
            minute,
            embed: capture_embed(event),
        }))
    }

    /// True when any unified dedupe gate is already set. Checked in a fixed
    /// order so both paths agree.
    async fn gates_closed(
        &self,
        id: &str,
        prev: Option<Realm>,
        new_owner: Realm,
        minute: i64,
    ) -> Result<bool> {
        if let Some(prev) = prev {
            if self
                .kv
                .get(&keys::cap_once_transition(id, prev, new_owner))
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(self
            .kv
            .get(&keys::cap_once_owner(id, new_owner))
            .await?
            .is_some()
            || self
                .kv
                .get(&keys::cap_any(id, new_owner, minute))
                .await?
                .is_some()
            || self.kv.get(&keys::cap_seen(id, new_owner)).await?.is_some())
    }

    /// Deliver and run the post-success side effects. Under strict delivery
    /// a failed batch leaves everything untouched so the next tick retries;
    /// under the freshness-first default state advances regardless, trading
    /// a possibly lost alert for never replaying a backlog after an outage.
    async fn deliver_and_stamp(
        &self,
        candidates: Vec<Candidate>,
        outcome: &mut CaptureOutcome,
        advance_baseline: bool,
    ) {
        if candidates.is_empty() {
            return;
        }

        let strict = matches!(
            self.kv.get(keys::STRICT_DELIVERY_FLAG).await,
            Ok(Some(ref v)) if v == "1"
        );

        let embeds: Vec<Value> = candidates.iter().map(|c| c.embed.clone()).collect();
        let delivered = self.dispatcher.deliver(&self.channel, &embeds).await;

        for (i, candidate) in candidates.iter().enumerate() {
            if i < delivered {
                outcome.sent += 1;
            } else {
                outcome.skipped += 1;
                if strict {
                    continue;
                }
            }
            if let Err(e) = self.stamp_sent(candidate, advance_baseline).await {
                warn!(keep = candidate.keep_id.as_str(), error = %e, "Capture stamp failed");
            }
        }
    }

    async fn stamp_sent(&self, candidate: &Candidate, advance_baseline: bool) -> Result<()> {
        let id = candidate.keep_id.as_str();
        let new_owner = candidate.new_owner;
        let once_ttl = Some(Duration::from_secs(keys::CAP_ONCE_TTL));

        self.kv
            .put(
                &keys::cap_seen(id, new_owner),
                "1",
                Some(Duration::from_secs(keys::CAP_SEEN_TTL)),
            )
            .await?;
        self.kv
            .put(
                &keys::cap_any(id, new_owner, candidate.minute),
                "1",
                Some(Duration::from_secs(keys::CAP_ANY_TTL)),
            )
            .await?;
        self.kv
            .put(&keys::cap_once_owner(id, new_owner), "1", once_ttl)
            .await?;
        if let Some(prev) = candidate.prev {
            self.kv
                .put(&keys::cap_once_transition(id, prev, new_owner), "1", once_ttl)
                .await?;
        }
        if advance_baseline {
            self.kv
                .put(&keys::own(id), &new_owner.to_string(), None)
                .await?;
        }

        // The siege is over: drop the UA session and mute the banner while
        // it flaps through the ownership change.
        self.kv
            .put(
                &keys::ua_state(id),
                "0",
                Some(Duration::from_secs(self.config.siege_window_secs())),
            )
            .await?;
        self.kv.delete(&keys::ua_session(id)).await?;
        self.kv
            .put(
                &keys::ua_suppress(id),
                "1",
                Some(Duration::from_secs(keys::UA_SUPPRESS_TTL)),
            )
            .await?;
        Ok(())
    }

    /// Drop the capture gates for one (keep, new owner) pair (admin).
    pub async fn clear_gates(
        &self,
        id: &str,
        new_owner: Realm,
        prev: Option<Realm>,
    ) -> Result<usize> {
        let mut removed = 0;
        self.kv.delete(&keys::cap_once_owner(id, new_owner)).await?;
        self.kv.delete(&keys::cap_seen(id, new_owner)).await?;
        removed += 2;
        if let Some(prev) = prev {
            self.kv
                .delete(&keys::cap_once_transition(id, prev, new_owner))
                .await?;
            removed += 1;
        }
        for prefix in [
            format!("cap:any:{id}:{new_owner}:"),
            format!("cap:claim:{id}:{new_owner}:"),
        ] {
            for key in self.kv.list(&prefix, 100).await? {
                self.kv.delete(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
