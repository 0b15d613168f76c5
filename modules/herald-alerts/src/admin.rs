//! Admin operations: health, state resets, and alert-path simulation.
//!
//! Simulations synthesize a snapshot and push it through the exact detector
//! code the tick runs, so an operator can exercise delivery end to end
//! without waiting for the game world to cooperate.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use herald_common::types::{slugify, EventKind, Keep, KeepType, Realm, Snapshot, WarEvent};
use herald_common::{keys, Config};
use herald_kv::KvStore;

use crate::capture::CaptureAlerter;
use crate::fetch::PageFetcher;
use crate::players::{PlayerScan, ScanStats};
use crate::ua::UaAlerter;
use crate::webhook::{ChannelConfig, Dispatcher};

pub struct Admin {
    kv: Arc<dyn KvStore>,
    fetcher: Arc<dyn PageFetcher>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
}

impl Admin {
    pub fn new(
        kv: Arc<dyn KvStore>,
        fetcher: Arc<dyn PageFetcher>,
        dispatcher: Dispatcher,
        config: Arc<Config>,
    ) -> Self {
        Self {
            kv,
            fetcher,
            dispatcher,
            config,
        }
    }

    /// Read-only operational snapshot: last warmap age, strict flag,
    /// cooldown state, metrics and ownership baselines.
    pub async fn health(&self, now: DateTime<Utc>) -> Result<Value> {
        let snapshot_age_secs = match self.kv.get(keys::WARMAP).await? {
            Some(json) => serde_json::from_str::<Snapshot>(&json)
                .ok()
                .map(|s| (now - s.updated_at).num_seconds()),
            None => None,
        };

        let strict = self.kv.get(keys::STRICT_DELIVERY_FLAG).await?.as_deref() == Some("1");
        let global_cooldown = self.kv.get(keys::GLOBAL_COOLDOWN_UNTIL).await?;

        let mut endpoint_cooldowns = json!({});
        for key in self.kv.list("discord:cooldown:", 100).await? {
            if let Some(until) = self.kv.get(&key).await? {
                endpoint_cooldowns[key.trim_start_matches("discord:cooldown:")] = json!(until);
            }
        }

        let mut baselines = json!({});
        for key in self.kv.list("own:", 1000).await? {
            if let Some(owner) = self.kv.get(&key).await? {
                baselines[key.trim_start_matches("own:")] = json!(owner);
            }
        }

        let metrics: Value = self
            .dispatcher
            .metrics()
            .all()
            .await
            .into_iter()
            .map(|(k, v)| (k, json!(v)))
            .collect::<serde_json::Map<_, _>>()
            .into();

        Ok(json!({
            "ok": true,
            "now": now.to_rfc3339(),
            "snapshot_age_secs": snapshot_age_secs,
            "strict_delivery": strict,
            "global_cooldown_until": global_cooldown,
            "endpoint_cooldowns": endpoint_cooldowns,
            "metrics": metrics,
            "baselines": baselines,
        }))
    }

    pub async fn set_strict(&self, on: bool) -> Result<Value> {
        if on {
            self.kv.put(keys::STRICT_DELIVERY_FLAG, "1", None).await?;
        } else {
            self.kv.delete(keys::STRICT_DELIVERY_FLAG).await?;
        }
        info!(strict = on, "Strict delivery toggled");
        Ok(json!({ "ok": true, "strict_delivery": on }))
    }

    pub async fn clear_cooldowns(&self) -> Result<Value> {
        let mut removed = 0;
        self.kv.delete(keys::GLOBAL_COOLDOWN_UNTIL).await?;
        for prefix in ["discord:cooldown:", "discord:penalty:"] {
            for key in self.kv.list(prefix, 100).await? {
                self.kv.delete(&key).await?;
                removed += 1;
            }
        }
        info!(removed, "Cooldowns cleared");
        Ok(json!({ "ok": true, "removed": removed }))
    }

    pub async fn clear_metrics(&self) -> Result<Value> {
        let removed = self.dispatcher.metrics().clear().await;
        Ok(json!({ "ok": true, "removed": removed }))
    }

    /// Drop every UA session, claim, suppressor and dedupe stamp.
    pub async fn reset_all_ua(&self) -> Result<Value> {
        let mut removed = 0;
        for prefix in ["ua:", "alert:"] {
            for key in self.kv.list(prefix, 1000).await? {
                self.kv.delete(&key).await?;
                removed += 1;
            }
        }
        info!(removed, "All under-attack state reset");
        Ok(json!({ "ok": true, "removed": removed }))
    }

    pub async fn reset_ua(&self, keep: &str) -> Result<Value> {
        let id = slugify(keep);
        self.ua_alerter().reset_keep(&id).await?;
        Ok(json!({ "ok": true, "keep": id }))
    }

    pub async fn clear_cap(
        &self,
        keep: &str,
        realm: Realm,
        prev: Option<Realm>,
    ) -> Result<Value> {
        let id = slugify(keep);
        let removed = self.capture_alerter().clear_gates(&id, realm, prev).await?;
        Ok(json!({ "ok": true, "keep": id, "removed": removed }))
    }

    /// Dump a slice of the key space for inspection.
    pub async fn dump(&self, prefix: &str) -> Result<Value> {
        let mut entries = json!({});
        for key in self.kv.list(prefix, 200).await? {
            if let Some(value) = self.kv.get(&key).await? {
                entries[key.as_str()] = json!(value);
            }
        }
        Ok(json!({ "ok": true, "prefix": prefix, "entries": entries }))
    }

    /// Synthesize a banner rising edge and run the production UA path.
    pub async fn simulate_ua(&self, keep: &str, realm: Realm, now: DateTime<Utc>) -> Result<Value> {
        let snapshot = Snapshot {
            updated_at: now,
            keeps: vec![synth_keep(keep, realm, true)],
            events: vec![],
            df_owner: Realm::Midgard,
        };
        let outcome = self.ua_alerter().run(&snapshot, now).await;
        Ok(json!({ "ok": true, "sent": outcome.sent, "skipped": outcome.skipped }))
    }

    /// Synthesize a fresh captured event row and run the event path.
    pub async fn simulate_capture(
        &self,
        keep: &str,
        realm: Realm,
        leader: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        let snapshot = Snapshot {
            updated_at: now,
            keeps: vec![],
            events: vec![synth_capture_event(keep, realm, leader, now)],
            df_owner: Realm::Midgard,
        };
        let outcome = self.capture_alerter().run(&snapshot, now).await;
        Ok(json!({ "ok": true, "sent": outcome.sent, "skipped": outcome.skipped }))
    }

    /// Synthesize an ownership flip (panel + corroborating event) and run
    /// the ownership path.
    pub async fn simulate_flip(
        &self,
        keep: &str,
        realm: Realm,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        let snapshot = Snapshot {
            updated_at: now,
            keeps: vec![synth_keep(keep, realm, false)],
            events: vec![synth_capture_event(keep, realm, None, now)],
            df_owner: Realm::Midgard,
        };
        let outcome = self.capture_alerter().run(&snapshot, now).await;
        Ok(json!({
            "ok": true,
            "sent": outcome.sent,
            "seeded": outcome.seeded,
            "advanced": outcome.advanced,
        }))
    }

    /// Pretend a tracked player gained `delta` RPs and run the activity
    /// state machine.
    pub async fn simulate_player(
        &self,
        player_id: &str,
        delta: u64,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        let Some(player) = self
            .config
            .tracked_players
            .iter()
            .find(|p| p.id == player_id)
        else {
            return Ok(json!({ "ok": false, "error": "unknown player" }));
        };

        let baseline = self
            .kv
            .get(&keys::rp(player_id))
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        self.kv
            .put(&keys::rp(player_id), &baseline.to_string(), None)
            .await?;

        let scan = PlayerScan::new(
            self.kv.clone(),
            self.fetcher.clone(),
            self.dispatcher.clone(),
            ChannelConfig::players(&self.config),
            self.config.clone(),
        );
        let mut stats = ScanStats::default();
        scan.apply(player, baseline + delta, now, &mut stats).await?;
        Ok(json!({ "ok": true, "notified": stats.notified }))
    }

    fn ua_alerter(&self) -> UaAlerter {
        UaAlerter::new(
            self.kv.clone(),
            self.dispatcher.clone(),
            ChannelConfig::ua(&self.config),
            self.config.clone(),
        )
    }

    fn capture_alerter(&self) -> CaptureAlerter {
        CaptureAlerter::new(
            self.kv.clone(),
            self.dispatcher.clone(),
            ChannelConfig::capture(&self.config),
            self.config.clone(),
        )
    }
}

fn synth_keep(name: &str, owner: Realm, under_attack: bool) -> Keep {
    Keep {
        id: slugify(name),
        name: name.to_string(),
        keep_type: KeepType::Keep,
        owner,
        level: None,
        claimed_by: None,
        emblem_url: None,
        header_under_attack: under_attack,
        under_attack,
        last_event: None,
    }
}

fn synth_capture_event(
    keep: &str,
    new_owner: Realm,
    leader: Option<String>,
    now: DateTime<Utc>,
) -> WarEvent {
    WarEvent {
        at: now - Duration::minutes(1),
        kind: EventKind::Captured,
        keep_id: slugify(keep),
        keep_name: keep.to_string(),
        new_owner: Some(new_owner),
        leader,
        raw: format!("{keep} was captured by {new_owner}"),
    }
}
