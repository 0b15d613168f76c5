//! One scheduled pass of the full pipeline.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use herald_common::types::Snapshot;
use herald_common::{keys, Config, HeraldError};
use herald_kv::KvStore;
use herald_parser::parse_warmap;

use crate::capture::{CaptureAlerter, CaptureOutcome};
use crate::fetch::{cache_busted, PageFetcher};
use crate::players::PlayerScan;
use crate::ua::{UaAlerter, UaOutcome};
use crate::webhook::{ChannelConfig, Dispatcher, WebhookTransport};

pub struct Tick {
    kv: Arc<dyn KvStore>,
    fetcher: Arc<dyn PageFetcher>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
}

#[derive(Debug, Default)]
pub struct TickStats {
    pub keeps: usize,
    pub events: usize,
    pub snapshot_changed: bool,
    pub ua: UaOutcome,
    pub captures: CaptureOutcome,
}

impl fmt::Display for TickStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "keeps={} events={} changed={} {} {}",
            self.keeps, self.events, self.snapshot_changed, self.ua, self.captures
        )
    }
}

impl Tick {
    pub fn new(
        kv: Arc<dyn KvStore>,
        fetcher: Arc<dyn PageFetcher>,
        transport: Arc<dyn WebhookTransport>,
        config: Arc<Config>,
    ) -> Self {
        let dispatcher = Dispatcher::new(kv.clone(), transport, config.base_interval_ms);
        Self {
            kv,
            fetcher,
            dispatcher,
            config,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Fetch, parse, diff, deliver, persist. Fetch failures abort the whole
    /// tick with no state changes; everything downstream is best-effort per
    /// keep and per player.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<TickStats, HeraldError> {
        let run_id = Uuid::new_v4().to_string()[..8].to_string();
        info!(run_id = run_id.as_str(), "Tick starting");

        let prev = self.load_previous().await;

        let url = cache_busted(&self.config.warmap_url, now);
        let html = self.fetcher.fetch(&url).await?;
        let snapshot = parse_warmap(
            &html,
            &self.config.warmap_url,
            now,
            self.config.attack_window_min,
        );

        if snapshot.keeps.is_empty() {
            warn!(run_id = run_id.as_str(), "Parse produced no keeps, treating as degraded input");
        }

        let snapshot_changed = match &prev {
            Some(prev) => prev.canonical_hash() != snapshot.canonical_hash(),
            None => true,
        };

        if let Some(prev) = &prev {
            if prev.df_owner != snapshot.df_owner {
                info!(
                    from = %prev.df_owner,
                    to = %snapshot.df_owner,
                    "Darkness Falls changed hands"
                );
            }
        }

        // Detection order is fixed: banner transitions, then ownership
        // flips, then the raw capture-event sweep.
        let ua = UaAlerter::new(
            self.kv.clone(),
            self.dispatcher.clone(),
            ChannelConfig::ua(&self.config),
            self.config.clone(),
        )
        .run(&snapshot, now)
        .await;

        let captures = CaptureAlerter::new(
            self.kv.clone(),
            self.dispatcher.clone(),
            ChannelConfig::capture(&self.config),
            self.config.clone(),
        )
        .run(&snapshot, now)
        .await;

        if snapshot_changed && !snapshot.keeps.is_empty() {
            match serde_json::to_string(&snapshot) {
                Ok(json) => {
                    if let Err(e) = self.kv.put(keys::WARMAP, &json, None).await {
                        warn!(error = %e, "Failed to persist snapshot");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode snapshot"),
            }
        }

        // The player scan straddles ticks; detach it so the tick returns as
        // soon as the map work is done.
        if !self.config.tracked_players.is_empty() {
            let scan = self.player_scan();
            tokio::spawn(async move {
                scan.run(Utc::now()).await;
            });
        }

        let stats = TickStats {
            keeps: snapshot.keeps.len(),
            events: snapshot.events.len(),
            snapshot_changed,
            ua,
            captures,
        };
        info!(run_id = run_id.as_str(), %stats, "Tick complete");
        Ok(stats)
    }

    pub fn player_scan(&self) -> PlayerScan {
        PlayerScan::new(
            self.kv.clone(),
            self.fetcher.clone(),
            self.dispatcher.clone(),
            ChannelConfig::players(&self.config),
            self.config.clone(),
        )
    }

    async fn load_previous(&self) -> Option<Snapshot> {
        let json = match self.kv.get(keys::WARMAP).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(error = %e, "Failed to load previous snapshot");
                return None;
            }
        };
        match serde_json::from_str(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Stored snapshot is unreadable, ignoring");
                None
            }
        }
    }
}
