//! Tracked-player activity detection over leaderboard profile pages.
//!
//! Profiles are fetched sequentially with a polite gap. Per player, the
//! lifetime realm-point total is compared to its baseline: gains open or
//! refresh an activity session, a shrinking total means the upstream rolled
//! the counter over and resets local state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use herald_common::types::TrackedPlayer;
use herald_common::{keys, Config};
use herald_kv::KvStore;

use crate::embeds::player_embed;
use crate::fetch::PageFetcher;
use crate::webhook::{ChannelConfig, Dispatcher};

/// Gap between consecutive profile fetches.
const REQUEST_GAP: Duration = Duration::from_millis(300);

pub struct PlayerScan {
    kv: Arc<dyn KvStore>,
    fetcher: Arc<dyn PageFetcher>,
    dispatcher: Dispatcher,
    channel: ChannelConfig,
    config: Arc<Config>,
}

#[derive(Debug, Default)]
pub struct ScanStats {
    pub scanned: usize,
    pub notified: usize,
    pub rollovers: usize,
    pub errors: usize,
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "players(scanned={} notified={} rollovers={} errors={})",
            self.scanned, self.notified, self.rollovers, self.errors
        )
    }
}

impl PlayerScan {
    pub fn new(
        kv: Arc<dyn KvStore>,
        fetcher: Arc<dyn PageFetcher>,
        dispatcher: Dispatcher,
        channel: ChannelConfig,
        config: Arc<Config>,
    ) -> Self {
        Self {
            kv,
            fetcher,
            dispatcher,
            channel,
            config,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> ScanStats {
        let mut stats = ScanStats::default();

        for (i, player) in self.config.tracked_players.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(REQUEST_GAP).await;
            }

            let html = match self.fetcher.fetch(&player.url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(player = player.id.as_str(), error = %e, "Profile fetch failed");
                    stats.errors += 1;
                    continue;
                }
            };
            let Some(rp) = herald_parser::parse_realm_points(&html) else {
                warn!(player = player.id.as_str(), "No realm points found on profile");
                stats.errors += 1;
                continue;
            };

            stats.scanned += 1;
            if let Err(e) = self.apply(player, rp, now, &mut stats).await {
                warn!(player = player.id.as_str(), error = %e, "Player state update failed");
                stats.errors += 1;
            }
        }

        info!(%stats, "Player scan complete");
        stats
    }

    /// Advance one player's state machine against a freshly observed total.
    /// Shared by the scan and the admin simulation path.
    pub async fn apply(
        &self,
        player: &TrackedPlayer,
        rp: u64,
        now: DateTime<Utc>,
        stats: &mut ScanStats,
    ) -> Result<()> {
        let id = player.id.as_str();
        let baseline = self
            .kv
            .get(&keys::rp(id))
            .await?
            .and_then(|v| v.parse::<u64>().ok());

        let Some(baseline) = baseline else {
            self.kv.put(&keys::rp(id), &rp.to_string(), None).await?;
            return Ok(());
        };

        if rp < baseline {
            // Upstream rolled the counter over; start fresh.
            self.kv.put(&keys::rp(id), &rp.to_string(), None).await?;
            self.kv.delete(&keys::rp_active(id)).await?;
            self.kv.delete(&keys::rp_last(id)).await?;
            stats.rollovers += 1;
            info!(player = id, rp, "Realm-point rollover, baseline reset");
            return Ok(());
        }
        if rp == baseline {
            return Ok(());
        }

        let delta = rp - baseline;
        let session_active = self.kv.get(&keys::rp_active(id)).await?.is_some();
        let last_notify_ms = self
            .kv
            .get(&keys::rp_last(id))
            .await?
            .and_then(|v| v.parse::<i64>().ok());
        let heartbeat_elapsed = last_notify_ms
            .map(|last| now.timestamp_millis() - last > self.config.activity_reping_min * 60_000)
            .unwrap_or(true);

        let should_notify =
            !session_active || delta >= self.config.activity_big_delta || heartbeat_elapsed;

        if should_notify {
            let embed = player_embed(player, delta, now);
            let delivered = self.dispatcher.deliver(&self.channel, &[embed]).await > 0;
            if delivered {
                self.kv
                    .put(
                        &keys::rp_active(id),
                        "1",
                        Some(Duration::from_secs(
                            self.config.activity_session_min as u64 * 60,
                        )),
                    )
                    .await?;
                self.kv
                    .put(
                        &keys::rp_last(id),
                        &now.timestamp_millis().to_string(),
                        Some(Duration::from_secs(keys::RP_LAST_TTL)),
                    )
                    .await?;
                stats.notified += 1;
            }
        }

        // The baseline tracks the observed total whether or not we notified.
        self.kv.put(&keys::rp(id), &rp.to_string(), None).await?;
        Ok(())
    }
}
