use std::env;

use crate::types::TrackedPlayer;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream warmap page.
    pub warmap_url: String,

    // Detection windows
    /// How recent an under-attack event row must be to count, in minutes.
    pub attack_window_min: i64,
    /// How recent a captured event row must be to corroborate an ownership
    /// flip, in minutes.
    pub capture_window_min: i64,

    // Tracked-player activity
    /// Player session TTL in minutes.
    pub activity_session_min: i64,
    /// RP delta that bypasses an active session.
    pub activity_big_delta: u64,
    /// Heartbeat re-notify window in minutes.
    pub activity_reping_min: i64,
    pub tracked_players: Vec<TrackedPlayer>,

    // Webhooks, in fallback order per channel
    pub ua_webhooks: Vec<String>,
    pub capture_webhooks: Vec<String>,
    pub players_webhooks: Vec<String>,
    pub webhook_username: String,
    /// Per-endpoint base pacing interval in milliseconds.
    pub base_interval_ms: u64,

    /// Startup default for the strict-delivery flag (runtime state lives in
    /// the KV store and is toggled through the admin surface).
    pub strict_delivery: bool,

    // Server
    pub web_host: String,
    pub web_port: u16,
    pub database_url: String,
    pub admin_username: String,
    pub admin_password: String,
    pub tick_interval_secs: u64,
}

impl Config {
    /// Load the full server configuration.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            warmap_url: required_env("HERALD_WARMAP_URL"),
            attack_window_min: env_num("ATTACK_WINDOW_MIN", 7),
            capture_window_min: env_num("CAPTURE_WINDOW_MIN", 12),
            activity_session_min: env_num("ACTIVITY_SESSION_MIN", 30),
            activity_big_delta: env_num("ACTIVITY_BIG_DELTA", 500),
            activity_reping_min: env_num("ACTIVITY_REPING_MIN", 10),
            tracked_players: tracked_players_from_env(),
            ua_webhooks: url_list("WEBHOOK_UA_URLS"),
            capture_webhooks: url_list("WEBHOOK_CAPTURE_URLS"),
            players_webhooks: env::var("WEBHOOK_PLAYERS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| vec![v.trim().to_string()])
                .unwrap_or_default(),
            webhook_username: env::var("WEBHOOK_USERNAME")
                .unwrap_or_else(|_| "Uthgard Herald".to_string()),
            base_interval_ms: env_num("WEBHOOK_BASE_INTERVAL_MS", 2000),
            strict_delivery: env::var("STRICT_DELIVERY").as_deref() == Ok("1"),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("WEB_PORT must be a number"),
            database_url: required_env("DATABASE_URL"),
            admin_username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
            admin_password: required_env("ADMIN_PASSWORD"),
            tick_interval_secs: env_num("TICK_INTERVAL_SECS", 60),
        }
    }

    /// The siege window: how long UA session state survives without a fresh
    /// banner sighting. Longer than the event window so a session outlives
    /// brief banner dropouts.
    pub fn siege_window_secs(&self) -> u64 {
        (self.attack_window_min as u64) * 4 * 60
    }

    /// Log configuration without exposing secrets.
    pub fn log_summary(&self) {
        tracing::info!(
            warmap_url = %self.warmap_url,
            attack_window_min = self.attack_window_min,
            capture_window_min = self.capture_window_min,
            ua_endpoints = self.ua_webhooks.len(),
            capture_endpoints = self.capture_webhooks.len(),
            players_endpoints = self.players_webhooks.len(),
            tracked_players = self.tracked_players.len(),
            strict_delivery = self.strict_delivery,
            "Configuration loaded"
        );
    }
}

fn tracked_players_from_env() -> Vec<TrackedPlayer> {
    let raw = match env::var("TRACKED_PLAYERS") {
        Ok(v) if !v.trim().is_empty() => v,
        _ => return Vec::new(),
    };
    match serde_json::from_str::<Vec<TrackedPlayer>>(&raw) {
        Ok(players) => players,
        Err(e) => {
            tracing::warn!(error = %e, "TRACKED_PLAYERS is malformed, player scan disabled");
            Vec::new()
        }
    }
}

fn url_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
