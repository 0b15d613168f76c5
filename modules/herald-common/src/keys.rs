//! The persistent key schema.
//!
//! Every durable coordination primitive the pipeline uses is a string key in
//! the KV store. Claim keys are short-lived best-effort mutexes; dedupe keys
//! are stamped only after a successful delivery and are the authoritative
//! barrier against duplicate alerts.

use chrono::{DateTime, Utc};

use crate::types::Realm;

/// Last accepted snapshot, JSON-encoded. No TTL.
pub const WARMAP: &str = "warmap";

/// Strict-delivery toggle. `"1"` means delivery failures block state advance.
pub const STRICT_DELIVERY_FLAG: &str = "flags:strict_delivery";

/// Global last-successful-send timestamp (ms since epoch).
pub const GLOBAL_LAST: &str = "discord:global:last";

/// Global cooldown marker, value is an ISO instant.
pub const GLOBAL_COOLDOWN_UNTIL: &str = "discord:global:cooldown_until";

// TTLs, in seconds.

/// Suppress banner alerts briefly after a capture so the flapping siege
/// banner does not immediately re-fire.
pub const UA_SUPPRESS_TTL: u64 = 120;
/// Cross-invocation claim keys.
pub const CLAIM_TTL: u64 = 120;
/// Minute-bucketed UA dedupe.
pub const ALERT_UNDER_TTL: u64 = 6 * 3600;
/// Capture once-per-owner and once-per-transition gates.
pub const CAP_ONCE_TTL: u64 = 20 * 60;
pub const CAP_SEEN_TTL: u64 = 20 * 60;
/// Unified capture dedupe across both detection paths.
pub const CAP_ANY_TTL: u64 = 6 * 3600;
/// Per-channel delivery serialization gate.
pub const GATE_TTL: u64 = 5;
/// Last-send stamps.
pub const SEND_STAMP_TTL: u64 = 3600;
/// Pacing penalty counter.
pub const PENALTY_TTL: u64 = 30 * 60;
/// Player last-notify stamp.
pub const RP_LAST_TTL: u64 = 3600;

/// Coarse minute bucket used in dedupe and claim keys, so the same event
/// reparsed across ticks maps to the same key.
pub fn minute_stamp(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

pub fn own(keep_id: &str) -> String {
    format!("own:{keep_id}")
}

/// Timestamp string while the banner is up, `"0"` when down.
pub fn ua_state(keep_id: &str) -> String {
    format!("ua:state:{keep_id}")
}

/// Session gate: one banner alert per siege.
pub fn ua_session(keep_id: &str) -> String {
    format!("alert:ua:start:{keep_id}")
}

pub fn ua_suppress(keep_id: &str) -> String {
    format!("ua:suppress:{keep_id}")
}

pub fn ua_claim(keep_id: &str, minute: i64) -> String {
    format!("ua:claim:{keep_id}:{minute}")
}

pub fn ua_minute(keep_id: &str, minute: i64) -> String {
    format!("alert:under:{keep_id}:{minute}")
}

/// Fallback-path suppressor for keeps alerted from event rows alone.
pub fn ua_nobanner(keep_id: &str) -> String {
    format!("alert:ua:nobanner:{keep_id}")
}

pub fn cap_once_owner(keep_id: &str, new_owner: Realm) -> String {
    format!("cap:once:{keep_id}:{new_owner}")
}

pub fn cap_once_transition(keep_id: &str, prev: Realm, new_owner: Realm) -> String {
    format!("cap:once:{keep_id}:{prev}->{new_owner}")
}

pub fn cap_seen(keep_id: &str, new_owner: Realm) -> String {
    format!("cap:seen:{keep_id}:{new_owner}")
}

pub fn cap_any(keep_id: &str, new_owner: Realm, minute: i64) -> String {
    format!("cap:any:{keep_id}:{new_owner}:{minute}")
}

pub fn cap_claim(keep_id: &str, new_owner: Realm, minute: i64) -> String {
    format!("cap:claim:{keep_id}:{new_owner}:{minute}")
}

pub fn rp(player_id: &str) -> String {
    format!("rp:{player_id}")
}

pub fn rp_active(player_id: &str) -> String {
    format!("rp:active:{player_id}")
}

pub fn rp_last(player_id: &str) -> String {
    format!("rp:last:{player_id}")
}

pub fn endpoint_cooldown(path_hash: &str) -> String {
    format!("discord:cooldown:{path_hash}")
}

pub fn endpoint_last(path_hash: &str) -> String {
    format!("discord:last:{path_hash}")
}

pub fn endpoint_penalty(path_hash: &str) -> String {
    format!("discord:penalty:{path_hash}")
}

pub fn channel_gate(channel: &str) -> String {
    format!("discord:gate:{channel}")
}

pub fn metric(name: &str) -> String {
    format!("metrics:{name}")
}
