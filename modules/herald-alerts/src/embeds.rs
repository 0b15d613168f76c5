//! Webhook embed payloads. One builder per alert kind; realms drive the
//! accent color.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use herald_common::types::{Keep, TrackedPlayer, WarEvent};

const FOOTER: &str = "Uthgard Herald";

pub fn capture_embed(event: &WarEvent) -> Value {
    let realm = event.new_owner.expect("capture events carry a new owner");
    let mut title = format!("🏰 {} was captured by {realm}", event.keep_name);
    if let Some(leader) = &event.leader {
        title.push_str(&format!(" — led by {leader}"));
    }
    json!({
        "title": title,
        "color": realm.color(),
        "timestamp": iso(event.at),
        "footer": { "text": FOOTER },
    })
}

pub fn ua_embed(keep: &Keep, now: DateTime<Utc>) -> Value {
    let mut fields = vec![json!({
        "name": "Owner",
        "value": keep.owner.to_string(),
        "inline": true,
    })];
    if let Some(level) = keep.level {
        fields.push(json!({ "name": "Level", "value": level.to_string(), "inline": true }));
    }
    if let Some(claimed_by) = &keep.claimed_by {
        fields.push(json!({ "name": "Claimed by", "value": claimed_by, "inline": true }));
    }

    let mut embed = json!({
        "title": format!("⚔️ {} is under attack!", keep.name),
        "color": keep.owner.color(),
        "timestamp": iso(now),
        "fields": fields,
        "footer": { "text": FOOTER },
    });
    if let Some(url) = &keep.emblem_url {
        embed["thumbnail"] = json!({ "url": url });
    }
    embed
}

pub fn player_embed(player: &TrackedPlayer, delta: u64, now: DateTime<Utc>) -> Value {
    json!({
        "title": format!("🟢 {} is active", player.name),
        "description": format!("+{delta} RPs gained"),
        "color": player.realm.color(),
        "timestamp": iso(now),
        "footer": { "text": FOOTER },
    })
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
