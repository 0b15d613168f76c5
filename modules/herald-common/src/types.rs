use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// One of the three playable factions. Keep ownership and alert colors are
/// always expressed in terms of a concrete realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Realm {
    Albion,
    Midgard,
    Hibernia,
}

impl Realm {
    /// Liberal mapping from CSS class markers, image names and free text.
    /// Accepts any token that starts with the canonical three-letter stem.
    pub fn from_marker(marker: &str) -> Option<Self> {
        let m = marker.trim().to_lowercase();
        if m.starts_with("alb") {
            Some(Realm::Albion)
        } else if m.starts_with("mid") {
            Some(Realm::Midgard)
        } else if m.starts_with("hib") {
            Some(Realm::Hibernia)
        } else {
            None
        }
    }

    /// Embed accent color.
    pub fn color(&self) -> u32 {
        match self {
            Realm::Albion => 0xC8102E,
            Realm::Midgard => 0x0072CE,
            Realm::Hibernia => 0x00843D,
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Realm::Albion => write!(f, "Albion"),
            Realm::Midgard => write!(f, "Midgard"),
            Realm::Hibernia => write!(f, "Hibernia"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepType {
    Keep,
    Relic,
}

/// A fortress panel from the warmap page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keep {
    /// Stable slug derived from `name`.
    pub id: String,
    pub name: String,
    pub keep_type: KeepType,
    pub owner: Realm,
    pub level: Option<u8>,
    pub claimed_by: Option<String>,
    pub emblem_url: Option<String>,
    /// True iff the source banner (text or image) says the keep is besieged.
    pub header_under_attack: bool,
    /// Banner OR a recent under-attack event within the attack window.
    pub under_attack: bool,
    pub last_event: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Captured,
    UnderAttack,
    Claimed,
    Upgraded,
    RelicMoved,
    Other,
}

/// One row from the recent-events table. `at` is synthetic: the page only
/// exposes relative ages, so instants are reconstructed against parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub keep_id: String,
    pub keep_name: String,
    pub new_owner: Option<Realm>,
    pub leader: Option<String>,
    pub raw: String,
}

/// Canonical world state derived from one warmap document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub updated_at: DateTime<Utc>,
    pub keeps: Vec<Keep>,
    /// Newest first, capped at 200.
    pub events: Vec<WarEvent>,
    pub df_owner: Realm,
}

impl Snapshot {
    /// Content hash used for change detection. Excludes `updated_at` and the
    /// synthetic event instants so that reparsing identical HTML at a
    /// different moment produces the same hash.
    pub fn canonical_hash(&self) -> String {
        let mut keeps: Vec<_> = self
            .keeps
            .iter()
            .map(|k| {
                json!({
                    "id": k.id,
                    "name": k.name,
                    "type": k.keep_type,
                    "owner": k.owner,
                    "level": k.level,
                    "claimed_by": k.claimed_by,
                    "emblem": k.emblem_url,
                    "banner_ua": k.header_under_attack,
                    "ua": k.under_attack,
                })
            })
            .collect();
        keeps.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

        let events: Vec<_> = self
            .events
            .iter()
            .map(|e| {
                json!({
                    "kind": e.kind,
                    "keep": e.keep_id,
                    "owner": e.new_owner,
                    "leader": e.leader,
                    "raw": e.raw,
                })
            })
            .collect();

        let doc = json!({
            "keeps": keeps,
            "events": events,
            "df": self.df_owner,
        });

        let mut hasher = Sha256::new();
        hasher.update(doc.to_string().as_bytes());
        hex_string(hasher.finalize().as_slice())
    }

    pub fn keep(&self, keep_id: &str) -> Option<&Keep> {
        self.keeps.iter().find(|k| k.id == keep_id)
    }
}

/// A leaderboard profile to watch for realm-point gains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPlayer {
    pub id: String,
    pub name: String,
    pub realm: Realm,
    pub url: String,
}

/// Derive a stable keep id from its display name: lowercase, runs of
/// non-alphanumeric characters collapse to a single dash.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// Short sha256 hex digest of an arbitrary string. Used for webhook path
/// hashes so full endpoint URLs never appear in the key space.
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_string(hasher.finalize().as_slice())[..16].to_string()
}
