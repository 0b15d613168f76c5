use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use tracing::debug;
use url::Url;

use herald_common::types::{slugify, EventKind, Keep, KeepType, Realm, Snapshot, WarEvent};

use crate::html::{images, strip_tags};
use crate::timeparse::parse_relative_age;

static PANEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"keepinfo_([a-zA-Z]+)").expect("valid regex"));
static BR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static LEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blevel\s+(\d+)").expect("valid regex"));
static UA_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)under\s*attack").expect("valid regex"));
static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("valid regex"));
static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").expect("valid regex"));
static CLAIM_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^claimed\s+by[:\s]\s*").expect("valid regex"));

static CAPTURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(.+?) (?:has been|was) captured by (?:the forces of )?(Albion|Midgard|Hibernia)(?: led by (.+?))?[.!]?$",
    )
    .expect("valid regex")
});
static UA_EVENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.+?) (?:is|was) under attack").expect("valid regex"));
static CLAIMED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?) (?:has been|was) claimed by (.+?)[.!]?$").expect("valid regex")
});
static UPGRADED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?) (?:has been|was) upgraded to level (\d+)").expect("valid regex")
});
static RELIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:the )?(.+? relic) (?:has been|was) (?:moved|captured|taken|returned)")
        .expect("valid regex")
});

/// Siege banner image basenames, matched exactly: a bare `under` substring
/// in some unrelated asset must not light a keep up.
const UA_BANNER_FILES: &[&str] = &[
    "keep_underattack.gif",
    "keep_underattack.png",
    "underattack.gif",
    "relic_underattack.gif",
];

/// Parse one warmap document into a snapshot.
///
/// Never fails: missing optional fields degrade to `None`, a document with
/// no recognizable keep panels yields an empty keep list (which downstream
/// treats as "nothing to diff").
pub fn parse_warmap(
    html: &str,
    base_url: &str,
    now: DateTime<Utc>,
    attack_window_min: i64,
) -> Snapshot {
    let mut keeps = parse_keeps(html, base_url);
    let events = parse_events(html, now);

    // A keep is under attack if its banner says so or an event row said so
    // recently enough.
    let attack_window = Duration::minutes(attack_window_min);
    for event in &events {
        if event.kind != EventKind::UnderAttack {
            continue;
        }
        if now - event.at > attack_window {
            continue;
        }
        if let Some(keep) = keeps.iter_mut().find(|k| k.id == event.keep_id) {
            keep.under_attack = true;
            keep.last_event = Some(match keep.last_event {
                Some(prev) => prev.max(event.at),
                None => event.at,
            });
        }
    }

    let df_owner = parse_df_owner(html);

    Snapshot {
        updated_at: now,
        keeps,
        events,
        df_owner,
    }
}

fn parse_keeps(html: &str, base_url: &str) -> Vec<Keep> {
    let matches: Vec<_> = PANEL_RE.captures_iter(html).collect();
    let mut keeps = Vec::with_capacity(matches.len());

    for (i, caps) in matches.iter().enumerate() {
        let Some(owner) = Realm::from_marker(&caps[1]) else {
            // Neutral or decorative marker, not a keep panel.
            continue;
        };

        // Skip past the rest of the opening tag the marker sits in.
        let marker_end = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let cell_start = html[marker_end..]
            .find('>')
            .map(|off| marker_end + off + 1)
            .unwrap_or(marker_end);
        let next_panel = matches
            .get(i + 1)
            .and_then(|c| c.get(0))
            .map(|m| m.start())
            .unwrap_or(html.len());
        let cell_end = html[cell_start..next_panel.max(cell_start)]
            .to_lowercase()
            .find("</td>")
            .map(|off| cell_start + off)
            .unwrap_or_else(|| next_panel.max(cell_start));
        let cell = &html[cell_start..cell_end];

        if let Some(keep) = parse_keep_cell(cell, owner, base_url) {
            keeps.push(keep);
        }
    }

    keeps
}

fn parse_keep_cell(cell: &str, owner: Realm, base_url: &str) -> Option<Keep> {
    let lines: Vec<String> = BR_RE
        .split(cell)
        .map(strip_tags)
        .filter(|l| !l.is_empty())
        .collect();
    let name = lines.first()?.clone();

    let text = strip_tags(cell);
    let level = LEVEL_RE
        .captures(&text)
        .and_then(|c| c[1].parse::<u8>().ok());
    let keep_type = if text.to_lowercase().contains("relic") {
        KeepType::Relic
    } else {
        KeepType::Keep
    };

    let imgs = images(cell);
    let emblem_url = imgs
        .iter()
        .find(|img| {
            img.alt
                .as_deref()
                .is_some_and(|a| a.to_lowercase().contains("emblem"))
                || img
                    .src
                    .as_deref()
                    .is_some_and(|s| s.to_lowercase().contains("emblem"))
        })
        .and_then(|img| img.src.as_deref())
        .map(|src| resolve_url(base_url, src));

    let banner_image = imgs.iter().any(|img| {
        img.alt.as_deref().is_some_and(|a| UA_TEXT_RE.is_match(a))
            || img
                .file_name()
                .is_some_and(|f| UA_BANNER_FILES.contains(&f.as_str()))
    });
    let header_under_attack = UA_TEXT_RE.is_match(&text) || banner_image;

    // Claimed-by is whatever the bottom of the cell says once the name,
    // level line, emblem caption and siege banner are ruled out.
    let claimed_by = lines
        .iter()
        .rev()
        .find(|line| {
            **line != name
                && !LEVEL_RE.is_match(line)
                && !line.to_lowercase().contains("emblem")
                && !UA_TEXT_RE.is_match(line)
        })
        .map(|line| CLAIM_PREFIX_RE.replace(line, "").trim().to_string())
        .filter(|s| !s.is_empty());

    Some(Keep {
        id: slugify(&name),
        name,
        keep_type,
        owner,
        level,
        claimed_by,
        emblem_url,
        header_under_attack,
        under_attack: header_under_attack,
        last_event: None,
    })
}

fn parse_events(html: &str, now: DateTime<Utc>) -> Vec<WarEvent> {
    let mut bucket_counts: HashMap<String, i64> = HashMap::new();
    let mut events = Vec::new();

    for row in ROW_RE.captures_iter(html) {
        let cells: Vec<String> = CELL_RE
            .captures_iter(&row[1])
            .map(|c| strip_tags(&c[1]))
            .collect();

        let Some((age_idx, age)) = cells
            .iter()
            .enumerate()
            .find_map(|(i, c)| parse_relative_age(c).map(|d| (i, d)))
        else {
            continue;
        };
        // The event text is the longest non-age cell, which skips icon cells.
        let Some(text) = cells
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != age_idx && !c.is_empty())
            .max_by_key(|(_, c)| c.len())
            .map(|(_, c)| c.clone())
        else {
            continue;
        };

        // Rows sharing the same relative token land in one bucket and get
        // spread a minute apart so intra-bucket ordering survives.
        let token = cells[age_idx].trim().to_lowercase();
        let index = bucket_counts.entry(token).or_insert(0);
        let at = now - age - Duration::minutes(*index);
        *index += 1;

        let (kind, keep_name, new_owner, leader) = parse_event_text(&text);
        events.push(WarEvent {
            at,
            kind,
            keep_id: slugify(&keep_name),
            keep_name,
            new_owner,
            leader,
            raw: text,
        });
    }

    events.sort_by(|a, b| b.at.cmp(&a.at));
    events.truncate(200);
    events
}

fn parse_event_text(text: &str) -> (EventKind, String, Option<Realm>, Option<String>) {
    if let Some(c) = CAPTURE_RE.captures(text) {
        let realm = Realm::from_marker(&c[2]);
        return (
            EventKind::Captured,
            c[1].trim().to_string(),
            realm,
            c.get(3).map(|m| m.as_str().trim().to_string()),
        );
    }
    if let Some(c) = UA_EVENT_RE.captures(text) {
        return (EventKind::UnderAttack, c[1].trim().to_string(), None, None);
    }
    if let Some(c) = RELIC_RE.captures(text) {
        return (EventKind::RelicMoved, c[1].trim().to_string(), None, None);
    }
    if let Some(c) = CLAIMED_RE.captures(text) {
        return (
            EventKind::Claimed,
            c[1].trim().to_string(),
            None,
            Some(c[2].trim().to_string()),
        );
    }
    if let Some(c) = UPGRADED_RE.captures(text) {
        return (EventKind::Upgraded, c[1].trim().to_string(), None, None);
    }
    (EventKind::Other, text.to_string(), None, None)
}

/// The Darkness Falls holder is inferred from imagery near the DF label.
/// Midgard is the documented fallback when nothing matches.
fn parse_df_owner(html: &str) -> Realm {
    static DF_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)darkness\s*falls").expect("valid regex"));

    if let Some(m) = DF_RE.find(html) {
        let mut window_end = (m.end() + 900).min(html.len());
        while !html.is_char_boundary(window_end) {
            window_end -= 1;
        }
        for img in images(&html[m.end()..window_end]) {
            let hint = img
                .alt
                .as_deref()
                .and_then(realm_hint)
                .or_else(|| img.file_name().as_deref().and_then(realm_hint));
            if let Some(realm) = hint {
                return realm;
            }
        }
    }

    debug!("DF owner not found in document, defaulting to Midgard");
    Realm::Midgard
}

fn realm_hint(s: &str) -> Option<Realm> {
    let s = s.to_lowercase();
    if s.contains("alb") {
        Some(Realm::Albion)
    } else if s.contains("mid") {
        Some(Realm::Midgard)
    } else if s.contains("hib") {
        Some(Realm::Hibernia)
    } else {
        None
    }
}

fn resolve_url(base: &str, src: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(src)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => src.to_string(),
    }
}
