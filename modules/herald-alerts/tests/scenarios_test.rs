//! End-to-end pipeline scenarios over the in-memory store and recording
//! transport: full ticks from HTML to webhook POSTs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use herald_alerts::capture::CaptureAlerter;
use herald_alerts::testutil::{RecordingTransport, StaticFetcher};
use herald_alerts::webhook::ChannelConfig;
use herald_alerts::{Dispatcher, Tick};
use herald_common::types::{
    short_hash, slugify, EventKind, Keep, KeepType, Realm, Snapshot, TrackedPlayer, WarEvent,
};
use herald_common::{keys, Config};
use herald_kv::{KvStore, MemoryKv};

const WARMAP_URL: &str = "https://herald.test/warmap";
const UA1: &str = "https://hooks.test/ua1";
const UA2: &str = "https://hooks.test/ua2";
const CAP1: &str = "https://hooks.test/cap1";
const CAP2: &str = "https://hooks.test/cap2";
const PLAYERS: &str = "https://hooks.test/players";
const SAZ_URL: &str = "https://herald.test/player/saz";

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn test_config() -> Config {
    Config {
        warmap_url: WARMAP_URL.to_string(),
        attack_window_min: 7,
        capture_window_min: 12,
        activity_session_min: 30,
        activity_big_delta: 500,
        activity_reping_min: 10,
        tracked_players: vec![TrackedPlayer {
            id: "saz".to_string(),
            name: "Saz".to_string(),
            realm: Realm::Albion,
            url: SAZ_URL.to_string(),
        }],
        ua_webhooks: vec![UA1.to_string(), UA2.to_string()],
        capture_webhooks: vec![CAP1.to_string(), CAP2.to_string()],
        players_webhooks: vec![PLAYERS.to_string()],
        webhook_username: "Uthgard Herald".to_string(),
        base_interval_ms: 2000,
        strict_delivery: false,
        web_host: String::new(),
        web_port: 0,
        database_url: String::new(),
        admin_username: String::new(),
        admin_password: String::new(),
        tick_interval_secs: 60,
    }
}

struct Harness {
    kv: Arc<MemoryKv>,
    transport: Arc<RecordingTransport>,
    fetcher: Arc<StaticFetcher>,
    config: Arc<Config>,
    tick: Tick,
}

fn harness() -> Harness {
    let kv = Arc::new(MemoryKv::new());
    let transport = Arc::new(RecordingTransport::new());
    let fetcher = Arc::new(StaticFetcher::new());
    let config = Arc::new(test_config());
    let tick = Tick::new(
        kv.clone(),
        fetcher.clone(),
        transport.clone(),
        config.clone(),
    );
    Harness {
        kv,
        transport,
        fetcher,
        config,
        tick,
    }
}

fn keep_panel(name: &str, marker: &str, under_attack: bool) -> String {
    let banner = if under_attack { "<br>UNDER ATTACK" } else { "" };
    format!(
        r#"<td class="keepinfo_{marker}">{name}<br>Level 5 keep{banner}</td>"#
    )
}

fn event_row(age: &str, text: &str) -> String {
    format!("<tr><td>{age}</td><td>{text}</td></tr>")
}

fn warmap_html(panels: &[String], rows: &[String]) -> String {
    format!(
        "<html><body><table><tr>{}</tr></table><table>{}</table></body></html>",
        panels.join(""),
        rows.join("")
    )
}

async fn get(kv: &MemoryKv, key: &str) -> Option<String> {
    kv.get(key).await.unwrap()
}

// ---------------------------------------------------------------------------
// Capture scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cold_start_seeds_baseline_without_alerting() {
    let h = harness();
    let html = warmap_html(
        &[keep_panel("Caer Benowyc", "mid", false)],
        &[event_row("2m ago", "Caer Benowyc was captured by the forces of Midgard")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    let stats = h.tick.run(Utc::now()).await.unwrap();

    assert_eq!(stats.captures.sent, 0);
    assert_eq!(stats.captures.seeded, 1);
    assert_eq!(h.transport.sent_count(), 0);
    assert_eq!(get(&h.kv, &keys::own("caer-benowyc")).await.as_deref(), Some("Midgard"));
}

#[tokio::test(start_paused = true)]
async fn true_capture_alerts_once_and_advances_state() {
    let h = harness();
    h.kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();

    let html = warmap_html(
        &[keep_panel("Caer Benowyc", "mid", false)],
        &[event_row("2m ago", "Caer Benowyc was captured by the forces of Midgard led by Ragnar")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    let stats = h.tick.run(Utc::now()).await.unwrap();

    assert_eq!(stats.captures.sent, 1);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, CAP1);
    let title = sent[0].1["embeds"][0]["title"].as_str().unwrap();
    assert!(title.contains("Caer Benowyc was captured by Midgard"));
    assert!(title.contains("led by Ragnar"));

    assert_eq!(get(&h.kv, &keys::own("caer-benowyc")).await.as_deref(), Some("Midgard"));
    assert!(get(&h.kv, &keys::ua_suppress("caer-benowyc")).await.is_some());
    assert!(get(&h.kv, &keys::cap_once_owner("caer-benowyc", Realm::Midgard)).await.is_some());
    assert!(get(&h.kv, &keys::cap_once_transition("caer-benowyc", Realm::Albion, Realm::Midgard))
        .await
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn banner_flap_after_capture_is_suppressed() {
    let h = harness();
    h.kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();

    // Tick 1: the capture itself.
    let captured = warmap_html(
        &[keep_panel("Caer Benowyc", "mid", false)],
        &[event_row("2m ago", "Caer Benowyc was captured by the forces of Midgard")],
    );
    h.fetcher.set_page(WARMAP_URL, &captured);
    let now = Utc::now();
    h.tick.run(now).await.unwrap();
    assert_eq!(h.transport.sent_count(), 1);

    // Tick 2: the banner flaps on right after the flip.
    let flapping = warmap_html(
        &[keep_panel("Caer Benowyc", "mid", true)],
        &[event_row("3m ago", "Caer Benowyc was captured by the forces of Midgard")],
    );
    h.fetcher.set_page(WARMAP_URL, &flapping);
    let stats = h.tick.run(now + Duration::seconds(60)).await.unwrap();

    assert_eq!(stats.ua.sent, 0);
    assert_eq!(h.transport.sent_count(), 1, "suppressor must mute the banner");
    assert_eq!(get(&h.kv, &keys::ua_state("caer-benowyc")).await.as_deref(), Some("0"));
}

#[tokio::test(start_paused = true)]
async fn capture_event_alone_does_not_alert_unowned_keep() {
    // An event row for a keep with no baseline (and no panel) stays silent.
    let h = harness();
    let html = warmap_html(
        &[],
        &[event_row("2m ago", "Caer Berkstead was captured by Albion")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    let stats = h.tick.run(Utc::now()).await.unwrap();
    assert_eq!(stats.captures.sent, 0);
    assert_eq!(h.transport.sent_count(), 0);
}

// ---------------------------------------------------------------------------
// Under-attack scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn ua_rising_edge_alerts_once_per_siege() {
    let h = harness();
    let html = warmap_html(&[keep_panel("Dun Crauchon", "hib", true)], &[]);
    h.fetcher.set_page(WARMAP_URL, &html);

    let now = Utc::now();
    let stats = h.tick.run(now).await.unwrap();
    assert_eq!(stats.ua.sent, 1);
    assert_eq!(h.transport.sent_count(), 1);
    assert_eq!(h.transport.sent()[0].0, UA1);
    assert!(get(&h.kv, &keys::ua_session("dun-crauchon")).await.is_some());

    // Still flaming on the next tick: no new alert.
    let stats = h.tick.run(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(stats.ua.sent, 0);
    assert_eq!(h.transport.sent_count(), 1);

    // Banner drops: state flips to "0" and the session closes.
    let quiet = warmap_html(&[keep_panel("Dun Crauchon", "hib", false)], &[]);
    h.fetcher.set_page(WARMAP_URL, &quiet);
    let stats = h.tick.run(now + Duration::seconds(120)).await.unwrap();
    assert_eq!(stats.ua.reset, 1);
    assert_eq!(get(&h.kv, &keys::ua_state("dun-crauchon")).await.as_deref(), Some("0"));
    assert!(get(&h.kv, &keys::ua_session("dun-crauchon")).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn ua_event_fallback_fires_without_banner() {
    let h = harness();
    let html = warmap_html(
        &[keep_panel("Bledmeer Faste", "mid", false)],
        &[event_row("3m ago", "Bledmeer Faste is under attack!")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    let now = Utc::now();
    let stats = h.tick.run(now).await.unwrap();
    assert_eq!(stats.ua.sent, 1);
    assert!(get(&h.kv, &keys::ua_nobanner("bledmeer-faste")).await.is_some());

    // The same row on the next tick is muted by the nobanner suppressor.
    let stats = h.tick.run(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(stats.ua.sent, 0);
    assert_eq!(h.transport.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_primary_falls_through_to_secondary() {
    let h = harness();
    let html = warmap_html(&[keep_panel("Dun Crauchon", "hib", true)], &[]);
    h.fetcher.set_page(WARMAP_URL, &html);

    h.transport
        .push_response(RecordingTransport::rate_limited(3.0, false));

    let stats = h.tick.run(Utc::now()).await.unwrap();

    // Delivered exactly once, via the fallback endpoint.
    assert_eq!(stats.ua.sent, 1);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, UA2);

    // Primary picked up a cooldown and one penalty step.
    let hash = short_hash(UA1);
    assert!(get(&h.kv, &keys::endpoint_cooldown(&hash)).await.is_some());
    assert_eq!(get(&h.kv, &keys::endpoint_penalty(&hash)).await.as_deref(), Some("1"));
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn back_to_back_ticks_notify_exactly_once() {
    let h = harness();
    h.kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();

    let html = warmap_html(
        &[
            keep_panel("Dun Crauchon", "hib", true),
            keep_panel("Caer Benowyc", "mid", false),
        ],
        &[event_row("2m ago", "Caer Benowyc was captured by the forces of Midgard")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    let now = Utc::now();
    let first = h.tick.run(now).await.unwrap();
    assert_eq!(first.ua.sent, 1);
    assert_eq!(first.captures.sent, 1);
    assert_eq!(h.transport.sent_count(), 2);

    let second = h.tick.run(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(second.ua.sent, 0);
    assert_eq!(second.captures.sent, 0);
    assert!(!second.snapshot_changed, "identical HTML must hash identically");
    assert_eq!(h.transport.sent_count(), 2);
}

// ---------------------------------------------------------------------------
// Strict vs freshness delivery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn strict_delivery_retries_failed_capture_next_tick() {
    let h = harness();
    h.kv.put(keys::STRICT_DELIVERY_FLAG, "1", None).await.unwrap();
    h.kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();

    let html = warmap_html(
        &[keep_panel("Caer Benowyc", "mid", false)],
        &[event_row("2m ago", "Caer Benowyc was captured by the forces of Midgard")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    // Both capture endpoints reject the payload (4xx: no cooldown).
    h.transport.push_response(herald_alerts::webhook::TransportResponse {
        status: 404,
        ..Default::default()
    });
    h.transport.push_response(herald_alerts::webhook::TransportResponse {
        status: 404,
        ..Default::default()
    });

    let now = Utc::now();
    let stats = h.tick.run(now).await.unwrap();
    assert_eq!(stats.captures.sent, 0);

    // Strict mode: nothing advanced, nothing stamped.
    assert_eq!(get(&h.kv, &keys::own("caer-benowyc")).await.as_deref(), Some("Albion"));
    assert!(get(&h.kv, &keys::cap_once_owner("caer-benowyc", Realm::Midgard)).await.is_none());
    assert!(get(&h.kv, &keys::ua_suppress("caer-benowyc")).await.is_none());

    // Next tick the webhook is healthy again: the capture goes out.
    let stats = h.tick.run(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(stats.captures.sent, 1);
    assert_eq!(get(&h.kv, &keys::own("caer-benowyc")).await.as_deref(), Some("Midgard"));
}

#[tokio::test(start_paused = true)]
async fn freshness_delivery_advances_state_despite_failure() {
    let h = harness();
    h.kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();

    let html = warmap_html(
        &[keep_panel("Caer Benowyc", "mid", false)],
        &[event_row("2m ago", "Caer Benowyc was captured by the forces of Midgard")],
    );
    h.fetcher.set_page(WARMAP_URL, &html);

    h.transport.push_response(herald_alerts::webhook::TransportResponse {
        status: 404,
        ..Default::default()
    });
    h.transport.push_response(herald_alerts::webhook::TransportResponse {
        status: 404,
        ..Default::default()
    });

    let now = Utc::now();
    let stats = h.tick.run(now).await.unwrap();
    assert_eq!(stats.captures.sent, 0);

    // Freshness-first: the world moved on even though the alert was lost.
    assert_eq!(get(&h.kv, &keys::own("caer-benowyc")).await.as_deref(), Some("Midgard"));
    assert!(get(&h.kv, &keys::cap_once_owner("caer-benowyc", Realm::Midgard)).await.is_some());

    // And the next tick stays silent.
    let stats = h.tick.run(now + Duration::seconds(60)).await.unwrap();
    assert_eq!(stats.captures.sent, 0);
    assert_eq!(h.transport.sent_count(), 0);
}

// ---------------------------------------------------------------------------
// Capture window boundary
// ---------------------------------------------------------------------------

fn synth_snapshot(owner: Realm, event_age: Duration, now: DateTime<Utc>) -> Snapshot {
    let name = "Caer Benowyc";
    Snapshot {
        updated_at: now,
        keeps: vec![Keep {
            id: slugify(name),
            name: name.to_string(),
            keep_type: KeepType::Keep,
            owner,
            level: None,
            claimed_by: None,
            emblem_url: None,
            header_under_attack: false,
            under_attack: false,
            last_event: None,
        }],
        events: vec![WarEvent {
            at: now - event_age,
            kind: EventKind::Captured,
            keep_id: slugify(name),
            keep_name: name.to_string(),
            new_owner: Some(owner),
            leader: None,
            raw: String::new(),
        }],
        df_owner: Realm::Midgard,
    }
}

#[tokio::test(start_paused = true)]
async fn capture_window_boundary_is_inclusive() {
    let h = harness();
    let dispatcher = Dispatcher::new(h.kv.clone(), h.transport.clone(), 2000);
    let alerter = CaptureAlerter::new(
        h.kv.clone(),
        dispatcher,
        ChannelConfig::capture(&h.config),
        h.config.clone(),
    );
    let now = Utc::now();

    // Exactly at the window: fresh.
    h.kv.put(&keys::own("caer-benowyc"), "Albion", None).await.unwrap();
    let snap = synth_snapshot(Realm::Midgard, Duration::minutes(12), now);
    let outcome = alerter.run(&snap, now).await;
    assert_eq!(outcome.sent, 1);

    // One second older: uncorroborated, baseline advances silently.
    h.kv.put(&keys::own("caer-benowyc"), "Hibernia", None).await.unwrap();
    let snap = synth_snapshot(Realm::Albion, Duration::minutes(12) + Duration::seconds(1), now);
    let outcome = alerter.run(&snap, now).await;
    assert_eq!(outcome.sent, 0);
    assert_eq!(outcome.advanced, 1);
    assert_eq!(get(&h.kv, &keys::own("caer-benowyc")).await.as_deref(), Some("Albion"));
}

// ---------------------------------------------------------------------------
// Tracked players
// ---------------------------------------------------------------------------

fn profile_html(rp: &str) -> String {
    format!("<table><tr><td>Realm Points</td><td>{rp}</td></tr></table>")
}

#[tokio::test(start_paused = true)]
async fn player_gain_notifies_and_opens_session() {
    let h = harness();
    h.kv.put(&keys::rp("saz"), "10000", None).await.unwrap();
    h.fetcher.set_page(SAZ_URL, &profile_html("10,450"));

    let now = Utc::now();
    let stats = h.tick.player_scan().run(now).await;

    assert_eq!(stats.notified, 1);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, PLAYERS);
    assert_eq!(sent[0].1["embeds"][0]["title"], "🟢 Saz is active");
    assert_eq!(sent[0].1["embeds"][0]["description"], "+450 RPs gained");

    assert_eq!(get(&h.kv, &keys::rp("saz")).await.as_deref(), Some("10450"));
    assert!(get(&h.kv, &keys::rp_active("saz")).await.is_some());
    assert!(get(&h.kv, &keys::rp_last("saz")).await.is_some());
}

#[tokio::test(start_paused = true)]
async fn player_small_gain_in_session_stays_quiet() {
    let h = harness();
    let now = Utc::now();
    h.kv.put(&keys::rp("saz"), "10450", None).await.unwrap();
    h.kv.put(&keys::rp_active("saz"), "1", None).await.unwrap();
    h.kv
        .put(&keys::rp_last("saz"), &now.timestamp_millis().to_string(), None)
        .await
        .unwrap();
    h.fetcher.set_page(SAZ_URL, &profile_html("10500"));

    let stats = h.tick.player_scan().run(now).await;

    assert_eq!(stats.notified, 0);
    assert_eq!(h.transport.sent_count(), 0);
    // Baseline still advances.
    assert_eq!(get(&h.kv, &keys::rp("saz")).await.as_deref(), Some("10500"));
}

#[tokio::test(start_paused = true)]
async fn player_big_delta_bypasses_session() {
    let h = harness();
    let now = Utc::now();
    h.kv.put(&keys::rp("saz"), "10000", None).await.unwrap();
    h.kv.put(&keys::rp_active("saz"), "1", None).await.unwrap();
    h.kv
        .put(&keys::rp_last("saz"), &now.timestamp_millis().to_string(), None)
        .await
        .unwrap();
    h.fetcher.set_page(SAZ_URL, &profile_html("10600"));

    let stats = h.tick.player_scan().run(now).await;
    assert_eq!(stats.notified, 1);
}

#[tokio::test(start_paused = true)]
async fn player_rollover_resets_state_silently() {
    let h = harness();
    h.kv.put(&keys::rp("saz"), "10450", None).await.unwrap();
    h.kv.put(&keys::rp_active("saz"), "1", None).await.unwrap();
    h.kv.put(&keys::rp_last("saz"), "123", None).await.unwrap();
    h.fetcher.set_page(SAZ_URL, &profile_html("0"));

    let stats = h.tick.player_scan().run(Utc::now()).await;

    assert_eq!(stats.notified, 0);
    assert_eq!(stats.rollovers, 1);
    assert_eq!(h.transport.sent_count(), 0);
    assert_eq!(get(&h.kv, &keys::rp("saz")).await.as_deref(), Some("0"));
    assert!(get(&h.kv, &keys::rp_active("saz")).await.is_none());
    assert!(get(&h.kv, &keys::rp_last("saz")).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn player_first_sighting_seeds_without_alert() {
    let h = harness();
    h.fetcher.set_page(SAZ_URL, &profile_html("9000"));

    let stats = h.tick.player_scan().run(Utc::now()).await;

    assert_eq!(stats.notified, 0);
    assert_eq!(h.transport.sent_count(), 0);
    assert_eq!(get(&h.kv, &keys::rp("saz")).await.as_deref(), Some("9000"));
}
