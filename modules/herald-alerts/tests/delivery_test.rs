//! Dispatcher behavior: endpoint fallback, cooldowns, pacing bookkeeping,
//! penalties, chunking and the channel gate.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::{json, Value};

use herald_alerts::testutil::RecordingTransport;
use herald_alerts::webhook::TransportResponse;
use herald_alerts::{Channel, ChannelConfig, Dispatcher};
use herald_common::keys;
use herald_common::types::short_hash;
use herald_kv::{KvStore, MemoryKv};

const EP1: &str = "https://hooks.test/one";
const EP2: &str = "https://hooks.test/two";

fn channel() -> ChannelConfig {
    ChannelConfig {
        channel: Channel::UnderAttack,
        endpoints: vec![EP1.to_string(), EP2.to_string()],
        username: "Uthgard Herald".to_string(),
    }
}

fn setup() -> (Arc<MemoryKv>, Arc<RecordingTransport>, Dispatcher) {
    let kv = Arc::new(MemoryKv::new());
    let transport = Arc::new(RecordingTransport::new());
    let dispatcher = Dispatcher::new(kv.clone(), transport.clone(), 2000);
    (kv, transport, dispatcher)
}

fn embeds(n: usize) -> Vec<Value> {
    (0..n).map(|i| json!({ "title": format!("embed {i}") })).collect()
}

#[tokio::test(start_paused = true)]
async fn delivers_to_first_healthy_endpoint() {
    let (_kv, transport, dispatcher) = setup();
    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    assert_eq!(delivered, 1);
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, EP1);
    assert_eq!(sent[0].1["username"], "Uthgard Herald");
}

#[tokio::test(start_paused = true)]
async fn global_rate_limit_aborts_instead_of_falling_through() {
    let (kv, transport, dispatcher) = setup();
    transport.push_response(RecordingTransport::rate_limited(5.0, true));

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    // The body-level global marker must cool the whole pipeline down, not
    // just endpoint one; endpoint two is never attempted.
    assert_eq!(delivered, 0);
    assert_eq!(transport.sent_count(), 0);
    assert!(kv.get(keys::GLOBAL_COOLDOWN_UNTIL).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn server_errors_cool_down_and_penalize() {
    let (kv, transport, dispatcher) = setup();
    transport.push_response(TransportResponse {
        status: 503,
        ..Default::default()
    });

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    // Fell through to endpoint two.
    assert_eq!(delivered, 1);
    assert_eq!(transport.sent()[0].0, EP2);

    let hash = short_hash(EP1);
    assert!(kv.get(&keys::endpoint_cooldown(&hash)).await.unwrap().is_some());
    assert_eq!(
        kv.get(&keys::endpoint_penalty(&hash)).await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test(start_paused = true)]
async fn network_error_penalizes_and_moves_on() {
    let (kv, transport, dispatcher) = setup();
    transport.push_network_error("connection refused");

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    assert_eq!(delivered, 1);
    assert_eq!(transport.sent()[0].0, EP2);
    assert_eq!(
        kv.get(&keys::endpoint_penalty(&short_hash(EP1))).await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test(start_paused = true)]
async fn cooled_endpoint_is_skipped_with_metric() {
    let (kv, transport, dispatcher) = setup();
    let until = (Utc::now() + Duration::seconds(30)).to_rfc3339();
    kv.put(
        &keys::endpoint_cooldown(&short_hash(EP1)),
        &until,
        Some(StdDuration::from_secs(30)),
    )
    .await
    .unwrap();

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    assert_eq!(delivered, 1);
    assert_eq!(transport.sent()[0].0, EP2);
    assert_eq!(
        kv.get(&keys::metric("ua:skipped_cooldown")).await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test(start_paused = true)]
async fn drained_bucket_triggers_proactive_cooldown() {
    let (kv, transport, dispatcher) = setup();
    transport.push_response(TransportResponse {
        status: 200,
        remaining: Some(0),
        reset_after_secs: Some(30.0),
        ..Default::default()
    });

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    assert_eq!(delivered, 1);
    assert_eq!(transport.sent()[0].0, EP1);
    assert!(kv
        .get(&keys::endpoint_cooldown(&short_hash(EP1)))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn success_clears_penalty_and_stamps_last_send() {
    let (kv, transport, dispatcher) = setup();
    let hash = short_hash(EP1);
    kv.put(&keys::endpoint_penalty(&hash), "3", None).await.unwrap();

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    assert_eq!(delivered, 1);
    assert_eq!(transport.sent_count(), 1);
    assert!(kv.get(&keys::endpoint_penalty(&hash)).await.unwrap().is_none());
    assert!(kv.get(&keys::endpoint_last(&hash)).await.unwrap().is_some());
    assert!(kv.get(keys::GLOBAL_LAST).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn batches_are_chunked_by_ten() {
    let (_kv, transport, dispatcher) = setup();
    let delivered = dispatcher.deliver(&channel(), &embeds(23)).await;

    assert_eq!(delivered, 23);
    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].1["embeds"].as_array().unwrap().len(), 10);
    assert_eq!(sent[1].1["embeds"].as_array().unwrap().len(), 10);
    assert_eq!(sent[2].1["embeds"].as_array().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn held_gate_defers_the_whole_batch() {
    let (kv, transport, dispatcher) = setup();
    kv.put(
        &keys::channel_gate("ua"),
        "1",
        Some(StdDuration::from_secs(5)),
    )
    .await
    .unwrap();

    let delivered = dispatcher.deliver(&channel(), &embeds(1)).await;

    assert_eq!(delivered, 0);
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_batch_and_empty_channel_are_noops() {
    let (_kv, transport, dispatcher) = setup();
    assert_eq!(dispatcher.deliver(&channel(), &[]).await, 0);

    let empty = ChannelConfig {
        channel: Channel::Players,
        endpoints: vec![],
        username: "Uthgard Herald".to_string(),
    };
    assert_eq!(dispatcher.deliver(&empty, &embeds(1)).await, 0);
    assert_eq!(transport.sent_count(), 0);
}
