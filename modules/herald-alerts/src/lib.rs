//! The transition-detection and delivery engine: fetch → parse → diff →
//! dedupe → pace → deliver, coordinated across overlapping invocations
//! through the KV store alone.

pub mod admin;
pub mod capture;
pub mod embeds;
pub mod fetch;
pub mod metrics;
pub mod players;
pub mod testutil;
pub mod tick;
pub mod ua;
pub mod webhook;

pub use fetch::{HttpFetcher, PageFetcher};
pub use tick::{Tick, TickStats};
pub use webhook::{Channel, ChannelConfig, Dispatcher, HttpTransport, WebhookTransport};
