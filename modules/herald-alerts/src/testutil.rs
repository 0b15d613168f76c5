//! Doubles for the transport and fetcher seams. Used by the test suites and
//! handy for local dry runs.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use herald_common::HeraldError;

use crate::fetch::PageFetcher;
use crate::webhook::{TransportResponse, WebhookTransport};

/// Records every POST and replays scripted responses. Once the script is
/// exhausted every send succeeds with a healthy rate-limit budget.
pub struct RecordingTransport {
    scripted: Mutex<VecDeque<Result<TransportResponse, String>>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response for the next POST.
    pub fn push_response(&self, resp: TransportResponse) {
        self.scripted.lock().unwrap().push_back(Ok(resp));
    }

    /// Queue a network-level failure for the next POST.
    pub fn push_network_error(&self, msg: &str) {
        self.scripted.lock().unwrap().push_back(Err(msg.to_string()));
    }

    /// Everything POSTed so far, as (url, payload) pairs.
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn success() -> TransportResponse {
        TransportResponse {
            status: 204,
            remaining: Some(5),
            ..Default::default()
        }
    }

    pub fn rate_limited(retry_after_secs: f64, global: bool) -> TransportResponse {
        TransportResponse {
            status: 429,
            retry_after_secs: Some(retry_after_secs),
            global,
            ..Default::default()
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for RecordingTransport {
    async fn post(&self, url: &str, payload: &Value) -> Result<TransportResponse> {
        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(resp)) => {
                if resp.ok() {
                    self.sent
                        .lock()
                        .unwrap()
                        .push((url.to_string(), payload.clone()));
                }
                Ok(resp)
            }
            Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            None => {
                self.sent
                    .lock()
                    .unwrap()
                    .push((url.to_string(), payload.clone()));
                Ok(Self::success())
            }
        }
    }
}

/// Serves canned pages by URL prefix, so cache-buster query params still
/// resolve.
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_page(&self, url_prefix: &str, html: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url_prefix.to_string(), html.to_string());
    }
}

impl Default for StaticFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<String, HeraldError> {
        let pages = self.pages.lock().unwrap();
        pages
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, html)| html.clone())
            .ok_or_else(|| HeraldError::Fetch(format!("no page for {url}")))
    }
}
