//! Inbound forwarder — POSTs normalized messages to the backend webhook.
//!
//! Consumes the channel's message stream and delivers each message to
//! `{backend_url}/whatsapp/incoming` as `{"from_number": ..., "text": ...}`.
//! Delivery failures are logged and retried a few times, never fatal.

use crate::channels::InboundMessage;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Delivery attempts per message.
const MAX_ATTEMPTS: u32 = 3;
/// Initial retry delay, doubled per attempt.
const RETRY_DELAY_MS: u64 = 500;

/// The wire payload the backend receives.
#[derive(Debug, Serialize)]
struct ForwardPayload<'a> {
    from_number: &'a str,
    text: &'a str,
}

/// Join the configured base URL with the fixed webhook path.
pub fn incoming_endpoint(backend_url: &str) -> String {
    format!("{}/whatsapp/incoming", backend_url.trim_end_matches('/'))
}

pub struct Forwarder {
    endpoint: String,
    http: reqwest::Client,
}

impl Forwarder {
    pub fn new(backend_url: &str) -> Self {
        Self {
            endpoint: incoming_endpoint(backend_url),
            http: reqwest::Client::new(),
        }
    }

    /// Consume the inbound stream until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>) {
        info!("forwarding inbound messages to {}", self.endpoint);
        while let Some(msg) = rx.recv().await {
            self.deliver(&msg).await;
        }
        debug!("inbound stream closed; forwarder stopping");
    }

    async fn deliver(&self, msg: &InboundMessage) {
        let payload = ForwardPayload {
            from_number: &msg.from_number,
            text: &msg.text,
        };

        let mut delay = RETRY_DELAY_MS;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.http.post(&self.endpoint).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(
                        "forwarded message {} from {} (attempt {attempt})",
                        msg.id, msg.from_number
                    );
                    return;
                }
                Ok(resp) => {
                    warn!(
                        "backend rejected message {} with {} (attempt {attempt}/{MAX_ATTEMPTS})",
                        msg.id,
                        resp.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "failed to forward message {} (attempt {attempt}/{MAX_ATTEMPTS}): {e}",
                        msg.id
                    );
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                delay *= 2;
            }
        }
        warn!("giving up on message {} from {}", msg.id, msg.from_number);
    }
}

/// Drain-and-drop consumer used when no backend URL is configured.
pub async fn drain(mut rx: mpsc::Receiver<InboundMessage>) {
    while let Some(msg) = rx.recv().await {
        debug!(
            "no backend_url configured; dropping inbound message from {}",
            msg.from_number
        );
    }
}
