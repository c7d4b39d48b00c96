//! Message delivery to negotiation peers.
//!
//! The engine does not own a message bus; it hands outbound payloads to a
//! [`MessageSender`]. The HTTP implementation retries on a fixed backoff
//! and gives up after a bounded number of attempts, surfacing a transport
//! error the caller can act on.

use crate::error::{AccordError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Where a payload should go. The id is the peer's stable identity, the
/// endpoint is whatever the messaging subsystem can deliver to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTarget {
    pub id: String,
    pub endpoint: String,
}

impl MessageTarget {
    pub fn new(id: &str, endpoint: &str) -> Self {
        Self {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, target: &MessageTarget, payload: &[u8]) -> Result<()>;
}

/// HTTP POST delivery with bounded fixed-backoff retry.
pub struct HttpSender {
    client: reqwest::Client,
    retries: u32,
    retry_interval: Duration,
}

impl HttpSender {
    pub fn new(retries: u32, retry_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            retries,
            retry_interval,
        }
    }
}

#[async_trait]
impl MessageSender for HttpSender {
    async fn send(&self, target: &MessageTarget, payload: &[u8]) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }
            let result = self
                .client
                .post(&target.endpoint)
                .header("content-type", "application/json")
                .body(payload.to_vec())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(peer = %target.id, attempt, "message delivered");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("peer returned {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            warn!(
                peer = %target.id,
                attempt,
                error = %last_error,
                "message delivery failed"
            );
        }
        Err(AccordError::Transport(format!(
            "giving up on {} after {} attempts: {last_error}",
            target.id,
            self.retries + 1
        )))
    }
}
