//! External node registry: heartbeats and policy advertisement.

use crate::error::{AccordError, Result};
use crate::policy::Policy;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Periodic liveness signal for a registered device.
    async fn heartbeat(&self, device_id: &str) -> Result<()>;

    /// Publish the device's full advertised policy set.
    async fn advertise(&self, device_id: &str, policies: &[Policy]) -> Result<()>;
}

#[derive(Serialize)]
struct AdvertiseBody<'a> {
    policies: &'a [Policy],
}

/// REST registry client. Retries are handled per call with a fixed backoff.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    retries: u32,
    retry_interval: Duration,
}

impl HttpRegistry {
    pub fn new(base_url: &str, retries: u32, retry_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            retries,
            retry_interval,
        }
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}/{path}", self.base_url);
        let mut last_error = String::new();
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }
            match self.client.post(&url).json(body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(%url, attempt, "registry call succeeded");
                    return Ok(());
                }
                Ok(response) => last_error = format!("registry returned {}", response.status()),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(AccordError::Transport(format!(
            "registry call {url} failed after {} attempts: {last_error}",
            self.retries + 1
        )))
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    async fn heartbeat(&self, device_id: &str) -> Result<()> {
        self.post(&format!("devices/{device_id}/heartbeat"), &serde_json::json!({}))
            .await
    }

    async fn advertise(&self, device_id: &str, policies: &[Policy]) -> Result<()> {
        self.post(
            &format!("devices/{device_id}/policies"),
            &AdvertiseBody { policies },
        )
        .await
    }
}
