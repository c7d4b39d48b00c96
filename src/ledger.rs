//! Ledger anchoring for the ledger-backed protocol variant.
//!
//! The ledger itself lives outside this process; the protocol only needs a
//! narrow surface to record an accepted agreement, look up the
//! counterparty's signature, and write a termination.

use crate::error::{AccordError, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Anchor an accepted agreement: the signed terms hash under the
    /// agreement id.
    async fn record_agreement(
        &self,
        agreement_id: &str,
        terms_hash: &str,
        signature: &str,
        address: &str,
    ) -> Result<()>;

    /// Write a termination with the protocol reason code.
    async fn terminate_agreement(&self, agreement_id: &str, reason: u64) -> Result<()>;

    /// The counterparty's recorded signature for an agreement, if any.
    async fn counterparty_signature(&self, agreement_id: &str) -> Result<Option<String>>;
}

#[derive(Serialize)]
struct RecordBody<'a> {
    terms_hash: &'a str,
    signature: &'a str,
    address: &'a str,
}

#[derive(Serialize)]
struct TerminateBody {
    reason: u64,
}

/// REST gateway in front of the ledger.
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn record_agreement(
        &self,
        agreement_id: &str,
        terms_hash: &str,
        signature: &str,
        address: &str,
    ) -> Result<()> {
        let url = format!("{}/agreements/{agreement_id}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RecordBody { terms_hash, signature, address })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AccordError::Ledger(format!(
                "recording {agreement_id} failed: {}",
                response.status()
            )));
        }
        debug!(agreement_id, "agreement recorded on ledger");
        Ok(())
    }

    async fn terminate_agreement(&self, agreement_id: &str, reason: u64) -> Result<()> {
        let url = format!("{}/agreements/{agreement_id}/terminate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&TerminateBody { reason })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AccordError::Ledger(format!(
                "terminating {agreement_id} failed: {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn counterparty_signature(&self, agreement_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/agreements/{agreement_id}/counterparty_signature",
            self.base_url
        );
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(AccordError::Ledger(format!(
                "signature lookup for {agreement_id} failed: {}",
                response.status()
            )));
        }
        let signature: String = response.text().await?;
        Ok(Some(signature))
    }
}
