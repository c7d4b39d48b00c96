//! Durable agreement records.
//!
//! Negotiation is only as trustworthy as its persistence: an accepting
//! reply must never leave this process before the acceptance is on disk.
//! The store trait keeps the engine independent of the backend; Postgres
//! carries production, the in-memory store carries dry runs and tests.

pub mod postgres;

use crate::error::{AccordError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

pub use postgres::PostgresStore;

/// Lifecycle of a stored agreement. Deletion is not a state: rejected or
/// rolled-back agreements leave the store entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementState {
    Pending,
    Accepted,
    Active,
    Terminated,
}

impl AgreementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementState::Pending => "pending",
            AgreementState::Accepted => "accepted",
            AgreementState::Active => "active",
            AgreementState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(AgreementState::Pending),
            "accepted" => Ok(AgreementState::Accepted),
            "active" => Ok(AgreementState::Active),
            "terminated" => Ok(AgreementState::Terminated),
            other => Err(AccordError::Persistence(format!(
                "unknown agreement state {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishedAgreement {
    pub agreement_id: String,
    pub protocol: String,
    pub state: AgreementState,
    pub counterparty: String,
    /// Raw proposal payload as received.
    pub proposal: String,
    pub terms_hash: Option<String>,
    pub signature: Option<String>,
    pub signer_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub terminated_reason: Option<u64>,
}

/// Agreement records keyed by (agreement id, protocol name).
#[async_trait]
pub trait AgreementStore: Send + Sync {
    /// Create the pending record. Creating an id that already exists fails
    /// without altering the stored record.
    async fn create_pending(
        &self,
        agreement_id: &str,
        protocol: &str,
        counterparty: &str,
        proposal: &str,
    ) -> Result<()>;

    /// Pending -> Accepted, recording what we signed. Must succeed before
    /// any accepting reply is transmitted.
    async fn mark_accepted(
        &self,
        agreement_id: &str,
        protocol: &str,
        terms_hash: &str,
        signature: &str,
        signer_address: &str,
    ) -> Result<()>;

    /// Accepted -> Active, after the counterparty's confirmation.
    async fn mark_active(&self, agreement_id: &str, protocol: &str) -> Result<()>;

    /// Accepted or Active -> Terminated with the protocol reason code.
    async fn mark_terminated(&self, agreement_id: &str, protocol: &str, reason: u64)
        -> Result<()>;

    /// Remove a pending record: rejection or full rollback only.
    async fn delete(&self, agreement_id: &str, protocol: &str) -> Result<()>;

    async fn find(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<Option<EstablishedAgreement>>;

    async fn list(&self) -> Result<Vec<EstablishedAgreement>>;
}

fn bad_transition(from: AgreementState, to: AgreementState) -> AccordError {
    AccordError::InvalidStateTransition {
        from: from.as_str().to_string(),
        to: to.as_str().to_string(),
    }
}

fn not_found(agreement_id: &str, protocol: &str) -> AccordError {
    AccordError::Persistence(format!("no agreement {agreement_id} under {protocol}"))
}

/// In-memory store for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    agreements: RwLock<HashMap<(String, String), EstablishedAgreement>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(agreement_id: &str, protocol: &str) -> (String, String) {
        (agreement_id.to_string(), protocol.to_string())
    }
}

#[async_trait]
impl AgreementStore for MemoryStore {
    async fn create_pending(
        &self,
        agreement_id: &str,
        protocol: &str,
        counterparty: &str,
        proposal: &str,
    ) -> Result<()> {
        let mut agreements = self.agreements.write().await;
        let key = Self::key(agreement_id, protocol);
        if agreements.contains_key(&key) {
            return Err(AccordError::Persistence(format!(
                "agreement {agreement_id} already exists under {protocol}"
            )));
        }
        agreements.insert(
            key,
            EstablishedAgreement {
                agreement_id: agreement_id.to_string(),
                protocol: protocol.to_string(),
                state: AgreementState::Pending,
                counterparty: counterparty.to_string(),
                proposal: proposal.to_string(),
                terms_hash: None,
                signature: None,
                signer_address: None,
                created_at: Utc::now(),
                accepted_at: None,
                terminated_at: None,
                terminated_reason: None,
            },
        );
        Ok(())
    }

    async fn mark_accepted(
        &self,
        agreement_id: &str,
        protocol: &str,
        terms_hash: &str,
        signature: &str,
        signer_address: &str,
    ) -> Result<()> {
        let mut agreements = self.agreements.write().await;
        let record = agreements
            .get_mut(&Self::key(agreement_id, protocol))
            .ok_or_else(|| not_found(agreement_id, protocol))?;
        if record.state != AgreementState::Pending {
            return Err(bad_transition(record.state, AgreementState::Accepted));
        }
        record.state = AgreementState::Accepted;
        record.terms_hash = Some(terms_hash.to_string());
        record.signature = Some(signature.to_string());
        record.signer_address = Some(signer_address.to_string());
        record.accepted_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_active(&self, agreement_id: &str, protocol: &str) -> Result<()> {
        let mut agreements = self.agreements.write().await;
        let record = agreements
            .get_mut(&Self::key(agreement_id, protocol))
            .ok_or_else(|| not_found(agreement_id, protocol))?;
        if record.state != AgreementState::Accepted {
            return Err(bad_transition(record.state, AgreementState::Active));
        }
        record.state = AgreementState::Active;
        Ok(())
    }

    async fn mark_terminated(
        &self,
        agreement_id: &str,
        protocol: &str,
        reason: u64,
    ) -> Result<()> {
        let mut agreements = self.agreements.write().await;
        let record = agreements
            .get_mut(&Self::key(agreement_id, protocol))
            .ok_or_else(|| not_found(agreement_id, protocol))?;
        match record.state {
            AgreementState::Accepted | AgreementState::Active => {
                record.state = AgreementState::Terminated;
                record.terminated_at = Some(Utc::now());
                record.terminated_reason = Some(reason);
                Ok(())
            }
            other => Err(bad_transition(other, AgreementState::Terminated)),
        }
    }

    async fn delete(&self, agreement_id: &str, protocol: &str) -> Result<()> {
        let mut agreements = self.agreements.write().await;
        let key = Self::key(agreement_id, protocol);
        match agreements.get(&key) {
            None => Err(not_found(agreement_id, protocol)),
            Some(record) if record.state != AgreementState::Pending => {
                Err(AccordError::Persistence(format!(
                    "agreement {agreement_id} is {}, only pending records can be deleted",
                    record.state.as_str()
                )))
            }
            Some(_) => {
                agreements.remove(&key);
                Ok(())
            }
        }
    }

    async fn find(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<Option<EstablishedAgreement>> {
        Ok(self
            .agreements
            .read()
            .await
            .get(&Self::key(agreement_id, protocol))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<EstablishedAgreement>> {
        let mut all: Vec<EstablishedAgreement> =
            self.agreements.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}
