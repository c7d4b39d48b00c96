//! Postgres-backed agreement store.
//!
//! Each transition is one conditional UPDATE guarded by the expected
//! current state, so concurrent writers cannot skip a step; zero rows
//! affected means the record was missing or in the wrong state.

use super::{
    bad_transition, not_found, AgreementState, AgreementStore, EstablishedAgreement,
};
use crate::error::{AccordError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the agreements table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agreements (
                agreement_id      TEXT NOT NULL,
                protocol          TEXT NOT NULL,
                state             TEXT NOT NULL,
                counterparty      TEXT NOT NULL,
                proposal          TEXT NOT NULL,
                terms_hash        TEXT,
                signature         TEXT,
                signer_address    TEXT,
                created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
                accepted_at       TIMESTAMPTZ,
                terminated_at     TIMESTAMPTZ,
                terminated_reason BIGINT,
                PRIMARY KEY (agreement_id, protocol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_state(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<Option<AgreementState>> {
        let row = sqlx::query(
            "SELECT state FROM agreements WHERE agreement_id = $1 AND protocol = $2",
        )
        .bind(agreement_id)
        .bind(protocol)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| AgreementState::parse(r.get::<String, _>("state").as_str()))
            .transpose()
    }

    /// Map a zero-row conditional update to the precise error.
    async fn transition_failed(
        &self,
        agreement_id: &str,
        protocol: &str,
        to: AgreementState,
    ) -> AccordError {
        match self.current_state(agreement_id, protocol).await {
            Ok(Some(state)) => bad_transition(state, to),
            Ok(None) => not_found(agreement_id, protocol),
            Err(e) => e,
        }
    }
}

fn row_to_agreement(row: &PgRow) -> Result<EstablishedAgreement> {
    Ok(EstablishedAgreement {
        agreement_id: row.get("agreement_id"),
        protocol: row.get("protocol"),
        state: AgreementState::parse(row.get::<String, _>("state").as_str())?,
        counterparty: row.get("counterparty"),
        proposal: row.get("proposal"),
        terms_hash: row.get("terms_hash"),
        signature: row.get("signature"),
        signer_address: row.get("signer_address"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        accepted_at: row.get("accepted_at"),
        terminated_at: row.get("terminated_at"),
        terminated_reason: row
            .get::<Option<i64>, _>("terminated_reason")
            .map(|r| r as u64),
    })
}

#[async_trait]
impl AgreementStore for PostgresStore {
    async fn create_pending(
        &self,
        agreement_id: &str,
        protocol: &str,
        counterparty: &str,
        proposal: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO agreements (agreement_id, protocol, state, counterparty, proposal)
            VALUES ($1, $2, 'pending', $3, $4)
            ON CONFLICT (agreement_id, protocol) DO NOTHING
            "#,
        )
        .bind(agreement_id)
        .bind(protocol)
        .bind(counterparty)
        .bind(proposal)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccordError::Persistence(format!(
                "agreement {agreement_id} already exists under {protocol}"
            )));
        }
        debug!(agreement_id, protocol, "pending agreement stored");
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
        let result = sqlx::query(
            r#"
            UPDATE agreements
            SET state = 'accepted', terms_hash = $3, signature = $4,
                signer_address = $5, accepted_at = now()
            WHERE agreement_id = $1 AND protocol = $2 AND state = 'pending'
            "#,
        )
        .bind(agreement_id)
        .bind(protocol)
        .bind(terms_hash)
        .bind(signature)
        .bind(signer_address)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_failed(agreement_id, protocol, AgreementState::Accepted)
                .await);
        }
        Ok(())
    }

    async fn mark_active(&self, agreement_id: &str, protocol: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agreements SET state = 'active'
            WHERE agreement_id = $1 AND protocol = $2 AND state = 'accepted'
            "#,
        )
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_failed(agreement_id, protocol, AgreementState::Active)
                .await);
        }
        Ok(())
    }

    async fn mark_terminated(
        &self,
        agreement_id: &str,
        protocol: &str,
        reason: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agreements
            SET state = 'terminated', terminated_at = now(), terminated_reason = $3
            WHERE agreement_id = $1 AND protocol = $2
              AND state IN ('accepted', 'active')
            "#,
        )
        .bind(agreement_id)
        .bind(protocol)
        .bind(reason as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .transition_failed(agreement_id, protocol, AgreementState::Terminated)
                .await);
        }
        Ok(())
    }

    async fn delete(&self, agreement_id: &str, protocol: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM agreements
            WHERE agreement_id = $1 AND protocol = $2 AND state = 'pending'
            "#,
        )
        .bind(agreement_id)
        .bind(protocol)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccordError::Persistence(format!(
                "no pending agreement {agreement_id} under {protocol} to delete"
            )));
        }
        Ok(())
    }

    async fn find(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> Result<Option<EstablishedAgreement>> {
        let row = sqlx::query(
            "SELECT * FROM agreements WHERE agreement_id = $1 AND protocol = $2",
        )
        .bind(agreement_id)
        .bind(protocol)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_agreement).transpose()
    }

    async fn list(&self) -> Result<Vec<EstablishedAgreement>> {
        let rows = sqlx::query("SELECT * FROM agreements ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agreement).collect()
    }
}
