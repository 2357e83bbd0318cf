use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::{Investment, InvestmentStatus, SettlementEvent, StateUpdate};
use crate::chain::Chain;
use crate::error::StoreError;

/// Persistence consumed by the settlement core.
///
/// `apply` is the only mutation path for settled fields. It is a
/// compare-and-swap on the status column and must fail with
/// [`StoreError::StatusConflict`] when the expected status no longer holds,
/// so a lost race is visible to the caller instead of silently clobbering a
/// concurrent transition.
#[async_trait]
pub trait InvestmentStore: Send + Sync {
    async fn create(&self, investment: &Investment) -> Result<Investment, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Investment>, StoreError>;

    /// Lookup used to stop one payment hash funding two investments
    async fn find_by_payment_hash(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> Result<Option<Investment>, StoreError>;

    /// Investments in PENDING_USDT / PENDING_TOKENS, oldest first
    async fn list_pending(&self) -> Result<Vec<Investment>, StoreError>;

    /// Merge `update` into the record iff its status still equals `expected`
    async fn apply(
        &self,
        id: Uuid,
        expected: InvestmentStatus,
        update: &StateUpdate,
    ) -> Result<Investment, StoreError>;

    async fn record_event(&self, event: &SettlementEvent) -> Result<(), StoreError>;
}

/// Postgres-backed store - THE source of truth for investment state
pub struct PgInvestmentStore {
    pool: PgPool,
}

impl PgInvestmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> Result<Investment, sqlx::Error> {
        let reward_tx_hashes: Json<BTreeMap<String, String>> = row.try_get("reward_tx_hashes")?;
        let reward_confirmed_at: Json<BTreeMap<String, DateTime<Utc>>> =
            row.try_get("reward_confirmed_at")?;

        Ok(Investment {
            id: row.try_get("id")?,
            vault_id: row.try_get("vault_id")?,
            wallet_address: row.try_get("wallet_address")?,
            principal: row.try_get("principal")?,
            currency: row.try_get("currency")?,
            status: row.try_get("status")?,
            payment_chain: row.try_get("payment_chain")?,
            token_chain: row.try_get("token_chain")?,
            usdt_tx_hash: row.try_get("usdt_tx_hash")?,
            reward_tx_hashes: reward_tx_hashes.0,
            reward_confirmed_at: reward_confirmed_at.0,
            step1_completed_at: row.try_get("step1_completed_at")?,
            step2_completed_at: row.try_get("step2_completed_at")?,
            payment_deadline_at: row.try_get("payment_deadline_at")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl InvestmentStore for PgInvestmentStore {
    async fn create(&self, investment: &Investment) -> Result<Investment, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO investments (
                id, vault_id, wallet_address, principal, currency, status,
                payment_chain, token_chain, usdt_tx_hash,
                reward_tx_hashes, reward_confirmed_at,
                step1_completed_at, step2_completed_at, payment_deadline_at,
                failure_reason, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING
                id, vault_id, wallet_address, principal, currency, status,
                payment_chain, token_chain, usdt_tx_hash,
                reward_tx_hashes, reward_confirmed_at,
                step1_completed_at, step2_completed_at, payment_deadline_at,
                failure_reason, created_at, updated_at
            "#,
        )
        .bind(investment.id)
        .bind(&investment.vault_id)
        .bind(&investment.wallet_address)
        .bind(investment.principal)
        .bind(&investment.currency)
        .bind(investment.status)
        .bind(investment.payment_chain)
        .bind(investment.token_chain)
        .bind(&investment.usdt_tx_hash)
        .bind(Json(&investment.reward_tx_hashes))
        .bind(Json(&investment.reward_confirmed_at))
        .bind(investment.step1_completed_at)
        .bind(investment.step2_completed_at)
        .bind(investment.payment_deadline_at)
        .bind(&investment.failure_reason)
        .bind(investment.created_at)
        .bind(investment.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Self::from_row(&row)?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Investment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, vault_id, wallet_address, principal, currency, status,
                payment_chain, token_chain, usdt_tx_hash,
                reward_tx_hashes, reward_confirmed_at,
                step1_completed_at, step2_completed_at, payment_deadline_at,
                failure_reason, created_at, updated_at
            FROM investments
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::from_row(&row)).transpose().map_err(Into::into)
    }

    async fn find_by_payment_hash(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> Result<Option<Investment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, vault_id, wallet_address, principal, currency, status,
                payment_chain, token_chain, usdt_tx_hash,
                reward_tx_hashes, reward_confirmed_at,
                step1_completed_at, step2_completed_at, payment_deadline_at,
                failure_reason, created_at, updated_at
            FROM investments
            WHERE payment_chain = $1 AND usdt_tx_hash = $2
            "#,
        )
        .bind(chain)
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::from_row(&row)).transpose().map_err(Into::into)
    }

    async fn list_pending(&self) -> Result<Vec<Investment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                id, vault_id, wallet_address, principal, currency, status,
                payment_chain, token_chain, usdt_tx_hash,
                reward_tx_hashes, reward_confirmed_at,
                step1_completed_at, step2_completed_at, payment_deadline_at,
                failure_reason, created_at, updated_at
            FROM investments
            WHERE status IN ('PENDING_USDT', 'PENDING_TOKENS')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::from_row(row).map_err(Into::into))
            .collect()
    }

    async fn apply(
        &self,
        id: Uuid,
        expected: InvestmentStatus,
        update: &StateUpdate,
    ) -> Result<Investment, StoreError> {
        let current = self.get(id).await?.ok_or(StoreError::NotFound(id))?;
        if current.status != expected {
            return Err(StoreError::StatusConflict {
                id,
                expected: expected.to_string(),
            });
        }
        let next = update.apply_to(&current, Utc::now());

        // The WHERE clause on status is the atomic commit point; a
        // concurrent transition leaves zero rows affected.
        let row = sqlx::query(
            r#"
            UPDATE investments
            SET status = $3, payment_chain = $4, usdt_tx_hash = $5,
                reward_tx_hashes = $6, reward_confirmed_at = $7,
                step1_completed_at = $8, step2_completed_at = $9,
                payment_deadline_at = $10, failure_reason = $11,
                updated_at = $12
            WHERE id = $1 AND status = $2
            RETURNING
                id, vault_id, wallet_address, principal, currency, status,
                payment_chain, token_chain, usdt_tx_hash,
                reward_tx_hashes, reward_confirmed_at,
                step1_completed_at, step2_completed_at, payment_deadline_at,
                failure_reason, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next.status)
        .bind(next.payment_chain)
        .bind(&next.usdt_tx_hash)
        .bind(Json(&next.reward_tx_hashes))
        .bind(Json(&next.reward_confirmed_at))
        .bind(next.step1_completed_at)
        .bind(next.step2_completed_at)
        .bind(next.payment_deadline_at)
        .bind(&next.failure_reason)
        .bind(next.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Self::from_row(&row)?),
            None => Err(StoreError::StatusConflict {
                id,
                expected: expected.to_string(),
            }),
        }
    }

    async fn record_event(&self, event: &SettlementEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settlement_events (id, investment_id, event_type, chain, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.investment_id)
        .bind(event.event_type)
        .bind(event.chain)
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
