use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chain::Chain;

/// Wire-stable settlement status.
///
/// Closed enum: the transition function matches exhaustively over it, so a
/// new status forces every guard site to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "investment_status")]
pub enum InvestmentStatus {
    #[sqlx(rename = "AWAITING_PAYMENT")]
    #[serde(rename = "AWAITING_PAYMENT")]
    AwaitingPayment,
    #[sqlx(rename = "PENDING_USDT")]
    #[serde(rename = "PENDING_USDT")]
    PendingUsdt,
    #[sqlx(rename = "PENDING_TOKENS")]
    #[serde(rename = "PENDING_TOKENS")]
    PendingTokens,
    #[sqlx(rename = "COMPLETED")]
    #[serde(rename = "COMPLETED")]
    Completed,
    #[sqlx(rename = "FAILED")]
    #[serde(rename = "FAILED")]
    Failed,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::AwaitingPayment => "AWAITING_PAYMENT",
            InvestmentStatus::PendingUsdt => "PENDING_USDT",
            InvestmentStatus::PendingTokens => "PENDING_TOKENS",
            InvestmentStatus::Completed => "COMPLETED",
            InvestmentStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InvestmentStatus::Completed | InvestmentStatus::Failed)
    }

    /// In-flight statuses the reconciler sweeps
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            InvestmentStatus::PendingUsdt | InvestmentStatus::PendingTokens
        )
    }
}

impl fmt::Display for InvestmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One user's stake in a vault product, tracked across both settlement
/// steps: stablecoin payment in, reward tokens out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Investment {
    pub id: Uuid,
    pub vault_id: String,
    /// Investor's Solana wallet, the reward disbursement recipient
    pub wallet_address: String,

    #[serde(with = "rust_decimal::serde::float")]
    pub principal: Decimal,
    pub currency: String,

    pub status: InvestmentStatus,

    /// Set once on payment submission, immutable thereafter
    pub payment_chain: Option<Chain>,
    /// Fixed to Solana by product design
    pub token_chain: Chain,

    /// Payment transaction hash. Set once, never overwritten or cleared.
    pub usdt_tx_hash: Option<String>,
    /// Reward token symbol -> disbursement tx hash. Each entry set at most
    /// once.
    pub reward_tx_hashes: BTreeMap<String, String>,
    /// Reward token symbol -> on-chain confirmation time
    pub reward_confirmed_at: BTreeMap<String, DateTime<Utc>>,

    pub step1_completed_at: Option<DateTime<Utc>>,
    pub step2_completed_at: Option<DateTime<Utc>>,
    pub payment_deadline_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Investment {
    pub fn new(vault_id: &str, wallet_address: &str, principal: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            vault_id: vault_id.to_string(),
            wallet_address: wallet_address.to_string(),
            principal,
            currency: "USDT".to_string(),
            status: InvestmentStatus::AwaitingPayment,
            payment_chain: None,
            token_chain: Chain::Solana,
            usdt_tx_hash: None,
            reward_tx_hashes: BTreeMap::new(),
            reward_confirmed_at: BTreeMap::new(),
            step1_completed_at: None,
            step2_completed_at: None,
            payment_deadline_at: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reward_confirmed(&self, token: &str) -> bool {
        self.reward_confirmed_at.contains_key(token)
    }
}

/// Field updates produced by a single transition, applied atomically by the
/// store's compare-and-swap. Hash and timestamp fields only ever go from
/// absent to present.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub status: InvestmentStatus,
    pub payment_chain: Option<Chain>,
    pub usdt_tx_hash: Option<String>,
    /// (token symbol, tx hash) to record
    pub record_reward_hash: Option<(String, String)>,
    /// (token symbol, confirmation time) to record
    pub confirm_reward: Option<(String, DateTime<Utc>)>,
    pub step1_completed_at: Option<DateTime<Utc>>,
    pub step2_completed_at: Option<DateTime<Utc>>,
    pub payment_deadline_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl StateUpdate {
    pub fn status(status: InvestmentStatus) -> Self {
        Self {
            status,
            payment_chain: None,
            usdt_tx_hash: None,
            record_reward_hash: None,
            confirm_reward: None,
            step1_completed_at: None,
            step2_completed_at: None,
            payment_deadline_at: None,
            failure_reason: None,
        }
    }

    /// Merge into a record. Optional fields only fill absent slots, so
    /// existing evidence can never be overwritten by a replay.
    pub fn apply_to(&self, investment: &Investment, now: DateTime<Utc>) -> Investment {
        let mut next = investment.clone();
        next.status = self.status;
        if next.payment_chain.is_none() {
            next.payment_chain = self.payment_chain;
        }
        if next.usdt_tx_hash.is_none() {
            next.usdt_tx_hash = self.usdt_tx_hash.clone();
        }
        if let Some((token, hash)) = &self.record_reward_hash {
            next.reward_tx_hashes
                .entry(token.clone())
                .or_insert_with(|| hash.clone());
        }
        if let Some((token, at)) = &self.confirm_reward {
            next.reward_confirmed_at.entry(token.clone()).or_insert(*at);
        }
        if next.step1_completed_at.is_none() {
            next.step1_completed_at = self.step1_completed_at;
        }
        if next.step2_completed_at.is_none() {
            next.step2_completed_at = self.step2_completed_at;
        }
        if next.payment_deadline_at.is_none() {
            next.payment_deadline_at = self.payment_deadline_at;
        }
        if next.failure_reason.is_none() {
            next.failure_reason = self.failure_reason.clone();
        }
        next.updated_at = now;
        next
    }
}

/// Operator-visible settlement event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "settlement_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SettlementEventType {
    PaymentSubmitted,
    PaymentConfirmed,
    UnderpaymentDetected,
    BalanceMismatch,
    DisbursementSubmitted,
    DisbursementConfirmed,
    DisbursementMismatch,
    InvestmentCompleted,
    InvestmentFailed,
    PaymentDeadlineExpired,
}

/// Append-only settlement audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub id: Uuid,
    pub investment_id: Uuid,
    pub event_type: SettlementEventType,
    pub chain: Option<Chain>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SettlementEvent {
    pub fn new(
        investment_id: Uuid,
        event_type: SettlementEventType,
        chain: Option<Chain>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            investment_id,
            event_type,
            chain,
            details,
            created_at: Utc::now(),
        }
    }
}
