//! Pure transition logic for the two-step settlement flow.
//!
//! `evaluate` takes the current record plus one piece of chain-sourced
//! evidence and decides whether the investment advances. It performs no I/O
//! and mutates nothing; the caller applies [`Outcome::Advance`] through the
//! store's compare-and-swap.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::chain::{self, Chain, TxRecord};
use crate::error::SettlementError;
use crate::investment::models::{Investment, InvestmentStatus, StateUpdate};
use crate::vault::VaultConfig;

/// Tolerance for decimal amount comparisons: one cent of USDT. Payments and
/// disbursements within this distance of the required amount are accepted.
pub const AMOUNT_EPSILON: Decimal = dec!(0.01);

/// Guard parameters the transition function evaluates against
#[derive(Debug, Clone)]
pub struct SettlementPolicy {
    /// Platform collection address per payment chain
    pub collection_addresses: HashMap<Chain, String>,
    /// Stablecoin contract expected to carry the payment, per chain
    pub usdt_contracts: HashMap<Chain, String>,
    /// Maximum wait for payment confirmation before the investment fails
    pub payment_deadline: Duration,
    pub amount_epsilon: Decimal,
}

impl SettlementPolicy {
    pub fn collection_address(&self, chain: Chain) -> Result<&str, SettlementError> {
        self.collection_addresses
            .get(&chain)
            .map(String::as_str)
            .ok_or_else(|| {
                SettlementError::Config(format!("no collection address configured for {chain}"))
            })
    }
}

/// A chain-sourced fact driving one transition attempt. The only input the
/// machine accepts besides the current record.
#[derive(Debug, Clone)]
pub enum Evidence {
    /// The user handed over their payment transaction hash
    PaymentSubmitted {
        chain: Chain,
        tx_hash: String,
        submitted_at: DateTime<Utc>,
    },
    /// Chain lookup result for the recorded payment hash
    PaymentConfirmed(TxRecord),
    /// The minting workflow handed over a disbursement hash
    DisbursementSubmitted { token: String, tx_hash: String },
    /// Chain lookup result for a recorded disbursement hash
    DisbursementConfirmed { token: String, tx: TxRecord },
    /// Periodic deadline probe
    DeadlineCheck { now: DateTime<Utc> },
}

/// Result of evaluating evidence against the current record
#[derive(Debug)]
pub enum Outcome {
    /// Guards passed; apply via compare-and-swap
    Advance(StateUpdate),
    /// No transition. The record is untouched; operator-relevant holds are
    /// recorded as settlement events by the caller.
    Hold(HoldReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HoldReason {
    /// Replayed evidence for a step that already took effect
    AlreadyApplied,
    /// Transaction exists but is not yet final
    AwaitingConfirmation,
    /// Evidence names a different chain than the recorded one
    ChainMismatch { expected: Chain, actual: Chain },
    /// Confirmed transfer went somewhere other than the expected recipient
    WrongRecipient { expected: String, actual: String },
    /// The transfer moved a different token than the one owed
    MintMismatch { expected: String, actual: String },
    /// Confirmed amount is short of the required principal
    Underpayment { required: Decimal, actual: Decimal },
    /// Disbursement amount does not match the computed entitlement
    EntitlementMismatch {
        token: String,
        required: Decimal,
        actual: Decimal,
    },
    /// Evidence hash differs from the hash already recorded for this step
    HashMismatch { recorded: String, actual: String },
    /// The payment deadline has not elapsed
    DeadlineNotReached,
    /// Evidence does not apply to the record's current status
    NotApplicable,
}

impl HoldReason {
    pub fn describe(&self) -> String {
        match self {
            HoldReason::AlreadyApplied => "evidence already applied".to_string(),
            HoldReason::AwaitingConfirmation => "transaction not yet final".to_string(),
            HoldReason::ChainMismatch { expected, actual } => {
                format!("evidence chain {actual} does not match recorded chain {expected}")
            }
            HoldReason::WrongRecipient { expected, actual } => {
                format!("transfer recipient {actual}, expected {expected}")
            }
            HoldReason::MintMismatch { expected, actual } => {
                format!("transfer moved token {actual}, expected {expected}")
            }
            HoldReason::Underpayment { required, actual } => {
                format!("paid {actual}, required {required}")
            }
            HoldReason::EntitlementMismatch {
                token,
                required,
                actual,
            } => format!("{token} disbursement {actual}, entitlement {required}"),
            HoldReason::HashMismatch { recorded, actual } => {
                format!("evidence hash {actual} differs from recorded {recorded}")
            }
            HoldReason::DeadlineNotReached => "payment deadline not reached".to_string(),
            HoldReason::NotApplicable => "evidence not applicable in current status".to_string(),
        }
    }
}

/// Evaluate one piece of evidence against an investment.
pub fn evaluate(
    investment: &Investment,
    vault: &VaultConfig,
    policy: &SettlementPolicy,
    evidence: &Evidence,
) -> Result<Outcome, SettlementError> {
    use Evidence::*;
    use HoldReason::*;
    use InvestmentStatus::*;

    match (investment.status, evidence) {
        // ---- Step 1: record the externally submitted payment ----
        (
            AwaitingPayment,
            PaymentSubmitted {
                chain,
                tx_hash,
                submitted_at,
            },
        ) => {
            if !chain.is_payment_chain() {
                return Err(SettlementError::UnsupportedPaymentChain(*chain));
            }
            if !chain::is_valid_tx_hash(*chain, tx_hash) {
                return Err(SettlementError::InvalidHash {
                    chain: *chain,
                    hash: tx_hash.clone(),
                });
            }
            Ok(Outcome::Advance(StateUpdate {
                payment_chain: Some(*chain),
                usdt_tx_hash: Some(tx_hash.clone()),
                payment_deadline_at: Some(*submitted_at + policy.payment_deadline),
                ..StateUpdate::status(PendingUsdt)
            }))
        }
        // Resubmitting the hash already on record is a no-op
        (_, PaymentSubmitted { chain, tx_hash, .. })
            if investment.usdt_tx_hash.as_deref() == Some(tx_hash.as_str())
                && investment.payment_chain == Some(*chain) =>
        {
            Ok(Outcome::Hold(AlreadyApplied))
        }
        (_, PaymentSubmitted { .. }) => Err(SettlementError::InvalidTransition {
            current: investment.status.to_string(),
            expected: AwaitingPayment.to_string(),
        }),

        // ---- Step 1 confirmation ----
        (PendingUsdt, PaymentConfirmed(tx)) => {
            let payment_chain = investment.payment_chain.ok_or_else(|| {
                SettlementError::Inconsistent(format!(
                    "investment {} pending payment without a payment chain",
                    investment.id
                ))
            })?;
            let recorded_hash = investment.usdt_tx_hash.as_deref().ok_or_else(|| {
                SettlementError::Inconsistent(format!(
                    "investment {} pending payment without a tx hash",
                    investment.id
                ))
            })?;

            if tx.chain != payment_chain {
                return Ok(Outcome::Hold(ChainMismatch {
                    expected: payment_chain,
                    actual: tx.chain,
                }));
            }
            if tx.tx_hash != recorded_hash {
                return Ok(Outcome::Hold(HashMismatch {
                    recorded: recorded_hash.to_string(),
                    actual: tx.tx_hash.clone(),
                }));
            }
            if tx.rejected {
                return Ok(Outcome::Advance(StateUpdate {
                    failure_reason: Some(format!(
                        "payment transaction {} rejected on {}",
                        tx.tx_hash, tx.chain
                    )),
                    ..StateUpdate::status(Failed)
                }));
            }
            if !tx.confirmed {
                return Ok(Outcome::Hold(AwaitingConfirmation));
            }
            if let (Some(moved), Some(expected)) =
                (&tx.token, policy.usdt_contracts.get(&payment_chain))
            {
                if chain::normalize_address(payment_chain, moved)
                    != chain::normalize_address(payment_chain, expected)
                {
                    return Ok(Outcome::Hold(MintMismatch {
                        expected: expected.clone(),
                        actual: moved.clone(),
                    }));
                }
            }
            let collection = policy.collection_address(payment_chain)?;
            if chain::normalize_address(payment_chain, &tx.recipient)
                != chain::normalize_address(payment_chain, collection)
            {
                return Ok(Outcome::Hold(WrongRecipient {
                    expected: collection.to_string(),
                    actual: tx.recipient.clone(),
                }));
            }
            // Overpayment is accepted; underpayment is held for an operator
            if tx.amount + policy.amount_epsilon < investment.principal {
                return Ok(Outcome::Hold(Underpayment {
                    required: investment.principal,
                    actual: tx.amount,
                }));
            }
            Ok(Outcome::Advance(StateUpdate {
                step1_completed_at: Some(tx.observed_at),
                ..StateUpdate::status(PendingTokens)
            }))
        }
        // Replayed confirmation after the step already advanced
        (PendingTokens | Completed, PaymentConfirmed(_)) => Ok(Outcome::Hold(AlreadyApplied)),
        (_, PaymentConfirmed(_)) => Ok(Outcome::Hold(NotApplicable)),

        // ---- Step 2: record disbursement hashes from the minting workflow ----
        (PendingTokens, DisbursementSubmitted { token, tx_hash }) => {
            if vault.reward_token(token).is_none() {
                return Err(SettlementError::UnknownRewardToken {
                    vault: vault.id.clone(),
                    token: token.clone(),
                });
            }
            if !chain::is_valid_tx_hash(investment.token_chain, tx_hash) {
                return Err(SettlementError::InvalidHash {
                    chain: investment.token_chain,
                    hash: tx_hash.clone(),
                });
            }
            match investment.reward_tx_hashes.get(token) {
                Some(recorded) if recorded == tx_hash => Ok(Outcome::Hold(AlreadyApplied)),
                Some(recorded) => Ok(Outcome::Hold(HashMismatch {
                    recorded: recorded.clone(),
                    actual: tx_hash.clone(),
                })),
                None => Ok(Outcome::Advance(StateUpdate {
                    record_reward_hash: Some((token.clone(), tx_hash.clone())),
                    ..StateUpdate::status(PendingTokens)
                })),
            }
        }
        (_, DisbursementSubmitted { .. }) => Err(SettlementError::InvalidTransition {
            current: investment.status.to_string(),
            expected: PendingTokens.to_string(),
        }),

        // ---- Step 2 confirmation; completes once every required token is
        // confirmed ----
        (PendingTokens, DisbursementConfirmed { token, tx }) => {
            let Some(reward) = vault.reward_token(token) else {
                return Ok(Outcome::Hold(NotApplicable));
            };
            let Some(recorded) = investment.reward_tx_hashes.get(token) else {
                return Ok(Outcome::Hold(NotApplicable));
            };
            if recorded != &tx.tx_hash {
                return Ok(Outcome::Hold(HashMismatch {
                    recorded: recorded.clone(),
                    actual: tx.tx_hash.clone(),
                }));
            }
            if investment.reward_confirmed(token) {
                return Ok(Outcome::Hold(AlreadyApplied));
            }
            if tx.chain != investment.token_chain {
                return Ok(Outcome::Hold(ChainMismatch {
                    expected: investment.token_chain,
                    actual: tx.chain,
                }));
            }
            if !tx.confirmed {
                return Ok(Outcome::Hold(AwaitingConfirmation));
            }
            if let Some(moved) = &tx.token {
                if moved != &reward.mint {
                    return Ok(Outcome::Hold(MintMismatch {
                        expected: reward.mint.clone(),
                        actual: moved.clone(),
                    }));
                }
            }
            if chain::normalize_address(investment.token_chain, &tx.recipient)
                != chain::normalize_address(investment.token_chain, &investment.wallet_address)
            {
                return Ok(Outcome::Hold(WrongRecipient {
                    expected: investment.wallet_address.clone(),
                    actual: tx.recipient.clone(),
                }));
            }
            let required = investment.principal * reward.ratio;
            if (tx.amount - required).abs() > policy.amount_epsilon {
                return Ok(Outcome::Hold(EntitlementMismatch {
                    token: token.clone(),
                    required,
                    actual: tx.amount,
                }));
            }

            // step2 never precedes step1 even under clock skew
            let confirmed_at = match investment.step1_completed_at {
                Some(step1) => tx.observed_at.max(step1),
                None => tx.observed_at,
            };
            let outstanding = vault
                .reward_tokens
                .iter()
                .filter(|t| t.symbol != *token && !investment.reward_confirmed(&t.symbol))
                .count();
            if outstanding == 0 {
                Ok(Outcome::Advance(StateUpdate {
                    confirm_reward: Some((token.clone(), confirmed_at)),
                    step2_completed_at: Some(confirmed_at),
                    ..StateUpdate::status(Completed)
                }))
            } else {
                Ok(Outcome::Advance(StateUpdate {
                    confirm_reward: Some((token.clone(), confirmed_at)),
                    ..StateUpdate::status(PendingTokens)
                }))
            }
        }
        (Completed, DisbursementConfirmed { .. }) => Ok(Outcome::Hold(AlreadyApplied)),
        (_, DisbursementConfirmed { .. }) => Ok(Outcome::Hold(NotApplicable)),

        // ---- Payment deadline. Only the payment step fails on a timer ----
        (PendingUsdt, DeadlineCheck { now }) => match investment.payment_deadline_at {
            Some(deadline) if *now >= deadline => Ok(Outcome::Advance(StateUpdate {
                failure_reason: Some("payment confirmation deadline exceeded".to_string()),
                ..StateUpdate::status(Failed)
            })),
            _ => Ok(Outcome::Hold(DeadlineNotReached)),
        },
        (_, DeadlineCheck { .. }) => Ok(Outcome::Hold(NotApplicable)),
    }
}
