use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::machine::{self, Evidence, HoldReason, Outcome, SettlementPolicy};
use crate::chain::cache::BalanceCache;
use crate::chain::{self, Chain, ChainClient};
use crate::error::{ChainError, SettlementError, SettlementResult};
use crate::investment::models::{
    Investment, InvestmentStatus, SettlementEvent, SettlementEventType,
};
use crate::investment::store::InvestmentStore;
use crate::vault::{VaultConfig, VaultRegistry};

/// Settlement operations exposed to collaborators, plus the evidence
/// application path shared by the scheduled sweep and `force_reconcile`.
///
/// Per-investment transitions are serialized two ways: an in-process
/// single-flight guard keeps concurrent reconcile passes off the same id,
/// and the store's compare-and-swap catches anything the guard cannot see.
pub struct SettlementService {
    store: Arc<dyn InvestmentStore>,
    chain_client: Arc<dyn ChainClient>,
    balances: Arc<BalanceCache>,
    vaults: Arc<VaultRegistry>,
    policy: SettlementPolicy,
    rpc_timeout: Duration,
    inflight: Mutex<HashSet<Uuid>>,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn InvestmentStore>,
        chain_client: Arc<dyn ChainClient>,
        balances: Arc<BalanceCache>,
        vaults: Arc<VaultRegistry>,
        policy: SettlementPolicy,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            store,
            chain_client,
            balances,
            vaults,
            policy,
            rpc_timeout,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Open a new investment in AWAITING_PAYMENT
    pub async fn create_investment(
        &self,
        vault_id: &str,
        wallet_address: &str,
        principal: Decimal,
    ) -> SettlementResult<Investment> {
        let vault = self
            .vaults
            .get(vault_id)
            .ok_or_else(|| SettlementError::UnknownVault(vault_id.to_string()))?;
        if principal < vault.min_principal {
            return Err(SettlementError::BelowMinimum {
                required: vault.min_principal.to_string(),
                actual: principal.to_string(),
            });
        }
        if !chain::is_valid_address(Chain::Solana, wallet_address) {
            return Err(SettlementError::InvalidAddress {
                chain: Chain::Solana,
                address: wallet_address.to_string(),
            });
        }

        let investment = Investment::new(vault_id, wallet_address, principal);
        let created = self.store.create(&investment).await?;
        info!(
            "📄 Investment {} created: {} {} into {}",
            created.id, created.principal, created.currency, vault.name
        );
        Ok(created)
    }

    /// Record the user's payment transaction hash:
    /// AWAITING_PAYMENT -> PENDING_USDT
    pub async fn submit_payment(
        &self,
        id: Uuid,
        tx_hash: &str,
        payment_chain: Chain,
    ) -> SettlementResult<Investment> {
        let investment = self.load(id).await?;
        let vault = self.vault_for(&investment)?;

        // One payment hash funds exactly one investment
        if let Some(other) = self
            .store
            .find_by_payment_hash(payment_chain, tx_hash)
            .await?
        {
            if other.id != id {
                return Err(SettlementError::HashAlreadyClaimed(other.id));
            }
        }

        let evidence = Evidence::PaymentSubmitted {
            chain: payment_chain,
            tx_hash: tx_hash.to_string(),
            submitted_at: Utc::now(),
        };
        match machine::evaluate(&investment, vault, &self.policy, &evidence)? {
            Outcome::Advance(update) => {
                let updated = self.store.apply(id, investment.status, &update).await?;
                self.store
                    .record_event(&SettlementEvent::new(
                        id,
                        SettlementEventType::PaymentSubmitted,
                        Some(payment_chain),
                        json!({ "tx_hash": tx_hash }),
                    ))
                    .await?;
                info!(
                    "💳 Payment {} recorded for investment {} on {}",
                    tx_hash, id, payment_chain
                );
                Ok(updated)
            }
            Outcome::Hold(reason) => {
                debug!("Payment submission held for {}: {}", id, reason.describe());
                Ok(investment)
            }
        }
    }

    /// Record a reward disbursement hash handed over by the minting
    /// workflow. The hash is verified on-chain by the reconciler before it
    /// counts toward completion.
    pub async fn submit_disbursement(
        &self,
        id: Uuid,
        token: &str,
        tx_hash: &str,
    ) -> SettlementResult<Investment> {
        let investment = self.load(id).await?;
        let vault = self.vault_for(&investment)?;

        let evidence = Evidence::DisbursementSubmitted {
            token: token.to_string(),
            tx_hash: tx_hash.to_string(),
        };
        match machine::evaluate(&investment, vault, &self.policy, &evidence)? {
            Outcome::Advance(update) => {
                let updated = self.store.apply(id, investment.status, &update).await?;
                self.store
                    .record_event(&SettlementEvent::new(
                        id,
                        SettlementEventType::DisbursementSubmitted,
                        Some(investment.token_chain),
                        json!({ "token": token, "tx_hash": tx_hash }),
                    ))
                    .await?;
                info!(
                    "🪙 {} disbursement {} recorded for investment {}",
                    token, tx_hash, id
                );
                Ok(updated)
            }
            Outcome::Hold(reason) => {
                debug!(
                    "Disbursement submission held for {}: {}",
                    id,
                    reason.describe()
                );
                Ok(investment)
            }
        }
    }

    /// Read-only snapshot
    pub async fn get_status(&self, id: Uuid) -> SettlementResult<Investment> {
        self.load(id).await
    }

    pub async fn list_pending(&self) -> SettlementResult<Vec<Investment>> {
        Ok(self.store.list_pending().await?)
    }

    /// On-demand single-investment sweep, used by admin tooling and by the
    /// scheduled reconciler. Same guards either way.
    pub async fn force_reconcile(&self, id: Uuid) -> SettlementResult<Investment> {
        if !self.begin_reconcile(id).await {
            // Another pass holds this id; hand back the current snapshot
            debug!("Reconcile already in flight for {}", id);
            return self.load(id).await;
        }
        let result = self.reconcile_inner(id).await;
        self.end_reconcile(id).await;
        result
    }

    async fn begin_reconcile(&self, id: Uuid) -> bool {
        self.inflight.lock().await.insert(id)
    }

    async fn end_reconcile(&self, id: Uuid) {
        self.inflight.lock().await.remove(&id);
    }

    async fn reconcile_inner(&self, id: Uuid) -> SettlementResult<Investment> {
        let investment = self.load(id).await?;
        match investment.status {
            InvestmentStatus::PendingUsdt => self.reconcile_payment(investment).await,
            InvestmentStatus::PendingTokens => self.reconcile_disbursements(investment).await,
            // Nothing to drive
            _ => Ok(investment),
        }
    }

    /// Fetch confirmation evidence for the recorded payment hash and drive
    /// PENDING_USDT forward.
    async fn reconcile_payment(&self, investment: Investment) -> SettlementResult<Investment> {
        let id = investment.id;
        let vault = self.vault_for(&investment)?;
        let payment_chain = investment.payment_chain.ok_or_else(|| {
            SettlementError::Inconsistent(format!("investment {id} pending payment without chain"))
        })?;
        let tx_hash = investment.usdt_tx_hash.clone().ok_or_else(|| {
            SettlementError::Inconsistent(format!("investment {id} pending payment without hash"))
        })?;

        let lookup = timeout(
            self.rpc_timeout,
            self.chain_client.get_transaction(payment_chain, &tx_hash),
        )
        .await;

        let tx = match lookup {
            Err(_) => {
                warn!(
                    "⏱ Payment lookup timed out for {} on {}, retrying next sweep",
                    id, payment_chain
                );
                return Ok(investment);
            }
            Ok(Err(error)) if error.is_transient() => {
                warn!(
                    "Payment lookup unavailable for {} on {}: {}, retrying next sweep",
                    id, payment_chain, error
                );
                return Ok(investment);
            }
            // The chain does not know the hash; the deadline clock decides
            Ok(Err(ChainError::NotFound)) => {
                return self.check_payment_deadline(investment, vault).await;
            }
            Ok(Err(error)) => return Err(error.into()),
            Ok(Ok(tx)) => tx,
        };

        let evidence = Evidence::PaymentConfirmed(tx.clone());
        match machine::evaluate(&investment, vault, &self.policy, &evidence)? {
            Outcome::Advance(update) if update.status == InvestmentStatus::PendingTokens => {
                let updated = self.store.apply(id, investment.status, &update).await?;
                self.store
                    .record_event(&SettlementEvent::new(
                        id,
                        SettlementEventType::PaymentConfirmed,
                        Some(payment_chain),
                        json!({
                            "tx_hash": &tx.tx_hash,
                            "amount": tx.amount.to_string(),
                            "sender": &tx.sender,
                        }),
                    ))
                    .await?;
                info!(
                    "✅ Payment confirmed for investment {}: {} {} on {}",
                    id, tx.amount, updated.currency, payment_chain
                );
                self.corroborate_collection_balance(&updated, payment_chain)
                    .await;
                Ok(updated)
            }
            Outcome::Advance(update) => {
                // Rejection path
                let reason = update.failure_reason.clone().unwrap_or_default();
                let updated = self.store.apply(id, investment.status, &update).await?;
                self.store
                    .record_event(&SettlementEvent::new(
                        id,
                        SettlementEventType::InvestmentFailed,
                        Some(payment_chain),
                        json!({ "reason": &reason }),
                    ))
                    .await?;
                warn!("❌ Investment {} failed: {}", id, reason);
                Ok(updated)
            }
            Outcome::Hold(HoldReason::Underpayment { required, actual }) => {
                self.store
                    .record_event(&SettlementEvent::new(
                        id,
                        SettlementEventType::UnderpaymentDetected,
                        Some(payment_chain),
                        json!({
                            "tx_hash": &tx.tx_hash,
                            "required": required.to_string(),
                            "paid": actual.to_string(),
                        }),
                    ))
                    .await?;
                warn!(
                    "⚠ Underpayment on investment {}: paid {}, required {}",
                    id, actual, required
                );
                Ok(investment)
            }
            Outcome::Hold(HoldReason::AwaitingConfirmation) => {
                debug!("Payment for {} not yet final on {}", id, payment_chain);
                Ok(investment)
            }
            Outcome::Hold(reason) => {
                warn!("⚠ Payment evidence held for {}: {}", id, reason.describe());
                Ok(investment)
            }
        }
    }

    async fn check_payment_deadline(
        &self,
        investment: Investment,
        vault: &VaultConfig,
    ) -> SettlementResult<Investment> {
        let id = investment.id;
        let evidence = Evidence::DeadlineCheck { now: Utc::now() };
        match machine::evaluate(&investment, vault, &self.policy, &evidence)? {
            Outcome::Advance(update) => {
                let updated = self.store.apply(id, investment.status, &update).await?;
                self.store
                    .record_event(&SettlementEvent::new(
                        id,
                        SettlementEventType::PaymentDeadlineExpired,
                        investment.payment_chain,
                        json!({ "deadline": investment.payment_deadline_at }),
                    ))
                    .await?;
                warn!("⏰ Investment {} failed: payment deadline exceeded", id);
                Ok(updated)
            }
            Outcome::Hold(_) => Ok(investment),
        }
    }

    /// Verify recorded-but-unconfirmed disbursement hashes and drive
    /// PENDING_TOKENS toward COMPLETED.
    async fn reconcile_disbursements(
        &self,
        investment: Investment,
    ) -> SettlementResult<Investment> {
        let id = investment.id;
        let vault = self.vault_for(&investment)?;
        let mut current = investment;

        let outstanding: Vec<(String, String)> = current
            .reward_tx_hashes
            .iter()
            .filter(|(token, _)| !current.reward_confirmed(token))
            .map(|(token, hash)| (token.clone(), hash.clone()))
            .collect();

        for (token, tx_hash) in outstanding {
            if current.status != InvestmentStatus::PendingTokens {
                break;
            }
            let lookup = timeout(
                self.rpc_timeout,
                self.chain_client
                    .get_transaction(current.token_chain, &tx_hash),
            )
            .await;
            let tx = match lookup {
                Err(_) => {
                    warn!("⏱ Disbursement lookup timed out for {} ({})", id, token);
                    continue;
                }
                // Not indexed yet or RPC trouble; disbursements have no
                // deadline, so either way we retry next sweep
                Ok(Err(error)) if error.is_transient() || matches!(error, ChainError::NotFound) => {
                    debug!("Disbursement {} for {} not resolvable: {}", tx_hash, id, error);
                    continue;
                }
                Ok(Err(error)) => return Err(error.into()),
                Ok(Ok(tx)) => tx,
            };

            let evidence = Evidence::DisbursementConfirmed {
                token: token.clone(),
                tx: tx.clone(),
            };
            match machine::evaluate(&current, vault, &self.policy, &evidence)? {
                Outcome::Advance(update) => {
                    let completed = update.status == InvestmentStatus::Completed;
                    current = self.store.apply(id, current.status, &update).await?;
                    self.store
                        .record_event(&SettlementEvent::new(
                            id,
                            SettlementEventType::DisbursementConfirmed,
                            Some(current.token_chain),
                            json!({
                                "token": &token,
                                "tx_hash": &tx_hash,
                                "amount": tx.amount.to_string(),
                            }),
                        ))
                        .await?;
                    info!(
                        "✅ {} disbursement confirmed for investment {}",
                        token, id
                    );
                    if completed {
                        self.store
                            .record_event(&SettlementEvent::new(
                                id,
                                SettlementEventType::InvestmentCompleted,
                                None,
                                json!({ "reward_tx_hashes": &current.reward_tx_hashes }),
                            ))
                            .await?;
                        info!("🎉 Investment {} completed", id);
                    }
                }
                Outcome::Hold(
                    reason @ (HoldReason::WrongRecipient { .. }
                    | HoldReason::EntitlementMismatch { .. }
                    | HoldReason::MintMismatch { .. }),
                ) => {
                    self.store
                        .record_event(&SettlementEvent::new(
                            id,
                            SettlementEventType::DisbursementMismatch,
                            Some(current.token_chain),
                            json!({
                                "token": &token,
                                "tx_hash": &tx_hash,
                                "reason": reason.describe(),
                            }),
                        ))
                        .await?;
                    warn!(
                        "⚠ Disbursement evidence held for {}: {}",
                        id,
                        reason.describe()
                    );
                }
                Outcome::Hold(reason) => {
                    debug!(
                        "Disbursement evidence held for {}: {}",
                        id,
                        reason.describe()
                    );
                }
            }
        }

        Ok(current)
    }

    /// Secondary consistency check through the balance cache: the collection
    /// address should hold at least the confirmed principal. Mismatches are
    /// surfaced to operators, never fed back into the state machine.
    async fn corroborate_collection_balance(&self, investment: &Investment, payment_chain: Chain) {
        let Some(address) = self.policy.collection_addresses.get(&payment_chain) else {
            return;
        };
        let token = self.policy.usdt_contracts.get(&payment_chain).cloned();

        match self
            .balances
            .get(payment_chain, address, token.as_deref())
            .await
        {
            Ok(balance) if balance < investment.principal => {
                warn!(
                    "⚠ Collection balance on {} is {}, below confirmed principal {}",
                    payment_chain, balance, investment.principal
                );
                let _ = self
                    .store
                    .record_event(&SettlementEvent::new(
                        investment.id,
                        SettlementEventType::BalanceMismatch,
                        Some(payment_chain),
                        json!({
                            "balance": balance.to_string(),
                            "principal": investment.principal.to_string(),
                        }),
                    ))
                    .await;
            }
            Ok(_) => {}
            Err(error) => {
                debug!(
                    "Balance corroboration skipped for {}: {}",
                    payment_chain, error
                );
            }
        }
    }

    async fn load(&self, id: Uuid) -> SettlementResult<Investment> {
        self.store
            .get(id)
            .await?
            .ok_or(SettlementError::NotFound(id))
    }

    fn vault_for(&self, investment: &Investment) -> SettlementResult<&VaultConfig> {
        self.vaults
            .get(&investment.vault_id)
            .ok_or_else(|| SettlementError::UnknownVault(investment.vault_id.clone()))
    }
}
