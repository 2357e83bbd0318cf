//! Periodic driver for the settlement flow.
//!
//! Sweeps every investment sitting in PENDING_USDT / PENDING_TOKENS, fetches
//! evidence through the service and applies verified transitions. One
//! investment's lookup failure never blocks the rest of a sweep; sweeps
//! never overlap because each pass runs to completion before the next tick
//! is taken.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use super::service::SettlementService;
use crate::error::SettlementResult;

/// Reconciler schedule configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between sweeps. A deployment parameter, not a design constant.
    pub sweep_interval: Duration,
    /// Investments looked up concurrently within one sweep
    pub max_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            max_concurrency: 8,
        }
    }
}

pub struct SettlementReconciler {
    service: Arc<SettlementService>,
    config: ReconcilerConfig,
    stopped: Arc<AtomicBool>,
}

impl SettlementReconciler {
    pub fn new(service: Arc<SettlementService>, config: ReconcilerConfig) -> Self {
        Self {
            service,
            config,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the sweep loop in the background
    pub fn start(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let config = self.config.clone();
        let stopped = self.stopped.clone();

        tokio::spawn(async move {
            let mut ticker = interval(config.sweep_interval);
            loop {
                ticker.tick().await;
                if stopped.load(Ordering::Relaxed) {
                    info!("Reconciler stopped");
                    break;
                }
                if let Err(error) = Self::sweep(&service, &config, &stopped).await {
                    error!("❌ Settlement sweep failed: {:?}", error);
                }
            }
        })
    }

    /// Request a cooperative stop. Takes effect between investments, never
    /// mid-transition.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// One pass over all pending investments
    pub async fn sweep_once(&self) -> SettlementResult<()> {
        Self::sweep(&self.service, &self.config, &self.stopped).await
    }

    async fn sweep(
        service: &Arc<SettlementService>,
        config: &ReconcilerConfig,
        stopped: &AtomicBool,
    ) -> SettlementResult<()> {
        let pending = service.list_pending().await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!("🔄 Sweeping {} pending investments", pending.len());

        stream::iter(pending)
            .for_each_concurrent(config.max_concurrency, |investment| {
                let service = service.clone();
                async move {
                    if stopped.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(error) = service.force_reconcile(investment.id).await {
                        error!(
                            "❌ Reconcile failed for investment {}: {:?}",
                            investment.id, error
                        );
                    }
                }
            })
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::chain::cache::BalanceCache;
    use crate::chain::testing::{ScriptedChainClient, ScriptedTx};
    use crate::chain::{Chain, TxRecord};
    use crate::error::SettlementError;
    use crate::investment::memory::MemoryInvestmentStore;
    use crate::investment::models::{InvestmentStatus, SettlementEventType};
    use crate::settlement::machine::{SettlementPolicy, AMOUNT_EPSILON};
    use crate::vault::VaultRegistry;

    const COLLECTION: &str = "0x9ab3f12de884749f4a28f342c52dbd4e37c9b582";
    const USDT: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";

    fn policy() -> SettlementPolicy {
        let mut collection_addresses = HashMap::new();
        collection_addresses.insert(Chain::Ethereum, COLLECTION.to_string());
        collection_addresses.insert(Chain::Bsc, COLLECTION.to_string());
        let mut usdt_contracts = HashMap::new();
        usdt_contracts.insert(Chain::Ethereum, USDT.to_string());
        SettlementPolicy {
            collection_addresses,
            usdt_contracts,
            payment_deadline: ChronoDuration::hours(24),
            amount_epsilon: AMOUNT_EPSILON,
        }
    }

    struct Harness {
        store: Arc<MemoryInvestmentStore>,
        client: Arc<ScriptedChainClient>,
        service: Arc<SettlementService>,
    }

    fn harness(client: ScriptedChainClient) -> Harness {
        let store = Arc::new(MemoryInvestmentStore::new());
        let client = Arc::new(client);
        let balances = Arc::new(BalanceCache::new(client.clone(), Duration::from_secs(120)));
        let service = Arc::new(SettlementService::new(
            store.clone(),
            client.clone(),
            balances,
            Arc::new(VaultRegistry::builtin()),
            policy(),
            Duration::from_secs(5),
        ));
        Harness {
            store,
            client,
            service,
        }
    }

    fn wallet() -> String {
        bs58::encode([1u8; 32]).into_string()
    }

    fn payment_hash() -> String {
        format!("0x{}", "ab".repeat(32))
    }

    fn takara_sig() -> String {
        bs58::encode([2u8; 64]).into_string()
    }

    fn laika_sig() -> String {
        bs58::encode([3u8; 64]).into_string()
    }

    fn confirmed_payment(amount: Decimal) -> TxRecord {
        TxRecord {
            chain: Chain::Ethereum,
            tx_hash: payment_hash(),
            confirmed: true,
            rejected: false,
            token: Some(USDT.to_string()),
            amount,
            recipient: COLLECTION.to_string(),
            sender: Some("0x1111111111111111111111111111111111111111".to_string()),
            observed_at: Utc::now(),
        }
    }

    fn confirmed_disbursement(mint: &str, amount: Decimal, sig: &str) -> TxRecord {
        TxRecord {
            chain: Chain::Solana,
            tx_hash: sig.to_string(),
            confirmed: true,
            rejected: false,
            token: Some(mint.to_string()),
            amount,
            recipient: wallet(),
            sender: None,
            observed_at: Utc::now(),
        }
    }

    fn takara_mint() -> String {
        VaultRegistry::builtin()
            .get("takara-growth")
            .unwrap()
            .reward_token("TAKARA")
            .unwrap()
            .mint
            .clone()
    }

    // End to end: submit payment, sweep confirms it
    #[tokio::test]
    async fn test_sweep_confirms_payment() {
        let h = harness(ScriptedChainClient::new());
        h.client
            .set_balance(Chain::Ethereum, COLLECTION, dec!(50000))
            .await;

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        let inv = h
            .service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        assert_eq!(inv.status, InvestmentStatus::PendingUsdt);

        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;

        let reconciler =
            SettlementReconciler::new(h.service.clone(), ReconcilerConfig::default());
        reconciler.sweep_once().await.unwrap();

        let after = h.service.get_status(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::PendingTokens);
        assert!(after.step1_completed_at.is_some());
        assert_eq!(
            h.store
                .events_of_type(SettlementEventType::PaymentConfirmed)
                .await
                .len(),
            1
        );
    }

    // A single-token vault completes once its disbursement confirms, and
    // reconciling again is a no-op
    #[tokio::test]
    async fn test_disbursement_completes_single_token_vault() {
        let h = harness(ScriptedChainClient::new());
        h.client
            .set_balance(Chain::Ethereum, COLLECTION, dec!(50000))
            .await;

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;
        h.service.force_reconcile(inv.id).await.unwrap();

        let inv = h
            .service
            .submit_disbursement(inv.id, "TAKARA", &takara_sig())
            .await
            .unwrap();
        assert_eq!(inv.status, InvestmentStatus::PendingTokens);

        h.client
            .script_tx(
                Chain::Solana,
                &takara_sig(),
                ScriptedTx::Found(confirmed_disbursement(
                    &takara_mint(),
                    dec!(10000),
                    &takara_sig(),
                )),
            )
            .await;
        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::Completed);
        assert!(after.step2_completed_at.is_some());

        // Reconciling again changes nothing
        let replay = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(replay.status, InvestmentStatus::Completed);
        assert_eq!(replay.step2_completed_at, after.step2_completed_at);
        assert_eq!(
            h.store
                .events_of_type(SettlementEventType::InvestmentCompleted)
                .await
                .len(),
            1
        );
    }

    // A dual vault holds until both tokens confirm
    #[tokio::test]
    async fn test_dual_vault_waits_for_second_token() {
        let h = harness(ScriptedChainClient::new());
        h.client
            .set_balance(Chain::Ethereum, COLLECTION, dec!(50000))
            .await;
        let registry = VaultRegistry::builtin();
        let dual = registry.get("takara-laika-dual").unwrap();
        let takara_mint = dual.reward_token("TAKARA").unwrap().mint.clone();
        let laika_mint = dual.reward_token("LAIKA").unwrap().mint.clone();

        let inv = h
            .service
            .create_investment("takara-laika-dual", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;
        h.service.force_reconcile(inv.id).await.unwrap();

        h.service
            .submit_disbursement(inv.id, "TAKARA", &takara_sig())
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Solana,
                &takara_sig(),
                ScriptedTx::Found(confirmed_disbursement(&takara_mint, dec!(8000), &takara_sig())),
            )
            .await;
        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::PendingTokens);
        assert!(after.reward_confirmed("TAKARA"));

        h.service
            .submit_disbursement(inv.id, "LAIKA", &laika_sig())
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Solana,
                &laika_sig(),
                ScriptedTx::Found(confirmed_disbursement(&laika_mint, dec!(40000), &laika_sig())),
            )
            .await;
        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::Completed);
    }

    // Underpayment holds the investment and records an event
    #[tokio::test]
    async fn test_underpayment_held_with_event() {
        let h = harness(ScriptedChainClient::new());

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(500))),
            )
            .await;

        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::PendingUsdt);
        assert_eq!(
            h.store
                .events_of_type(SettlementEventType::UnderpaymentDetected)
                .await
                .len(),
            1
        );
    }

    // An unknown hash past the deadline fails the investment
    #[tokio::test]
    async fn test_deadline_fails_stale_payment() {
        let h = harness(ScriptedChainClient::new());

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();

        // Backdate the deadline; the chain never saw the hash
        {
            use crate::investment::store::InvestmentStore;
            let mut record = h.store.get(inv.id).await.unwrap().unwrap();
            record.payment_deadline_at = Some(Utc::now() - ChronoDuration::hours(1));
            h.store.create(&record).await.unwrap();
        }

        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::Failed);
        assert_eq!(
            h.store
                .events_of_type(SettlementEventType::PaymentDeadlineExpired)
                .await
                .len(),
            1
        );
    }

    // Transient RPC trouble defers the transition to the next sweep
    #[tokio::test]
    async fn test_rpc_outage_is_transient() {
        let h = harness(ScriptedChainClient::new());

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        h.client
            .script_tx(Chain::Ethereum, &payment_hash(), ScriptedTx::Unavailable)
            .await;

        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::PendingUsdt);

        // RPC recovers, next sweep advances
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;
        let after = h.service.force_reconcile(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::PendingTokens);
    }

    #[tokio::test]
    async fn test_hash_reuse_across_investments_rejected() {
        let h = harness(ScriptedChainClient::new());

        let first = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        let second = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();

        h.service
            .submit_payment(first.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        let result = h
            .service
            .submit_payment(second.id, &payment_hash(), Chain::Ethereum)
            .await;
        assert!(matches!(
            result,
            Err(SettlementError::HashAlreadyClaimed(id)) if id == first.id
        ));
    }

    #[tokio::test]
    async fn test_submit_payment_requires_awaiting_status() {
        let h = harness(ScriptedChainClient::new());

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();

        // A different hash after one is recorded is an invalid transition
        let result = h
            .service
            .submit_payment(inv.id, &format!("0x{}", "cd".repeat(32)), Chain::Ethereum)
            .await;
        assert!(matches!(
            result,
            Err(SettlementError::InvalidTransition { .. })
        ));

        // The same hash is an idempotent no-op
        let again = h
            .service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        assert_eq!(again.status, InvestmentStatus::PendingUsdt);
    }

    // Two concurrent reconcile passes on one id share a single evidence
    // lookup and apply exactly one transition
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_per_investment() {
        let h = harness(ScriptedChainClient::new().with_delay(Duration::from_millis(50)));
        h.client
            .set_balance(Chain::Ethereum, COLLECTION, dec!(50000))
            .await;

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;

        let a = {
            let service = h.service.clone();
            let id = inv.id;
            tokio::spawn(async move { service.force_reconcile(id).await })
        };
        let b = {
            let service = h.service.clone();
            let id = inv.id;
            tokio::spawn(async move { service.force_reconcile(id).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(h.client.tx_call_count(), 1);
        let after = h.service.get_status(inv.id).await.unwrap();
        assert_eq!(after.status, InvestmentStatus::PendingTokens);
        assert_eq!(
            h.store
                .events_of_type(SettlementEventType::PaymentConfirmed)
                .await
                .len(),
            1
        );
    }

    // An investment with a broken lookup does not block the rest of a sweep
    #[tokio::test]
    async fn test_sweep_isolates_failures() {
        let h = harness(ScriptedChainClient::new());
        h.client
            .set_balance(Chain::Ethereum, COLLECTION, dec!(50000))
            .await;

        let broken = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        let healthy = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();

        let broken_hash = format!("0x{}", "ef".repeat(32));
        h.service
            .submit_payment(broken.id, &broken_hash, Chain::Ethereum)
            .await
            .unwrap();
        h.service
            .submit_payment(healthy.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();

        h.client
            .script_tx(Chain::Ethereum, &broken_hash, ScriptedTx::Unavailable)
            .await;
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;

        let reconciler =
            SettlementReconciler::new(h.service.clone(), ReconcilerConfig::default());
        reconciler.sweep_once().await.unwrap();

        assert_eq!(
            h.service.get_status(broken.id).await.unwrap().status,
            InvestmentStatus::PendingUsdt
        );
        assert_eq!(
            h.service.get_status(healthy.id).await.unwrap().status,
            InvestmentStatus::PendingTokens
        );
    }

    #[tokio::test]
    async fn test_balance_corroboration_mismatch_recorded() {
        let h = harness(ScriptedChainClient::new());
        // Collection wallet somehow holds less than the confirmed principal
        h.client
            .set_balance(Chain::Ethereum, COLLECTION, dec!(10))
            .await;

        let inv = h
            .service
            .create_investment("takara-growth", &wallet(), dec!(1000))
            .await
            .unwrap();
        h.service
            .submit_payment(inv.id, &payment_hash(), Chain::Ethereum)
            .await
            .unwrap();
        h.client
            .script_tx(
                Chain::Ethereum,
                &payment_hash(),
                ScriptedTx::Found(confirmed_payment(dec!(1000))),
            )
            .await;

        let after = h.service.force_reconcile(inv.id).await.unwrap();
        // Corroboration never blocks the verified transition
        assert_eq!(after.status, InvestmentStatus::PendingTokens);
        assert_eq!(h.client.balance_call_count(), 1);
        assert_eq!(
            h.store
                .events_of_type(SettlementEventType::BalanceMismatch)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_create_investment_validation() {
        let h = harness(ScriptedChainClient::new());

        assert!(matches!(
            h.service
                .create_investment("no-such-vault", &wallet(), dec!(1000))
                .await,
            Err(SettlementError::UnknownVault(_))
        ));
        assert!(matches!(
            h.service
                .create_investment("takara-growth", &wallet(), dec!(5))
                .await,
            Err(SettlementError::BelowMinimum { .. })
        ));
        assert!(matches!(
            h.service
                .create_investment("takara-growth", "not-base58!", dec!(1000))
                .await,
            Err(SettlementError::InvalidAddress { .. })
        ));
    }
}
