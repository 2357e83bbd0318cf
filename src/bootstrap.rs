use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::chain::cache::BalanceCache;
use crate::chain::rpc::{RpcChainClient, RpcEndpoints, WatchedToken};
use crate::chain::{Chain, ChainClient};
use crate::config::Config;
use crate::investment::store::PgInvestmentStore;
use crate::settlement::machine::{SettlementPolicy, AMOUNT_EPSILON};
use crate::settlement::{ReconcilerConfig, SettlementReconciler, SettlementService};
use crate::vault::VaultRegistry;

pub struct AppState {
    pub service: Arc<SettlementService>,
    pub reconciler: SettlementReconciler,
}

pub async fn initialize(config: &Config) -> anyhow::Result<AppState> {
    info!("Initializing settlement components ...");

    let pool = initialize_database(&config.database_url).await?;
    let store = Arc::new(PgInvestmentStore::new(pool));

    let endpoints = RpcEndpoints {
        ethereum_rpc_url: config.ethereum_rpc_url.clone(),
        bsc_rpc_url: config.bsc_rpc_url.clone(),
        tron_api_url: config.tron_api_url.clone(),
        solana_rpc_url: config.solana_rpc_url.clone(),
    };
    let tokens = config
        .usdt_contracts
        .iter()
        .map(|(chain, contract)| {
            (
                *chain,
                WatchedToken {
                    contract: contract.clone(),
                    decimals: usdt_decimals(*chain),
                },
            )
        })
        .collect();
    let chain_client: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(endpoints, tokens));
    info!("✅ Chain clients initialized (ethereum, bsc, tron, solana)");

    let balances = Arc::new(BalanceCache::new(
        chain_client.clone(),
        Duration::from_secs(config.balance_cache_ttl_secs),
    ));
    info!(
        "✅ Balance cache initialized ({}s TTL)",
        config.balance_cache_ttl_secs
    );

    let vaults = Arc::new(VaultRegistry::builtin());
    for vault in vaults.all() {
        info!(
            "📦 Vault {} rewards: {}",
            vault.id,
            vault
                .reward_tokens
                .iter()
                .map(|token| token.symbol.as_str())
                .collect::<Vec<_>>()
                .join(" + ")
        );
    }

    let policy = SettlementPolicy {
        collection_addresses: config.collection_addresses.clone(),
        usdt_contracts: config.usdt_contracts.clone(),
        payment_deadline: chrono::Duration::seconds(config.payment_deadline_secs),
        amount_epsilon: AMOUNT_EPSILON,
    };
    let service = Arc::new(SettlementService::new(
        store,
        chain_client,
        balances.clone(),
        vaults,
        policy,
        Duration::from_secs(config.rpc_timeout_secs),
    ));

    let reconciler = SettlementReconciler::new(
        service.clone(),
        ReconcilerConfig {
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            ..ReconcilerConfig::default()
        },
    );
    info!("✅ Settlement service initialized");

    // Keep the cache map from accumulating dead keys
    let cache_cleanup = balances.clone();
    let cleanup_interval = Duration::from_secs(config.balance_cache_ttl_secs.max(60));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cleanup_interval).await;
            cache_cleanup.cleanup_expired().await;
        }
    });

    Ok(AppState {
        service,
        reconciler,
    })
}

fn usdt_decimals(chain: Chain) -> u32 {
    match chain {
        // BSC-USD is an 18-decimal BEP-20; everywhere else USDT uses 6
        Chain::Bsc => 18,
        Chain::Ethereum | Chain::Tron | Chain::Solana => 6,
    }
}

async fn initialize_database(database_url: &str) -> anyhow::Result<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
