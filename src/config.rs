use std::collections::HashMap;

use serde::Deserialize;

use crate::chain::Chain;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub ethereum_rpc_url: String,
    pub bsc_rpc_url: String,
    pub tron_api_url: String,
    pub solana_rpc_url: String,
    /// Platform collection address per payment chain. Chains without an
    /// address configured cannot settle payments.
    pub collection_addresses: HashMap<Chain, String>,
    /// Stablecoin contract per payment chain
    pub usdt_contracts: HashMap<Chain, String>,
    pub balance_cache_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub payment_deadline_secs: i64,
    pub rpc_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let mut collection_addresses = HashMap::new();
        for (chain, var) in [
            (Chain::Ethereum, "ETHEREUM_COLLECTION_ADDRESS"),
            (Chain::Bsc, "BSC_COLLECTION_ADDRESS"),
            (Chain::Tron, "TRON_COLLECTION_ADDRESS"),
        ] {
            if let Ok(address) = std::env::var(var) {
                if !address.is_empty() {
                    collection_addresses.insert(chain, address);
                }
            }
        }

        let mut usdt_contracts = HashMap::new();
        usdt_contracts.insert(
            Chain::Ethereum,
            std::env::var("ETHEREUM_USDT_CONTRACT")
                .unwrap_or_else(|_| "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string()),
        );
        usdt_contracts.insert(
            Chain::Bsc,
            std::env::var("BSC_USDT_CONTRACT")
                .unwrap_or_else(|_| "0x55d398326f99059ff775485246999027b3197955".to_string()),
        );
        usdt_contracts.insert(
            Chain::Tron,
            std::env::var("TRON_USDT_CONTRACT")
                .unwrap_or_else(|_| "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string()),
        );

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/settlement".to_string()),
            ethereum_rpc_url: std::env::var("ETHEREUM_RPC_URL")
                .unwrap_or_else(|_| "https://eth.llamarpc.com".to_string()),
            bsc_rpc_url: std::env::var("BSC_RPC_URL")
                .unwrap_or_else(|_| "https://bsc-dataseed.binance.org".to_string()),
            tron_api_url: std::env::var("TRON_API_URL")
                .unwrap_or_else(|_| "https://api.trongrid.io".to_string()),
            solana_rpc_url: std::env::var("SOLANA_RPC_URL")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
            collection_addresses,
            usdt_contracts,
            balance_cache_ttl_secs: env_u64("BALANCE_CACHE_TTL_SECS", 120),
            sweep_interval_secs: env_u64("SWEEP_INTERVAL_SECS", 30),
            payment_deadline_secs: env_u64("PAYMENT_DEADLINE_SECS", 86_400) as i64,
            rpc_timeout_secs: env_u64("RPC_TIMEOUT_SECS", 10),
        })
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
