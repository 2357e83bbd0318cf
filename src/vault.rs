use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// One reward token a vault pays out on Solana
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardToken {
    pub symbol: String,
    /// SPL mint address
    pub mint: String,
    /// Reward units disbursed per unit of principal
    #[serde(with = "rust_decimal::serde::float")]
    pub ratio: Decimal,
}

/// Vault product terms. Consumed, never mutated, by the state machine's
/// guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub id: String,
    pub name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub min_principal: Decimal,
    /// One or two tokens, by product design
    pub reward_tokens: Vec<RewardToken>,
}

impl VaultConfig {
    pub fn reward_token(&self, symbol: &str) -> Option<&RewardToken> {
        self.reward_tokens.iter().find(|token| token.symbol == symbol)
    }

    /// Token units owed for a given principal
    pub fn entitlement(&self, symbol: &str, principal: Decimal) -> Option<Decimal> {
        self.reward_token(symbol).map(|token| principal * token.ratio)
    }
}

/// Read-only lookup of vault products
pub struct VaultRegistry {
    vaults: HashMap<String, VaultConfig>,
}

impl VaultRegistry {
    pub fn new(vaults: Vec<VaultConfig>) -> Self {
        Self {
            vaults: vaults
                .into_iter()
                .map(|vault| (vault.id.clone(), vault))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&VaultConfig> {
        self.vaults.get(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &VaultConfig> {
        self.vaults.values()
    }

    /// Current vault products
    pub fn builtin() -> Self {
        Self::new(vec![
            VaultConfig {
                id: "takara-growth".to_string(),
                name: "TAKARA Growth Vault".to_string(),
                min_principal: dec!(100),
                reward_tokens: vec![RewardToken {
                    symbol: "TAKARA".to_string(),
                    mint: "TAKRjMQxTkR8yE1ZYkUpEnPxGmwS46kQ2sDq3vE5aWm".to_string(),
                    ratio: dec!(10),
                }],
            },
            VaultConfig {
                id: "takara-laika-dual".to_string(),
                name: "TAKARA + LAIKA Dual Vault".to_string(),
                min_principal: dec!(500),
                reward_tokens: vec![
                    RewardToken {
                        symbol: "TAKARA".to_string(),
                        mint: "TAKRjMQxTkR8yE1ZYkUpEnPxGmwS46kQ2sDq3vE5aWm".to_string(),
                        ratio: dec!(8),
                    },
                    RewardToken {
                        symbol: "LAIKA".to_string(),
                        mint: "LAiKAfmhF1nRqk7YjtRkGpzfU2cQvYkSTyrXgmnqAx3".to_string(),
                        ratio: dec!(40),
                    },
                ],
            },
        ])
    }
}
