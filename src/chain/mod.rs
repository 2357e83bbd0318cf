pub mod cache;
pub mod rpc;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ChainError;

/// Universal Chain enum - used everywhere in the system.
/// Stablecoin payments arrive on Ethereum, TRON or BSC; reward tokens are
/// always disbursed on Solana.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "chain_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Tron,
    Bsc,
    Solana,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Tron => "tron",
            Chain::Bsc => "bsc",
            Chain::Solana => "solana",
        }
    }

    /// Whether the chain accepts the stablecoin payment leg
    pub fn is_payment_chain(self) -> bool {
        !matches!(self, Chain::Solana)
    }
}

/// What a chain client reports about one transaction. This is the raw
/// material for settlement evidence; the state machine never sees anything
/// the chain did not say.
#[derive(Debug, Clone)]
pub struct TxRecord {
    pub chain: Chain,
    pub tx_hash: String,
    /// Final per the chain's confirmation policy
    pub confirmed: bool,
    /// Explicit on-chain rejection (reverted / failed receipt)
    pub rejected: bool,
    /// Token contract / mint the transfer moved, when one was identified
    pub token: Option<String>,
    pub amount: Decimal,
    pub recipient: String,
    pub sender: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Look up a transaction by hash. Fails with [`ChainError::NotFound`]
    /// when the chain does not know the hash, [`ChainError::Unavailable`] or
    /// [`ChainError::Timeout`] on transport trouble.
    async fn get_transaction(&self, chain: Chain, tx_hash: &str) -> Result<TxRecord, ChainError>;

    /// Current balance of `address`. `token` is a contract / mint
    /// identifier, `None` for the chain's native asset.
    async fn get_token_balance(
        &self,
        chain: Chain,
        address: &str,
        token: Option<&str>,
    ) -> Result<Decimal, ChainError>;
}

/// Syntactic transaction-hash check per chain format.
/// EVM: 0x-prefixed 32-byte hex. TRON: bare 32-byte hex. Solana: base58 of
/// a 64-byte signature.
pub fn is_valid_tx_hash(chain: Chain, hash: &str) -> bool {
    match chain {
        Chain::Ethereum | Chain::Bsc => {
            hash.len() == 66
                && hash.starts_with("0x")
                && hash[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        Chain::Tron => hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()),
        Chain::Solana => bs58::decode(hash)
            .into_vec()
            .map(|bytes| bytes.len() == 64)
            .unwrap_or(false),
    }
}

/// Structural address check per chain format.
pub fn is_valid_address(chain: Chain, address: &str) -> bool {
    match chain {
        Chain::Ethereum | Chain::Bsc => {
            address.len() == 42
                && address.starts_with("0x")
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        }
        // Base58check: 21 payload bytes with a 0x41 prefix and a valid
        // double-SHA256 checksum
        Chain::Tron => match bs58::decode(address).into_vec() {
            Ok(bytes) if bytes.len() == 25 && bytes[0] == 0x41 => {
                let check = Sha256::digest(Sha256::digest(&bytes[..21]));
                bytes[21..] == check[..4]
            }
            _ => false,
        },
        Chain::Solana => bs58::decode(address)
            .into_vec()
            .map(|bytes| bytes.len() == 32)
            .unwrap_or(false),
    }
}

/// Normalization applied before cache-key construction and recipient
/// comparisons. EVM addresses are case-insensitive hex; TRON and Solana
/// base58 is case significant and passes through untouched.
pub fn normalize_address(chain: Chain, address: &str) -> String {
    match chain {
        Chain::Ethereum | Chain::Bsc => address.trim().to_ascii_lowercase(),
        Chain::Tron | Chain::Solana => address.trim().to_string(),
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted chain client for exercising the settlement flow without RPC.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;
    use tokio::time::Duration;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum ScriptedTx {
        Found(TxRecord),
        NotFound,
        Unavailable,
    }

    pub struct ScriptedChainClient {
        txs: Mutex<HashMap<(Chain, String), ScriptedTx>>,
        balances: Mutex<HashMap<(Chain, String), Decimal>>,
        pub tx_calls: AtomicUsize,
        pub balance_calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedChainClient {
        pub fn new() -> Self {
            Self {
                txs: Mutex::new(HashMap::new()),
                balances: Mutex::new(HashMap::new()),
                tx_calls: AtomicUsize::new(0),
                balance_calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        /// Every lookup sleeps, so tests can overlap concurrent callers
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub async fn script_tx(&self, chain: Chain, tx_hash: &str, script: ScriptedTx) {
            self.txs
                .lock()
                .await
                .insert((chain, tx_hash.to_string()), script);
        }

        pub async fn set_balance(&self, chain: Chain, address: &str, balance: Decimal) {
            self.balances
                .lock()
                .await
                .insert((chain, normalize_address(chain, address)), balance);
        }

        pub fn tx_call_count(&self) -> usize {
            self.tx_calls.load(Ordering::SeqCst)
        }

        pub fn balance_call_count(&self) -> usize {
            self.balance_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedChainClient {
        async fn get_transaction(
            &self,
            chain: Chain,
            tx_hash: &str,
        ) -> Result<TxRecord, ChainError> {
            self.tx_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let txs = self.txs.lock().await;
            match txs.get(&(chain, tx_hash.to_string())) {
                Some(ScriptedTx::Found(record)) => Ok(record.clone()),
                Some(ScriptedTx::NotFound) | None => Err(ChainError::NotFound),
                Some(ScriptedTx::Unavailable) => {
                    Err(ChainError::Unavailable("scripted outage".to_string()))
                }
            }
        }

        async fn get_token_balance(
            &self,
            chain: Chain,
            address: &str,
            _token: Option<&str>,
        ) -> Result<Decimal, ChainError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let balances = self.balances.lock().await;
            balances
                .get(&(chain, normalize_address(chain, address)))
                .copied()
                .ok_or_else(|| ChainError::Unavailable("no scripted balance".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evm_hash_validation() {
        let good = format!("0x{}", "ab".repeat(32));
        assert!(is_valid_tx_hash(Chain::Ethereum, &good));
        assert!(is_valid_tx_hash(Chain::Bsc, &good));

        assert!(!is_valid_tx_hash(Chain::Ethereum, &"ab".repeat(32)));
        assert!(!is_valid_tx_hash(Chain::Ethereum, "0xzz"));
        assert!(!is_valid_tx_hash(Chain::Ethereum, &format!("0x{}", "ab".repeat(31))));
    }

    #[test]
    fn test_tron_hash_validation() {
        assert!(is_valid_tx_hash(Chain::Tron, &"9f".repeat(32)));
        assert!(!is_valid_tx_hash(Chain::Tron, &format!("0x{}", "9f".repeat(32))));
    }

    #[test]
    fn test_solana_hash_validation() {
        let signature = bs58::encode([7u8; 64]).into_string();
        assert!(is_valid_tx_hash(Chain::Solana, &signature));

        // A 32-byte pubkey is not a signature
        let pubkey = bs58::encode([7u8; 32]).into_string();
        assert!(!is_valid_tx_hash(Chain::Solana, &pubkey));
        assert!(!is_valid_tx_hash(Chain::Solana, "0OIl"));
    }

    #[test]
    fn test_tron_address_checksum() {
        // Canonical TRC-20 USDT contract address
        assert!(is_valid_address(Chain::Tron, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t"));
        // Same characters, broken checksum
        assert!(!is_valid_address(Chain::Tron, "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u"));
        assert!(!is_valid_address(Chain::Tron, "not-an-address"));
    }

    #[test]
    fn test_address_normalization() {
        assert_eq!(
            normalize_address(Chain::Ethereum, " 0xABCDef12 "),
            "0xabcdef12"
        );
        let solana = bs58::encode([3u8; 32]).into_string();
        assert_eq!(normalize_address(Chain::Solana, &solana), solana);
    }
}
