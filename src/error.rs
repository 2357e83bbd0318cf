use thiserror::Error;
use uuid::Uuid;

use crate::chain::Chain;

/// Top-level error type for the settlement core
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Investment not found: {0}")]
    NotFound(Uuid),

    #[error("Unknown vault: {0}")]
    UnknownVault(String),

    #[error("Invalid transition: investment is {current}, expected {expected}")]
    InvalidTransition { current: String, expected: String },

    #[error("Invalid transaction hash for {chain}: {hash}")]
    InvalidHash { chain: Chain, hash: String },

    #[error("Chain {0} is not accepted for stablecoin payments")]
    UnsupportedPaymentChain(Chain),

    #[error("Transaction hash already claimed by investment {0}")]
    HashAlreadyClaimed(Uuid),

    #[error("Unknown reward token {token} for vault {vault}")]
    UnknownRewardToken { vault: String, token: String },

    #[error("Invalid {chain} address: {address}")]
    InvalidAddress { chain: Chain, address: String },

    #[error("Principal {actual} below vault minimum {required}")]
    BelowMinimum { required: String, actual: String },

    #[error("Inconsistent record: {0}")]
    Inconsistent(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Persistence errors. The compare-and-swap precondition failure is kept
/// distinct so callers can tell a lost race from a missing row.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Investment not found: {0}")]
    NotFound(Uuid),

    #[error("Status precondition failed for {id}: expected {expected}")]
    StatusConflict { id: Uuid, expected: String },
}

/// Chain reader errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Transaction not found")]
    NotFound,

    #[error("RPC unavailable: {0}")]
    Unavailable(String),

    #[error("RPC timeout")]
    Timeout,

    #[error("Malformed RPC response: {0}")]
    InvalidResponse(String),
}

impl ChainError {
    /// Transient failures are retried on the next sweep. A timeout is never
    /// negative evidence about a transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Unavailable(_) | ChainError::Timeout)
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ChainError::Timeout
        } else {
            ChainError::Unavailable(format!("{error}"))
        }
    }
}

/// Result type alias for the settlement core
pub type SettlementResult<T> = Result<T, SettlementError>;
