use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::{normalize_address, Chain, ChainClient};
use crate::error::ChainError;

/// Balance cache key: (chain, normalized address, token-or-native)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BalanceKey {
    chain: Chain,
    address: String,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct CachedBalance {
    value: Decimal,
    fetched_at: Instant,
}

/// Short-TTL memoization in front of a [`ChainClient`], bounding RPC call
/// volume for hot addresses.
///
/// Concurrent misses on one key coalesce into a single upstream read. A
/// reader failure with no live entry propagates as an error; a stale entry
/// is never served as success.
pub struct BalanceCache {
    reader: Arc<dyn ChainClient>,
    ttl: Duration,
    entries: RwLock<HashMap<BalanceKey, CachedBalance>>,
    /// Per-key refresh gates. Holding a gate across the upstream read is the
    /// coalescing mechanism; waiters re-check the cache once they acquire it.
    inflight: Mutex<HashMap<BalanceKey, Arc<Mutex<()>>>>,
}

impl BalanceCache {
    pub fn new(reader: Arc<dyn ChainClient>, ttl: Duration) -> Self {
        Self {
            reader,
            ttl,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached balance if live, otherwise refresh it from the
    /// reader and cache the result.
    pub async fn get(
        &self,
        chain: Chain,
        address: &str,
        token: Option<&str>,
    ) -> Result<Decimal, ChainError> {
        let key = BalanceKey {
            chain,
            address: normalize_address(chain, address),
            token: token.map(str::to_string),
        };

        if let Some(value) = self.live(&key).await {
            debug!("✓ Balance cache hit: {} on {}", key.address, chain);
            return Ok(value);
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key.clone()).or_default().clone()
        };
        let _refresh = gate.lock().await;

        // Whoever held the gate before us may already have refreshed the key
        if let Some(value) = self.live(&key).await {
            debug!("✓ Balance cache hit after refresh: {} on {}", key.address, chain);
            return Ok(value);
        }

        let value = self
            .reader
            .get_token_balance(chain, &key.address, key.token.as_deref())
            .await?;

        {
            let mut entries = self.entries.write().await;
            entries.insert(
                key.clone(),
                CachedBalance {
                    value,
                    fetched_at: Instant::now(),
                },
            );
        }
        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }

        debug!("💾 Cached balance: {} on {} = {}", key.address, chain, value);
        Ok(value)
    }

    async fn live(&self, key: &BalanceKey) -> Option<Decimal> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop expired entries. Expiry is enforced on read; this just keeps the
    /// map from accumulating dead keys.
    pub async fn cleanup_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
        let after = entries.len();
        if before > after {
            info!("🧹 Cleaned up {} expired balance entries", before - after);
        }
    }
}
