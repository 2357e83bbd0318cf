//! In-memory store with the same compare-and-swap semantics as Postgres.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{Investment, InvestmentStatus, SettlementEvent, SettlementEventType, StateUpdate};
use super::store::InvestmentStore;
use crate::chain::Chain;
use crate::error::StoreError;

pub struct MemoryInvestmentStore {
    investments: Mutex<HashMap<Uuid, Investment>>,
    events: Mutex<Vec<SettlementEvent>>,
}

impl MemoryInvestmentStore {
    pub fn new() -> Self {
        Self {
            investments: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub async fn events(&self) -> Vec<SettlementEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_of_type(&self, event_type: SettlementEventType) -> Vec<SettlementEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InvestmentStore for MemoryInvestmentStore {
    async fn create(&self, investment: &Investment) -> Result<Investment, StoreError> {
        let mut investments = self.investments.lock().await;
        investments.insert(investment.id, investment.clone());
        Ok(investment.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Investment>, StoreError> {
        let investments = self.investments.lock().await;
        Ok(investments.get(&id).cloned())
    }

    async fn find_by_payment_hash(
        &self,
        chain: Chain,
        tx_hash: &str,
    ) -> Result<Option<Investment>, StoreError> {
        let investments = self.investments.lock().await;
        Ok(investments
            .values()
            .find(|investment| {
                investment.payment_chain == Some(chain)
                    && investment.usdt_tx_hash.as_deref() == Some(tx_hash)
            })
            .cloned())
    }

    async fn list_pending(&self) -> Result<Vec<Investment>, StoreError> {
        let investments = self.investments.lock().await;
        let mut pending: Vec<Investment> = investments
            .values()
            .filter(|investment| investment.status.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|investment| investment.created_at);
        Ok(pending)
    }

    async fn apply(
        &self,
        id: Uuid,
        expected: InvestmentStatus,
        update: &StateUpdate,
    ) -> Result<Investment, StoreError> {
        let mut investments = self.investments.lock().await;
        let current = investments.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if current.status != expected {
            return Err(StoreError::StatusConflict {
                id,
                expected: expected.to_string(),
            });
        }
        let next = update.apply_to(current, Utc::now());
        *current = next.clone();
        Ok(next)
    }

    async fn record_event(&self, event: &SettlementEvent) -> Result<(), StoreError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
