//! Credit ledger collaborator
//!
//! The core reserves credits before dispatching a stage, commits on
//! success, and releases on failure. It never debits directly; the
//! ledger's accounting rules live in the billing layer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::{Result, eyre};
use uuid::Uuid;

use crate::pipeline::AgentKind;

/// Reservation-based credit accounting
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Reserve credits for one stage; returns a reservation id
    async fn reserve(&self, user_id: &str, stage: AgentKind, amount: u32) -> Result<String>;

    /// Commit a reservation after the stage succeeded
    async fn commit(&self, reservation_id: &str) -> Result<()>;

    /// Release a reservation after the stage failed
    async fn release(&self, reservation_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Held,
    Committed,
    Released,
}

/// In-memory ledger for tests and the demo CLI
#[derive(Default)]
pub struct InMemoryLedger {
    reservations: Mutex<HashMap<String, (String, AgentKind, u32, ReservationState)>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_total(&self, user_id: &str) -> u32 {
        self.reservations
            .lock()
            .unwrap()
            .values()
            .filter(|(user, _, _, state)| user == user_id && *state == ReservationState::Committed)
            .map(|(_, _, amount, _)| amount)
            .sum()
    }

    pub fn held_count(&self) -> usize {
        self.reservations
            .lock()
            .unwrap()
            .values()
            .filter(|(_, _, _, state)| *state == ReservationState::Held)
            .count()
    }
}

#[async_trait]
impl CreditLedger for InMemoryLedger {
    async fn reserve(&self, user_id: &str, stage: AgentKind, amount: u32) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        self.reservations.lock().unwrap().insert(
            id.clone(),
            (user_id.to_string(), stage, amount, ReservationState::Held),
        );
        Ok(id)
    }

    async fn commit(&self, reservation_id: &str) -> Result<()> {
        let mut reservations = self.reservations.lock().unwrap();
        let entry = reservations
            .get_mut(reservation_id)
            .ok_or_else(|| eyre!("unknown reservation: {reservation_id}"))?;
        entry.3 = ReservationState::Committed;
        Ok(())
    }

    async fn release(&self, reservation_id: &str) -> Result<()> {
        let mut reservations = self.reservations.lock().unwrap();
        let entry = reservations
            .get_mut(reservation_id)
            .ok_or_else(|| eyre!("unknown reservation: {reservation_id}"))?;
        // Committed reservations stay committed; release after commit is
        // a replay, not a refund
        if entry.3 == ReservationState::Held {
            entry.3 = ReservationState::Released;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_commit() {
        let ledger = InMemoryLedger::new();

        let id = ledger.reserve("user-1", AgentKind::Summarizer, 5).await.unwrap();
        assert_eq!(ledger.held_count(), 1);

        ledger.commit(&id).await.unwrap();
        assert_eq!(ledger.held_count(), 0);
        assert_eq!(ledger.committed_total("user-1"), 5);
    }

    #[tokio::test]
    async fn test_reserve_release() {
        let ledger = InMemoryLedger::new();

        let id = ledger.reserve("user-1", AgentKind::Summarizer, 5).await.unwrap();
        ledger.release(&id).await.unwrap();

        assert_eq!(ledger.held_count(), 0);
        assert_eq!(ledger.committed_total("user-1"), 0);
    }

    #[tokio::test]
    async fn test_unknown_reservation_errors() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.commit("nope").await.is_err());
        assert!(ledger.release("nope").await.is_err());
    }
}
