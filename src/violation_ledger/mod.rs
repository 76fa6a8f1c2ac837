//! ViolationLedger - Reported-Violation Deduplication
//!
//! ## Responsibilities
//!
//! - Remember which (red-phase timestamp, plate) pairs were reported
//! - Serialize check-and-insert through a single owner task
//! - Bound memory: keep only the most recent red phases
//!
//! A key whose phase is older than every retained phase counts as already
//! reported, so eviction can never cause a second report for a key.

use crate::models::ViolationKey;
use std::collections::{HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Request queue capacity for the owner task
const REQUEST_CAPACITY: usize = 64;

/// Plates reported during one red phase
#[derive(Debug)]
struct PhaseEntry {
    phase_timestamp: String,
    plates: HashSet<String>,
}

/// Deduplication set, grouped by red phase
#[derive(Debug)]
pub struct Ledger {
    /// Ordered oldest -> newest by phase timestamp
    phases: VecDeque<PhaseEntry>,
    retained_phases: usize,
}

impl Ledger {
    /// Create a ledger keeping at most `retained_phases` phases (minimum 1)
    pub fn new(retained_phases: usize) -> Self {
        Self {
            phases: VecDeque::new(),
            retained_phases: retained_phases.max(1),
        }
    }

    /// Insert `key`; true if it was not seen before (caller should report)
    pub fn insert(&mut self, key: &ViolationKey) -> bool {
        if let Some(entry) = self
            .phases
            .iter_mut()
            .find(|e| e.phase_timestamp == key.phase_timestamp)
        {
            return entry.plates.insert(key.plate.clone());
        }

        // Timestamps share one fixed ISO-8601 format, so string order is time order
        let position = self
            .phases
            .iter()
            .position(|e| e.phase_timestamp > key.phase_timestamp)
            .unwrap_or(self.phases.len());

        if position == 0 && self.phases.len() >= self.retained_phases {
            tracing::debug!(
                phase = %key.phase_timestamp,
                plate = %key.plate,
                "Key predates retained phases, treating as reported"
            );
            return false;
        }

        let mut plates = HashSet::new();
        plates.insert(key.plate.clone());
        self.phases.insert(
            position,
            PhaseEntry {
                phase_timestamp: key.phase_timestamp.clone(),
                plates,
            },
        );

        while self.phases.len() > self.retained_phases {
            if let Some(evicted) = self.phases.pop_front() {
                tracing::debug!(
                    phase = %evicted.phase_timestamp,
                    plates = evicted.plates.len(),
                    "Evicted red phase from ledger"
                );
            }
        }
        true
    }

    pub fn contains(&self, key: &ViolationKey) -> bool {
        self.phases
            .iter()
            .any(|e| e.phase_timestamp == key.phase_timestamp && e.plates.contains(&key.plate))
    }

    /// Total keys held
    pub fn len(&self) -> usize {
        self.phases.iter().map(|e| e.plates.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }
}

struct LedgerRequest {
    key: ViolationKey,
    reply: oneshot::Sender<bool>,
}

/// Handle to the ledger owner task
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<LedgerRequest>,
}

impl LedgerHandle {
    /// Start the owner task; it stops once every handle is dropped
    pub fn spawn(retained_phases: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LedgerRequest>(REQUEST_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut ledger = Ledger::new(retained_phases);
            while let Some(request) = rx.recv().await {
                let inserted = ledger.insert(&request.key);
                let _ = request.reply.send(inserted);
            }
            if ledger.is_empty() {
                tracing::info!("Violation ledger stopped, nothing recorded");
            } else {
                tracing::info!(keys = ledger.len(), phases = ledger.phase_count(), "Violation ledger stopped");
            }
        });

        (Self { tx }, handle)
    }

    /// Atomically check and record `key`; true if it is new.
    ///
    /// Returns false if the owner task is gone (nothing gets reported).
    pub async fn check_and_insert(&self, key: ViolationKey) -> bool {
        let (reply, response) = oneshot::channel();
        if self.tx.send(LedgerRequest { key, reply }).await.is_err() {
            tracing::error!("Violation ledger unavailable");
            return false;
        }
        response.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(phase: &str, plate: &str) -> ViolationKey {
        ViolationKey::new(phase, plate)
    }

    #[test]
    fn test_insert_once_per_key() {
        let mut ledger = Ledger::new(2);
        assert!(ledger.is_empty());
        assert!(ledger.insert(&key("2025-01-01T00:00:10Z", "AAA")));
        assert!(!ledger.is_empty());
        assert!(!ledger.insert(&key("2025-01-01T00:00:10Z", "AAA")));
        assert!(ledger.insert(&key("2025-01-01T00:00:10Z", "BBB")));
        // Same plate, next red phase
        assert!(ledger.insert(&key("2025-01-01T00:00:25Z", "AAA")));
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_retention_evicts_oldest_phase() {
        let mut ledger = Ledger::new(2);
        ledger.insert(&key("2025-01-01T00:00:10Z", "AAA"));
        ledger.insert(&key("2025-01-01T00:00:25Z", "BBB"));
        ledger.insert(&key("2025-01-01T00:00:40Z", "CCC"));

        assert_eq!(ledger.phase_count(), 2);
        assert!(!ledger.contains(&key("2025-01-01T00:00:10Z", "AAA")));
        assert!(ledger.contains(&key("2025-01-01T00:00:25Z", "BBB")));
        assert!(ledger.contains(&key("2025-01-01T00:00:40Z", "CCC")));
    }

    #[test]
    fn test_evicted_phase_is_never_reported_again() {
        let mut ledger = Ledger::new(2);
        assert!(ledger.insert(&key("2025-01-01T00:00:10Z", "AAA")));
        ledger.insert(&key("2025-01-01T00:00:25Z", "BBB"));
        ledger.insert(&key("2025-01-01T00:00:40Z", "CCC"));

        assert!(!ledger.insert(&key("2025-01-01T00:00:10Z", "AAA")));
        assert!(!ledger.insert(&key("2025-01-01T00:00:10Z", "ZZZ")));
    }

    #[tokio::test]
    async fn test_concurrent_check_and_insert_admits_one() {
        let (handle, task) = LedgerHandle::spawn(2);

        let attempts: Vec<_> = (0..32)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle
                        .check_and_insert(key("2025-01-01T00:00:10Z", "DUP1"))
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);

        drop(handle);
        task.await.unwrap();
    }
}
