//! ViolationPublisher - Violation Report Emission
//!
//! ## Responsibilities
//!
//! - Check the ledger for (red phase, plate)
//! - Build the ViolationRecord for new keys
//! - Publish it on the violation topic without blocking

use crate::message_bus::{BusPublisher, QoS};
use crate::models::{StatusEvent, ViolationKey, ViolationRecord};
use crate::violation_ledger::LedgerHandle;
use chrono::Utc;
use std::sync::Arc;

/// Violation reporter
pub struct ViolationPublisher {
    bus: Arc<dyn BusPublisher>,
    topic: String,
    intersection_id: String,
    ledger: LedgerHandle,
}

impl ViolationPublisher {
    /// Create new ViolationPublisher
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        topic: String,
        intersection_id: String,
        ledger: LedgerHandle,
    ) -> Self {
        Self {
            bus,
            topic,
            intersection_id,
            ledger,
        }
    }

    /// Report `plate` seen during `phase`.
    ///
    /// Returns the record if this key was new, `None` if already reported.
    pub async fn report(&self, phase: &StatusEvent, plate: &str, jpeg: &[u8]) -> Option<ViolationRecord> {
        let key = ViolationKey::new(phase.timestamp.clone(), plate);
        if !self.ledger.check_and_insert(key).await {
            tracing::debug!(plate = %plate, phase = %phase.timestamp, "Violation already reported");
            return None;
        }

        let record = ViolationRecord::new(plate, &self.intersection_id, jpeg, Utc::now());

        match serde_json::to_vec(&record) {
            Ok(payload) => match self.bus.publish(&self.topic, QoS::AtMostOnce, payload) {
                Ok(()) => tracing::info!(
                    plate = %record.plate,
                    timestamp = %record.timestamp,
                    phase = %phase.timestamp,
                    image_bytes = jpeg.len(),
                    "Published violation"
                ),
                Err(e) => tracing::error!(plate = %record.plate, error = %e, "Failed to publish violation"),
            },
            Err(e) => tracing::error!(error = %e, "Failed to serialize violation"),
        }

        Some(record)
    }
}
