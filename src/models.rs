//! Shared data model
//!
//! Light states, controller mode, and the wire payloads exchanged over the
//! message bus and the durable status snapshot.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lamp state of the intersection, cycling Green -> Yellow -> Red -> Green
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightState {
    Green,
    Yellow,
    Red,
}

impl LightState {
    /// Fixed auto-mode cycle
    pub const CYCLE: [LightState; 3] = [LightState::Green, LightState::Yellow, LightState::Red];

    /// State at a (wrapping) position in the cycle
    pub fn from_cycle_index(index: usize) -> Self {
        Self::CYCLE[index % Self::CYCLE.len()]
    }

    /// Parse an exact state token ("Green", "Yellow", "Red")
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "Green" => Some(LightState::Green),
            "Yellow" => Some(LightState::Yellow),
            "Red" => Some(LightState::Red),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LightState::Green => "Green",
            LightState::Yellow => "Yellow",
            LightState::Red => "Red",
        }
    }
}

impl fmt::Display for LightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerMode {
    Auto,
    Manual,
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerMode::Auto => f.write_str("Auto"),
            ControllerMode::Manual => f.write_str("Manual"),
        }
    }
}

/// Format a UTC instant as ISO-8601 with second precision and a "Z" suffix
pub fn utc_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Status event, published on every real light transition
///
/// Same schema on the status topic and in the durable snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub timestamp: String,
    pub status: LightState,
    pub intersection_id: String,
}

impl StatusEvent {
    /// Create new status event stamped at `at`
    pub fn new(status: LightState, intersection_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            timestamp: utc_timestamp(at),
            status,
            intersection_id: intersection_id.to_string(),
        }
    }

    pub fn is_red(&self) -> bool {
        self.status == LightState::Red
    }
}

/// Identifies "this plate during this red phase"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViolationKey {
    /// Timestamp of the red-phase StatusEvent
    pub phase_timestamp: String,
    pub plate: String,
}

impl ViolationKey {
    pub fn new(phase_timestamp: impl Into<String>, plate: impl Into<String>) -> Self {
        Self {
            phase_timestamp: phase_timestamp.into(),
            plate: plate.into(),
        }
    }
}

/// Violation report published on the violation topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub timestamp: String,
    pub plate: String,
    pub intersection_id: String,
    /// Base64-encoded JPEG
    pub image: String,
}

impl ViolationRecord {
    /// Build a record for `plate`, embedding the JPEG as base64
    pub fn new(plate: &str, intersection_id: &str, jpeg: &[u8], at: DateTime<Utc>) -> Self {
        Self {
            timestamp: utc_timestamp(at),
            plate: plate.to_string(),
            intersection_id: intersection_id.to_string(),
            image: base64::engine::general_purpose::STANDARD.encode(jpeg),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub intersection_id: String,
    pub viewers: u64,
    pub frames_captured: u64,
    pub light_status: Option<LightState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cycle_wraps() {
        assert_eq!(LightState::from_cycle_index(0), LightState::Green);
        assert_eq!(LightState::from_cycle_index(1), LightState::Yellow);
        assert_eq!(LightState::from_cycle_index(2), LightState::Red);
        assert_eq!(LightState::from_cycle_index(3), LightState::Green);
    }

    #[test]
    fn test_token_is_case_sensitive() {
        assert_eq!(LightState::from_token("Red"), Some(LightState::Red));
        assert_eq!(LightState::from_token("red"), None);
        assert_eq!(LightState::from_token("Auto"), None);
    }

    #[test]
    fn test_status_event_schema() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap();
        let event = StatusEvent::new(LightState::Red, "0", at);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["timestamp"], "2025-03-01T12:30:05Z");
        assert_eq!(json["status"], "Red");
        assert_eq!(json["intersection_id"], "0");
    }

    #[test]
    fn test_violation_record_encodes_image() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap();
        let record = ViolationRecord::new("ABC123", "7", &[0xFF, 0xD8, 0xFF, 0xD9], at);

        assert_eq!(record.image, "/9j/2Q==");
        assert_eq!(record.plate, "ABC123");
        assert_eq!(record.intersection_id, "7");
    }
}
