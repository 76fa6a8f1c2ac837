//! FrameBuffer - Single-Slot Latest Frame
//!
//! Last write wins. Readers get their own handle to an immutable frame (or
//! `None` before the first capture) and never hold the lock while using it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Captured frame (JPEG-encoded)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub jpeg: Bytes,
    pub captured_at: DateTime<Utc>,
    /// 1-based capture counter
    pub sequence: u64,
}

/// Latest-frame slot shared between the capture loop and its readers
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<Frame>>,
    captured: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot with a new frame; returns its sequence number
    pub fn update(&self, jpeg: Bytes) -> u64 {
        let sequence = self.captured.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Frame {
            jpeg,
            captured_at: Utc::now(),
            sequence,
        };

        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(frame);
        sequence
    }

    /// Most recent frame, if any has been captured
    pub fn latest(&self) -> Option<Frame> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Total frames captured since start
    pub fn frames_captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }
}
