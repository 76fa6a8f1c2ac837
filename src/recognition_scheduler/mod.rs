//! RecognitionScheduler - Gated Plate Recognition
//!
//! ## Responsibilities
//!
//! - Sample the frame buffer once per fixed number of captured frames
//! - Start an attempt only during a red phase and only if none is outstanding
//! - Hand confirmed plates to the ViolationPublisher
//!
//! Skipped samples are dropped, never queued.

use crate::frame_buffer::FrameBuffer;
use crate::plate_client::PlateRecognizer;
use crate::shutdown::Shutdown;
use crate::status_monitor::StatusView;
use crate::violation_publisher::ViolationPublisher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// At-most-one-outstanding gate
#[derive(Clone, Default)]
pub struct RecognitionGate {
    busy: Arc<AtomicBool>,
}

impl RecognitionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate; `None` if an attempt is already outstanding
    pub fn try_acquire(&self) -> Option<RecognitionPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RecognitionPermit {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Held for the lifetime of one attempt; releases the gate on drop
pub struct RecognitionPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for RecognitionPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Result of one sampling tick
#[derive(Debug)]
pub enum SampleOutcome {
    Started(JoinHandle<()>),
    NotRed,
    Busy,
    NoFrame,
}

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Captured frames per sample
    pub sample_every: u64,
    /// How often the frame counter is checked
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_every: 30,
            poll_interval: Duration::from_millis(10),
        }
    }
}

pub struct RecognitionScheduler<R: PlateRecognizer> {
    frames: Arc<FrameBuffer>,
    status: StatusView,
    recognizer: Arc<R>,
    publisher: Arc<ViolationPublisher>,
    gate: RecognitionGate,
    config: SchedulerConfig,
}

impl<R: PlateRecognizer> RecognitionScheduler<R> {
    /// Create new RecognitionScheduler
    pub fn new(
        frames: Arc<FrameBuffer>,
        status: StatusView,
        recognizer: Arc<R>,
        publisher: Arc<ViolationPublisher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            frames,
            status,
            recognizer,
            publisher,
            gate: RecognitionGate::new(),
            config: SchedulerConfig {
                sample_every: config.sample_every.max(1),
                ..config
            },
        }
    }

    pub fn gate(&self) -> &RecognitionGate {
        &self.gate
    }

    /// Run one sampling tick.
    ///
    /// The attempt is keyed to the red phase observed here, even if the
    /// light changes while recognition is in flight.
    pub fn on_sample(&self) -> SampleOutcome {
        let Some(phase) = self.status.red_phase() else {
            return SampleOutcome::NotRed;
        };
        let Some(permit) = self.gate.try_acquire() else {
            return SampleOutcome::Busy;
        };
        let Some(frame) = self.frames.latest() else {
            return SampleOutcome::NoFrame;
        };

        let recognizer = self.recognizer.clone();
        let publisher = self.publisher.clone();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let plate = recognizer.recognize(frame.jpeg.clone()).await;
            if plate.is_empty() {
                tracing::trace!(sequence = frame.sequence, "No plate in sampled frame");
                return;
            }
            tracing::debug!(plate = %plate, sequence = frame.sequence, phase = %phase.timestamp, "Plate recognized during red");
            publisher.report(&phase, &plate, &frame.jpeg).await;
        });

        SampleOutcome::Started(handle)
    }

    /// Sample whenever another `sample_every` frames have been captured
    pub async fn run(self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_bucket = 0u64;

        tracing::info!(
            sample_every = self.config.sample_every,
            "Recognition scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }

            let bucket = self.frames.frames_captured() / self.config.sample_every;
            if bucket == last_bucket {
                continue;
            }
            last_bucket = bucket;

            match self.on_sample() {
                SampleOutcome::Started(_) => {}
                SampleOutcome::Busy => tracing::trace!("Recognition outstanding, sample skipped"),
                SampleOutcome::NotRed | SampleOutcome::NoFrame => {}
            }
        }

        tracing::info!("Recognition scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_bus::MemoryBus;
    use crate::models::{LightState, StatusEvent};
    use crate::violation_ledger::LedgerHandle;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::watch;

    const VIOLATION_TOPIC: &str = "traffic_violation/0/detected";

    struct SlowRecognizer {
        plate: String,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SlowRecognizer {
        fn new(plate: &str, delay: Duration) -> Self {
            Self {
                plate: plate.to_string(),
                delay,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl PlateRecognizer for SlowRecognizer {
        async fn recognize(&self, _jpeg: Bytes) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.plate.clone()
        }
    }

    fn red_phase() -> StatusEvent {
        StatusEvent::new(LightState::Red, "0", Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap())
    }

    fn fixture(
        status: Option<StatusEvent>,
        recognizer: Arc<SlowRecognizer>,
    ) -> (RecognitionScheduler<SlowRecognizer>, Arc<MemoryBus>, Arc<FrameBuffer>, watch::Sender<Option<StatusEvent>>) {
        let frames = Arc::new(FrameBuffer::new());
        let bus = Arc::new(MemoryBus::new());
        let (ledger, _task) = LedgerHandle::spawn(2);
        let publisher = Arc::new(ViolationPublisher::new(
            bus.clone(),
            VIOLATION_TOPIC.to_string(),
            "0".to_string(),
            ledger,
        ));
        let (status_tx, status_rx) = watch::channel(status);
        let scheduler = RecognitionScheduler::new(
            frames.clone(),
            StatusView::from_receiver(status_rx),
            recognizer,
            publisher,
            SchedulerConfig::default(),
        );
        (scheduler, bus, frames, status_tx)
    }

    #[test]
    fn test_gate_single_permit() {
        let gate = RecognitionGate::new();
        let permit = gate.try_acquire().expect("first acquire");
        assert!(gate.is_busy());
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_skipped_when_not_red() {
        let recognizer = Arc::new(SlowRecognizer::new("AB12", Duration::ZERO));
        let green = StatusEvent::new(LightState::Green, "0", Utc::now());
        let (scheduler, bus, frames, _status) = fixture(Some(green), recognizer.clone());
        frames.update(Bytes::from_static(b"jpeg"));

        assert!(matches!(scheduler.on_sample(), SampleOutcome::NotRed));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
        assert!(bus.messages().is_empty());
        assert!(!scheduler.gate().is_busy());
    }

    #[tokio::test]
    async fn test_skipped_without_status() {
        let recognizer = Arc::new(SlowRecognizer::new("AB12", Duration::ZERO));
        let (scheduler, _bus, frames, _status) = fixture(None, recognizer);
        frames.update(Bytes::from_static(b"jpeg"));
        assert!(matches!(scheduler.on_sample(), SampleOutcome::NotRed));
    }

    #[tokio::test]
    async fn test_no_frame_releases_gate() {
        let recognizer = Arc::new(SlowRecognizer::new("AB12", Duration::ZERO));
        let (scheduler, _bus, _frames, _status) = fixture(Some(red_phase()), recognizer);
        assert!(matches!(scheduler.on_sample(), SampleOutcome::NoFrame));
        assert!(!scheduler.gate().is_busy());
    }

    #[tokio::test]
    async fn test_never_two_outstanding_attempts() {
        let recognizer = Arc::new(SlowRecognizer::new("AB12", Duration::from_millis(100)));
        let (scheduler, bus, frames, _status) = fixture(Some(red_phase()), recognizer.clone());
        frames.update(Bytes::from_static(b"jpeg"));

        let SampleOutcome::Started(first) = scheduler.on_sample() else {
            panic!("first sample should start an attempt");
        };
        for _ in 0..5 {
            assert!(matches!(scheduler.on_sample(), SampleOutcome::Busy));
        }

        first.await.unwrap();
        assert!(!scheduler.gate().is_busy());
        assert_eq!(recognizer.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.messages_on(VIOLATION_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_same_plate_same_phase_reported_once() {
        let recognizer = Arc::new(SlowRecognizer::new("AB12", Duration::ZERO));
        let (scheduler, bus, frames, status) = fixture(Some(red_phase()), recognizer);
        frames.update(Bytes::from_static(b"jpeg-1"));

        for _ in 0..3 {
            let SampleOutcome::Started(attempt) = scheduler.on_sample() else {
                panic!("expected attempt");
            };
            attempt.await.unwrap();
        }
        assert_eq!(bus.messages_on(VIOLATION_TOPIC).len(), 1);

        // A new red phase reports the plate again
        status.send_replace(Some(StatusEvent::new(
            LightState::Red,
            "0",
            Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 15).unwrap(),
        )));
        let SampleOutcome::Started(attempt) = scheduler.on_sample() else {
            panic!("expected attempt");
        };
        attempt.await.unwrap();
        assert_eq!(bus.messages_on(VIOLATION_TOPIC).len(), 2);
    }

    #[tokio::test]
    async fn test_empty_plate_not_reported() {
        let recognizer = Arc::new(SlowRecognizer::new("", Duration::ZERO));
        let (scheduler, bus, frames, _status) = fixture(Some(red_phase()), recognizer);
        frames.update(Bytes::from_static(b"jpeg"));

        let SampleOutcome::Started(attempt) = scheduler.on_sample() else {
            panic!("expected attempt");
        };
        attempt.await.unwrap();
        assert!(bus.messages().is_empty());
    }

    #[tokio::test]
    async fn test_run_samples_per_frame_bucket() {
        let recognizer = Arc::new(SlowRecognizer::new("", Duration::ZERO));
        let (scheduler, _bus, frames, _status) = fixture(Some(red_phase()), recognizer.clone());
        let (trigger, shutdown) = crate::shutdown::channel();
        let task = tokio::spawn(scheduler.run(shutdown));

        for _ in 0..30 {
            frames.update(Bytes::from_static(b"jpeg"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            frames.update(Bytes::from_static(b"jpeg"));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);

        trigger.trigger("test");
        task.await.unwrap();
    }
}
