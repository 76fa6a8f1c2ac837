//! StatusMonitor - Snapshot File Polling
//!
//! ## Responsibilities
//!
//! - Poll the durable status snapshot at a short fixed interval
//! - Publish the last successfully parsed StatusEvent to readers
//! - Keep the last known value when a read fails
//!
//! This is the only channel through which the violation pipeline learns the
//! light state; staleness is bounded by the poll interval.

use crate::models::StatusEvent;
use crate::shutdown::Shutdown;
use crate::status_publisher::read_snapshot;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Read-only view of the last known light status
#[derive(Clone)]
pub struct StatusView {
    rx: watch::Receiver<Option<StatusEvent>>,
}

impl StatusView {
    /// View fed by an arbitrary watch channel
    pub fn from_receiver(rx: watch::Receiver<Option<StatusEvent>>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> Option<StatusEvent> {
        self.rx.borrow().clone()
    }

    /// Current status if it is a red phase
    pub fn red_phase(&self) -> Option<StatusEvent> {
        self.current().filter(StatusEvent::is_red)
    }
}

/// Snapshot poller
pub struct StatusMonitor;

impl StatusMonitor {
    /// Start polling `path` every `interval` until shutdown
    pub fn spawn(path: PathBuf, interval: Duration, mut shutdown: Shutdown) -> (StatusView, JoinHandle<()>) {
        let (tx, rx) = watch::channel::<Option<StatusEvent>>(None);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failing = false;

            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {}
                }

                let target = path.clone();
                let result = tokio::task::spawn_blocking(move || read_snapshot(&target)).await;

                match result {
                    Ok(Ok(event)) => {
                        failing = false;
                        tx.send_if_modified(|current| {
                            if current.as_ref() == Some(&event) {
                                return false;
                            }
                            tracing::info!(
                                status = %event.status,
                                timestamp = %event.timestamp,
                                "Light status changed"
                            );
                            *current = Some(event);
                            true
                        });
                    }
                    Ok(Err(e)) => {
                        // Log once per failure streak; the poll interval is short
                        if !failing {
                            tracing::warn!(path = %path.display(), error = %e, "Failed to read light status");
                            failing = true;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Status read task panicked"),
                }
            }

            tracing::info!("Status monitor stopped");
        });

        (StatusView { rx }, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LightState;
    use crate::status_publisher::write_snapshot;
    use chrono::{TimeZone, Utc};

    async fn wait_for(view: &StatusView, expected: Option<&StatusEvent>) {
        for _ in 0..200 {
            if view.current().as_ref() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status view never reached {:?}", expected);
    }

    #[tokio::test]
    async fn test_monitor_tracks_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("light.json");
        let (trigger, shutdown) = crate::shutdown::channel();

        let (view, handle) = StatusMonitor::spawn(path.clone(), Duration::from_millis(5), shutdown);
        assert!(view.current().is_none());

        let red = StatusEvent::new(LightState::Red, "0", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        write_snapshot(&path, &red).unwrap();
        wait_for(&view, Some(&red)).await;
        assert_eq!(view.red_phase(), Some(red.clone()));

        // Garbage keeps the last good value
        std::fs::write(&path, b"{not json").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(view.current(), Some(red));

        let green = StatusEvent::new(LightState::Green, "0", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 5).unwrap());
        write_snapshot(&path, &green).unwrap();
        wait_for(&view, Some(&green)).await;
        assert!(view.red_phase().is_none());

        trigger.trigger("test");
        handle.await.unwrap();
    }
}
