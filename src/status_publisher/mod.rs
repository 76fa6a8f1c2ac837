//! StatusPublisher - Durable Status Publication
//!
//! ## Responsibilities
//!
//! - Write the latest StatusEvent to the snapshot file atomically
//!   (temp file, fsync, rename)
//! - Publish the same event on the status topic (QoS 1)
//! - Never block or retry inside the controller tick
//!
//! The controller hands events over through a watch channel; a dedicated
//! writer task performs the file I/O. Latest value wins: a newer transition
//! supersedes one that has not been written yet.

use crate::error::Result;
use crate::message_bus::{BusPublisher, QoS};
use crate::models::StatusEvent;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receiver of real light transitions
pub trait StatusSink: Send {
    /// Record `event`; must return without waiting on I/O
    fn publish(&self, event: &StatusEvent);
}

/// Fan-out to snapshot file + status topic
pub struct StatusPublisher {
    bus: Arc<dyn BusPublisher>,
    topic: String,
    snapshot: watch::Sender<Option<StatusEvent>>,
}

impl StatusPublisher {
    /// Create new StatusPublisher
    ///
    /// # Arguments
    /// * `bus` - Bus used for the status topic
    /// * `topic` - Status topic name
    /// * `snapshot` - Sender half returned by `SnapshotWriter::spawn`
    pub fn new(
        bus: Arc<dyn BusPublisher>,
        topic: String,
        snapshot: watch::Sender<Option<StatusEvent>>,
    ) -> Self {
        Self { bus, topic, snapshot }
    }
}

impl StatusSink for StatusPublisher {
    fn publish(&self, event: &StatusEvent) {
        // 1. Durable snapshot (handed to writer task)
        self.snapshot.send_replace(Some(event.clone()));

        // 2. Bus, independent of the file path
        match serde_json::to_vec(event) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&self.topic, QoS::AtLeastOnce, payload) {
                    tracing::warn!(
                        topic = %self.topic,
                        status = %event.status,
                        error = %e,
                        "Status publish failed"
                    );
                } else {
                    tracing::debug!(topic = %self.topic, status = %event.status, "Status published");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize status event"),
        }
    }
}

/// Background writer for the snapshot file
pub struct SnapshotWriter;

impl SnapshotWriter {
    /// Start the writer task for `path`.
    ///
    /// The task exits after the sender is dropped and the last pending
    /// event has been written.
    pub fn spawn(path: PathBuf) -> (watch::Sender<Option<StatusEvent>>, JoinHandle<()>) {
        let (tx, mut rx) = watch::channel::<Option<StatusEvent>>(None);

        let handle = tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    tracing::warn!(dir = %parent.display(), error = %e, "Failed to create snapshot directory");
                }
            }

            while rx.changed().await.is_ok() {
                let Some(event) = rx.borrow_and_update().clone() else {
                    continue;
                };

                let target = path.clone();
                let status = event.status;
                let result = tokio::task::spawn_blocking(move || write_snapshot(&target, &event)).await;

                match result {
                    Ok(Ok(())) => {
                        tracing::debug!(path = %path.display(), status = %status, "Snapshot written");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "Snapshot write failed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Snapshot writer task panicked");
                    }
                }
            }

            tracing::info!("Snapshot writer stopped");
        });

        (tx, handle)
    }
}

/// Temporary sibling used for the atomic replace
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically replace the snapshot at `path` with `event`.
///
/// Readers see either the previous complete file or the new one.
pub fn write_snapshot(path: &Path, event: &StatusEvent) -> Result<()> {
    let temp = temp_path(path);
    let payload = serde_json::to_vec(event)?;

    {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(&payload)?;
        file.flush()?;
        file.sync_all()?;
    }

    std::fs::rename(&temp, path)?;
    Ok(())
}

/// Read and validate the snapshot at `path`
pub fn read_snapshot(path: &Path) -> Result<StatusEvent> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
