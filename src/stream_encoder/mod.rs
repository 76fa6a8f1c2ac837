//! StreamEncoder - Live MJPEG Viewer Streams
//!
//! ## Responsibilities
//!
//! - Wrap JPEG frames as multipart/x-mixed-replace parts
//! - One throttled stream per connected viewer
//! - Track connected viewers
//!
//! Viewers only read the frame buffer; a disconnect drops the stream and
//! nothing else.

use crate::frame_buffer::FrameBuffer;
use crate::shutdown::Shutdown;
use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Content-Type of the streaming response
pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)
}

/// Encode one JPEG as a multipart part
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

pub struct StreamEncoder {
    frames: Arc<FrameBuffer>,
    frame_interval: Duration,
    viewers: AtomicU64,
}

impl StreamEncoder {
    /// Create new StreamEncoder
    pub fn new(frames: Arc<FrameBuffer>, frame_interval: Duration) -> Self {
        Self {
            frames,
            frame_interval,
            viewers: AtomicU64::new(0),
        }
    }

    /// Currently connected viewers
    pub fn viewer_count(&self) -> u64 {
        self.viewers.load(Ordering::Relaxed)
    }

    /// Part stream for one viewer; ends on shutdown
    pub fn viewer_stream(
        self: &Arc<Self>,
        shutdown: Shutdown,
    ) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
        let mut ticker = tokio::time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let viewer = Viewer {
            guard: ViewerGuard::connect(self.clone()),
            ticker,
            shutdown,
            last_sequence: 0,
        };

        futures::stream::unfold(viewer, |mut viewer| async move {
            loop {
                tokio::select! {
                    _ = viewer.shutdown.wait() => return None,
                    _ = viewer.ticker.tick() => {}
                }

                let Some(frame) = viewer.guard.encoder.frames.latest() else {
                    continue;
                };
                if frame.sequence == viewer.last_sequence {
                    continue;
                }
                viewer.last_sequence = frame.sequence;
                return Some((Ok(encode_part(&frame.jpeg)), viewer));
            }
        })
    }
}

struct Viewer {
    guard: ViewerGuard,
    ticker: Interval,
    shutdown: Shutdown,
    last_sequence: u64,
}

/// Counts the viewer for as long as its stream is alive
struct ViewerGuard {
    id: Uuid,
    encoder: Arc<StreamEncoder>,
}

impl ViewerGuard {
    fn connect(encoder: Arc<StreamEncoder>) -> Self {
        let id = Uuid::new_v4();
        let viewers = encoder.viewers.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(viewer_id = %id, viewers, "Viewer connected");
        Self { id, encoder }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let viewers = self.encoder.viewers.fetch_sub(1, Ordering::Relaxed) - 1;
        tracing::info!(viewer_id = %self.id, viewers, "Viewer disconnected");
    }
}
