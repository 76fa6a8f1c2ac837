//! CameraCapture - Continuous Frame Capture
//!
//! ## Responsibilities
//!
//! - Pull JPEG frames from the camera at its native rate (ffmpeg, V4L2)
//! - Overwrite the shared `FrameBuffer` from a dedicated thread
//! - Treat device failure as fatal: stop capturing and request shutdown
//! - On shutdown, unblock a pending read and exit cleanly

use crate::error::{Error, Result};
use crate::frame_buffer::FrameBuffer;
use crate::shutdown::{Shutdown, ShutdownTrigger};
use bytes::{Bytes, BytesMut};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// JPEG start-of-image marker
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
const EOI: [u8; 2] = [0xFF, 0xD9];
/// Read chunk size for the ffmpeg pipe
const READ_CHUNK: usize = 64 * 1024;
/// Drop buffered bytes beyond this without a complete frame
const MAX_PENDING: usize = 8 * 1024 * 1024;

/// Source of JPEG frames
pub trait CameraDevice: Send {
    /// Block until the next frame is available
    fn next_frame(&mut self) -> Result<Bytes>;

    /// Handle that makes a blocked `next_frame` return from another thread
    fn stopper(&self) -> Option<CameraStopper> {
        None
    }
}

/// Interrupts a camera blocked in `next_frame`
#[derive(Clone)]
pub struct CameraStopper {
    stop: Arc<dyn Fn() + Send + Sync>,
}

impl CameraStopper {
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self { stop: Arc::new(stop) }
    }

    pub fn stop(&self) {
        (self.stop)();
    }
}

/// Camera capture settings
#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// V4L2 device path
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// ffmpeg `-q:v` (2 = best, 31 = worst)
    pub quality: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
            quality: 5,
        }
    }
}

/// Splits a concatenated MJPEG byte stream into individual JPEGs
#[derive(Default)]
pub struct JpegSplitter {
    pending: BytesMut,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        if self.pending.len() > MAX_PENDING {
            tracing::warn!(size = self.pending.len(), "Discarding oversized partial frame");
            self.pending.clear();
        }
    }

    /// Next complete JPEG in the buffer, if any
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = find_marker(&self.pending, SOI, 0)?;
        if start > 0 {
            // Garbage before SOI
            let _ = self.pending.split_to(start);
        }
        let end = find_marker(&self.pending, EOI, SOI.len())?;
        Some(self.pending.split_to(end + EOI.len()).freeze())
    }
}

fn find_marker(data: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

/// Camera read through an ffmpeg child process emitting MJPEG on stdout
pub struct FfmpegCamera {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    splitter: JpegSplitter,
    chunk: Vec<u8>,
}

impl FfmpegCamera {
    /// Spawn ffmpeg against the V4L2 device
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        let video_size = format!("{}x{}", settings.width, settings.height);
        let framerate = settings.fps.to_string();
        let quality = settings.quality.to_string();
        let mut command = Command::new("ffmpeg");
        // Own process group so terminal SIGINT is not delivered to ffmpeg
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command
            .args([
                "-f", "v4l2",
                "-framerate", framerate.as_str(),
                "-video_size", video_size.as_str(),
                "-i", settings.device.as_str(),
                "-f", "image2pipe",
                "-vcodec", "mjpeg",
                "-q:v", quality.as_str(),
                "-loglevel", "error",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| Error::Camera(format!("ffmpeg spawn failed: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Camera("ffmpeg stdout unavailable".to_string()))?;

        tracing::info!(
            device = %settings.device,
            size = %video_size,
            fps = settings.fps,
            "Camera opened via ffmpeg"
        );

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdout,
            splitter: JpegSplitter::new(),
            chunk: vec![0; READ_CHUNK],
        })
    }
}

impl CameraDevice for FfmpegCamera {
    fn next_frame(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.splitter.next_frame() {
                return Ok(frame);
            }

            let n = self
                .stdout
                .read(&mut self.chunk)
                .map_err(|e| Error::Camera(format!("camera read failed: {}", e)))?;
            if n == 0 {
                let status = self
                    .child
                    .lock()
                    .ok()
                    .and_then(|mut child| child.try_wait().ok().flatten());
                return Err(Error::Camera(format!("camera stream ended (ffmpeg status: {:?})", status)));
            }
            self.splitter.push(&self.chunk[..n]);
        }
    }

    fn stopper(&self) -> Option<CameraStopper> {
        let child = self.child.clone();
        Some(CameraStopper::new(move || {
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }))
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Running capture thread
pub struct CaptureHandle {
    thread: JoinHandle<Result<()>>,
    stopper: Option<CameraStopper>,
}

impl CaptureHandle {
    /// Unblock the device so the thread notices shutdown
    pub fn stop(&self) {
        if let Some(ref stopper) = self.stopper {
            stopper.stop();
        }
    }

    /// Wait for the capture thread (blocking)
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .unwrap_or_else(|_| Err(Error::Camera("capture thread panicked".to_string())))
    }
}

/// Start the capture loop on its own thread.
///
/// The thread ends with `Ok` once `shutdown` fires, even if the device
/// errors while being stopped. A device error before that is fatal: it
/// requests process shutdown through `trigger` and is returned.
pub fn spawn_capture(
    mut device: Box<dyn CameraDevice>,
    buffer: Arc<FrameBuffer>,
    shutdown: Shutdown,
    trigger: ShutdownTrigger,
) -> Result<CaptureHandle> {
    let stopper = device.stopper();

    let thread = std::thread::Builder::new()
        .name("camera-capture".to_string())
        .spawn(move || {
            tracing::info!("Capture loop started");
            while !shutdown.is_triggered() {
                match device.next_frame() {
                    Ok(jpeg) => {
                        let sequence = buffer.update(jpeg);
                        tracing::trace!(sequence, "Frame captured");
                    }
                    Err(e) if shutdown.is_triggered() => {
                        tracing::debug!(error = %e, "Camera closed during shutdown");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Capture failed, stopping");
                        trigger.trigger("camera failure");
                        return Err(e);
                    }
                }
            }
            tracing::info!(frames = buffer.frames_captured(), "Capture loop stopped");
            Ok(())
        })?;

    Ok(CaptureHandle { thread, stopper })
}
