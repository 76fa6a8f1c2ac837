//! Redlight Guard Library
//!
//! Intersection light controller and red-light violation camera
//!
//! ## Architecture
//!
//! Controller side:
//!
//! 1. CommandIngress - Bus payloads into a FIFO queue
//! 2. TrafficController - Light state machine and controller loop
//! 3. LampDriver - Lamp outputs (simulated or GPIO)
//! 4. StatusPublisher - Atomic snapshot file + status topic
//!
//! Detector side:
//!
//! 5. CameraCapture + FrameBuffer - Continuous capture into a single slot
//! 6. StatusMonitor - Polls the snapshot for the current light
//! 7. RecognitionScheduler + PlateClient - Gated plate recognition
//! 8. ViolationLedger + ViolationPublisher - Deduplicated reports
//! 9. StreamEncoder + WebAPI - Live MJPEG feed and status endpoints
//!
//! MessageBus and Shutdown are shared by both sides.

pub mod camera_capture;
pub mod command_ingress;
pub mod error;
pub mod frame_buffer;
pub mod lamp_driver;
pub mod message_bus;
pub mod models;
pub mod plate_client;
pub mod recognition_scheduler;
pub mod shutdown;
pub mod state;
pub mod status_monitor;
pub mod status_publisher;
pub mod stream_encoder;
pub mod traffic_controller;
pub mod violation_ledger;
pub mod violation_publisher;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
