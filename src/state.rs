//! Application state
//!
//! Process configuration and the state shared by HTTP handlers

use crate::camera_capture::CameraSettings;
use crate::error::Error;
use crate::frame_buffer::FrameBuffer;
use crate::lamp_driver::GpioPins;
use crate::message_bus::{BusOptions, Topics};
use crate::recognition_scheduler::SchedulerConfig;
use crate::shutdown::Shutdown;
use crate::status_monitor::StatusView;
use crate::stream_encoder::StreamEncoder;
use crate::traffic_controller::ControllerConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Lamp output backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampBackend {
    /// In-memory lamps, for machines without GPIO
    Simulated,
    /// Raspberry Pi GPIO
    Gpio,
}

impl FromStr for LampBackend {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(Self::Simulated),
            "gpio" => Ok(Self::Gpio),
            other => Err(Error::Config(format!("unknown lamp backend: {}", other))),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Intersection identifier used in topics and payloads
    pub intersection_id: String,
    /// MQTT broker host (empty = offline, in-memory bus)
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    /// Largest MQTT packet accepted or sent, in bytes
    pub mqtt_max_packet_size: usize,
    pub status_topic_prefix: String,
    pub violation_topic_prefix: String,
    /// Durable status snapshot (controller writes, detector polls)
    pub snapshot_path: PathBuf,
    pub dwell: Duration,
    pub controller_tick: Duration,
    pub lamp_backend: LampBackend,
    pub gpio_pins: GpioPins,
    pub camera: CameraSettings,
    /// ALPR service endpoint
    pub alpr_url: String,
    pub alpr_timeout: Duration,
    /// Frames between recognition samples
    pub recognition_interval_frames: u64,
    /// How often the scheduler checks for a new frame
    pub frame_poll: Duration,
    pub status_poll: Duration,
    /// Delay between parts sent to a viewer
    pub stream_frame_interval: Duration,
    /// Red phases kept by the violation ledger
    pub ledger_retained_phases: usize,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Default for AppConfig {
    fn default() -> Self {
        let intersection_id = env_string("INTERSECTION_ID", "0");
        let mqtt_client_id = std::env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| {
            format!("intersection-{}-{}", intersection_id, uuid::Uuid::new_v4().simple())
        });
        let defaults = GpioPins::default();

        Self {
            mqtt_broker: env_string("MQTT_BROKER", "mqtt-dashboard.com"),
            mqtt_port: env_or("MQTT_PORT", 1883),
            mqtt_client_id,
            mqtt_max_packet_size: env_or("MQTT_MAX_PACKET_BYTES", 1024 * 1024),
            status_topic_prefix: env_string("STATUS_TOPIC_PREFIX", "traffic_light"),
            violation_topic_prefix: env_string("VIOLATION_TOPIC_PREFIX", "traffic_violation"),
            snapshot_path: std::env::var("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/traffic_light.json")),
            dwell: Duration::from_secs(env_or("DWELL_SECS", 5)),
            controller_tick: Duration::from_millis(env_or("CONTROLLER_TICK_MS", 50)),
            lamp_backend: env_or("LAMP_BACKEND", LampBackend::Simulated),
            gpio_pins: GpioPins {
                red: env_or("LAMP_GPIO_RED", defaults.red),
                yellow: env_or("LAMP_GPIO_YELLOW", defaults.yellow),
                green: env_or("LAMP_GPIO_GREEN", defaults.green),
            },
            camera: CameraSettings {
                device: env_string("CAMERA_DEVICE", "/dev/video0"),
                width: env_or("CAMERA_WIDTH", 640),
                height: env_or("CAMERA_HEIGHT", 480),
                fps: env_or("CAMERA_FPS", 30),
                quality: env_or("JPEG_QUALITY", 5),
            },
            alpr_url: env_string("ALPR_URL", "http://104.168.34.100:5555/v1/image/alpr"),
            alpr_timeout: Duration::from_millis(env_or("ALPR_TIMEOUT_MS", 2000)),
            recognition_interval_frames: env_or("RECOGNITION_INTERVAL_FRAMES", 30),
            frame_poll: Duration::from_millis(env_or("FRAME_POLL_MS", 10)),
            status_poll: Duration::from_millis(env_or("STATUS_POLL_MS", 10)),
            stream_frame_interval: Duration::from_millis(env_or("STREAM_FRAME_MS", 33)),
            ledger_retained_phases: env_or("LEDGER_RETAINED_PHASES", 2),
            host: env_string("HOST", "0.0.0.0"),
            port: env_or("PORT", 8000),
            intersection_id,
        }
    }
}

impl AppConfig {
    pub fn topics(&self) -> Topics {
        Topics::new(
            &self.status_topic_prefix,
            &self.violation_topic_prefix,
            &self.intersection_id,
        )
    }

    /// `None` when running without a broker
    pub fn bus_options(&self) -> Option<BusOptions> {
        if self.mqtt_broker.trim().is_empty() {
            return None;
        }
        Some(BusOptions {
            host: self.mqtt_broker.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            keep_alive: Duration::from_secs(30),
            max_packet_size: self.mqtt_max_packet_size,
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            intersection_id: self.intersection_id.clone(),
            dwell: self.dwell,
            tick: self.controller_tick,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sample_every: self.recognition_interval_frames,
            poll_interval: self.frame_poll,
        }
    }
}

/// Detector state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub frames: Arc<FrameBuffer>,
    pub status: StatusView,
    pub stream: Arc<StreamEncoder>,
    pub shutdown: Shutdown,
}
