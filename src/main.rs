//! Redlight Guard - intersection controller and violation camera
//!
//! Main entry point. The role subcommand selects which side runs in this
//! process; `all` runs both against the same snapshot file and bus.

use clap::{Parser, Subcommand};
use redlight_guard::{
    camera_capture::{self, CaptureHandle, FfmpegCamera},
    command_ingress::{self, CommandQueue},
    frame_buffer::FrameBuffer,
    lamp_driver::{self, LampBank, LampOutputs, SimulatedLamps},
    message_bus::{BusPublisher, CommandSubscription, MqttBus, OfflineBus},
    plate_client::AlprClient,
    recognition_scheduler::RecognitionScheduler,
    shutdown::{self, Shutdown, ShutdownTrigger},
    state::{AppConfig, AppState, LampBackend},
    status_monitor::StatusMonitor,
    status_publisher::{SnapshotWriter, StatusPublisher},
    stream_encoder::StreamEncoder,
    traffic_controller::TrafficController,
    violation_ledger::LedgerHandle,
    violation_publisher::ViolationPublisher,
    web_api,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "redlight-guard", version)]
#[command(about = "Traffic light controller and red-light violation camera")]
struct Cli {
    /// Process role (defaults to all)
    #[command(subcommand)]
    role: Option<Role>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Light controller only: commands, lamps, status publication
    Controller,
    /// Camera only: capture, recognition, violations, video feed
    Detector,
    /// Both in one process
    All,
}

impl Role {
    fn runs_controller(self) -> bool {
        matches!(self, Role::Controller | Role::All)
    }

    fn runs_detector(self) -> bool {
        matches!(self, Role::Detector | Role::All)
    }
}

/// Resolve on Ctrl-C or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Start the controller loop and its snapshot writer
fn start_controller(
    config: &AppConfig,
    bus: Arc<dyn BusPublisher>,
    queue: CommandQueue,
    shutdown: Shutdown,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let outputs: Box<dyn LampOutputs> = match config.lamp_backend {
        LampBackend::Gpio => Box::new(lamp_driver::open_gpio(config.gpio_pins)?),
        LampBackend::Simulated => Box::new(SimulatedLamps::new()),
    };
    tracing::info!(backend = ?config.lamp_backend, "Lamp outputs ready");

    let (snapshot_tx, writer) = SnapshotWriter::spawn(config.snapshot_path.clone());
    let publisher = StatusPublisher::new(bus, config.topics().status, snapshot_tx);

    let controller = TrafficController::new(
        config.controller_config(),
        LampBank::new(outputs),
        Box::new(publisher),
        tokio::time::Instant::now(),
    );
    let controller_task = tokio::spawn(controller.run(queue, shutdown));

    tracing::info!(
        dwell_secs = config.dwell.as_secs(),
        snapshot_path = %config.snapshot_path.display(),
        "Controller started"
    );

    Ok(vec![controller_task, writer])
}

/// Running detector pieces that main has to wait for
struct Detector {
    tasks: Vec<JoinHandle<()>>,
    capture: CaptureHandle,
}

/// Start capture, recognition and the HTTP server
async fn start_detector(
    config: Arc<AppConfig>,
    bus: Arc<dyn BusPublisher>,
    shutdown: Shutdown,
    trigger: ShutdownTrigger,
) -> anyhow::Result<Detector> {
    let frames = Arc::new(FrameBuffer::new());
    let camera = FfmpegCamera::open(&config.camera)?;
    let capture = camera_capture::spawn_capture(
        Box::new(camera),
        frames.clone(),
        shutdown.clone(),
        trigger.clone(),
    )?;
    tracing::info!(
        device = %config.camera.device,
        width = config.camera.width,
        height = config.camera.height,
        fps = config.camera.fps,
        "Camera capture started"
    );

    let (status, monitor) = StatusMonitor::spawn(
        config.snapshot_path.clone(),
        config.status_poll,
        shutdown.clone(),
    );

    let (ledger, ledger_task) = LedgerHandle::spawn(config.ledger_retained_phases);
    let violations = Arc::new(ViolationPublisher::new(
        bus,
        config.topics().violation,
        config.intersection_id.clone(),
        ledger,
    ));
    let recognizer = Arc::new(AlprClient::new(config.alpr_url.clone(), config.alpr_timeout)?);
    let scheduler = RecognitionScheduler::new(
        frames.clone(),
        status.clone(),
        recognizer,
        violations,
        config.scheduler_config(),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    tracing::info!(alpr_url = %config.alpr_url, "Recognition scheduler started");

    let stream = Arc::new(StreamEncoder::new(frames.clone(), config.stream_frame_interval));
    let state = AppState {
        config: config.clone(),
        frames,
        status,
        stream,
        shutdown: shutdown.clone(),
    };

    let app = web_api::create_router(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let mut server_shutdown = shutdown;
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "HTTP server failed");
            trigger.trigger("http server failure");
        }
    });

    Ok(Detector {
        tasks: vec![monitor, scheduler_task, ledger_task, server],
        capture,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "redlight_guard=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let role = cli.role.unwrap_or(Role::All);
    tracing::info!(role = ?role, "Starting Redlight Guard v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Arc::new(AppConfig::default());
    let topics = config.topics();
    tracing::info!(
        intersection_id = %config.intersection_id,
        broker = %config.mqtt_broker,
        command_topic = %topics.command,
        status_topic = %topics.status,
        violation_topic = %topics.violation,
        snapshot_path = %config.snapshot_path.display(),
        "Configuration loaded"
    );

    let (trigger, shutdown) = shutdown::channel();
    let signal_trigger = trigger.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_trigger.trigger("signal");
    });

    // Message bus
    let (ingress, queue) = command_ingress::channel();
    let (bus, bus_task): (Arc<dyn BusPublisher>, Option<JoinHandle<()>>) = match config.bus_options() {
        Some(options) => {
            let subscription = role.runs_controller().then(|| CommandSubscription {
                topic: topics.command.clone(),
                ingress,
            });
            let (mqtt, task) = MqttBus::start(options, subscription, shutdown.clone());
            let bus: Arc<dyn BusPublisher> = Arc::new(mqtt);
            (bus, Some(task))
        }
        None => {
            tracing::warn!("MQTT_BROKER is empty, running without a message bus");
            let bus: Arc<dyn BusPublisher> = Arc::new(OfflineBus);
            (bus, None)
        }
    };

    let mut tasks = Vec::new();
    if role.runs_controller() {
        tasks.extend(start_controller(&config, bus.clone(), queue, shutdown.clone())?);
    }

    let mut capture = None;
    if role.runs_detector() {
        let detector = start_detector(config.clone(), bus.clone(), shutdown.clone(), trigger.clone()).await?;
        tasks.extend(detector.tasks);
        capture = Some(detector.capture);
    }

    shutdown.clone().wait().await;
    tracing::info!("Shutting down");

    // Kill ffmpeg so a stalled read returns
    if let Some(ref handle) = capture {
        handle.stop();
    }

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Task ended abnormally");
        }
    }

    let mut capture_result = Ok(());
    if let Some(handle) = capture {
        capture_result = match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(result) => result,
            Err(e) => Err(redlight_guard::Error::Internal(e.to_string())),
        };
    }

    // Event loop sends DISCONNECT on its way out
    if let Some(task) = bus_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Bus task ended abnormally");
        }
    }
    drop(bus);

    capture_result?;
    tracing::info!("Shutdown complete");
    Ok(())
}
