//! TrafficController - Intersection State Machine
//!
//! ## Responsibilities
//!
//! - Own the controller snapshot (state, mode, cycle index, dwell start)
//! - Apply queued commands in arrival order, then the auto-dwell check
//! - Drive lamps and emit a StatusEvent on every real transition
//! - De-energize lamps on every exit path (via `LampBank`)
//!
//! Same-state applications are no-ops: no lamp write, no dwell reset, no event.
//! This includes ResumeAuto landing on the current state, so after a manual
//! hold longer than the dwell the auto cycle moves on in the same tick.

use crate::command_ingress::{Command, CommandQueue};
use crate::lamp_driver::LampBank;
use crate::models::{ControllerMode, LightState, StatusEvent};
use crate::shutdown::Shutdown;
use crate::status_publisher::StatusSink;
use chrono::Utc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Controller state, owned by the controller loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub state: LightState,
    pub mode: ControllerMode,
    pub cycle_index: usize,
    pub dwell_start: Instant,
}

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub intersection_id: String,
    /// How long each state is held in auto mode
    pub dwell: Duration,
    /// Loop tick interval
    pub tick: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            intersection_id: "0".to_string(),
            dwell: Duration::from_secs(5),
            tick: Duration::from_millis(50),
        }
    }
}

/// Intersection controller
pub struct TrafficController {
    snapshot: ControllerSnapshot,
    config: ControllerConfig,
    lamps: LampBank,
    sink: Box<dyn StatusSink>,
}

impl TrafficController {
    /// Create controller in auto mode at the first cycle state.
    ///
    /// Lamps stay dark until `announce` is called.
    pub fn new(config: ControllerConfig, lamps: LampBank, sink: Box<dyn StatusSink>, now: Instant) -> Self {
        Self {
            snapshot: ControllerSnapshot {
                state: LightState::from_cycle_index(0),
                mode: ControllerMode::Auto,
                cycle_index: 0,
                dwell_start: now,
            },
            config,
            lamps,
            sink,
        }
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot
    }

    pub fn lamps(&self) -> &LampBank {
        &self.lamps
    }

    /// Energize the initial state and publish it, starting its dwell
    pub fn announce(&mut self, now: Instant) {
        self.snapshot.dwell_start = now;
        self.lamps.show(self.snapshot.state);
        self.emit();
        tracing::info!(
            state = %self.snapshot.state,
            mode = %self.snapshot.mode,
            "Controller started"
        );
    }

    /// One loop iteration: commands first, then the auto-dwell check
    pub fn tick(&mut self, commands: Vec<Command>, now: Instant) {
        for command in commands {
            self.apply_command(command, now);
        }

        if self.snapshot.mode == ControllerMode::Auto
            && now.saturating_duration_since(self.snapshot.dwell_start) >= self.config.dwell
        {
            self.advance_cycle(now);
        }
    }

    /// Apply a single command
    pub fn apply_command(&mut self, command: Command, now: Instant) {
        tracing::info!(command = ?command, "Applying command");
        match command {
            Command::SetState(state) => {
                self.snapshot.mode = ControllerMode::Manual;
                self.apply_state(state, now);
            }
            Command::ResumeAuto => {
                self.snapshot.mode = ControllerMode::Auto;
                self.advance_cycle(now);
            }
        }
    }

    fn advance_cycle(&mut self, now: Instant) {
        self.snapshot.cycle_index = (self.snapshot.cycle_index + 1) % LightState::CYCLE.len();
        self.apply_state(LightState::from_cycle_index(self.snapshot.cycle_index), now);
    }

    /// Returns true on a real transition
    fn apply_state(&mut self, state: LightState, now: Instant) -> bool {
        if state == self.snapshot.state {
            tracing::debug!(state = %state, "State unchanged");
            return false;
        }

        let previous = self.snapshot.state;
        self.snapshot.state = state;
        self.snapshot.dwell_start = now;
        self.lamps.show(state);
        self.emit();

        tracing::info!(
            from = %previous,
            to = %state,
            mode = %self.snapshot.mode,
            cycle_index = self.snapshot.cycle_index,
            "Light transition"
        );
        true
    }

    fn emit(&self) {
        let event = StatusEvent::new(self.snapshot.state, &self.config.intersection_id, Utc::now());
        self.sink.publish(&event);
    }

    /// Run the controller loop until shutdown.
    ///
    /// Consumes the controller; lamps are de-energized and released when it
    /// is dropped, whichever way this function exits.
    pub async fn run(mut self, mut queue: CommandQueue, mut shutdown: Shutdown) {
        self.announce(Instant::now());

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = interval.tick() => {
                    let commands = queue.drain();
                    self.tick(commands, Instant::now());
                }
            }
        }

        tracing::info!(state = %self.snapshot.state, "Controller loop stopped");
    }
}
