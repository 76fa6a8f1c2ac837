//! CommandIngress - Control Message Intake
//!
//! ## Responsibilities
//!
//! - Accept raw control payloads from the bus delivery context
//! - Enqueue them without parsing or blocking (FIFO, unbounded)
//! - Parse queued payloads into `Command`s on the controller side
//!
//! Accepted payloads: a bare token (`Red`, `Yellow`, `Green`, `Auto`) or a
//! JSON object `{"command": "<token>"}`. Anything else is dropped.

use crate::models::LightState;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

/// Control command applied by the controller loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Switch to manual mode and show the given state
    SetState(LightState),
    /// Return to auto mode, advancing one cycle position
    ResumeAuto,
}

/// Raw payload shapes seen on the command topic
#[derive(Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Structured { command: String },
    Bare(String),
}

impl Command {
    /// Parse a raw payload; `None` for anything outside the vocabulary
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?.trim();

        let token = match serde_json::from_str::<RawCommand>(text) {
            Ok(RawCommand::Structured { command }) => command,
            Ok(RawCommand::Bare(token)) => token,
            // Not JSON: treat as a bare token
            Err(_) => text.to_string(),
        };

        Self::from_token(token.trim())
    }

    fn from_token(token: &str) -> Option<Self> {
        if token == "Auto" {
            return Some(Command::ResumeAuto);
        }
        LightState::from_token(token).map(Command::SetState)
    }
}

/// Create a connected ingress/queue pair
pub fn channel() -> (CommandIngress, CommandQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandIngress { tx }, CommandQueue { rx })
}

/// Producer half, owned by the bus delivery context
#[derive(Clone)]
pub struct CommandIngress {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl CommandIngress {
    /// Enqueue a raw payload; never blocks
    pub fn deliver(&self, payload: Bytes) {
        if self.tx.send(payload).is_err() {
            tracing::debug!("Command queue closed, dropping payload");
        }
    }
}

/// Consumer half, owned by the controller loop
pub struct CommandQueue {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl CommandQueue {
    /// Take every payload queued so far, in arrival order, parsing each.
    ///
    /// Unparseable payloads are logged and skipped.
    pub fn drain(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Ok(payload) = self.rx.try_recv() {
            match Command::parse(&payload) {
                Some(command) => commands.push(command),
                None => {
                    tracing::warn!(
                        payload = %String::from_utf8_lossy(&payload),
                        "Unknown command dropped"
                    );
                }
            }
        }
        commands
    }
}
