//! LampDriver - Lamp Output Control
//!
//! ## Responsibilities
//!
//! - Fixed state -> lamp table (exactly one lamp per state)
//! - Drive three `embedded_hal` output pins (Raspberry Pi GPIO or simulated)
//! - Scoped ownership: `LampBank` de-energizes on drop, then releases the pins

use crate::error::{Error, Result};
use crate::models::LightState;
use embedded_hal::digital::{Error as _, ErrorType, OutputPin, PinState};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Energized lamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lamps {
    pub red: bool,
    pub yellow: bool,
    pub green: bool,
}

impl Lamps {
    /// All lamps off
    pub const OFF: Lamps = Lamps {
        red: false,
        yellow: false,
        green: false,
    };

    /// Lamp table; `None` (unknown / shutting down) de-energizes everything
    pub fn for_state(state: Option<LightState>) -> Self {
        match state {
            Some(LightState::Red) => Lamps { red: true, ..Lamps::OFF },
            Some(LightState::Yellow) => Lamps { yellow: true, ..Lamps::OFF },
            Some(LightState::Green) => Lamps { green: true, ..Lamps::OFF },
            None => Lamps::OFF,
        }
    }

    pub fn energized_count(&self) -> usize {
        [self.red, self.yellow, self.green].iter().filter(|on| **on).count()
    }
}

/// Object-safe lamp output seam used by `LampBank`
pub trait LampOutputs: Send {
    /// Drive the outputs to exactly `lamps`
    fn set(&mut self, lamps: Lamps) -> Result<()>;
}

/// Three output pins, one per lamp
pub struct PinLamps<P> {
    red: P,
    yellow: P,
    green: P,
}

impl<P: OutputPin> PinLamps<P> {
    pub fn from_pins(red: P, yellow: P, green: P) -> Self {
        Self { red, yellow, green }
    }
}

fn drive_pin<P: OutputPin>(pin: &mut P, lamp: &str, on: bool) -> Result<()> {
    pin.set_state(PinState::from(on))
        .map_err(|e| Error::Lamp(format!("{} lamp: {:?}", lamp, e.kind())))
}

impl<P: OutputPin + Send> LampOutputs for PinLamps<P> {
    fn set(&mut self, lamps: Lamps) -> Result<()> {
        // Switch off before on so two lamps are never lit together
        if !lamps.red {
            drive_pin(&mut self.red, "red", false)?;
        }
        if !lamps.yellow {
            drive_pin(&mut self.yellow, "yellow", false)?;
        }
        if !lamps.green {
            drive_pin(&mut self.green, "green", false)?;
        }
        if lamps.red {
            drive_pin(&mut self.red, "red", true)?;
        }
        if lamps.yellow {
            drive_pin(&mut self.yellow, "yellow", true)?;
        }
        if lamps.green {
            drive_pin(&mut self.green, "green", true)?;
        }
        Ok(())
    }
}

/// In-memory output pin; clones share the same level
#[derive(Debug, Clone, Default)]
pub struct SimulatedPin {
    high: Arc<AtomicBool>,
}

impl SimulatedPin {
    pub fn is_high(&self) -> bool {
        self.high.load(Ordering::Acquire)
    }
}

impl ErrorType for SimulatedPin {
    type Error = Infallible;
}

impl OutputPin for SimulatedPin {
    fn set_low(&mut self) -> std::result::Result<(), Self::Error> {
        self.high.store(false, Ordering::Release);
        Ok(())
    }

    fn set_high(&mut self) -> std::result::Result<(), Self::Error> {
        self.high.store(true, Ordering::Release);
        Ok(())
    }
}

/// Lamps for machines without GPIO
pub type SimulatedLamps = PinLamps<SimulatedPin>;

impl PinLamps<SimulatedPin> {
    pub fn new() -> Self {
        Self::from_pins(SimulatedPin::default(), SimulatedPin::default(), SimulatedPin::default())
    }

    pub fn readback(&self) -> LampReadback {
        LampReadback {
            red: self.red.clone(),
            yellow: self.yellow.clone(),
            green: self.green.clone(),
        }
    }
}

impl Default for PinLamps<SimulatedPin> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of simulated lamp levels
#[derive(Clone)]
pub struct LampReadback {
    red: SimulatedPin,
    yellow: SimulatedPin,
    green: SimulatedPin,
}

impl LampReadback {
    pub fn current(&self) -> Lamps {
        Lamps {
            red: self.red.is_high(),
            yellow: self.yellow.is_high(),
            green: self.green.is_high(),
        }
    }
}

/// GPIO pin numbers (BCM) for each lamp
#[derive(Debug, Clone, Copy)]
pub struct GpioPins {
    pub red: u8,
    pub yellow: u8,
    pub green: u8,
}

impl Default for GpioPins {
    fn default() -> Self {
        Self {
            red: 17,
            yellow: 27,
            green: 22,
        }
    }
}

/// Claim the three BCM pins as outputs, all low.
///
/// The pins return to their previous mode when dropped.
#[cfg(target_os = "linux")]
pub fn open_gpio(pins: GpioPins) -> Result<PinLamps<rppal::gpio::OutputPin>> {
    let gpio = rppal::gpio::Gpio::new().map_err(|e| Error::Lamp(format!("open gpio: {}", e)))?;
    let output = |pin: u8| -> Result<rppal::gpio::OutputPin> {
        gpio.get(pin)
            .map(|p| p.into_output_low())
            .map_err(|e| Error::Lamp(format!("gpio{}: {}", pin, e)))
    };

    let lamps = PinLamps::from_pins(output(pins.red)?, output(pins.yellow)?, output(pins.green)?);
    tracing::info!(red = pins.red, yellow = pins.yellow, green = pins.green, "GPIO lamps opened");
    Ok(lamps)
}

#[cfg(not(target_os = "linux"))]
pub fn open_gpio(_pins: GpioPins) -> Result<PinLamps<SimulatedPin>> {
    Err(Error::Lamp("GPIO lamps require Linux".to_string()))
}

/// Owned lamp outputs; de-energized and released when dropped
pub struct LampBank {
    outputs: Box<dyn LampOutputs>,
    current: Lamps,
}

impl LampBank {
    pub fn new(outputs: Box<dyn LampOutputs>) -> Self {
        Self {
            outputs,
            current: Lamps::OFF,
        }
    }

    /// Show exactly the lamp for `state`
    pub fn show(&mut self, state: LightState) {
        self.drive(Lamps::for_state(Some(state)));
    }

    /// Switch every lamp off
    pub fn de_energize(&mut self) {
        self.drive(Lamps::OFF);
    }

    pub fn current(&self) -> Lamps {
        self.current
    }

    fn drive(&mut self, lamps: Lamps) {
        match self.outputs.set(lamps) {
            Ok(()) => {
                self.current = lamps;
                tracing::debug!(red = lamps.red, yellow = lamps.yellow, green = lamps.green, "Lamps set");
            }
            Err(e) => tracing::error!(error = %e, "Failed to drive lamps"),
        }
    }
}

impl Drop for LampBank {
    fn drop(&mut self) {
        self.de_energize();
        tracing::info!("Lamps de-energized and released");
    }
}
