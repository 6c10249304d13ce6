//! Simulated LightSense instrument
//!
//! An in-memory model of the light-sensor firmware behind a [`Link`]
//! implementation, for tests and for running the command-line tool without
//! hardware.
//!
//! - [`Instrument`]: the firmware state machine (calibration slots, voltage
//!   reference, measurement mode, double acknowledgement)
//! - [`SimulatedSensor`]: a link that feeds written commands to an instrument
//!   and returns its replies, with optional prompt prefix and reply splitting
//! - [`SharedInstrument`]: one instrument that several consecutive links can
//!   be opened to
//!
//! [`Link`]: lightsense_protocol::Link

mod instrument;
mod link;

pub use instrument::*;
pub use link::*;
