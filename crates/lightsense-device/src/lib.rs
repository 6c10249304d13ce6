//! LightSense device layer
//!
//! Builds the user-facing operations on top of [`lightsense_protocol`]:
//!
//! - [`DeviceSession`]: scoped one-shot configuration of the five channel
//!   slots (wavelength, zero error, gain error), channel selection and
//!   commit, and internal voltage reference calibration.
//! - [`MeasurementPoller`]: a background sampling loop with a dedicated
//!   connection, lock-protected latest value and terminal error, swappable
//!   value sink, and cooperative cancellation.
//!
//! # Example
//!
//! ```rust,ignore
//! use lightsense_device::{DeviceSession, MeasurementPoller, PollerConfig};
//!
//! let config = DeviceSession::scoped(&connector, &Default::default(), |s| s.read_channel(0))?;
//!
//! let mut poller = MeasurementPoller::new(PollerConfig::default());
//! poller.start(&connector, 0, None)?;
//! let latest = poller.sample();
//! let error = poller.request_stop_and_join();
//! ```

mod error;
mod parameter;
mod poller;
mod session;
mod sink;

pub use error::*;
pub use parameter::*;
pub use poller::*;
pub use session::*;
pub use sink::*;
