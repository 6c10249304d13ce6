//! Channel parameters as known to the host.

use lightsense_protocol::{ChannelParam, FromResponse, CHANNEL_COUNT};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{DeviceError, DeviceResult};

/// Number of configuration slots on the instrument.
pub const NUM_CHANNELS: u8 = CHANNEL_COUNT;

/// A parameter value as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter<T> {
    /// Not read from the instrument yet.
    Unread,
    /// Read, and the instrument holds no value (`NA`/`NONE`).
    Unset,
    /// Read (or written) value.
    Present(T),
}

impl<T> Default for Parameter<T> {
    fn default() -> Self {
        Parameter::Unread
    }
}

impl<T> Parameter<T> {
    /// State after a read or write: `None` means the instrument holds no value.
    pub fn from_read(value: Option<T>) -> Self {
        match value {
            Some(v) => Parameter::Present(v),
            None => Parameter::Unset,
        }
    }

    /// The value, if present.
    pub fn value(&self) -> Option<&T> {
        match self {
            Parameter::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Parameter::Present(_))
    }

    pub fn is_unread(&self) -> bool {
        matches!(self, Parameter::Unread)
    }

    /// Mark the value cleared.
    pub fn clear(&mut self) {
        *self = Parameter::Unset;
    }
}

impl<T: fmt::Display> fmt::Display for Parameter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Unread => f.write_str("?"),
            Parameter::Unset => f.write_str("-"),
            Parameter::Present(v) => write!(f, "{}", v),
        }
    }
}

/// Snapshot of one channel slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelConfig {
    pub channel: u8,
    pub wavelength: Parameter<u16>,
    pub zero_error: Parameter<i16>,
    pub gain_error: Parameter<f64>,
}

impl ChannelConfig {
    /// A slot with nothing read yet.
    pub fn new(channel: u8) -> Self {
        ChannelConfig {
            channel,
            wavelength: Parameter::Unread,
            zero_error: Parameter::Unread,
            gain_error: Parameter::Unread,
        }
    }

    /// The firmware only produces values when both corrections are set.
    pub fn is_measurable(&self) -> bool {
        self.zero_error.is_present() && self.gain_error.is_present()
    }
}

/// Snapshot of every slot plus the voltage reference state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub channels: Vec<ChannelConfig>,
    /// `NA` from the instrument reads as not calibrated.
    pub reference_calibrated: bool,
}

/// Check a channel index against the slot count.
pub fn check_channel(channel: u8) -> DeviceResult<()> {
    if channel < NUM_CHANNELS {
        Ok(())
    } else {
        Err(DeviceError::InvalidChannel {
            channel,
            count: NUM_CHANNELS,
        })
    }
}

/// Parse user text for a parameter. Blank text means "clear".
pub fn parse_value<T>(param: ChannelParam, text: &str) -> DeviceResult<Option<T>>
where
    T: FromStr + FromResponse,
{
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| DeviceError::InvalidParameter {
        param: param.as_str(),
        text: text.to_string(),
        expected: T::EXPECTED,
    })
}
