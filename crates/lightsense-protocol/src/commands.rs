//! Commands understood by the light-sensor firmware.
//!
//! Commands fall into a few groups:
//! - Session control (`nop`, `prompt_off`)
//! - Measurement (`meas_start`, `meas_stop`, `meas_get_val`)
//! - Channel configuration (`conf_select`, `conf_commit`, `conf_get_*`, `conf_set_*`)
//! - Internal voltage reference calibration (`int_ref_*`)

use crate::error::{ProtocolError, ProtocolResult};
use crate::framer::encode_command;
use std::str::FromStr;

/// Number of configuration channels on the reference instrument.
pub const CHANNEL_COUNT: u8 = 5;

/// Wire token for "no value" in `conf_set_*` commands.
pub const NONE_VALUE: &str = "NONE";

/// Per-channel parameters that can be read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelParam {
    /// Wavelength the channel is calibrated for (`wavelength`).
    Wavelength,
    /// ADC zero offset (`zero_error`).
    ZeroError,
    /// Gain correction coefficient (`gain_error`).
    GainError,
}

impl ChannelParam {
    /// The parameter name used in commands.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelParam::Wavelength => "wavelength",
            ChannelParam::ZeroError => "zero_error",
            ChannelParam::GainError => "gain_error",
        }
    }
}

impl FromStr for ChannelParam {
    type Err = ProtocolError;

    /// Parse a parameter from its command name.
    fn from_str(s: &str) -> ProtocolResult<ChannelParam> {
        match s {
            "wavelength" => Ok(ChannelParam::Wavelength),
            "zero_error" => Ok(ChannelParam::ZeroError),
            "gain_error" => Ok(ChannelParam::GainError),
            other => Err(ProtocolError::InvalidCommand(format!(
                "unknown channel parameter '{}'",
                other
            ))),
        }
    }
}

/// Commands that can be sent to the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // ========== Session ==========
    /// No-op. Used as a liveness ping and to collect the result of the
    /// previous configuration command.
    Nop,

    /// Disable the interactive prompt and local echo.
    PromptOff,

    // ========== Measurement ==========
    /// Start measuring on the selected channel.
    MeasStart,

    /// Stop measuring.
    MeasStop,

    /// Read the latest measured value.
    MeasGetValue,

    // ========== Channel Configuration ==========
    /// Select the channel used for measurement.
    ConfSelect {
        /// Channel index.
        channel: u8,
    },

    /// Persist a channel's working parameters to non-volatile storage.
    ConfCommit {
        /// Channel index.
        channel: u8,
    },

    /// Read one parameter of a channel.
    ConfGet {
        /// Parameter to read.
        param: ChannelParam,
        /// Channel index.
        channel: u8,
    },

    /// Write one parameter of a channel. `None` clears it.
    ConfSet {
        /// Parameter to write.
        param: ChannelParam,
        /// Channel index.
        channel: u8,
        /// Formatted value, or `None` for `NONE`.
        value: Option<String>,
    },

    // ========== Voltage Reference ==========
    /// Calibrate the internal voltage reference against the current supply.
    IntRefCalibrate,

    /// Persist the voltage reference calibration.
    IntRefCommit,

    /// Ask whether the voltage reference has been calibrated.
    IntRefIsCalibrated,

    // ========== Raw ==========
    /// Send a raw command string.
    Raw {
        /// The raw command text.
        command: String,
    },
}

impl Command {
    /// Encode the command as a line to send to the instrument.
    /// Returns the bytes to send (including the `\r\n` terminator).
    pub fn encode(&self) -> Vec<u8> {
        encode_command(&self.to_command_string())
    }

    /// Get the command string without the terminator.
    pub fn to_command_string(&self) -> String {
        match self {
            Command::Nop => "nop".to_string(),
            Command::PromptOff => "prompt_off".to_string(),

            Command::MeasStart => "meas_start".to_string(),
            Command::MeasStop => "meas_stop".to_string(),
            Command::MeasGetValue => "meas_get_val".to_string(),

            Command::ConfSelect { channel } => format!("conf_select:{}", channel),
            Command::ConfCommit { channel } => format!("conf_commit:{}", channel),
            Command::ConfGet { param, channel } => {
                format!("conf_get_{}:{}", param.as_str(), channel)
            }
            Command::ConfSet {
                param,
                channel,
                value,
            } => format!(
                "conf_set_{}:{}:{}",
                param.as_str(),
                channel,
                value.as_deref().unwrap_or(NONE_VALUE)
            ),

            Command::IntRefCalibrate => "int_ref_calibrate".to_string(),
            Command::IntRefCommit => "int_ref_commit".to_string(),
            Command::IntRefIsCalibrated => "int_ref_is_calibrated".to_string(),

            Command::Raw { command } => command.clone(),
        }
    }

    /// Parse a command line (without terminator) as received by the instrument.
    ///
    /// Unknown command words are rejected; use [`Command::Raw`] to send
    /// arbitrary text.
    pub fn parse(line: &str) -> ProtocolResult<Command> {
        let line = line.trim();
        let mut parts = line.split(':');
        let head = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        let simple = match head {
            "nop" => Some(Command::Nop),
            "prompt_off" => Some(Command::PromptOff),
            "meas_start" => Some(Command::MeasStart),
            "meas_stop" => Some(Command::MeasStop),
            "meas_get_val" => Some(Command::MeasGetValue),
            "int_ref_calibrate" => Some(Command::IntRefCalibrate),
            "int_ref_commit" => Some(Command::IntRefCommit),
            "int_ref_is_calibrated" => Some(Command::IntRefIsCalibrated),
            _ => None,
        };
        if let Some(cmd) = simple {
            if !args.is_empty() {
                return Err(ProtocolError::InvalidCommand(line.to_string()));
            }
            return Ok(cmd);
        }

        let channel = |s: Option<&&str>| -> ProtocolResult<u8> {
            s.and_then(|s| s.parse().ok())
                .ok_or_else(|| ProtocolError::InvalidCommand(line.to_string()))
        };

        match (head, args.len()) {
            ("conf_select", 1) => Ok(Command::ConfSelect {
                channel: channel(args.first())?,
            }),
            ("conf_commit", 1) => Ok(Command::ConfCommit {
                channel: channel(args.first())?,
            }),
            (h, 1) if h.starts_with("conf_get_") => {
                let param: ChannelParam = h["conf_get_".len()..]
                    .parse()
                    .map_err(|_| ProtocolError::InvalidCommand(line.to_string()))?;
                Ok(Command::ConfGet {
                    param,
                    channel: channel(args.first())?,
                })
            }
            (h, 2) if h.starts_with("conf_set_") => {
                let param: ChannelParam = h["conf_set_".len()..]
                    .parse()
                    .map_err(|_| ProtocolError::InvalidCommand(line.to_string()))?;
                let value = match args[1] {
                    NONE_VALUE => None,
                    v => Some(v.to_string()),
                };
                Ok(Command::ConfSet {
                    param,
                    channel: channel(args.first())?,
                    value,
                })
            }
            _ => Err(ProtocolError::InvalidCommand(line.to_string())),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_command_string())
    }
}
