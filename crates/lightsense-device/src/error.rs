//! Error types for device sessions and measurement.

use lightsense_protocol::{ProtocolError, Response};
use std::sync::Arc;
use thiserror::Error;

/// Errors from configuration sessions and poller control.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Protocol exchange failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connector could not open a link.
    #[error("failed to connect to {device}: {source}")]
    Connect {
        /// Connector identity.
        device: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Channel index outside the instrument's slots.
    #[error("channel {channel} out of range (0..{count})")]
    InvalidChannel {
        /// Requested channel.
        channel: u8,
        /// Number of channels.
        count: u8,
    },

    /// User-supplied parameter text did not parse.
    #[error("invalid {param} value {text:?}: expected {expected}")]
    InvalidParameter {
        /// Parameter name.
        param: &'static str,
        /// The rejected text.
        text: String,
        /// Expected value type.
        expected: &'static str,
    },

    /// The voltage reference must be calibrated before this operation.
    #[error("internal voltage reference is not calibrated")]
    ReferenceNotCalibrated,

    /// The poller thread could not be spawned.
    #[error("failed to spawn poller thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Reason a measurement loop ended on its own.
///
/// Cloneable so the poller can hand the same error to the callback and to
/// the joining caller.
#[derive(Debug, Clone, Error)]
pub enum MeasurementError {
    /// The instrument reported `CHECK_FAILED`.
    #[error("supply voltage dropped below the acceptable limit")]
    VoltageCheckFailed,

    /// The instrument reported `NO_CONF_SELECTED`.
    #[error("no channel configuration selected")]
    NoConfigurationSelected,

    /// A sample reply was neither a value nor a known sentinel.
    #[error("unexpected sample response: {0}")]
    UnexpectedResponse(Response),

    /// Protocol failure while sampling.
    #[error("{0}")]
    Protocol(Arc<ProtocolError>),

    /// Writing a value to the sink failed.
    #[error("failed to record value: {0}")]
    Sink(Arc<std::io::Error>),

    /// The worker thread panicked.
    #[error("measurement thread panicked")]
    ThreadPanicked,
}

impl MeasurementError {
    /// Short stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            MeasurementError::VoltageCheckFailed => "voltage_check_failed",
            MeasurementError::NoConfigurationSelected => "no_configuration_selected",
            MeasurementError::UnexpectedResponse(_) => "unexpected_response",
            MeasurementError::Protocol(e) => e.kind_label(),
            MeasurementError::Sink(_) => "sink",
            MeasurementError::ThreadPanicked => "panicked",
        }
    }
}

impl From<ProtocolError> for MeasurementError {
    fn from(e: ProtocolError) -> Self {
        MeasurementError::Protocol(Arc::new(e))
    }
}

/// Result type alias for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
