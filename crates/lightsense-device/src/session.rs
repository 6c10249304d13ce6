//! One-shot configuration sessions.
//!
//! Every user action opens its own connection, disables the prompt, checks
//! the instrument is alive, performs the action and closes the connection
//! again. [`DeviceSession::scoped`] packages that sequence.

use lightsense_protocol::{ChannelParam, ClientConfig, Link, ProtocolClient};
use std::io;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::parameter::{
    check_channel, parse_value, ChannelConfig, DeviceSnapshot, Parameter, NUM_CHANNELS,
};

/// Opens a fresh link to the instrument.
pub trait Connector {
    /// The link type produced.
    type Link: Link + 'static;

    /// Open a new connection.
    fn connect(&self) -> io::Result<Self::Link>;

    /// Identity for logs and errors.
    fn describe(&self) -> String {
        "connector".to_string()
    }
}

/// A [`Connector`] backed by a closure.
pub struct FnConnector<F> {
    name: String,
    open: F,
}

impl<F, L> FnConnector<F>
where
    F: Fn() -> io::Result<L>,
    L: Link + 'static,
{
    pub fn new(name: impl Into<String>, open: F) -> Self {
        FnConnector {
            name: name.into(),
            open,
        }
    }
}

impl<F, L> Connector for FnConnector<F>
where
    F: Fn() -> io::Result<L>,
    L: Link + 'static,
{
    type Link = L;

    fn connect(&self) -> io::Result<L> {
        (self.open)()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Open a link through `connector`, mapping failures to [`DeviceError::Connect`].
pub fn connect<C: Connector>(connector: &C) -> DeviceResult<C::Link> {
    connector.connect().map_err(|source| DeviceError::Connect {
        device: connector.describe(),
        source,
    })
}

/// Configuration operations over a single connection.
///
/// Reads and writes go through the client's guarded retry.
#[derive(Debug)]
pub struct DeviceSession<L: Link> {
    client: ProtocolClient<L>,
}

impl<L: Link> DeviceSession<L> {
    /// Wrap a link without talking to the instrument.
    pub fn new(link: L, config: ClientConfig) -> Self {
        DeviceSession {
            client: ProtocolClient::with_config(link, config),
        }
    }

    /// Connect, hand-shake, run `f`, and close the connection whatever the
    /// outcome.
    pub fn scoped<C, T, F>(connector: &C, config: &ClientConfig, f: F) -> DeviceResult<T>
    where
        C: Connector<Link = L>,
        F: FnOnce(&mut DeviceSession<L>) -> DeviceResult<T>,
    {
        let link = connect(connector)?;
        let mut session = Self::new(link, config.clone());
        let result = session.handshake().and_then(|()| f(&mut session));
        session.close();
        result
    }

    /// Disable the prompt, then check the instrument answers.
    pub fn handshake(&mut self) -> DeviceResult<()> {
        self.client.prompt_off()?;
        self.client.ping()?;
        debug!("DeviceSession[{}]: handshake complete", self.client.device());
        Ok(())
    }

    /// Close the connection. Failures are logged, not returned.
    pub fn close(mut self) {
        if let Err(e) = self.client.close() {
            warn!(
                "DeviceSession[{}]: failed to close link: {}",
                self.client.device(),
                e
            );
        }
    }

    /// Hand the connection over without closing it.
    pub fn into_client(self) -> ProtocolClient<L> {
        self.client
    }

    pub fn client(&self) -> &ProtocolClient<L> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut ProtocolClient<L> {
        &mut self.client
    }

    // ========================================================================
    // Channel Parameters
    // ========================================================================

    pub fn get_wavelength(&mut self, channel: u8) -> DeviceResult<Parameter<u16>> {
        check_channel(channel)?;
        let value = self
            .client
            .guarded("get_wavelength", |c| c.get_wavelength(channel))?;
        Ok(Parameter::from_read(value))
    }

    /// Write the wavelength from user text; blank text clears it.
    pub fn set_wavelength(&mut self, channel: u8, text: &str) -> DeviceResult<Parameter<u16>> {
        check_channel(channel)?;
        let value = parse_value(ChannelParam::Wavelength, text)?;
        self.client
            .guarded("set_wavelength", |c| c.set_wavelength(channel, value))?;
        Ok(Parameter::from_read(value))
    }

    pub fn get_zero_error(&mut self, channel: u8) -> DeviceResult<Parameter<i16>> {
        check_channel(channel)?;
        let value = self
            .client
            .guarded("get_zero_error", |c| c.get_zero_error(channel))?;
        Ok(Parameter::from_read(value))
    }

    /// Write the zero error from user text; blank text clears it.
    pub fn set_zero_error(&mut self, channel: u8, text: &str) -> DeviceResult<Parameter<i16>> {
        check_channel(channel)?;
        let value = parse_value(ChannelParam::ZeroError, text)?;
        self.client
            .guarded("set_zero_error", |c| c.set_zero_error(channel, value))?;
        Ok(Parameter::from_read(value))
    }

    pub fn get_gain_error(&mut self, channel: u8) -> DeviceResult<Parameter<f64>> {
        check_channel(channel)?;
        let value = self
            .client
            .guarded("get_gain_error", |c| c.get_gain_error(channel))?;
        Ok(Parameter::from_read(value))
    }

    /// Write the gain error from user text; blank text clears it.
    pub fn set_gain_error(&mut self, channel: u8, text: &str) -> DeviceResult<Parameter<f64>> {
        check_channel(channel)?;
        let value = parse_value(ChannelParam::GainError, text)?;
        self.client
            .guarded("set_gain_error", |c| c.set_gain_error(channel, value))?;
        Ok(Parameter::from_read(value))
    }

    /// Read all three parameters of a channel.
    pub fn read_channel(&mut self, channel: u8) -> DeviceResult<ChannelConfig> {
        Ok(ChannelConfig {
            channel,
            wavelength: self.get_wavelength(channel)?,
            zero_error: self.get_zero_error(channel)?,
            gain_error: self.get_gain_error(channel)?,
        })
    }

    /// Read every channel and the voltage reference state.
    pub fn read_all(&mut self) -> DeviceResult<DeviceSnapshot> {
        let channels = (0..NUM_CHANNELS)
            .map(|channel| self.read_channel(channel))
            .collect::<DeviceResult<Vec<_>>>()?;
        let reference_calibrated = self.reference_calibrated()?;
        Ok(DeviceSnapshot {
            channels,
            reference_calibrated,
        })
    }

    // ========================================================================
    // Selection and Persistence
    // ========================================================================

    /// Select the channel used for measurement.
    pub fn select_channel(&mut self, channel: u8) -> DeviceResult<()> {
        check_channel(channel)?;
        self.client
            .guarded("select_channel", |c| c.select_channel(channel))?;
        Ok(())
    }

    /// Persist a channel's parameters.
    pub fn commit_channel(&mut self, channel: u8) -> DeviceResult<()> {
        check_channel(channel)?;
        self.client
            .guarded("commit_channel", |c| c.commit_channel(channel))?;
        Ok(())
    }

    /// Persist every channel and the voltage reference calibration.
    pub fn commit_all(&mut self) -> DeviceResult<()> {
        for channel in 0..NUM_CHANNELS {
            self.commit_channel(channel)?;
        }
        self.commit_reference()?;
        info!("DeviceSession[{}]: all parameters committed", self.client.device());
        Ok(())
    }

    // ========================================================================
    // Voltage Reference
    // ========================================================================

    /// Calibrate the internal voltage reference against the present supply.
    pub fn calibrate_reference(&mut self) -> DeviceResult<()> {
        self.client
            .guarded("int_ref_calibrate", |c| c.int_ref_calibrate())?;
        info!("DeviceSession[{}]: voltage reference calibrated", self.client.device());
        Ok(())
    }

    /// Persist the voltage reference calibration.
    pub fn commit_reference(&mut self) -> DeviceResult<()> {
        self.client.guarded("int_ref_commit", |c| c.int_ref_commit())?;
        Ok(())
    }

    pub fn reference_calibrated(&mut self) -> DeviceResult<bool> {
        Ok(self
            .client
            .guarded("int_ref_is_calibrated", |c| c.int_ref_is_calibrated())?)
    }

    /// Fail unless the voltage reference is calibrated, so the instrument can
    /// check the supply while measuring.
    pub fn ensure_reference_calibrated(&mut self) -> DeviceResult<()> {
        if self.reference_calibrated()? {
            Ok(())
        } else {
            Err(DeviceError::ReferenceNotCalibrated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightsense_protocol::testing::{LinkRecorder, ScriptedLink};
    use lightsense_protocol::ProtocolError;

    type ScriptedConnector = FnConnector<Box<dyn Fn() -> io::Result<ScriptedLink>>>;

    /// A connector that hands out one scripted link.
    fn scripted(lines: &[&str]) -> (ScriptedConnector, LinkRecorder) {
        let link = ScriptedLink::from_lines(lines);
        let recorder = link.recorder();
        let slot = parking_lot::Mutex::new(Some(link));
        let open: Box<dyn Fn() -> io::Result<ScriptedLink>> = Box::new(move || {
            slot.lock()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "already used"))
        });
        (FnConnector::new("scripted", open), recorder)
    }

    #[test]
    fn test_scoped_reads_wavelength() {
        let (connector, recorder) = scripted(&["OK", "OK", "OK", "532"]);
        let value = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.get_wavelength(2)
        })
        .unwrap();
        assert_eq!(value, Parameter::Present(532));
        assert_eq!(
            recorder.commands(),
            vec!["prompt_off", "nop", "conf_get_wavelength:2", "nop"]
        );
        assert!(recorder.is_closed());
    }

    #[test]
    fn test_scoped_closes_on_handshake_failure() {
        let (connector, recorder) = scripted(&["ERROR"]);
        let result = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.select_channel(0)
        });
        assert!(matches!(
            result,
            Err(DeviceError::Protocol(ProtocolError::DeviceRejected { .. }))
        ));
        assert_eq!(recorder.commands(), vec!["prompt_off"]);
        assert_eq!(recorder.close_calls(), 1);
    }

    #[test]
    fn test_scoped_closes_on_operation_failure() {
        let (connector, recorder) = scripted(&["OK", "OK"]);
        let result = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.set_zero_error(1, "twelve")
        });
        assert!(matches!(result, Err(DeviceError::InvalidParameter { .. })));
        // Parse failure is reported before any parameter traffic.
        assert_eq!(recorder.commands(), vec!["prompt_off", "nop"]);
        assert!(recorder.is_closed());
    }

    #[test]
    fn test_clear_sets_unset() {
        let (connector, recorder) = scripted(&["OK", "OK", "OK", "OK"]);
        let value = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.set_zero_error(1, "")
        })
        .unwrap();
        assert_eq!(value, Parameter::Unset);
        assert!(recorder
            .commands()
            .contains(&"conf_set_zero_error:1:NONE".to_string()));
    }

    #[test]
    fn test_invalid_channel_rejected_without_io() {
        let (connector, recorder) = scripted(&["OK", "OK"]);
        let result = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.get_gain_error(NUM_CHANNELS)
        });
        assert!(matches!(result, Err(DeviceError::InvalidChannel { .. })));
        assert_eq!(recorder.commands().len(), 2);
    }

    #[test]
    fn test_close_failure_does_not_mask_result() {
        let link = ScriptedLink::from_lines(&["OK", "OK", "OK", "TRUE"])
            .with_close_error(io::ErrorKind::Other);
        let slot = parking_lot::Mutex::new(Some(link));
        let connector = FnConnector::new("scripted", move || {
            slot.lock()
                .take()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        });
        let calibrated = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.reference_calibrated()
        })
        .unwrap();
        assert!(calibrated);
    }

    #[test]
    fn test_ensure_reference_calibrated() {
        let (connector, _) = scripted(&["OK", "OK", "OK", "FALSE"]);
        let result = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
            s.ensure_reference_calibrated()
        });
        assert!(matches!(result, Err(DeviceError::ReferenceNotCalibrated)));
    }

    #[test]
    fn test_connect_failure() {
        let connector = FnConnector::new("nowhere", || -> io::Result<ScriptedLink> {
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        let result = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| s.handshake());
        match result {
            Err(DeviceError::Connect { device, .. }) => assert_eq!(device, "nowhere"),
            other => panic!("expected connect error, got {:?}", other),
        }
    }
}
