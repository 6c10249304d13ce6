//! Command/response client for the light-sensor firmware.
//!
//! Configuration commands are double-acknowledged: the instrument answers the
//! command itself with `OK` and delivers the actual result (a value, `NA`,
//! `OK` or `ERROR`) as the reply to the following `nop`.

use crate::commands::{ChannelParam, Command};
use crate::error::{ProtocolError, ProtocolResult};
use crate::framer::{LineFramer, DEFAULT_BUFFER_LIMIT, DEFAULT_READ_SIZE};
use crate::link::Link;
use crate::responses::{FromResponse, Response};
use lightsense_metrics::metric_defs;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};

/// Attempts made by [`ProtocolClient::guarded`] with the default config.
pub const GUARDED_ATTEMPTS: u32 = 12;

/// Tunables for a [`ProtocolClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Attempts made by guarded operations before giving up.
    pub retry_attempts: u32,
    /// Response deadline as a multiple of the link's read timeout.
    pub response_timeout_factor: u32,
    /// Bytes requested per read.
    pub read_size: usize,
    /// Bound on buffered, unterminated bytes.
    pub buffer_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            retry_attempts: GUARDED_ATTEMPTS,
            response_timeout_factor: 2,
            read_size: DEFAULT_READ_SIZE,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }
}

/// Result of a single `meas_get_val`.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    /// A measured value.
    Value(f64),
    /// The supply voltage dropped below the calibrated reference.
    VoltageCheckFailed,
    /// No channel was selected before measuring.
    NoConfigurationSelected,
    /// Anything else, including `ERROR` and a timed-out read.
    Failed(Response),
}

/// Issues commands over a [`Link`] and interprets the replies.
#[derive(Debug)]
pub struct ProtocolClient<L> {
    framer: LineFramer<L>,
    config: ClientConfig,
    device: String,
    last_attempts: u32,
}

impl<L: Link> ProtocolClient<L> {
    /// Wrap a link with the default configuration.
    pub fn new(link: L) -> Self {
        Self::with_config(link, ClientConfig::default())
    }

    /// Wrap a link.
    pub fn with_config(link: L, config: ClientConfig) -> Self {
        let device = link.describe();
        let framer = LineFramer::with_limits(link, config.read_size, config.buffer_limit);
        ProtocolClient {
            framer,
            config,
            device,
            last_attempts: 0,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Identity of the underlying link.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// How long an exchange waits for its reply line.
    pub fn response_timeout(&self) -> Duration {
        self.framer.read_timeout() * self.config.response_timeout_factor.max(1)
    }

    /// Attempts used by the most recent [`guarded`](Self::guarded) call.
    pub fn last_attempts(&self) -> u32 {
        self.last_attempts
    }

    /// Close the underlying link.
    pub fn close(&mut self) -> io::Result<()> {
        self.framer.clear();
        self.framer.get_mut().close()
    }

    // ========================================================================
    // Exchanges
    // ========================================================================

    /// Write a command without waiting for a reply.
    pub fn send(&mut self, command: &Command) -> ProtocolResult<()> {
        let text = command.to_command_string();
        log::trace!("ProtocolClient[{}]: -> {}", self.device, text);
        self.framer.get_mut().write_all(&command.encode())?;
        Ok(())
    }

    /// Wait for the next reply line, up to the response deadline.
    ///
    /// An expired deadline yields [`Response::Empty`].
    pub fn read_response(&mut self) -> ProtocolResult<Response> {
        let deadline = Instant::now() + self.response_timeout();
        loop {
            if let Some(line) = self.framer.poll_line()? {
                let response = Response::from_bytes(&line);
                log::trace!("ProtocolClient[{}]: <- {}", self.device, response);
                return Ok(response);
            }
            if Instant::now() >= deadline {
                log::trace!("ProtocolClient[{}]: <- (timeout)", self.device);
                return Ok(Response::Empty);
            }
        }
    }

    /// Send a command and read one reply line.
    pub fn exchange(&mut self, command: &Command) -> ProtocolResult<Response> {
        let started = Instant::now();
        self.send(command)?;
        let response = self.read_response()?;

        let labels = [("command", command_label(command))];
        metrics::counter!(metric_defs::PROTOCOL_EXCHANGES.name, &labels).increment(1);
        metrics::histogram!(metric_defs::PROTOCOL_EXCHANGE_LATENCY.name, &labels)
            .record(started.elapsed().as_micros() as f64);
        if response.is_empty() {
            metrics::counter!(metric_defs::PROTOCOL_TIMEOUTS.name, &labels).increment(1);
        }

        log::debug!(
            "ProtocolClient[{}]: {} => {}",
            self.device,
            command,
            response
        );
        Ok(response)
    }

    /// Send a command and require `OK`.
    pub fn expect_ok(&mut self, command: &Command) -> ProtocolResult<()> {
        let response = self.exchange(command)?;
        require_ok(command, response)
    }

    /// Send a double-acknowledged command and require `OK` for both the
    /// command and its `nop` confirmation.
    pub fn command_confirmed(&mut self, command: &Command) -> ProtocolResult<()> {
        self.expect_ok(command)?;
        let confirmation = self.exchange(&Command::Nop)?;
        require_ok(command, confirmation)
    }

    /// Send a double-acknowledged read and convert the value from the `nop`
    /// confirmation. `NA`/`NONE` yield `None`.
    pub fn get_value<T: FromResponse>(&mut self, command: &Command) -> ProtocolResult<Option<T>> {
        self.expect_ok(command)?;
        let confirmation = self.exchange(&Command::Nop)?;
        match confirmation {
            Response::NotAvailable => Ok(None),
            Response::Error(text) => Err(ProtocolError::DeviceRejected {
                command: command.to_command_string(),
                response: text,
            }),
            Response::Empty => Err(ProtocolError::Unacknowledged {
                command: command.to_command_string(),
                response: Response::Empty,
            }),
            other => T::from_response(&other)
                .map(Some)
                .ok_or_else(|| ProtocolError::UnparsableResponse {
                    command: command.to_command_string(),
                    text: other.to_string(),
                    expected: T::EXPECTED,
                }),
        }
    }

    /// Run `operation` until it succeeds, fails fatally, or the configured
    /// number of attempts is used up. The last attempt's outcome is returned.
    ///
    /// Every retry starts with [`resync`](Self::resync), so a reply that
    /// missed its deadline cannot be taken as the answer to a later command.
    pub fn guarded<T, F>(&mut self, operation: &str, mut f: F) -> ProtocolResult<T>
    where
        F: FnMut(&mut Self) -> ProtocolResult<T>,
    {
        let max_attempts = self.config.retry_attempts.max(1);
        let labels = [("operation", operation.to_string())];
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                self.resync()?;
            }
            attempt += 1;
            self.last_attempts = attempt;
            match f(self) {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!(
                            "ProtocolClient[{}]: {} succeeded after {} attempts",
                            self.device,
                            operation,
                            attempt
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_fatal() => {
                    log::warn!(
                        "ProtocolClient[{}]: {} failed fatally on attempt {}: {}",
                        self.device,
                        operation,
                        attempt,
                        e
                    );
                    metrics::counter!(metric_defs::PROTOCOL_GUARDED_FAILURES.name, &labels)
                        .increment(1);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    log::warn!(
                        "ProtocolClient[{}]: {} gave up after {} attempts: {}",
                        self.device,
                        operation,
                        attempt,
                        e
                    );
                    metrics::counter!(metric_defs::PROTOCOL_GUARDED_FAILURES.name, &labels)
                        .increment(1);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!(
                        "ProtocolClient[{}]: {} attempt {}/{} failed: {}",
                        self.device,
                        operation,
                        attempt,
                        max_attempts,
                        e
                    );
                    metrics::counter!(metric_defs::PROTOCOL_RETRIES.name, &labels).increment(1);
                }
            }
        }
    }

    /// Discard stale input and bring the instrument back to idle.
    ///
    /// Drops buffered bytes and any lines already waiting, then sends `nop`
    /// (which also collects a result the instrument may still hold) and reads
    /// until its `OK` or the response deadline. Lines still queued after that
    /// are dropped too.
    pub fn resync(&mut self) -> ProtocolResult<()> {
        self.framer.clear();
        let mut discarded = self.drain_lines()?;

        self.send(&Command::Nop)?;
        let deadline = Instant::now() + self.response_timeout();
        loop {
            match self.framer.poll_line()? {
                Some(line) => {
                    let response = Response::from_bytes(&line);
                    if response.is_ok() {
                        break;
                    }
                    log::trace!("ProtocolClient[{}]: dropped {}", self.device, response);
                    discarded += 1;
                }
                None if Instant::now() >= deadline => break,
                None => {}
            }
        }

        discarded += self.drain_lines()?;
        if discarded > 0 {
            log::debug!(
                "ProtocolClient[{}]: resync dropped {} stale lines",
                self.device,
                discarded
            );
        }
        Ok(())
    }

    /// Read until a read completes no line, discarding every line seen.
    fn drain_lines(&mut self) -> ProtocolResult<usize> {
        let mut discarded = 0;
        while let Some(line) = self.framer.poll_line()? {
            log::trace!(
                "ProtocolClient[{}]: dropped {}",
                self.device,
                Response::from_bytes(&line)
            );
            discarded += 1;
        }
        self.framer.clear();
        Ok(discarded)
    }

    // ========================================================================
    // Session
    // ========================================================================

    /// Liveness check (`nop` → `OK`).
    pub fn ping(&mut self) -> ProtocolResult<()> {
        self.expect_ok(&Command::Nop)
    }

    /// Disable the prompt and echo.
    pub fn prompt_off(&mut self) -> ProtocolResult<()> {
        self.expect_ok(&Command::PromptOff)
    }

    // ========================================================================
    // Measurement
    // ========================================================================

    /// Start measuring. Any reply other than `ERROR` or silence counts as
    /// success.
    pub fn meas_start(&mut self) -> ProtocolResult<()> {
        let command = Command::MeasStart;
        match self.exchange(&command)? {
            Response::Error(text) => Err(ProtocolError::DeviceRejected {
                command: command.to_command_string(),
                response: text,
            }),
            Response::Empty => Err(ProtocolError::Unacknowledged {
                command: command.to_command_string(),
                response: Response::Empty,
            }),
            _ => Ok(()),
        }
    }

    /// Stop measuring. Accepts `OK` followed by `OK`, or `ERRORS_CLEARED` at
    /// either step.
    pub fn meas_stop(&mut self) -> ProtocolResult<()> {
        let command = Command::MeasStop;
        match self.exchange(&command)? {
            Response::ErrorsCleared => return Ok(()),
            Response::Ok => {}
            other => return Err(unexpected(&command, other)),
        }
        match self.exchange(&Command::Nop)? {
            Response::Ok | Response::ErrorsCleared => Ok(()),
            other => Err(unexpected(&command, other)),
        }
    }

    /// Read one measured value. Never retried.
    pub fn sample(&mut self) -> ProtocolResult<SampleOutcome> {
        let response = self.exchange(&Command::MeasGetValue)?;
        Ok(match response {
            Response::CheckFailed => SampleOutcome::VoltageCheckFailed,
            Response::NoConfigSelected => SampleOutcome::NoConfigurationSelected,
            Response::Numeric(_) => match response.as_f64() {
                Some(value) => SampleOutcome::Value(value),
                None => SampleOutcome::Failed(response),
            },
            other => SampleOutcome::Failed(other),
        })
    }

    // ========================================================================
    // Channel Configuration
    // ========================================================================

    /// Select the measurement channel.
    pub fn select_channel(&mut self, channel: u8) -> ProtocolResult<()> {
        self.command_confirmed(&Command::ConfSelect { channel })
    }

    /// Persist a channel's parameters.
    pub fn commit_channel(&mut self, channel: u8) -> ProtocolResult<()> {
        self.command_confirmed(&Command::ConfCommit { channel })
    }

    /// Read a channel's wavelength.
    pub fn get_wavelength(&mut self, channel: u8) -> ProtocolResult<Option<u16>> {
        self.get_param(ChannelParam::Wavelength, channel)
    }

    /// Write (or clear with `None`) a channel's wavelength.
    pub fn set_wavelength(&mut self, channel: u8, value: Option<u16>) -> ProtocolResult<()> {
        self.set_param(ChannelParam::Wavelength, channel, value.map(|v| v.to_string()))
    }

    /// Read a channel's zero error.
    pub fn get_zero_error(&mut self, channel: u8) -> ProtocolResult<Option<i16>> {
        self.get_param(ChannelParam::ZeroError, channel)
    }

    /// Write (or clear with `None`) a channel's zero error.
    pub fn set_zero_error(&mut self, channel: u8, value: Option<i16>) -> ProtocolResult<()> {
        self.set_param(ChannelParam::ZeroError, channel, value.map(|v| v.to_string()))
    }

    /// Read a channel's gain error.
    pub fn get_gain_error(&mut self, channel: u8) -> ProtocolResult<Option<f64>> {
        self.get_param(ChannelParam::GainError, channel)
    }

    /// Write (or clear with `None`) a channel's gain error.
    pub fn set_gain_error(&mut self, channel: u8, value: Option<f64>) -> ProtocolResult<()> {
        self.set_param(ChannelParam::GainError, channel, value.map(|v| v.to_string()))
    }

    fn get_param<T: FromResponse>(
        &mut self,
        param: ChannelParam,
        channel: u8,
    ) -> ProtocolResult<Option<T>> {
        self.get_value(&Command::ConfGet { param, channel })
    }

    fn set_param(
        &mut self,
        param: ChannelParam,
        channel: u8,
        value: Option<String>,
    ) -> ProtocolResult<()> {
        self.command_confirmed(&Command::ConfSet {
            param,
            channel,
            value,
        })
    }

    // ========================================================================
    // Voltage Reference
    // ========================================================================

    /// Calibrate the internal voltage reference.
    pub fn int_ref_calibrate(&mut self) -> ProtocolResult<()> {
        self.command_confirmed(&Command::IntRefCalibrate)
    }

    /// Persist the voltage reference calibration.
    pub fn int_ref_commit(&mut self) -> ProtocolResult<()> {
        self.command_confirmed(&Command::IntRefCommit)
    }

    /// Whether the voltage reference is calibrated. `NA` reads as `false`.
    pub fn int_ref_is_calibrated(&mut self) -> ProtocolResult<bool> {
        Ok(self
            .get_value::<bool>(&Command::IntRefIsCalibrated)?
            .unwrap_or(false))
    }
}

fn require_ok(command: &Command, response: Response) -> ProtocolResult<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(command, other)),
    }
}

fn unexpected(command: &Command, response: Response) -> ProtocolError {
    match response {
        Response::Error(text) => ProtocolError::DeviceRejected {
            command: command.to_command_string(),
            response: text,
        },
        other => ProtocolError::Unacknowledged {
            command: command.to_command_string(),
            response: other,
        },
    }
}

/// Command word without arguments, so metric label cardinality stays bounded.
fn command_label(command: &Command) -> String {
    match command {
        Command::Raw { .. } => "raw".to_string(),
        other => other
            .to_command_string()
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLink;
    use approx::assert_relative_eq;

    fn client(lines: &[&str]) -> (ProtocolClient<ScriptedLink>, crate::testing::LinkRecorder) {
        let link = ScriptedLink::from_lines(lines);
        let recorder = link.recorder();
        (ProtocolClient::new(link), recorder)
    }

    #[test]
    fn test_get_wavelength() {
        let (mut client, recorder) = client(&["OK", "532"]);
        assert_eq!(client.get_wavelength(2).unwrap(), Some(532));
        assert_eq!(recorder.commands(), vec!["conf_get_wavelength:2", "nop"]);
    }

    #[test]
    fn test_clear_zero_error() {
        let (mut client, recorder) = client(&["OK", "OK"]);
        client.set_zero_error(1, None).unwrap();
        assert_eq!(recorder.commands(), vec!["conf_set_zero_error:1:NONE", "nop"]);
    }

    #[test]
    fn test_get_not_available() {
        let (mut client, _) = client(&["OK", "NA"]);
        assert_eq!(client.get_gain_error(0).unwrap(), None);
    }

    #[test]
    fn test_get_gain_error_float() {
        let (mut client, _) = client(&["OK", "1.0625"]);
        let value = client.get_gain_error(4).unwrap().unwrap();
        assert_relative_eq!(value, 1.0625);
    }

    #[test]
    fn test_get_unparsable() {
        let (mut client, _) = client(&["OK", "abc"]);
        match client.get_zero_error(0) {
            Err(ProtocolError::UnparsableResponse { expected, text, .. }) => {
                assert_eq!(expected, "integer");
                assert!(text.contains("abc"));
            }
            other => panic!("expected unparsable, got {:?}", other),
        }
    }

    #[test]
    fn test_set_rejected_on_confirmation() {
        let (mut client, _) = client(&["OK", "ERROR"]);
        assert!(matches!(
            client.set_wavelength(0, Some(650)),
            Err(ProtocolError::DeviceRejected { .. })
        ));
    }

    #[test]
    fn test_ping_timeout_is_unacknowledged() {
        let (mut client, _) = client(&[]);
        match client.ping() {
            Err(ProtocolError::Unacknowledged { response, .. }) => {
                assert_eq!(response, Response::Empty)
            }
            other => panic!("expected unacknowledged, got {:?}", other),
        }
    }

    /// `failures` rejected attempts, each followed by a clean resync.
    fn rejected(failures: usize) -> ScriptedLink {
        (0..failures).fold(ScriptedLink::new(), |link, _| {
            link.then_line("ERROR").then_resync()
        })
    }

    #[test]
    fn test_guarded_retries_until_success() {
        for failures in 0..GUARDED_ATTEMPTS as usize {
            let link = rejected(failures).then_line("OK").then_line("OK");
            let recorder = link.recorder();
            let mut client = ProtocolClient::new(link);

            client
                .guarded("select", |c| c.select_channel(1))
                .expect("should succeed on the last scripted attempt");
            assert_eq!(client.last_attempts() as usize, failures + 1);
            assert_eq!(recorder.count("conf_select:1"), failures + 1);
            // One nop per resync plus the confirmation.
            assert_eq!(recorder.count("nop"), failures + 1);
        }
    }

    #[test]
    fn test_guarded_gives_up_after_limit() {
        let link = rejected(GUARDED_ATTEMPTS as usize);
        let recorder = link.recorder();
        let mut client = ProtocolClient::new(link);
        let result = client.guarded("select", |c| c.select_channel(3));
        assert!(matches!(result, Err(ProtocolError::DeviceRejected { .. })));
        assert_eq!(client.last_attempts(), GUARDED_ATTEMPTS);
        assert_eq!(recorder.count("conf_select:3"), GUARDED_ATTEMPTS as usize);
        // No resync after the final attempt.
        assert_eq!(recorder.count("nop"), GUARDED_ATTEMPTS as usize - 1);
    }

    #[test]
    fn test_guarded_drops_late_reply_before_retry() {
        // With a zero read timeout every quiet read is a missed deadline.
        // The confirmation arrives late, during the resync, in one chunk with
        // the OK answering the resync's nop.
        let link = ScriptedLink::from_lines(&["OK"])
            .with_read_timeout(Duration::ZERO)
            .then_silence(2)
            .then_data("532\r\nOK\r\n")
            .then_silence(2)
            .then_line("OK")
            .then_line("650");
        let recorder = link.recorder();
        let mut client = ProtocolClient::new(link);

        let value = client
            .guarded("get_wavelength", |c| c.get_wavelength(0))
            .unwrap();
        assert_eq!(value, Some(650));
        assert_eq!(client.last_attempts(), 2);
        assert_eq!(
            recorder.commands(),
            vec![
                "conf_get_wavelength:0",
                "nop",
                "nop",
                "conf_get_wavelength:0",
                "nop"
            ]
        );
    }

    #[test]
    fn test_resync_collects_pending_result() {
        // The instrument answers the resync nop with a held result first.
        let link = ScriptedLink::new()
            .then_silence(1)
            .then_line("NA")
            .then_line("OK")
            .then_silence(1);
        let recorder = link.recorder();
        let mut client = ProtocolClient::new(link);
        client.resync().unwrap();
        assert_eq!(recorder.commands(), vec!["nop"]);
        assert_eq!(client.framer.buffered_len(), 0);
    }

    #[test]
    fn test_guarded_stops_on_transport_failure() {
        let link = ScriptedLink::new().then_fail(io::ErrorKind::BrokenPipe);
        let mut client = ProtocolClient::new(link);
        let result = client.guarded("ping", |c| c.ping());
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
        assert_eq!(client.last_attempts(), 1);
    }

    #[test]
    fn test_sample_outcomes() {
        let (mut client, _) = client(&["12.5", "CHECK_FAILED", "NO_CONF_SELECTED", "ERROR"]);
        assert_eq!(client.sample().unwrap(), SampleOutcome::Value(12.5));
        assert_eq!(client.sample().unwrap(), SampleOutcome::VoltageCheckFailed);
        assert_eq!(
            client.sample().unwrap(),
            SampleOutcome::NoConfigurationSelected
        );
        assert!(matches!(
            client.sample().unwrap(),
            SampleOutcome::Failed(Response::Error(_))
        ));
        assert_eq!(
            client.sample().unwrap(),
            SampleOutcome::Failed(Response::Empty)
        );
    }

    #[test]
    fn test_meas_start_accepts_non_error() {
        let (mut client, _) = client(&["STARTED", "ERROR"]);
        client.meas_start().unwrap();
        assert!(client.meas_start().is_err());
    }

    #[test]
    fn test_meas_stop_variants() {
        let (mut client, recorder) = client(&["OK", "OK", "ERRORS_CLEARED", "OK", "ERRORS_CLEARED"]);
        client.meas_stop().unwrap();
        client.meas_stop().unwrap();
        client.meas_stop().unwrap();
        assert_eq!(recorder.count("meas_stop"), 3);
        assert_eq!(recorder.count("nop"), 2);
    }

    #[test]
    fn test_int_ref_is_calibrated() {
        let (mut client, _) = client(&["OK", "TRUE", "OK", "FALSE", "OK", "NA"]);
        assert!(client.int_ref_is_calibrated().unwrap());
        assert!(!client.int_ref_is_calibrated().unwrap());
        assert!(!client.int_ref_is_calibrated().unwrap());
    }

    #[test]
    fn test_response_timeout_scales_read_timeout() {
        let link = ScriptedLink::new().with_read_timeout(Duration::from_millis(50));
        let client = ProtocolClient::new(link);
        assert_eq!(client.response_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn test_close_reaches_link() {
        let (mut client, recorder) = client(&[]);
        client.close().unwrap();
        assert!(recorder.is_closed());
    }
}
