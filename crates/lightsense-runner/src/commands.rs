//! Subcommand implementations.
//!
//! Each function opens its own scoped session (or poller connection) through
//! the transport and writes human-readable output to `out`.

use crossbeam_channel::{select, Receiver};
use lightsense_device::{
    format_value, ChannelConfig, Connector, DeviceSession, FileSink, MeasurementPoller,
    PollerConfig, ValueSink,
};
use lightsense_protocol::ClientConfig;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::transport::Transport;

/// Check the instrument answers.
pub fn ping(transport: &Transport, config: &ClientConfig, out: &mut dyn Write) -> RunnerResult<()> {
    DeviceSession::scoped(transport, config, |_| Ok(()))?;
    writeln!(out, "instrument on {} is responding", transport.describe())?;
    Ok(())
}

fn write_channel_header(out: &mut dyn Write) -> std::io::Result<()> {
    writeln!(out, "{:<8} {:>10} {:>10} {:>10}", "channel", "wavelength", "zero", "gain")
}

fn write_channel_row(out: &mut dyn Write, config: &ChannelConfig) -> std::io::Result<()> {
    writeln!(
        out,
        "{:<8} {:>10} {:>10} {:>10}",
        config.channel,
        config.wavelength.to_string(),
        config.zero_error.to_string(),
        config.gain_error.to_string()
    )
}

/// Print one channel, or every channel and the reference state.
pub fn read(
    transport: &Transport,
    config: &ClientConfig,
    channel: Option<u8>,
    json: bool,
    out: &mut dyn Write,
) -> RunnerResult<()> {
    match channel {
        Some(channel) => {
            let channel_config = DeviceSession::scoped(transport, config, |s| s.read_channel(channel))?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &channel_config)?;
                writeln!(out)?;
            } else {
                write_channel_header(out)?;
                write_channel_row(out, &channel_config)?;
            }
        }
        None => {
            let snapshot = DeviceSession::scoped(transport, config, |s| s.read_all())?;
            if json {
                serde_json::to_writer_pretty(&mut *out, &snapshot)?;
                writeln!(out)?;
            } else {
                write_channel_header(out)?;
                for channel_config in &snapshot.channels {
                    write_channel_row(out, channel_config)?;
                }
                writeln!(out, "reference calibrated: {}", snapshot.reference_calibrated)?;
            }
        }
    }
    Ok(())
}

/// Parameter text to write. `Some("")` clears a parameter.
#[derive(Debug, Clone, Default)]
pub struct SetRequest {
    pub channel: u8,
    pub wavelength: Option<String>,
    pub zero_error: Option<String>,
    pub gain_error: Option<String>,
}

/// Write the requested parameters of one channel.
pub fn set(
    transport: &Transport,
    config: &ClientConfig,
    request: &SetRequest,
    out: &mut dyn Write,
) -> RunnerResult<()> {
    if request.wavelength.is_none() && request.zero_error.is_none() && request.gain_error.is_none() {
        return Err(RunnerError::NothingToSet);
    }
    let channel = request.channel;
    let written = DeviceSession::scoped(transport, config, |s| {
        let mut written = Vec::new();
        if let Some(text) = &request.wavelength {
            written.push(("wavelength", s.set_wavelength(channel, text)?.to_string()));
        }
        if let Some(text) = &request.zero_error {
            written.push(("zero error", s.set_zero_error(channel, text)?.to_string()));
        }
        if let Some(text) = &request.gain_error {
            written.push(("gain error", s.set_gain_error(channel, text)?.to_string()));
        }
        Ok(written)
    })?;
    for (name, value) in written {
        writeln!(out, "channel {} {} = {}", channel, name, value)?;
    }
    Ok(())
}

/// Persist one channel, or every channel and the reference calibration.
pub fn commit(
    transport: &Transport,
    config: &ClientConfig,
    channel: Option<u8>,
    out: &mut dyn Write,
) -> RunnerResult<()> {
    match channel {
        Some(channel) => {
            DeviceSession::scoped(transport, config, |s| s.commit_channel(channel))?;
            writeln!(out, "channel {} committed", channel)?;
        }
        None => {
            DeviceSession::scoped(transport, config, |s| s.commit_all())?;
            writeln!(out, "all channels and reference calibration committed")?;
        }
    }
    Ok(())
}

/// Calibrate the voltage reference, optionally persisting it.
pub fn calibrate(
    transport: &Transport,
    config: &ClientConfig,
    persist: bool,
    out: &mut dyn Write,
) -> RunnerResult<()> {
    DeviceSession::scoped(transport, config, |s| {
        s.calibrate_reference()?;
        if persist {
            s.commit_reference()?;
        }
        Ok(())
    })?;
    if persist {
        writeln!(out, "voltage reference calibrated and committed")?;
    } else {
        writeln!(out, "voltage reference calibrated (not committed)")?;
    }
    Ok(())
}

// ============================================================================
// Measure
// ============================================================================

/// Options for [`measure`].
#[derive(Debug, Clone)]
pub struct MeasureRequest {
    pub channel: u8,
    pub poller: PollerConfig,
    /// How often the latest value is printed.
    pub display_interval: Duration,
    /// Stop after this long. Runs until stopped otherwise.
    pub duration: Option<Duration>,
    /// File that captured values are appended to.
    pub output: Option<PathBuf>,
}

/// What a measurement run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeasureSummary {
    pub samples: u64,
    pub displayed: u64,
    pub last_value: Option<f64>,
}

/// Control inputs of a measurement run.
pub struct MeasureControl {
    /// Any message (or disconnection) stops the run.
    pub stop: Receiver<()>,
    /// Each message toggles capture to the output file.
    pub toggle_capture: Receiver<()>,
}

/// Run the poller and print the latest value at the display interval until
/// stopped, the duration elapses, or the measurement fails.
///
/// Capture to `output` starts enabled when a path is given.
pub fn measure(
    transport: &Transport,
    request: &MeasureRequest,
    control: MeasureControl,
    out: &mut dyn Write,
) -> RunnerResult<MeasureSummary> {
    let mut poller = MeasurementPoller::new(request.poller.clone());
    let sink: Option<Box<dyn ValueSink>> = match &request.output {
        Some(path) => Some(Box::new(FileSink::append(path)?)),
        None => None,
    };
    let mut capturing = sink.is_some();
    poller.start(transport, request.channel, sink)?;
    info!(
        "measure: channel {} on {}, press Ctrl-C to stop",
        request.channel,
        transport.describe()
    );

    let ticker = crossbeam_channel::tick(request.display_interval.max(Duration::from_millis(1)));
    let deadline = match request.duration {
        Some(duration) => crossbeam_channel::after(duration),
        None => crossbeam_channel::never(),
    };
    let mut toggle = control.toggle_capture;
    let mut summary = MeasureSummary::default();

    loop {
        let mut toggle_closed = false;
        select! {
            recv(ticker) -> _ => {
                if !poller.is_running() {
                    break;
                }
                if let Some(value) = poller.sample() {
                    writeln!(out, "{}", format_value(value))?;
                    summary.displayed += 1;
                }
            }
            recv(control.stop) -> _ => break,
            recv(deadline) -> _ => break,
            recv(toggle) -> message => {
                if message.is_ok() {
                    capturing = toggle_capture(&poller, capturing, request.output.as_ref())?;
                } else {
                    toggle_closed = true;
                }
            }
        }
        if toggle_closed {
            toggle = crossbeam_channel::never();
        }
    }

    let error = poller.request_stop_and_join();
    summary.samples = poller.samples_taken();
    summary.last_value = poller.sample();
    info!("measure: stopped after {} samples", summary.samples);
    match error {
        Some(error) => Err(RunnerError::Measurement(error)),
        None => Ok(summary),
    }
}

/// Attach or detach the capture file. Returns the new capture state.
fn toggle_capture(
    poller: &MeasurementPoller,
    capturing: bool,
    output: Option<&PathBuf>,
) -> RunnerResult<bool> {
    if capturing {
        poller.set_sink(None);
        info!("measure: capture paused");
        return Ok(false);
    }
    match output {
        Some(path) => {
            poller.set_sink(Some(Box::new(FileSink::append(path)?)));
            info!("measure: capturing to {}", path.display());
            Ok(true)
        }
        None => {
            warn!("measure: no output file configured, capture unavailable");
            Ok(false)
        }
    }
}
