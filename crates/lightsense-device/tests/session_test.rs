//! Configuration sessions against the simulated instrument.

use approx::assert_relative_eq;
use lightsense_device::{
    ChannelConfig, DeviceError, DeviceSession, FnConnector, Parameter, NUM_CHANNELS,
};
use lightsense_protocol::{ClientConfig, Link};
use lightsense_sim::{SharedInstrument, SimConfig, SimulatedSensor, Slot};
use std::io;
use std::time::Duration;

type SimConnector = FnConnector<Box<dyn Fn() -> io::Result<SimulatedSensor>>>;

fn connector(shared: &SharedInstrument) -> SimConnector {
    let shared = shared.clone();
    let open: Box<dyn Fn() -> io::Result<SimulatedSensor>> = Box::new(move || Ok(shared.open_link()));
    FnConnector::new("simulated", open)
}

fn instrument(config: SimConfig) -> SharedInstrument {
    SharedInstrument::new(SimConfig {
        read_timeout_ms: 1,
        split_replies: Some(5),
        ..config
    })
}

fn scoped<T>(
    shared: &SharedInstrument,
    f: impl FnOnce(&mut DeviceSession<SimulatedSensor>) -> Result<T, DeviceError>,
) -> Result<T, DeviceError> {
    DeviceSession::scoped(&connector(shared), &ClientConfig::default(), f)
}

// ============================================================================
// Parameters
// ============================================================================

#[test]
fn test_read_preset_channel() {
    let shared = instrument(SimConfig::default());
    let config = scoped(&shared, |s| s.read_channel(0)).unwrap();
    assert_eq!(
        config,
        ChannelConfig {
            channel: 0,
            wavelength: Parameter::Present(550),
            zero_error: Parameter::Present(-12),
            gain_error: Parameter::Present(1.0),
        }
    );
    assert!(config.is_measurable());
    assert_eq!(shared.open_links(), 0);
}

#[test]
fn test_write_then_read_in_separate_sessions() {
    let shared = instrument(SimConfig::blank());
    scoped(&shared, |s| {
        assert_eq!(s.set_wavelength(3, "405")?, Parameter::Present(405));
        assert_eq!(s.set_zero_error(3, " -7 ")?, Parameter::Present(-7));
        assert_eq!(s.set_gain_error(3, "0.875")?, Parameter::Present(0.875));
        Ok(())
    })
    .unwrap();

    let config = scoped(&shared, |s| s.read_channel(3)).unwrap();
    assert_eq!(config.wavelength, Parameter::Present(405));
    assert_eq!(config.zero_error, Parameter::Present(-7));
    assert_relative_eq!(config.gain_error.value().copied().unwrap(), 0.875);
    assert_eq!(shared.links_opened(), 2);
    assert_eq!(shared.open_links(), 0);
}

#[test]
fn test_clear_parameter() {
    let shared = instrument(SimConfig::default());
    let cleared = scoped(&shared, |s| s.set_wavelength(0, "")).unwrap();
    assert_eq!(cleared, Parameter::Unset);
    let read = scoped(&shared, |s| s.get_wavelength(0)).unwrap();
    assert_eq!(read, Parameter::Unset);
}

#[test]
fn test_invalid_text_leaves_instrument_untouched() {
    let shared = instrument(SimConfig::default());
    let result = scoped(&shared, |s| s.set_wavelength(0, "green"));
    assert!(matches!(result, Err(DeviceError::InvalidParameter { .. })));
    assert_eq!(shared.lock().working_slot(0).unwrap().wavelength, Some(550));
}

#[test]
fn test_read_all_snapshot() {
    let shared = instrument(SimConfig {
        slots: vec![
            Slot::default(),
            Slot {
                wavelength: Some(940),
                zero_error: None,
                gain_error: Some(2.0),
            },
        ],
        reference_calibrated: true,
        ..SimConfig::default()
    });
    let snapshot = scoped(&shared, |s| s.read_all()).unwrap();
    assert_eq!(snapshot.channels.len(), NUM_CHANNELS as usize);
    assert_eq!(snapshot.channels[0].wavelength, Parameter::Unset);
    assert_eq!(snapshot.channels[1].wavelength, Parameter::Present(940));
    assert_eq!(snapshot.channels[1].zero_error, Parameter::Unset);
    assert!(!snapshot.channels[1].is_measurable());
    assert!(snapshot.reference_calibrated);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_uncommitted_changes_lost_on_power_cycle() {
    let shared = instrument(SimConfig::default());
    scoped(&shared, |s| s.set_zero_error(0, "4").map(|_| ())).unwrap();
    shared.lock().power_cycle();
    let read = scoped(&shared, |s| s.get_zero_error(0)).unwrap();
    assert_eq!(read, Parameter::Present(-12));
}

#[test]
fn test_commit_all_survives_power_cycle() {
    let shared = instrument(SimConfig::blank());
    scoped(&shared, |s| {
        s.set_wavelength(2, "660")?;
        s.calibrate_reference()?;
        s.commit_all()
    })
    .unwrap();

    shared.lock().power_cycle();
    assert_eq!(shared.lock().committed_slot(2).unwrap().wavelength, Some(660));

    let (wavelength, calibrated) =
        scoped(&shared, |s| Ok((s.get_wavelength(2)?, s.reference_calibrated()?))).unwrap();
    assert_eq!(wavelength, Parameter::Present(660));
    assert!(calibrated);
}

#[test]
fn test_select_channel() {
    let shared = instrument(SimConfig::default());
    scoped(&shared, |s| s.select_channel(4)).unwrap();
    assert_eq!(shared.lock().selected(), Some(4));

    let result = scoped(&shared, |s| s.select_channel(NUM_CHANNELS));
    assert!(matches!(result, Err(DeviceError::InvalidChannel { .. })));
}

// ============================================================================
// Voltage Reference
// ============================================================================

#[test]
fn test_reference_calibration_flow() {
    let shared = instrument(SimConfig::default());
    let result = scoped(&shared, |s| s.ensure_reference_calibrated());
    assert!(matches!(result, Err(DeviceError::ReferenceNotCalibrated)));

    scoped(&shared, |s| {
        s.calibrate_reference()?;
        s.commit_reference()
    })
    .unwrap();
    scoped(&shared, |s| s.ensure_reference_calibrated()).unwrap();
    assert!(shared.lock().reference_calibrated());
}

// ============================================================================
// Late Replies
// ============================================================================

/// Holds back everything the instrument sends after the `late_line`-th
/// command line for a few reads.
struct LateReply {
    inner: SimulatedSensor,
    late_line: usize,
    lines_written: usize,
    held_reads: usize,
}

impl LateReply {
    fn new(inner: SimulatedSensor, late_line: usize) -> Self {
        LateReply {
            inner,
            late_line,
            lines_written: 0,
            held_reads: 0,
        }
    }
}

impl Link for LateReply {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.held_reads > 0 {
            self.held_reads -= 1;
            std::thread::sleep(self.inner.read_timeout());
            return Ok(0);
        }
        self.inner.read_chunk(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let before = self.lines_written;
        self.lines_written += data.iter().filter(|&&b| b == b'\n').count();
        if before < self.late_line && self.lines_written >= self.late_line {
            // Longer than the two-read response deadline.
            self.held_reads = 3;
        }
        self.inner.write_all(data)
    }

    fn read_timeout(&self) -> Duration {
        self.inner.read_timeout()
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

#[test]
fn test_late_confirmation_recovered_on_retry() {
    let shared = instrument(SimConfig::default());
    let opener = shared.clone();
    // prompt_off, nop, conf_get_wavelength:0, then its nop confirmation.
    let connector = FnConnector::new("late", move || -> io::Result<LateReply> {
        Ok(LateReply::new(opener.open_link(), 4))
    });

    let (value, attempts) = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
        let value = s.get_wavelength(0)?;
        Ok((value, s.client().last_attempts()))
    })
    .unwrap();
    assert_eq!(value, Parameter::Present(550));
    assert_eq!(attempts, 2);
    assert_eq!(shared.open_links(), 0);
}

#[test]
fn test_late_reply_does_not_shift_later_reads() {
    let shared = instrument(SimConfig::default());
    let opener = shared.clone();
    let connector = FnConnector::new("late", move || -> io::Result<LateReply> {
        Ok(LateReply::new(opener.open_link(), 4))
    });

    let config = DeviceSession::scoped(&connector, &ClientConfig::default(), |s| {
        s.read_channel(0)
    })
    .unwrap();
    assert_eq!(config.wavelength, Parameter::Present(550));
    assert_eq!(config.zero_error, Parameter::Present(-12));
    assert_eq!(config.gain_error, Parameter::Present(1.0));
}
