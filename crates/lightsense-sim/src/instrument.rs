//! Firmware model of the light-sensor instrument.
//!
//! The instrument keeps a working copy of five calibration slots plus a
//! committed (non-volatile) copy, an internal voltage reference flag and the
//! selected slot. Configuration commands are answered `OK` immediately and
//! their result is delivered on the next `nop`.

use lightsense_protocol::{ChannelParam, Command, CHANNEL_COUNT};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

const OK: &str = "OK";
const ERROR: &str = "ERROR";
const NA: &str = "NA";

/// Highest reading of the 10-bit ADC.
pub const ADC_MAX: f64 = 1023.0;

/// Calibration data of one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slot {
    pub wavelength: Option<u16>,
    pub zero_error: Option<i16>,
    pub gain_error: Option<f64>,
}

/// Simulation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// RNG seed for ADC noise.
    pub seed: u64,
    /// Mean raw ADC reading.
    pub light_level: f64,
    /// Peak ADC noise, in counts.
    pub noise: f64,
    /// Per-read timeout reported by simulated links, in milliseconds.
    pub read_timeout_ms: u64,
    /// Deliver replies in chunks of at most this many bytes.
    pub split_replies: Option<usize>,
    /// Supply droops (and samples fail the voltage check) after this many
    /// samples.
    pub droop_after_samples: Option<u64>,
    /// Committed slot contents at power-up.
    pub slots: Vec<Slot>,
    /// Voltage reference calibrated at power-up.
    pub reference_calibrated: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            seed: 42,
            light_level: 512.0,
            noise: 3.0,
            read_timeout_ms: 5,
            split_replies: None,
            droop_after_samples: None,
            slots: vec![Slot {
                wavelength: Some(550),
                zero_error: Some(-12),
                gain_error: Some(1.0),
            }],
            reference_calibrated: false,
        }
    }
}

impl SimConfig {
    /// An instrument with empty slots and no noise.
    pub fn blank() -> Self {
        SimConfig {
            noise: 0.0,
            slots: Vec::new(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Idle,
    /// A configuration command was acknowledged; its result goes out on `nop`.
    AwaitingNop(String),
    Measuring,
}

/// The firmware state machine.
#[derive(Debug)]
pub struct Instrument {
    config: SimConfig,
    working: [Slot; CHANNEL_COUNT as usize],
    committed: [Slot; CHANNEL_COUNT as usize],
    reference_calibrated: bool,
    reference_committed: bool,
    selected: Option<u8>,
    mode: Mode,
    measurement_error: bool,
    supply_ok: bool,
    samples: u64,
    rng: ChaCha8Rng,
}

impl Instrument {
    pub fn new(config: SimConfig) -> Self {
        let mut committed = [Slot::default(); CHANNEL_COUNT as usize];
        for (slot, preset) in committed.iter_mut().zip(config.slots.iter()) {
            *slot = *preset;
        }
        Instrument {
            working: committed,
            committed,
            reference_calibrated: config.reference_calibrated,
            reference_committed: config.reference_calibrated,
            selected: None,
            mode: Mode::Idle,
            measurement_error: false,
            supply_ok: true,
            samples: 0,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Reload the working state from the committed copy, as after a reset.
    pub fn power_cycle(&mut self) {
        self.working = self.committed;
        self.reference_calibrated = self.reference_committed;
        self.selected = None;
        self.mode = Mode::Idle;
        self.measurement_error = false;
        self.supply_ok = true;
        self.samples = 0;
    }

    pub fn working_slot(&self, channel: u8) -> Option<&Slot> {
        self.working.get(channel as usize)
    }

    pub fn committed_slot(&self, channel: u8) -> Option<&Slot> {
        self.committed.get(channel as usize)
    }

    pub fn selected(&self) -> Option<u8> {
        self.selected
    }

    pub fn is_measuring(&self) -> bool {
        self.mode == Mode::Measuring
    }

    pub fn reference_calibrated(&self) -> bool {
        self.reference_calibrated
    }

    /// Values produced since power-up.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Handle one command line and return the reply line (no terminator).
    pub fn handle_line(&mut self, line: &str) -> String {
        let reply = match Command::parse(line) {
            Ok(command) => self.handle(&command),
            Err(_) => ERROR.to_string(),
        };
        trace!("Instrument: {:?} -> {:?}", line, reply);
        reply
    }

    fn handle(&mut self, command: &Command) -> String {
        match command {
            Command::Nop => match std::mem::replace(&mut self.mode, Mode::Idle) {
                Mode::AwaitingNop(result) => result,
                other => {
                    self.mode = other;
                    OK.to_string()
                }
            },
            Command::PromptOff => OK.to_string(),
            Command::MeasStart => {
                if self.mode != Mode::Idle {
                    return ERROR.to_string();
                }
                self.mode = Mode::Measuring;
                self.measurement_error = false;
                OK.to_string()
            }
            Command::MeasStop => {
                if self.mode != Mode::Measuring {
                    return ERROR.to_string();
                }
                let result = if self.measurement_error {
                    "ERRORS_CLEARED"
                } else {
                    OK
                };
                self.measurement_error = false;
                self.mode = Mode::AwaitingNop(result.to_string());
                OK.to_string()
            }
            Command::MeasGetValue => self.sample(),
            Command::Raw { .. } => ERROR.to_string(),
            configuration => {
                if self.mode != Mode::Idle {
                    return ERROR.to_string();
                }
                let result = self.configure(configuration);
                self.mode = Mode::AwaitingNop(result);
                OK.to_string()
            }
        }
    }

    fn sample(&mut self) -> String {
        if self.mode != Mode::Measuring {
            return ERROR.to_string();
        }
        let Some(channel) = self.selected else {
            return "NO_CONF_SELECTED".to_string();
        };
        if let Some(limit) = self.config.droop_after_samples {
            if self.samples >= limit {
                self.supply_ok = false;
            }
        }
        if self.reference_calibrated && !self.supply_ok {
            self.measurement_error = true;
            return "CHECK_FAILED".to_string();
        }
        let slot = self.working[channel as usize];
        let (Some(zero), Some(gain)) = (slot.zero_error, slot.gain_error) else {
            return ERROR.to_string();
        };

        let noise = if self.config.noise > 0.0 {
            self.rng.gen_range(-self.config.noise..=self.config.noise)
        } else {
            0.0
        };
        let adc = (self.config.light_level + noise).round().clamp(0.0, ADC_MAX);
        self.samples += 1;
        format!("{:.6}", gain * (adc + f64::from(zero)))
    }

    fn configure(&mut self, command: &Command) -> String {
        let reply = match command {
            Command::ConfSelect { channel } => self.slot_index(*channel).map(|_| {
                self.selected = Some(*channel);
                OK.to_string()
            }),
            Command::ConfCommit { channel } => self.slot_index(*channel).map(|i| {
                self.committed[i] = self.working[i];
                OK.to_string()
            }),
            Command::ConfGet { param, channel } => self
                .slot_index(*channel)
                .map(|i| read_param(&self.working[i], *param)),
            Command::ConfSet {
                param,
                channel,
                value,
            } => self
                .slot_index(*channel)
                .and_then(|i| write_param(&mut self.working[i], *param, value.as_deref())),
            Command::IntRefCalibrate => {
                self.reference_calibrated = true;
                self.supply_ok = true;
                Some(OK.to_string())
            }
            Command::IntRefCommit => {
                self.reference_committed = self.reference_calibrated;
                Some(OK.to_string())
            }
            Command::IntRefIsCalibrated => {
                let answer = if self.reference_calibrated { "TRUE" } else { "FALSE" };
                Some(answer.to_string())
            }
            _ => None,
        };
        reply.unwrap_or_else(|| ERROR.to_string())
    }

    fn slot_index(&self, channel: u8) -> Option<usize> {
        (channel < CHANNEL_COUNT).then_some(channel as usize)
    }
}

fn read_param(slot: &Slot, param: ChannelParam) -> String {
    let value = match param {
        ChannelParam::Wavelength => slot.wavelength.map(|v| v.to_string()),
        ChannelParam::ZeroError => slot.zero_error.map(|v| v.to_string()),
        ChannelParam::GainError => slot.gain_error.map(|v| format!("{:.6}", v)),
    };
    value.unwrap_or_else(|| NA.to_string())
}

/// Apply a set command. `None` (on the wire `NONE`) clears the value; text
/// that does not parse is rejected.
fn write_param(slot: &mut Slot, param: ChannelParam, value: Option<&str>) -> Option<String> {
    match (param, value) {
        (ChannelParam::Wavelength, None) => slot.wavelength = None,
        (ChannelParam::ZeroError, None) => slot.zero_error = None,
        (ChannelParam::GainError, None) => slot.gain_error = None,
        (ChannelParam::Wavelength, Some(text)) => slot.wavelength = Some(text.parse().ok()?),
        (ChannelParam::ZeroError, Some(text)) => slot.zero_error = Some(text.parse().ok()?),
        (ChannelParam::GainError, Some(text)) => {
            let gain: f64 = text.parse().ok()?;
            if !gain.is_finite() {
                return None;
            }
            slot.gain_error = Some(gain);
        }
    }
    Some(OK.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn exchange(instrument: &mut Instrument, command: &str) -> (String, String) {
        let ack = instrument.handle_line(command);
        let result = instrument.handle_line("nop");
        (ack, result)
    }

    #[test]
    fn test_double_acknowledged_get() {
        let mut instrument = Instrument::new(SimConfig::default());
        assert_eq!(
            exchange(&mut instrument, "conf_get_wavelength:0"),
            ("OK".to_string(), "550".to_string())
        );
        assert_eq!(
            exchange(&mut instrument, "conf_get_gain_error:3"),
            ("OK".to_string(), "NA".to_string())
        );
    }

    #[test]
    fn test_set_and_clear() {
        let mut instrument = Instrument::new(SimConfig::blank());
        assert_eq!(exchange(&mut instrument, "conf_set_zero_error:2:-40").1, "OK");
        assert_eq!(instrument.working_slot(2).unwrap().zero_error, Some(-40));
        assert_eq!(exchange(&mut instrument, "conf_set_zero_error:2:NONE").1, "OK");
        assert_eq!(instrument.working_slot(2).unwrap().zero_error, None);
        assert_eq!(exchange(&mut instrument, "conf_set_zero_error:2:lots").1, "ERROR");
        assert_eq!(exchange(&mut instrument, "conf_set_wavelength:9:500").1, "ERROR");
    }

    #[test]
    fn test_commit_survives_power_cycle() {
        let mut instrument = Instrument::new(SimConfig::blank());
        exchange(&mut instrument, "conf_set_wavelength:1:405");
        exchange(&mut instrument, "conf_set_wavelength:2:470");
        exchange(&mut instrument, "conf_commit:1");
        instrument.power_cycle();
        assert_eq!(instrument.working_slot(1).unwrap().wavelength, Some(405));
        assert_eq!(instrument.working_slot(2).unwrap().wavelength, None);
    }

    #[test]
    fn test_pending_result_blocks_next_command() {
        let mut instrument = Instrument::new(SimConfig::default());
        assert_eq!(instrument.handle_line("conf_select:0"), "OK");
        assert_eq!(instrument.handle_line("conf_select:1"), "ERROR");
        assert_eq!(instrument.handle_line("nop"), "OK");
        assert_eq!(instrument.selected(), Some(0));
    }

    #[test]
    fn test_measurement_value() {
        let mut instrument = Instrument::new(SimConfig {
            noise: 0.0,
            light_level: 100.0,
            slots: vec![Slot {
                wavelength: None,
                zero_error: Some(-10),
                gain_error: Some(0.5),
            }],
            ..SimConfig::default()
        });
        exchange(&mut instrument, "conf_select:0");
        assert_eq!(instrument.handle_line("meas_start"), "OK");
        let value: f64 = instrument.handle_line("meas_get_val").parse().unwrap();
        assert_relative_eq!(value, 45.0);
        assert_eq!(instrument.handle_line("conf_select:0"), "ERROR");
        assert_eq!(exchange(&mut instrument, "meas_stop"), ("OK".into(), "OK".into()));
    }

    #[test]
    fn test_measurement_sentinels() {
        let mut instrument = Instrument::new(SimConfig::blank());
        assert_eq!(instrument.handle_line("meas_get_val"), "ERROR");
        assert_eq!(instrument.handle_line("meas_stop"), "ERROR");
        instrument.handle_line("meas_start");
        assert_eq!(instrument.handle_line("meas_start"), "ERROR");
        assert_eq!(instrument.handle_line("meas_get_val"), "NO_CONF_SELECTED");
        instrument.handle_line("meas_stop");
        instrument.handle_line("nop");

        exchange(&mut instrument, "conf_select:4");
        instrument.handle_line("meas_start");
        // Slot 4 has no zero or gain data.
        assert_eq!(instrument.handle_line("meas_get_val"), "ERROR");
    }

    #[test]
    fn test_voltage_check_needs_calibrated_reference() {
        let mut instrument = Instrument::new(SimConfig {
            droop_after_samples: Some(2),
            ..SimConfig::default()
        });
        exchange(&mut instrument, "int_ref_calibrate");
        assert_eq!(exchange(&mut instrument, "int_ref_is_calibrated").1, "TRUE");
        exchange(&mut instrument, "conf_select:0");
        instrument.handle_line("meas_start");
        assert!(instrument.handle_line("meas_get_val").parse::<f64>().is_ok());
        assert!(instrument.handle_line("meas_get_val").parse::<f64>().is_ok());
        assert_eq!(instrument.handle_line("meas_get_val"), "CHECK_FAILED");
        assert_eq!(
            exchange(&mut instrument, "meas_stop"),
            ("OK".into(), "ERRORS_CLEARED".into())
        );
    }

    #[test]
    fn test_noise_is_seeded() {
        let run = || {
            let mut instrument = Instrument::new(SimConfig::default());
            exchange(&mut instrument, "conf_select:0");
            instrument.handle_line("meas_start");
            (0..5)
                .map(|_| instrument.handle_line("meas_get_val"))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_unknown_command() {
        let mut instrument = Instrument::new(SimConfig::default());
        assert_eq!(instrument.handle_line("reboot"), "ERROR");
    }
}
