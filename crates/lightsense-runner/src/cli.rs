//! Command-line interface.

use clap::{ArgAction, Args, Parser, Subcommand};
use crossbeam_channel::Sender;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::commands::{self, MeasureControl, MeasureRequest, SetRequest};
use crate::config::RunnerConfig;
use crate::error::RunnerResult;
use crate::transport::Transport;

#[derive(Debug, Parser)]
#[command(name = "lightsense")]
#[command(version, about = "Configure and read LightSense light sensors")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// YAML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub transport: TransportArgs,

    /// More output (-v debug, -vv trace). Overrides RUST_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Default, Args)]
pub struct TransportArgs {
    /// Serial device, e.g. /dev/ttyUSB0
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    pub baud: Option<u32>,

    /// UART bridged over TCP, as host:port
    #[arg(long, global = true)]
    pub tcp: Option<String>,

    /// Talk to a simulated instrument
    #[arg(long, global = true)]
    pub simulate: bool,
}

impl TransportArgs {
    /// Apply the flags over the file settings. A flag naming a transport
    /// replaces the transport chosen in the file.
    pub fn apply(&self, config: &mut RunnerConfig) {
        let transport = &mut config.transport;
        if self.port.is_some() || self.tcp.is_some() || self.simulate {
            transport.port = self.port.clone();
            transport.tcp = self.tcp.clone();
            transport.simulate = self.simulate;
        }
        if let Some(baud) = self.baud {
            transport.baud_rate = baud;
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Check that the instrument answers
    Ping,

    /// Show channel parameters and the voltage reference state
    Read {
        /// Only this channel
        #[arg(long)]
        channel: Option<u8>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write channel parameters (an empty value clears one)
    Set {
        #[arg(long)]
        channel: u8,

        #[arg(long)]
        wavelength: Option<String>,

        #[arg(long, allow_hyphen_values = true)]
        zero_error: Option<String>,

        #[arg(long)]
        gain_error: Option<String>,
    },

    /// Persist one channel, or all channels and the reference calibration
    Commit {
        #[arg(long)]
        channel: Option<u8>,
    },

    /// Calibrate the internal voltage reference against the present supply
    Calibrate {
        /// Also persist the calibration
        #[arg(long)]
        commit: bool,
    },

    /// Measure a channel until Ctrl-C. Type `c` and Enter to toggle capture.
    Measure {
        #[arg(long)]
        channel: u8,

        /// Append values to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Require a calibrated voltage reference and check the supply on
        /// every sample
        #[arg(long)]
        check_voltage: bool,

        /// Milliseconds between displayed values
        #[arg(long)]
        display_interval: Option<u64>,
    },
}

/// Load the config file (if any) and apply command-line overrides.
pub fn resolve_config(cli: &Cli) -> RunnerResult<RunnerConfig> {
    let mut config = match &cli.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };
    cli.transport.apply(&mut config);
    if let Commands::Measure {
        output,
        check_voltage,
        display_interval,
        ..
    } = &cli.command
    {
        if output.is_some() {
            config.measure.output = output.clone();
        }
        if *check_voltage {
            config.measure.check_voltage = true;
        }
        if let Some(interval) = display_interval {
            config.measure.display_interval_ms = *interval;
        }
    }
    Ok(config)
}

/// Run a parsed command line, writing results to `out`.
pub fn run(cli: Cli, out: &mut dyn Write) -> RunnerResult<()> {
    let config = resolve_config(&cli)?;
    debug!("resolved config: {:?}", config);
    let transport = Transport::from_config(&config.transport)?;
    let client = &config.protocol;

    match cli.command {
        Commands::Ping => commands::ping(&transport, client, out),
        Commands::Read { channel, json } => commands::read(&transport, client, channel, json, out),
        Commands::Set {
            channel,
            wavelength,
            zero_error,
            gain_error,
        } => {
            let request = SetRequest {
                channel,
                wavelength,
                zero_error,
                gain_error,
            };
            commands::set(&transport, client, &request, out)
        }
        Commands::Commit { channel } => commands::commit(&transport, client, channel, out),
        Commands::Calibrate { commit } => commands::calibrate(&transport, client, commit, out),
        Commands::Measure {
            channel, duration, ..
        } => {
            let request = MeasureRequest {
                channel,
                poller: config.poller_config(),
                display_interval: Duration::from_millis(config.measure.display_interval_ms),
                duration: duration.map(Duration::from_secs_f64),
                output: config.measure.output.clone(),
            };
            let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
            ctrlc::set_handler(move || {
                let _ = stop_tx.try_send(());
            })?;
            let (toggle_tx, toggle_rx) = crossbeam_channel::unbounded();
            spawn_capture_toggle_reader(toggle_tx);

            let control = MeasureControl {
                stop: stop_rx,
                toggle_capture: toggle_rx,
            };
            let summary = commands::measure(&transport, &request, control, out)?;
            writeln!(out, "{} samples", summary.samples)?;
            Ok(())
        }
    }
}

/// Forward `c` lines from stdin as capture toggles. The reader thread is left
/// blocked on stdin when the run ends.
fn spawn_capture_toggle_reader(toggle: Sender<()>) {
    let spawned = std::thread::Builder::new()
        .name("lightsense-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().eq_ignore_ascii_case("c") && toggle.send(()).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("could not read capture toggles from stdin: {}", e);
    }
}
