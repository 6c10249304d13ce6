//! LightSense command-line tool
//!
//! Library half of the `lightsense` binary: configuration loading, transport
//! selection (serial port, TCP bridge or simulated instrument), logging
//! setup, and the subcommand implementations.

pub mod cli;
pub mod commands;
pub mod config;
mod error;
pub mod transport;

pub use error::*;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `verbose` of 0 honours `RUST_LOG` and falls back to `info`; 1 and above
/// force `debug` and `trace`. Records from crates using `log` are forwarded.
pub fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
