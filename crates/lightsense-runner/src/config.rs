//! Runner configuration file.
//!
//! ```yaml
//! transport:
//!   port: /dev/ttyUSB0
//!   baud_rate: 19200
//! protocol:
//!   retry_attempts: 12
//! measure:
//!   display_interval_ms: 400
//!   output: values.txt
//! ```
//!
//! Every field is optional. Command-line flags take precedence.

use lightsense_device::PollerConfig;
use lightsense_protocol::ClientConfig;
use lightsense_sim::SimConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RunnerError, RunnerResult};

pub const DEFAULT_BAUD_RATE: u32 = 19200;
pub const DEFAULT_SERIAL_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_DISPLAY_INTERVAL_MS: u64 = 400;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub transport: TransportConfig,
    pub protocol: ClientConfig,
    pub measure: MeasureConfig,
}

/// Where the instrument is. At most one of `port`, `tcp` and `simulate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial device path.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Per-read timeout for serial and TCP links.
    pub timeout_ms: u64,
    /// `host:port` of a UART bridged over TCP.
    pub tcp: Option<String>,
    /// Use the in-memory instrument.
    pub simulate: bool,
    /// Settings of the simulated instrument.
    pub sim: SimConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_SERIAL_TIMEOUT_MS,
            tcp: None,
            simulate: false,
            sim: SimConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    /// How often the latest value is printed.
    pub display_interval_ms: u64,
    /// Pause between samples on the instrument.
    pub sample_interval_ms: u64,
    /// Append every sampled value to this file.
    pub output: Option<PathBuf>,
    pub check_voltage: bool,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        MeasureConfig {
            display_interval_ms: DEFAULT_DISPLAY_INTERVAL_MS,
            sample_interval_ms: 0,
            output: None,
            check_voltage: false,
        }
    }
}

impl RunnerConfig {
    /// Load a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> RunnerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RunnerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| RunnerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Settings for the measurement poller.
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            client: self.protocol.clone(),
            check_voltage: self.measure.check_voltage,
            sample_interval_ms: self.measure.sample_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config: RunnerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.transport.baud_rate, 19200);
        assert_eq!(config.measure.display_interval_ms, 400);
        assert_eq!(config.protocol.retry_attempts, 12);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
transport:
  tcp: "127.0.0.1:4000"
protocol:
  retry_attempts: 3
measure:
  check_voltage: true
  output: values.txt
"#;
        let config: RunnerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.transport.tcp.as_deref(), Some("127.0.0.1:4000"));
        assert_eq!(config.transport.timeout_ms, 1000);
        assert_eq!(config.protocol.retry_attempts, 3);
        assert_eq!(config.protocol.buffer_limit, 100);

        let poller = config.poller_config();
        assert!(poller.check_voltage);
        assert_eq!(poller.client.retry_attempts, 3);
        assert_eq!(config.measure.output, Some(PathBuf::from("values.txt")));
    }

    #[test]
    fn test_load_reports_path() {
        let missing = std::env::temp_dir().join("lightsense-no-such-config.yaml");
        match RunnerConfig::load(&missing) {
            Err(RunnerError::ConfigRead { path, .. }) => assert_eq!(path, missing),
            other => panic!("expected read error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_bad_yaml() {
        let path = std::env::temp_dir().join(format!(
            "lightsense-bad-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "protocol: [1, 2").unwrap();
        let result = RunnerConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(RunnerError::ConfigParse { .. })));
    }
}
