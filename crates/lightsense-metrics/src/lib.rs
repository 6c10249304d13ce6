//! Metrics infrastructure for LightSense.
//!
//! This crate declares every metric emitted by the protocol client and the
//! measurement poller as a structured [`Metric`] constant, and re-exports the
//! `metrics` facade so callers record through the same crate version.
//!
//! No recorder is installed here. Until the embedding application installs
//! one, every `counter!`/`gauge!`/`histogram!` call is a no-op.
//!
//! # Example
//!
//! ```rust,ignore
//! use lightsense_metrics::{describe_metrics, metric_defs, MetricLabels};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new("/dev/ttyUSB0").with_channel(2);
//! metrics::counter!(metric_defs::POLLER_SAMPLES.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use lightsense_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const LINES: Metric = Metric::counter("lightsense.framer.lines")
///     .with_description("Framed lines")
///     .with_unit(Unit::Count)
///     .with_labels(&["device"]);
///
/// assert_eq!(LINES.name, "lightsense.framer.lines");
/// assert_eq!(LINES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "lightsense.protocol.exchanges").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    /// Creates a counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Creates a gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Creates a histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Sets the description for the metric.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit for the metric.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys for the metric.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Protocol Client
    // ========================================================================

    /// Command/response exchanges written to the link.
    ///
    /// Labels: command
    pub const PROTOCOL_EXCHANGES: Metric = Metric::counter("lightsense.protocol.exchanges")
        .with_description("Command/response exchanges performed")
        .with_unit(Unit::Count)
        .with_labels(&["command"]);

    /// Exchanges whose response deadline expired without a framed line.
    ///
    /// Labels: command
    pub const PROTOCOL_TIMEOUTS: Metric = Metric::counter("lightsense.protocol.timeouts")
        .with_description("Exchanges that produced no response line before the deadline")
        .with_unit(Unit::Count)
        .with_labels(&["command"]);

    /// Round-trip time of a single exchange.
    ///
    /// Labels: command
    pub const PROTOCOL_EXCHANGE_LATENCY: Metric =
        Metric::histogram("lightsense.protocol.exchange_latency_us")
            .with_description("Time from writing a command to receiving its response line")
            .with_unit(Unit::Microseconds)
            .with_labels(&["command"]);

    /// Additional attempts made by the guarded retry wrapper.
    ///
    /// Labels: operation
    pub const PROTOCOL_RETRIES: Metric = Metric::counter("lightsense.protocol.retries")
        .with_description("Retry attempts made by guarded operations")
        .with_unit(Unit::Count)
        .with_labels(&["operation"]);

    /// Guarded operations that failed after exhausting their attempts.
    ///
    /// Labels: operation
    pub const PROTOCOL_GUARDED_FAILURES: Metric =
        Metric::counter("lightsense.protocol.guarded_failures")
            .with_description("Guarded operations that failed on their final attempt")
            .with_unit(Unit::Count)
            .with_labels(&["operation"]);

    // ========================================================================
    // Measurement Poller
    // ========================================================================

    /// Values successfully sampled by the poller.
    ///
    /// Labels: device, channel
    pub const POLLER_SAMPLES: Metric = Metric::counter("lightsense.poller.samples")
        .with_description("Measured values published by the poller")
        .with_unit(Unit::Count)
        .with_labels(&["device", "channel"]);

    /// Latest sampled value.
    ///
    /// Labels: device, channel
    pub const POLLER_LAST_VALUE: Metric = Metric::gauge("lightsense.poller.last_value")
        .with_description("Most recent measured value")
        .with_labels(&["device", "channel"]);

    /// Poller runs that ended with a terminal error.
    ///
    /// Labels: device, channel, reason
    pub const POLLER_TERMINAL_ERRORS: Metric =
        Metric::counter("lightsense.poller.terminal_errors")
            .with_description("Measurement loops ended by a terminal error")
            .with_unit(Unit::Count)
            .with_labels(&["device", "channel", "reason"]);

    /// Every metric, for bulk description.
    pub const ALL: &[Metric] = &[
        PROTOCOL_EXCHANGES,
        PROTOCOL_TIMEOUTS,
        PROTOCOL_EXCHANGE_LATENCY,
        PROTOCOL_RETRIES,
        PROTOCOL_GUARDED_FAILURES,
        POLLER_SAMPLES,
        POLLER_LAST_VALUE,
        POLLER_TERMINAL_ERRORS,
    ];
}

/// Labels identifying the device (and optionally the channel) a metric refers to.
///
/// ```rust
/// use lightsense_metrics::MetricLabels;
///
/// let labels = MetricLabels::new("/dev/ttyUSB0").with_channel(3);
/// assert!(labels.to_labels().contains(&("channel", "3".to_string())));
/// ```
#[derive(Debug, Clone)]
pub struct MetricLabels {
    /// Device identifier (port path, TCP address, or "simulated").
    pub device: String,
    /// Channel slot, when the metric is channel-scoped.
    pub channel: Option<u8>,
}

impl MetricLabels {
    /// Creates labels for a device.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            channel: None,
        }
    }

    /// Scopes the labels to a channel.
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Converts to the label vector accepted by the `metrics` macros.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("device", self.device.clone())];
        if let Some(channel) = self.channel {
            labels.push(("channel", channel.to_string()));
        }
        labels
    }

    /// Returns labels with additional key-value pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Describes all metrics. Call once after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
