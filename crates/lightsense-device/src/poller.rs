//! Background measurement polling.
//!
//! The poller owns a dedicated connection and a worker thread that samples
//! the selected channel in a loop. The caller reads the latest value at its
//! own pace through short locked accessors, and stops the loop with a
//! cancellation flag that the worker checks between samples.

use lightsense_metrics::{metric_defs, MetricLabels};
use lightsense_protocol::{ClientConfig, Link, ProtocolClient, SampleOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DeviceError, DeviceResult, MeasurementError};
use crate::parameter::check_channel;
use crate::session::{connect, Connector, DeviceSession};
use crate::sink::ValueSink;

/// Poller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Client settings for the poller's connection.
    pub client: ClientConfig,
    /// Require a calibrated voltage reference before starting, so the
    /// instrument checks the supply on every sample.
    pub check_voltage: bool,
    /// Pause between samples. Zero samples as fast as the instrument answers.
    pub sample_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            client: ClientConfig::default(),
            check_voltage: false,
            sample_interval_ms: 0,
        }
    }
}

/// Lifecycle of a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Finished,
}

impl PollerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerState::Idle => "idle",
            PollerState::Starting => "starting",
            PollerState::Running => "running",
            PollerState::Stopping => "stopping",
            PollerState::Finished => "finished",
        }
    }
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`MeasurementPoller::start`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new measurement loop is running.
    Started,
    /// A loop was already starting or running; nothing changed.
    AlreadyRunning,
}

/// Called on the worker thread once the loop has ended and the connection
/// is closed, with the terminal error if there was one.
pub type FinishedCallback = Box<dyn FnOnce(Option<MeasurementError>) + Send>;

/// Fields guarded by the measurement mutex.
#[derive(Debug)]
struct Measurement {
    state: PollerState,
    value: Option<f64>,
    error: Option<MeasurementError>,
    samples: u64,
}

/// State shared between the caller and the worker thread.
struct SharedState {
    measurement: Mutex<Measurement>,
    sink: Mutex<Option<Box<dyn ValueSink>>>,
    stop_flag: AtomicBool,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            measurement: Mutex::new(Measurement {
                state: PollerState::Idle,
                value: None,
                error: None,
                samples: 0,
            }),
            sink: Mutex::new(None),
            stop_flag: AtomicBool::new(false),
        }
    }

    fn state(&self) -> PollerState {
        self.measurement.lock().state
    }

    fn set_state(&self, state: PollerState) {
        self.measurement.lock().state = state;
    }

    fn publish(&self, value: f64) {
        let mut m = self.measurement.lock();
        m.value = Some(value);
        m.samples += 1;
    }

    /// Keep the first terminal error.
    fn record_error(&self, error: MeasurementError) {
        let mut m = self.measurement.lock();
        if m.error.is_none() {
            m.error = Some(error);
        }
    }

    fn error(&self) -> Option<MeasurementError> {
        self.measurement.lock().error.clone()
    }

    /// Raise the stop flag; a running loop reports `Stopping` from here on.
    fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        let mut m = self.measurement.lock();
        if m.state == PollerState::Running {
            m.state = PollerState::Stopping;
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    /// Swap the sink, returning the previous one.
    fn replace_sink(&self, sink: Option<Box<dyn ValueSink>>) -> Option<Box<dyn ValueSink>> {
        std::mem::replace(&mut *self.sink.lock(), sink)
    }

    fn forward(&self, value: f64) -> std::io::Result<()> {
        match self.sink.lock().as_mut() {
            Some(sink) => sink.write_value(value),
            None => Ok(()),
        }
    }
}

fn close_sink(sink: Option<Box<dyn ValueSink>>) {
    if let Some(mut sink) = sink {
        if let Err(e) = sink.close() {
            warn!("MeasurementPoller: failed to close sink {}: {}", sink.describe(), e);
        }
    }
}

/// Samples one channel on a background thread.
pub struct MeasurementPoller {
    config: PollerConfig,
    shared: Arc<SharedState>,
    thread_handle: Option<JoinHandle<()>>,
    on_finished: Option<FinishedCallback>,
}

impl MeasurementPoller {
    /// An idle poller.
    pub fn new(config: PollerConfig) -> Self {
        MeasurementPoller {
            config,
            shared: Arc::new(SharedState::new()),
            thread_handle: None,
            on_finished: None,
        }
    }

    /// Register a callback for the next run. It is consumed by that run.
    pub fn on_finished<F>(&mut self, callback: F)
    where
        F: FnOnce(Option<MeasurementError>) + Send + 'static,
    {
        self.on_finished = Some(Box::new(callback));
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PollerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), PollerState::Starting | PollerState::Running)
    }

    /// Latest sampled value, if any.
    pub fn sample(&self) -> Option<f64> {
        self.shared.measurement.lock().value
    }

    /// Values published by the current run.
    pub fn samples_taken(&self) -> u64 {
        self.shared.measurement.lock().samples
    }

    /// Terminal error recorded so far, without waiting.
    pub fn error(&self) -> Option<MeasurementError> {
        self.shared.error()
    }

    /// Attach, replace or (with `None`) detach the sink. The previous sink is
    /// closed. Takes effect from the next sample.
    pub fn set_sink(&self, sink: Option<Box<dyn ValueSink>>) {
        if let Some(sink) = &sink {
            debug!("MeasurementPoller: attaching sink {}", sink.describe());
        }
        close_sink(self.shared.replace_sink(sink));
    }

    /// Open a connection, select `channel` and start measuring on a worker
    /// thread.
    ///
    /// Fails without leaving Idle if the connection, handshake, channel
    /// selection, voltage reference check or `meas_start` fails; the
    /// connection is closed in that case.
    pub fn start<C: Connector>(
        &mut self,
        connector: &C,
        channel: u8,
        sink: Option<Box<dyn ValueSink>>,
    ) -> DeviceResult<StartOutcome> {
        if self.is_running() {
            debug!("MeasurementPoller: start ignored, already {}", self.state());
            return Ok(StartOutcome::AlreadyRunning);
        }
        check_channel(channel)?;

        // Reap a finished run before reusing the poller.
        self.request_stop_and_join();
        self.shared = Arc::new(SharedState::new());
        self.shared.set_state(PollerState::Starting);

        let link = match connect(connector) {
            Ok(link) => link,
            Err(e) => {
                self.shared.set_state(PollerState::Idle);
                return Err(e);
            }
        };
        let mut session = DeviceSession::new(link, self.config.client.clone());
        if let Err(e) = self.prepare(&mut session, channel) {
            warn!(
                "MeasurementPoller[{}]: failed to start on channel {}: {}",
                connector.describe(),
                channel,
                e
            );
            session.close();
            self.shared.set_state(PollerState::Idle);
            return Err(e);
        }

        let client = session.into_client();
        let labels = MetricLabels::new(client.device()).with_channel(channel);
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        let shared = Arc::clone(&self.shared);
        let on_finished = self.on_finished.take();
        shared.replace_sink(sink);
        shared.set_state(PollerState::Running);

        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("lightsense-poller-{}", channel))
            .spawn(move || run_loop(client, worker_shared, labels, interval, on_finished));

        match spawned {
            Ok(handle) => {
                info!(
                    "MeasurementPoller[{}]: measuring channel {}",
                    connector.describe(),
                    channel
                );
                self.thread_handle = Some(handle);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                close_sink(shared.replace_sink(None));
                shared.set_state(PollerState::Idle);
                Err(DeviceError::Spawn(e))
            }
        }
    }

    fn prepare<L: Link>(&self, session: &mut DeviceSession<L>, channel: u8) -> DeviceResult<()> {
        session.handshake()?;
        if self.config.check_voltage {
            session.ensure_reference_calibrated()?;
        }
        session.select_channel(channel)?;
        session.client_mut().meas_start()?;
        Ok(())
    }

    /// Ask the loop to stop, wait for it, and return the terminal error.
    ///
    /// Returns immediately when nothing is running. Repeated calls return the
    /// same error.
    pub fn request_stop_and_join(&mut self) -> Option<MeasurementError> {
        self.shared.stop();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("MeasurementPoller: worker thread panicked");
                self.shared.record_error(MeasurementError::ThreadPanicked);
                close_sink(self.shared.replace_sink(None));
                self.shared.set_state(PollerState::Finished);
            }
        }
        self.shared.error()
    }
}

impl Drop for MeasurementPoller {
    fn drop(&mut self) {
        self.request_stop_and_join();
    }
}

impl fmt::Debug for MeasurementPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementPoller")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Worker
// ============================================================================

fn run_loop<L: Link>(
    mut client: ProtocolClient<L>,
    shared: Arc<SharedState>,
    labels: MetricLabels,
    interval: Duration,
    on_finished: Option<FinishedCallback>,
) {
    let device = client.device().to_string();
    let metric_labels = labels.to_labels();

    let terminal = loop {
        if shared.should_stop() {
            break None;
        }
        match client.sample() {
            Ok(SampleOutcome::Value(value)) => {
                shared.publish(value);
                metrics::counter!(metric_defs::POLLER_SAMPLES.name, &metric_labels).increment(1);
                metrics::gauge!(metric_defs::POLLER_LAST_VALUE.name, &metric_labels).set(value);
                if let Err(e) = shared.forward(value) {
                    break Some(MeasurementError::Sink(Arc::new(e)));
                }
            }
            Ok(SampleOutcome::VoltageCheckFailed) => {
                break Some(MeasurementError::VoltageCheckFailed)
            }
            Ok(SampleOutcome::NoConfigurationSelected) => {
                break Some(MeasurementError::NoConfigurationSelected)
            }
            Ok(SampleOutcome::Failed(response)) => {
                break Some(MeasurementError::UnexpectedResponse(response))
            }
            Err(e) => break Some(MeasurementError::from(e)),
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    };

    shared.set_state(PollerState::Stopping);
    if let Some(error) = &terminal {
        warn!("MeasurementPoller[{}]: measurement ended: {}", device, error);
        let reason_labels = labels.with(&[("reason", error.reason().to_string())]);
        metrics::counter!(metric_defs::POLLER_TERMINAL_ERRORS.name, &reason_labels).increment(1);
        shared.record_error(error.clone());
    }

    // Best effort: the terminal error, if any, is what the caller sees.
    if let Err(e) = client.meas_stop() {
        debug!("MeasurementPoller[{}]: meas_stop failed: {}", device, e);
    }
    if let Err(e) = client.close() {
        warn!("MeasurementPoller[{}]: failed to close link: {}", device, e);
    }
    close_sink(shared.replace_sink(None));
    shared.set_state(PollerState::Finished);
    info!("MeasurementPoller[{}]: stopped", device);

    if let Some(callback) = on_finished {
        callback(shared.error());
    }
}
