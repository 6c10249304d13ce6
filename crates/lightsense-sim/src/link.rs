//! Serial-link front end of the simulated instrument.

use lightsense_protocol::Link;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::instrument::{Instrument, SimConfig};

/// Prefix written before every reply while the prompt is enabled.
pub const PROMPT: &str = "> ";

/// Commands longer than this without a terminator are discarded.
const MAX_COMMAND_LENGTH: usize = 128;

/// One instrument that any number of links can be opened to, one after the
/// other, the way a physical port is reopened for each operation.
#[derive(Debug, Clone)]
pub struct SharedInstrument {
    inner: Arc<Mutex<Instrument>>,
    links: Arc<Mutex<LinkCounts>>,
}

#[derive(Debug, Default)]
struct LinkCounts {
    opened: usize,
    closed: usize,
}

impl SharedInstrument {
    pub fn new(config: SimConfig) -> Self {
        SharedInstrument {
            inner: Arc::new(Mutex::new(Instrument::new(config))),
            links: Arc::new(Mutex::new(LinkCounts::default())),
        }
    }

    /// Open a new link. The prompt is enabled again, as after reopening the
    /// port.
    pub fn open_link(&self) -> SimulatedSensor {
        self.links.lock().opened += 1;
        SimulatedSensor::attach(self.clone())
    }

    /// Lock the instrument for inspection or fault injection.
    pub fn lock(&self) -> MutexGuard<'_, Instrument> {
        self.inner.lock()
    }

    /// Number of links opened so far.
    pub fn links_opened(&self) -> usize {
        self.links.lock().opened
    }

    /// Links opened and not yet closed.
    pub fn open_links(&self) -> usize {
        let links = self.links.lock();
        links.opened - links.closed
    }
}

/// A [`Link`] to a simulated instrument.
///
/// Replies are queued as soon as a command line is written and handed out by
/// subsequent reads, optionally in small pieces.
#[derive(Debug)]
pub struct SimulatedSensor {
    instrument: SharedInstrument,
    pending_input: Vec<u8>,
    output: VecDeque<u8>,
    prompt: bool,
    split_replies: Option<usize>,
    read_timeout: Duration,
    closed: bool,
}

impl SimulatedSensor {
    /// A link to a fresh instrument of its own.
    pub fn new(config: SimConfig) -> Self {
        SharedInstrument::new(config).open_link()
    }

    fn attach(instrument: SharedInstrument) -> Self {
        let (split_replies, read_timeout) = {
            let guard = instrument.lock();
            let config = guard.config();
            (
                config.split_replies,
                Duration::from_millis(config.read_timeout_ms),
            )
        };
        SimulatedSensor {
            instrument,
            pending_input: Vec::new(),
            output: VecDeque::new(),
            prompt: true,
            split_replies,
            read_timeout,
            closed: false,
        }
    }

    pub fn instrument(&self) -> &SharedInstrument {
        &self.instrument
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let reply = self.instrument.lock().handle_line(line);
        let prefix = if self.prompt { PROMPT } else { "" };
        if line == "prompt_off" {
            self.prompt = false;
        }
        self.output.extend(prefix.as_bytes());
        self.output.extend(reply.as_bytes());
        self.output.extend(b"\r\n");
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"))
        } else {
            Ok(())
        }
    }
}

impl Link for SimulatedSensor {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        if self.output.is_empty() {
            if !self.read_timeout.is_zero() {
                std::thread::sleep(self.read_timeout);
            }
            return Ok(0);
        }
        let limit = self.split_replies.unwrap_or(usize::MAX).max(1);
        let n = buf.len().min(limit).min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.check_open()?;
        for &byte in data {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.pending_input);
                self.handle_line(&line);
            } else if self.pending_input.len() < MAX_COMMAND_LENGTH {
                self.pending_input.push(byte);
            } else {
                debug!("SimulatedSensor: discarding overlong command");
                self.pending_input.clear();
            }
        }
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.instrument.links.lock().closed += 1;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}
