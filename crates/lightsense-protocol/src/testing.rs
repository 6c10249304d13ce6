//! Test doubles for code built on [`Link`].
//!
//! [`ScriptedLink`] replays a fixed script of reads and records everything
//! written to it. A [`LinkRecorder`] obtained before the link is handed off keeps
//! observing it from the test thread.

use crate::link::Link;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// One scripted read.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return these bytes (an empty vector is an immediate empty read).
    Data(Vec<u8>),
    /// Behave like a read that timed out.
    Silence,
    /// Fail the read with this error kind.
    Fail(io::ErrorKind),
}

#[derive(Debug, Default)]
struct RecorderState {
    written: Vec<u8>,
    close_calls: usize,
    reads: usize,
}

/// Observer for a [`ScriptedLink`] that outlives moving the link elsewhere.
#[derive(Debug, Clone, Default)]
pub struct LinkRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl LinkRecorder {
    /// Written bytes split into command lines, terminators removed.
    pub fn commands(&self) -> Vec<String> {
        let state = self.state.lock();
        String::from_utf8_lossy(&state.written)
            .split("\r\n")
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// How many times `command` was written.
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Whether `close` has been called at least once.
    pub fn is_closed(&self) -> bool {
        self.state.lock().close_calls > 0
    }

    /// Number of `close` calls.
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Number of `read_chunk` calls.
    pub fn reads(&self) -> usize {
        self.state.lock().reads
    }
}

/// A [`Link`] that replays a script.
///
/// Once the script is exhausted every read behaves like [`Step::Silence`].
/// Silent reads sleep for the configured read timeout, like a real port.
#[derive(Debug)]
pub struct ScriptedLink {
    steps: VecDeque<Step>,
    read_timeout: Duration,
    close_error: Option<io::ErrorKind>,
    recorder: LinkRecorder,
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLink {
    /// Empty script with a 1 ms read timeout.
    pub fn new() -> Self {
        ScriptedLink {
            steps: VecDeque::new(),
            read_timeout: Duration::from_millis(1),
            close_error: None,
            recorder: LinkRecorder::default(),
        }
    }

    /// Script that returns each chunk from one read, in order.
    pub fn from_chunks(chunks: &[&[u8]]) -> Self {
        let mut link = Self::new();
        for chunk in chunks {
            link.steps.push_back(Step::Data(chunk.to_vec()));
        }
        link
    }

    /// Script that returns each line, `\r\n`-terminated, from its own read.
    pub fn from_lines(lines: &[&str]) -> Self {
        lines.iter().fold(Self::new(), |link, line| link.then_line(line))
    }

    /// Append a raw chunk.
    pub fn then_data(mut self, data: impl AsRef<[u8]>) -> Self {
        self.steps.push_back(Step::Data(data.as_ref().to_vec()));
        self
    }

    /// Append a `\r\n`-terminated line as one chunk.
    pub fn then_line(self, line: &str) -> Self {
        self.then_data(format!("{}\r\n", line))
    }

    /// Append `n` timed-out reads.
    pub fn then_silence(mut self, n: usize) -> Self {
        self.steps.extend(std::iter::repeat(Step::Silence).take(n));
        self
    }

    /// Append what a retry's resynchronisation reads: a quiet read, the
    /// `OK` answering its `nop`, and another quiet read.
    pub fn then_resync(self) -> Self {
        self.then_silence(1).then_line("OK").then_silence(1)
    }

    /// Append a failing read.
    pub fn then_fail(mut self, kind: io::ErrorKind) -> Self {
        self.steps.push_back(Step::Fail(kind));
        self
    }

    /// Set the reported (and slept) read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Make `close` fail with `kind`.
    pub fn with_close_error(mut self, kind: io::ErrorKind) -> Self {
        self.close_error = Some(kind);
        self
    }

    /// A recorder observing this link.
    pub fn recorder(&self) -> LinkRecorder {
        self.recorder.clone()
    }
}

impl Link for ScriptedLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recorder.state.lock().reads += 1;
        match self.steps.pop_front() {
            Some(Step::Data(mut data)) => {
                if data.len() > buf.len() {
                    let rest = data.split_off(buf.len());
                    self.steps.push_front(Step::Data(rest));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Some(Step::Fail(kind)) => Err(io::Error::from(kind)),
            Some(Step::Silence) | None => {
                if !self.read_timeout.is_zero() {
                    std::thread::sleep(self.read_timeout);
                }
                Ok(0)
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.recorder.state.lock().written.extend_from_slice(data);
        Ok(())
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn close(&mut self) -> io::Result<()> {
        self.recorder.state.lock().close_calls += 1;
        match self.close_error {
            Some(kind) => Err(io::Error::from(kind)),
            None => Ok(()),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replays_chunks_then_silence() {
        let mut link = ScriptedLink::from_chunks(&[b"ab", b""]);
        let mut buf = [0u8; 8];
        assert_eq!(link.read_chunk(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(link.read_chunk(&mut buf).unwrap(), 0);
        assert_eq!(link.read_chunk(&mut buf).unwrap(), 0);
        assert_eq!(link.recorder().reads(), 3);
    }

    #[test]
    fn test_long_chunk_is_split_by_buffer() {
        let mut link = ScriptedLink::new().then_data("abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(link.read_chunk(&mut buf).unwrap(), 4);
        assert_eq!(link.read_chunk(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_recorder_sees_writes_and_close() {
        let mut link = ScriptedLink::new().with_close_error(io::ErrorKind::Other);
        let recorder = link.recorder();
        link.write_all(b"nop\r\nconf_select:1\r\n").unwrap();
        assert!(link.close().is_err());
        assert_eq!(recorder.commands(), vec!["nop", "conf_select:1"]);
        assert_eq!(recorder.count("nop"), 1);
        assert!(recorder.is_closed());
    }

    #[test]
    fn test_fail_step() {
        let mut link = ScriptedLink::new().then_fail(io::ErrorKind::BrokenPipe);
        let mut buf = [0u8; 4];
        assert_eq!(
            link.read_chunk(&mut buf).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
