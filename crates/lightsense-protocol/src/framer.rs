//! Line framing over a chunked byte stream.
//!
//! The instrument terminates every reply with `\n` (usually `\r\n`), but the
//! serial link hands bytes over in arbitrary chunks: a reply may be split
//! across several reads, a read may time out empty, and a read may carry the
//! tail of one line and the start of the next.

use crate::error::{ProtocolError, ProtocolResult};
use crate::link::Link;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

/// Default number of bytes requested per read.
pub const DEFAULT_READ_SIZE: usize = 100;

/// Default bound on unterminated bytes held between reads.
pub const DEFAULT_BUFFER_LIMIT: usize = 100;

/// Line terminator byte.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Command terminator appended by [`encode_command`].
pub const COMMAND_TERMINATOR: &[u8] = b"\r\n";

/// Encode a command line for transmission, appending `\r\n`.
pub fn encode_command(cmd: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(cmd.len() + COMMAND_TERMINATOR.len());
    buf.extend_from_slice(cmd.as_bytes());
    buf.extend_from_slice(COMMAND_TERMINATOR);
    buf
}

/// Turns a [`Link`]'s byte chunks into complete lines.
///
/// Each [`poll_line`](LineFramer::poll_line) performs exactly one read. At
/// most one line is returned per call; further complete lines stay buffered
/// for later calls.
#[derive(Debug)]
pub struct LineFramer<L> {
    link: L,
    /// Bytes received but not yet yielded as a line.
    buffer: BytesMut,
    buffer_limit: usize,
    scratch: Vec<u8>,
}

impl<L: Link> LineFramer<L> {
    /// Wrap a link using the default read size and buffer limit.
    pub fn new(link: L) -> Self {
        Self::with_limits(link, DEFAULT_READ_SIZE, DEFAULT_BUFFER_LIMIT)
    }

    /// Wrap a link with explicit limits.
    pub fn with_limits(link: L, read_size: usize, buffer_limit: usize) -> Self {
        LineFramer {
            link,
            buffer: BytesMut::with_capacity(buffer_limit + read_size),
            buffer_limit,
            scratch: vec![0; read_size.max(1)],
        }
    }

    /// Read once from the link and return the next complete line, if any.
    ///
    /// The returned line includes its terminator. `Ok(None)` means no line is
    /// complete yet, including when the read timed out with no data.
    pub fn poll_line(&mut self) -> ProtocolResult<Option<Bytes>> {
        let n = self.link.read_chunk(&mut self.scratch)?;
        if n > 0 {
            self.buffer.extend_from_slice(&self.scratch[..n]);
        }

        let line = self
            .buffer
            .iter()
            .position(|&b| b == LINE_TERMINATOR)
            .map(|end| self.buffer.split_to(end + 1).freeze());

        if self.buffer.len() > self.buffer_limit {
            return Err(ProtocolError::BufferOverflow {
                max: self.buffer_limit,
                actual: self.buffer.len(),
            });
        }

        Ok(line)
    }

    /// Number of buffered, not yet yielded bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Configured buffer limit.
    pub fn buffer_limit(&self) -> usize {
        self.buffer_limit
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// The link's per-read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.link.read_timeout()
    }

    /// Borrow the underlying link (for writing commands).
    pub fn get_mut(&mut self) -> &mut L {
        &mut self.link
    }
}
