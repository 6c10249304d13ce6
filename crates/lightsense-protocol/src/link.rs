//! The byte transport underneath the protocol.
//!
//! Opening a physical port (baud rate, device path, timeouts) is the job of
//! the embedding application. The protocol only needs something it can write
//! command bytes to and read reply bytes from with a bounded wait.

use std::io;
use std::time::Duration;

/// A bidirectional byte link to the instrument.
///
/// `read_chunk` must never block for longer than [`Link::read_timeout`]. A
/// read that times out without data returns `Ok(0)`; any `Err` is treated as
/// a transport failure that ends the connection.
pub trait Link: Send {
    /// Read whatever bytes arrive before the read timeout into `buf`.
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` to the instrument.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Upper bound on a single `read_chunk` call.
    fn read_timeout(&self) -> Duration;

    /// Release the underlying resource. Called exactly once when a session
    /// or poller is done with the link.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Human-readable identity used in logs and metric labels.
    fn describe(&self) -> String {
        "link".to_string()
    }
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_chunk(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).write_all(data)
    }

    fn read_timeout(&self) -> Duration {
        (**self).read_timeout()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Map the "nothing arrived in time" errors of blocking readers to `Ok(0)`.
///
/// Serial ports report an expired read timeout as `TimedOut`, sockets as
/// `WouldBlock`. Both mean an empty chunk, not a broken link.
pub fn timeout_as_empty(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        other => other,
    }
}
