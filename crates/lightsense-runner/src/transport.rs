//! Links to real and simulated instruments.
//!
//! Each subcommand opens a fresh link through [`Transport`], which picks the
//! serial port, a TCP bridge, or the in-memory instrument.

use lightsense_device::Connector;
use lightsense_protocol::{timeout_as_empty, Link};
use lightsense_sim::SharedInstrument;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::{RunnerError, RunnerResult};

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "link closed")
}

// ============================================================================
// Serial
// ============================================================================

/// A serial port link.
pub struct SerialLink {
    path: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialLink {
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .open()
            .map_err(io::Error::from)?;
        debug!("SerialLink[{}]: opened at {} baud", path, baud_rate);
        Ok(SerialLink {
            path: path.to_string(),
            port: Some(port),
            timeout,
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(not_connected)
    }
}

impl Link for SerialLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        timeout_as_empty(self.port()?.read(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        Write::write_all(port, data)?;
        port.flush()
    }

    fn read_timeout(&self) -> Duration {
        self.timeout
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(mut port) = self.port.take() {
            port.flush()?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

// ============================================================================
// TCP
// ============================================================================

/// A UART exposed on a TCP socket.
pub struct TcpLink {
    addr: String,
    stream: Option<TcpStream>,
    timeout: Duration,
}

impl TcpLink {
    pub fn connect(addr: &str, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        debug!("TcpLink[{}]: connected", addr);
        Ok(TcpLink {
            addr: addr.to_string(),
            stream: Some(stream),
            timeout,
        })
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Link for TcpLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream()?.read(buf) {
            // A zero-length read on a socket is the peer hanging up.
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            other => timeout_as_empty(other),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self.stream()?, data)
    }

    fn read_timeout(&self) -> Duration {
        self.timeout
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

// ============================================================================
// Transport Selection
// ============================================================================

/// The configured way of reaching the instrument.
#[derive(Debug, Clone)]
pub enum Transport {
    Serial {
        path: String,
        baud_rate: u32,
        timeout: Duration,
    },
    Tcp {
        addr: String,
        timeout: Duration,
    },
    /// One simulated instrument shared by every link opened, so state
    /// persists across subcommand steps.
    Simulated(SharedInstrument),
}

impl Transport {
    pub fn from_config(config: &TransportConfig) -> RunnerResult<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        match (&config.port, &config.tcp, config.simulate) {
            (Some(path), None, false) => Ok(Transport::Serial {
                path: path.clone(),
                baud_rate: config.baud_rate,
                timeout,
            }),
            (None, Some(addr), false) => Ok(Transport::Tcp {
                addr: addr.clone(),
                timeout,
            }),
            (None, None, true) => Ok(Transport::Simulated(SharedInstrument::new(
                config.sim.clone(),
            ))),
            (None, None, false) => Err(RunnerError::NoTransport),
            _ => Err(RunnerError::ConflictingTransports),
        }
    }
}

impl Connector for Transport {
    type Link = Box<dyn Link>;

    fn connect(&self) -> io::Result<Box<dyn Link>> {
        let link: Box<dyn Link> = match self {
            Transport::Serial {
                path,
                baud_rate,
                timeout,
            } => Box::new(SerialLink::open(path, *baud_rate, *timeout)?),
            Transport::Tcp { addr, timeout } => Box::new(TcpLink::connect(addr, *timeout)?),
            Transport::Simulated(shared) => Box::new(shared.open_link()),
        };
        Ok(link)
    }

    fn describe(&self) -> String {
        match self {
            Transport::Serial { path, .. } => path.clone(),
            Transport::Tcp { addr, .. } => format!("tcp://{}", addr),
            Transport::Simulated(_) => "simulated".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn transport_config() -> TransportConfig {
        TransportConfig::default()
    }

    #[test]
    fn test_transport_selection() {
        assert!(matches!(
            Transport::from_config(&transport_config()),
            Err(RunnerError::NoTransport)
        ));

        let serial = TransportConfig {
            port: Some("/dev/ttyUSB0".to_string()),
            ..transport_config()
        };
        match Transport::from_config(&serial).unwrap() {
            Transport::Serial {
                baud_rate, timeout, ..
            } => {
                assert_eq!(baud_rate, 19200);
                assert_eq!(timeout, Duration::from_secs(1));
            }
            other => panic!("expected serial, got {:?}", other),
        }

        let both = TransportConfig {
            port: Some("/dev/ttyUSB0".to_string()),
            simulate: true,
            ..transport_config()
        };
        assert!(matches!(
            Transport::from_config(&both),
            Err(RunnerError::ConflictingTransports)
        ));
    }

    #[test]
    fn test_tcp_link_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"nop\r\n");
            socket.write_all(b"OK\r\n").unwrap();
        });

        let mut link = TcpLink::connect(&addr, Duration::from_millis(500)).unwrap();
        link.write_all(b"nop\r\n").unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        while !received.ends_with(b"\r\n") {
            let n = link.read_chunk(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"OK\r\n");
        server.join().unwrap();

        // The server has hung up.
        assert_eq!(
            link.read_chunk(&mut buf).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
        link.close().unwrap();
        assert_eq!(
            link.write_all(b"nop\r\n").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_tcp_read_timeout_is_empty() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut link = TcpLink::connect(&addr, Duration::from_millis(20)).unwrap();
        let (_socket, _) = listener.accept().unwrap();
        assert_eq!(link.read_chunk(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn test_simulated_links_share_instrument() {
        let transport = Transport::from_config(&TransportConfig {
            simulate: true,
            ..transport_config()
        })
        .unwrap();
        let mut first = transport.connect().unwrap();
        first.write_all(b"conf_select:3\r\nnop\r\n").unwrap();
        first.close().unwrap();
        match &transport {
            Transport::Simulated(shared) => {
                assert_eq!(shared.lock().selected(), Some(3));
                assert_eq!(shared.links_opened(), 1);
            }
            other => panic!("expected simulated, got {:?}", other),
        }
        assert_eq!(transport.describe(), "simulated");
    }
}
