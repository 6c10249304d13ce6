//! Destinations for measured values.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Receives every value the poller publishes.
pub trait ValueSink: Send {
    /// Record one value.
    fn write_value(&mut self, value: f64) -> io::Result<()>;

    /// Flush and release the destination. Called once when the sink is
    /// detached or the poller finishes.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Name for logs.
    fn describe(&self) -> String {
        "sink".to_string()
    }
}

/// Format a value as written to text sinks: always with a decimal point.
pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Appends one value per line to a text file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    /// Open `path` for appending, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileSink {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ValueSink for FileSink {
    fn write_value(&mut self, value: f64) -> io::Result<()> {
        writeln!(self.writer, "{}", format_value(value))?;
        self.writer.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Collects values in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    values: Arc<Mutex<Vec<f64>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values recorded so far.
    pub fn values(&self) -> Vec<f64> {
        self.values.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl ValueSink for MemorySink {
    fn write_value(&mut self, value: f64) -> io::Result<()> {
        self.values.lock().push(value);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
