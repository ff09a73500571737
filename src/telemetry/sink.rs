//! Append-only telemetry destination.
//!
//! The sink is opened once at startup and shared (behind an `Arc`) by the
//! acceptor loop and every connection handler. Each event is rendered to a
//! complete line first and handed to the writer in a single `write_all` while
//! the lock is held, so lines coming from concurrent handlers never interleave.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use log::{error, info, trace};

use super::event::TelemetryEvent;
use crate::error_handling::types::TelemetryError;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

pub struct TelemetrySink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl TelemetrySink {
    /// Opens `path` for appending, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::Open`] when the file cannot be created or
    /// opened; callers treat this as fatal.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TelemetryError::Open(path.to_path_buf(), e))?;

        info!("Telemetry log opened at {}", path.display());
        Ok(Self::from_writer(file))
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Appends one timestamped line for `event`.
    pub fn record(&self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let line = format!("{} {}\n", Local::now().format(TIMESTAMP_FORMAT), event);

        let mut writer = self.writer.lock().map_err(|_| TelemetryError::Poisoned)?;
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(TelemetryError::WriteFailed)?;

        trace!("telemetry: {}", event);
        Ok(())
    }

    /// Like [`record`](Self::record), but a failed write is only reported
    /// through the process log.
    pub fn emit(&self, event: TelemetryEvent) {
        if let Err(e) = self.record(&event) {
            error!("Dropped telemetry line \"{}\": {}", event, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// In-memory writer whose contents stay readable after the sink took it.
    #[derive(Clone, Default)]
    pub struct SharedBuffer {
        inner: Arc<Mutex<Vec<u8>>>,
    }

    impl SharedBuffer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.inner.lock().unwrap()).into_owned()
        }

        /// Logged lines with the timestamp prefix stripped.
        pub fn messages(&self) -> Vec<String> {
            self.contents()
                .lines()
                .map(|l| l.split_once(' ').map(|(_, m)| m).unwrap_or(l).to_string())
                .collect()
        }

        pub fn count_prefix(&self, prefix: &str) -> usize {
            self.messages()
                .iter()
                .filter(|m| m.starts_with(prefix))
                .count()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer that rejects everything.
    pub struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
