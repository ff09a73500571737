//! Per-connection read loop.
//!
//! A [`ConnectionHandler`] drains one accepted connection until the peer closes
//! it or a read fails. Each chunk is recorded to the telemetry sink and added
//! to the process-wide [`ByteCounter`]. Whatever ends the loop, the connection
//! is shut down and its admission slot goes back to the pool, once.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Local;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use super::admission::AdmissionSlot;
use super::types::{ByteCounter, ConnectionSummary, ExitReason};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Bytes of each chunk shown in trace output.
const PREVIEW_LEN: usize = 64;

/// Shared, cheaply clonable state every handler runs with.
#[derive(Clone)]
pub struct ConnectionHandler {
    counter: ByteCounter,
    sink: Arc<TelemetrySink>,
    buffer_size: usize,
    max_payload_chars: usize,
}

impl ConnectionHandler {
    pub fn new(
        counter: ByteCounter,
        sink: Arc<TelemetrySink>,
        buffer_size: usize,
        max_payload_chars: usize,
    ) -> Self {
        Self {
            counter,
            sink,
            buffer_size,
            max_payload_chars,
        }
    }

    #[cfg(test)]
    pub(crate) fn counter(&self) -> &ByteCounter {
        &self.counter
    }

    /// Services `stream` until end-of-stream or a read error.
    ///
    /// Per chunk of `n` bytes the sink receives, in order: the remote
    /// endpoint, the wall-clock time, `n` with the updated total, and the
    /// sanitized payload. `slot` is released after the stream has been shut
    /// down, on every exit path.
    pub async fn handle<S>(
        &self,
        mut stream: S,
        remote: SocketAddr,
        slot: AdmissionSlot,
    ) -> ConnectionSummary
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = Uuid::new_v4();
        debug!("[{}] handling connection from {}", id, remote);

        let mut buf = vec![0u8; self.buffer_size];
        let mut bytes_read = 0u64;
        let mut reads = 0usize;

        let exit = loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) => {
                    self.sink.emit(TelemetryEvent::ClosedByClient);
                    break ExitReason::ClosedByClient;
                }
                Ok(n) => n,
                Err(e) => {
                    self.sink.emit(TelemetryEvent::ReadError {
                        error: e.to_string(),
                    });
                    break ExitReason::ReadError(e.to_string());
                }
            };

            self.sink.emit(TelemetryEvent::ConnectionReceived { remote });
            self.sink.emit(TelemetryEvent::ConnectionTime { at: Local::now() });

            let total = self.counter.add(n as u64);
            self.sink.emit(TelemetryEvent::BytesReceived { bytes: n, total });
            self.sink
                .emit(TelemetryEvent::message(&buf[..n], self.max_payload_chars));

            bytes_read += n as u64;
            reads += 1;

            let preview = &buf[..n.min(PREVIEW_LEN)];
            trace!(
                "[{}] read {} bytes: {}{}",
                id,
                n,
                String::from_utf8_lossy(preview),
                if n > PREVIEW_LEN { " ..." } else { "" }
            );
        };

        let close_error = match stream.shutdown().await {
            Ok(()) => None,
            Err(e) => {
                self.sink.emit(TelemetryEvent::CloseError {
                    error: e.to_string(),
                });
                Some(e.to_string())
            }
        };
        drop(stream);
        slot.release();

        debug!(
            "[{}] connection from {} finished: {:?}, {} bytes in {} read(s)",
            id, remote, exit, bytes_read, reads
        );

        ConnectionSummary {
            remote,
            bytes_read,
            reads,
            exit,
            close_error,
        }
    }
}
