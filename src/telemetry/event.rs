//! Telemetry events emitted over a connection's lifetime.

use chrono::{DateTime, Local, SecondsFormat};
use std::fmt;
use std::net::SocketAddr;

/// One line of the telemetry log, without its timestamp prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Listening { addr: SocketAddr },
    AcceptError { error: String },
    AdmissionFailed { error: String },
    ConnectionReceived { remote: SocketAddr },
    ConnectionTime { at: DateTime<Local> },
    BytesReceived { bytes: usize, total: u64 },
    /// Payload already passed through [`sanitize_payload`].
    Message { payload: String },
    ClosedByClient,
    ReadError { error: String },
    CloseError { error: String },
    ListenerClosed,
    Fatal { cause: String },
}

impl TelemetryEvent {
    pub fn message(data: &[u8], max_chars: usize) -> Self {
        TelemetryEvent::Message {
            payload: sanitize_payload(data, max_chars),
        }
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEvent::Listening { addr } => write!(f, "Listening on {}", addr),
            TelemetryEvent::AcceptError { error } => write!(f, "Error accepting: {}", error),
            TelemetryEvent::AdmissionFailed { error } => {
                write!(f, "Failed to acquire admission slot: {}", error)
            }
            TelemetryEvent::ConnectionReceived { remote } => {
                write!(f, "Received connection from: {}", remote)
            }
            TelemetryEvent::ConnectionTime { at } => write!(
                f,
                "Time of connection: {}",
                at.to_rfc3339_opts(SecondsFormat::Secs, false)
            ),
            TelemetryEvent::BytesReceived { bytes, total } => write!(
                f,
                "Received {} bytes from the client. Total bytes received: {}",
                bytes, total
            ),
            TelemetryEvent::Message { payload } => write!(f, "Received message: {}", payload),
            TelemetryEvent::ClosedByClient => write!(f, "Connection closed by the client"),
            TelemetryEvent::ReadError { error } => write!(f, "Error reading: {}", error),
            TelemetryEvent::CloseError { error } => write!(f, "Error closing connection: {}", error),
            TelemetryEvent::ListenerClosed => write!(f, "Listener closed"),
            TelemetryEvent::Fatal { cause } => write!(f, "Fatal: {}", cause),
        }
    }
}

/// Renders raw bytes as a single printable line.
///
/// Invalid UTF-8 becomes U+FFFD, control characters are escaped (`\n`, `\u{1b}`)
/// and output past `max_chars` characters is cut and marked with `...`.
/// A literal backslash is doubled so it cannot pass for an escape.
pub fn sanitize_payload(data: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(data);
    let mut out = String::with_capacity(text.len().min(max_chars));
    let mut taken = 0;

    for c in text.chars() {
        if taken == max_chars {
            out.push_str("...");
            return out;
        }
        if c == '\\' {
            out.push_str("\\\\");
        } else if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
        taken += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bytes_received_line() {
        let event = TelemetryEvent::BytesReceived {
            bytes: 5,
            total: 42,
        };
        assert_eq!(
            event.to_string(),
            "Received 5 bytes from the client. Total bytes received: 42"
        );
    }

    #[test]
    fn test_connection_time_has_offset() {
        let at = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let line = TelemetryEvent::ConnectionTime { at }.to_string();

        assert!(line.starts_with("Time of connection: 2024-03-01T12:30:00"));
        // numeric offset, never `Z`
        let offset = &line[line.len() - 6..];
        assert!(offset.starts_with('+') || offset.starts_with('-'), "{}", line);
    }

    #[test]
    fn test_sanitize_escapes_newlines() {
        let out = sanitize_payload(b"GET / HTTP/1.1\r\nHost: x\r\n", 1024);
        assert_eq!(out, "GET / HTTP/1.1\\r\\nHost: x\\r\\n");
        assert!(!out.contains('\n'));
    }

    #[test]
    fn test_sanitize_keeps_literal_backslash_distinct() {
        let literal = sanitize_payload(b"a\\nb", 1024);
        let newline = sanitize_payload(b"a\nb", 1024);
        assert_eq!(literal, "a\\\\nb");
        assert_eq!(newline, "a\\nb");
        assert_ne!(literal, newline);
    }

    #[test]
    fn test_sanitize_binary() {
        let out = sanitize_payload(&[0x00, 0xff, b'o', b'k'], 1024);
        assert_eq!(out, "\\u{0}\u{fffd}ok");
    }

    #[test]
    fn test_sanitize_truncates() {
        assert_eq!(sanitize_payload(b"abcdef", 4), "abcd...");
        assert_eq!(sanitize_payload(b"abcd", 4), "abcd");
    }
}
