//! Telemetry subsystem.
//!
//! - `event`: the kinds of line written for the connection lifecycle, and how
//!   payloads are made safe to print.
//! - `sink`: the append-only, line-atomic destination those lines go to.

pub mod event;
pub mod sink;

pub use event::TelemetryEvent;
pub use sink::TelemetrySink;
