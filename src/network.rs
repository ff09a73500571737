//! Network side: the admission-controlled acceptor loop and the
//! per-connection handlers it dispatches.

pub mod admission;
pub mod connection_handler;
pub mod network_listener;
pub mod types;

pub use admission::{AdmissionController, AdmissionSlot};
pub use connection_handler::ConnectionHandler;
pub use network_listener::{Acceptor, NetworkListener, TcpAcceptor};
pub use types::{ByteCounter, ConnectionSummary, ExitReason, ListenerState};
