use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide count of bytes read across every connection.
///
/// Clones share the same counter. Additions are a single atomic `fetch_add`,
/// so concurrent handlers never lose an update and the totals they observe
/// only ever grow.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter {
    total: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `bytes` and returns the total including them.
    pub fn add(&self, bytes: u64) -> u64 {
        self.total.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub fn get(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }
}

/// Where the acceptor loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Endpoint bound, loop not started yet.
    Listening,
    /// Waiting on accept or on an admission slot.
    Accepting,
    /// Spawning a handler for an admitted connection.
    Dispatching,
    ShuttingDown,
}

/// How a connection handler's read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    ClosedByClient,
    ReadError(String),
}

/// Outcome of one handled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub remote: SocketAddr,
    pub bytes_read: u64,
    pub reads: usize,
    pub exit: ExitReason,
    /// Set when shutting the connection down failed; never fatal.
    pub close_error: Option<String>,
}
