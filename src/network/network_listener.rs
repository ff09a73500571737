//! # Network Listener Module
//!
//! The acceptor loop: accepts connections one at a time, turns on TCP
//! keep-alive, waits for an admission slot and hands each connection to its
//! own [`ConnectionHandler`] task.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    ┌──────────────────┐    ┌────────────────────┐
//! │ Incoming    │───▶│ NetworkListener  │───▶│ ConnectionHandler  │ (one task
//! │ Connections │    │                  │    │                    │  per
//! └─────────────┘    │ - accept         │    │ - read loop        │  connection)
//!                    │ - keep-alive     │    │ - telemetry        │
//!                    │ - admission slot │    │ - byte counter     │
//!                    └──────────────────┘    └────────────────────┘
//! ```
//!
//! While every slot is taken the loop sits in `acquire`, so no further
//! connection is accepted and new clients queue up in the kernel backlog.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::watch;
//! use tollgate::network::{AdmissionController, ByteCounter, ConnectionHandler, NetworkListener, TcpAcceptor};
//! use tollgate::telemetry::TelemetrySink;
//! use tollgate::error_handling::types::NetworkError;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), NetworkError> {
//!     let sink = Arc::new(TelemetrySink::from_writer(std::io::stderr()));
//!     let handler = ConnectionHandler::new(ByteCounter::new(), Arc::clone(&sink), 1024, 1024);
//!     let acceptor = TcpAcceptor::bind("127.0.0.1:2000".parse().unwrap(), Duration::from_secs(300)).await?;
//!
//!     let (_tx, rx) = watch::channel(false);
//!     let mut listener = NetworkListener::new(acceptor, AdmissionController::new(10), handler, sink);
//!     listener.run(rx).await;
//!     Ok(())
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::admission::AdmissionController;
use super::connection_handler::ConnectionHandler;
use super::types::ListenerState;
use crate::error_handling::types::{AdmissionError, NetworkError};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Source of inbound connections for the acceptor loop.
#[async_trait]
pub trait Acceptor: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Transport tuning for a freshly accepted stream. Failures are not fatal.
    fn configure(&self, _stream: &Self::Stream) -> io::Result<()> {
        Ok(())
    }
}

/// [`Acceptor`] over a bound TCP socket.
pub struct TcpAcceptor {
    listener: TcpListener,
    keepalive: Duration,
}

impl TcpAcceptor {
    /// Binds `addr`. `keepalive` is both the idle time before the first probe
    /// and the interval between probes.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindError`] if the address is in use, not local
    /// or needs privileges the process lacks.
    pub async fn bind(addr: SocketAddr, keepalive: Duration) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindError(addr, e))?;
        Ok(Self {
            listener,
            keepalive,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        let keepalive = TcpKeepalive::new()
            .with_time(self.keepalive)
            .with_interval(self.keepalive);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)
    }
}

/// Admission-controlled accept/dispatch loop.
pub struct NetworkListener<A: Acceptor> {
    acceptor: Option<A>,
    admission: AdmissionController,
    handler: ConnectionHandler,
    sink: Arc<TelemetrySink>,
    accept_error_backoff: Option<Duration>,
    state: ListenerState,
}

impl<A: Acceptor> NetworkListener<A> {
    pub fn new(
        acceptor: A,
        admission: AdmissionController,
        handler: ConnectionHandler,
        sink: Arc<TelemetrySink>,
    ) -> Self {
        Self {
            acceptor: Some(acceptor),
            admission,
            handler,
            sink,
            accept_error_backoff: None,
            state: ListenerState::Listening,
        }
    }

    /// Pause after each failed accept. Without one the loop retries at once.
    pub fn with_accept_error_backoff(mut self, backoff: Option<Duration>) -> Self {
        self.accept_error_backoff = backoff;
        self
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Fails once [`run`](Self::run) has returned and the acceptor is gone.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.acceptor {
            Some(acceptor) => acceptor.local_addr(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            )),
        }
    }

    fn transition(&mut self, next: ListenerState) {
        trace!("listener state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs the acceptor loop until `shutdown` turns `true`.
    ///
    /// Accept errors are recorded and the loop carries on. On shutdown the
    /// admission controller is closed, which also ends a wait for a slot; the
    /// connection accepted during that wait is shut down without being served.
    /// Handlers already running are left alone.
    ///
    /// The acceptor is dropped before `Listener closed` is recorded, so the
    /// listening socket is gone by then. A second call returns at once.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut acceptor = match self.acceptor.take() {
            Some(acceptor) => acceptor,
            None => {
                warn!("Listener already closed");
                return;
            }
        };

        match acceptor.local_addr() {
            Ok(addr) => {
                info!("Listening on {}", addr);
                self.sink.emit(TelemetryEvent::Listening { addr });
            }
            Err(e) => warn!("Listening on an unknown address: {}", e),
        }

        loop {
            self.transition(ListenerState::Accepting);

            let accepted = tokio::select! {
                res = acceptor.accept() => res,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };

            let (stream, remote) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting: {}", e);
                    self.sink.emit(TelemetryEvent::AcceptError {
                        error: e.to_string(),
                    });
                    if let Some(backoff) = self.accept_error_backoff {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = wait_for_shutdown(&mut shutdown) => break,
                        }
                    }
                    continue;
                }
            };
            debug!("Accepted connection from {}", remote);

            if let Err(e) = acceptor.configure(&stream) {
                debug!("Keep-alive not enabled for {}: {}", remote, e);
            }

            let acquired = tokio::select! {
                res = self.admission.acquire() => res,
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.admission.close();
                    Err(AdmissionError::Closed)
                }
            };

            let slot = match acquired {
                Ok(slot) => slot,
                Err(e) => {
                    error!("Failed to acquire admission slot for {}: {}", remote, e);
                    self.sink.emit(TelemetryEvent::AdmissionFailed {
                        error: e.to_string(),
                    });
                    abandon(stream, &self.sink).await;
                    break;
                }
            };

            self.transition(ListenerState::Dispatching);
            let handler = self.handler.clone();
            tokio::spawn(async move {
                handler.handle(stream, remote, slot).await;
            });
        }

        self.transition(ListenerState::ShuttingDown);
        self.admission.close();
        drop(acceptor);
        info!(
            "Listener stopped, {} connection(s) still in flight",
            self.admission.in_flight()
        );
        self.sink.emit(TelemetryEvent::ListenerClosed);
    }
}

/// Shuts down a connection that will not be served.
async fn abandon<S: AsyncWrite + Unpin>(mut stream: S, sink: &TelemetrySink) {
    if let Err(e) = stream.shutdown().await {
        sink.emit(TelemetryEvent::CloseError {
            error: e.to_string(),
        });
    }
}

/// Resolves once `true` has been sent. A dropped sender means no shutdown
/// will ever come.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
