use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;

use crate::configuration::config::Config;
use crate::error_handling::types::*;
use crate::network::{
    AdmissionController, ByteCounter, ConnectionHandler, NetworkListener, TcpAcceptor,
};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Process wiring: the shared byte counter, the admission pool and the bound
/// listener, all built from one [`Config`].
pub struct Controller {
    config: Config,
    counter: ByteCounter,
    admission: AdmissionController,
    listener: NetworkListener<TcpAcceptor>,
}

impl Controller {
    /// Opens the telemetry log and binds the listening endpoint.
    ///
    /// Both failures are fatal for the process. A bind failure is also
    /// written to the telemetry log, which is open by then.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        info!("[+] Creating controller");
        config.validate()?;

        let sink = Arc::new(TelemetrySink::open(&config.log_file).map_err(|e| {
            error!("[!] {}", e);
            e
        })?);

        let addr = config.listen_addr()?;
        let acceptor = match TcpAcceptor::bind(addr, config.keepalive()).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!("[!] {}", e);
                sink.emit(TelemetryEvent::Fatal {
                    cause: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let counter = ByteCounter::new();
        let admission = AdmissionController::new(config.max_connections);
        let handler = ConnectionHandler::new(
            counter.clone(),
            Arc::clone(&sink),
            config.buffer_size,
            config.max_payload_chars,
        );
        let listener = NetworkListener::new(acceptor, admission.clone(), handler, Arc::clone(&sink))
            .with_accept_error_backoff(config.accept_error_backoff());

        Ok(Self {
            config,
            counter,
            admission,
            listener,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub fn total_bytes(&self) -> u64 {
        self.counter.get()
    }

    /// Serves until Ctrl-C (or SIGTERM on Unix).
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let (tx, rx) = watch::channel(false);

        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(
                |e| ControllerError::InitializationFailed(format!("SIGTERM handler: {}", e)),
            )?;

        tokio::spawn(async move {
            #[cfg(unix)]
            let terminated = terminate.recv();
            #[cfg(not(unix))]
            let terminated = std::future::pending::<Option<()>>();

            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!("[!] Unable to listen for Ctrl-C: {}", e);
                        return;
                    }
                    info!("[+] Ctrl-C received, shutting down");
                }
                _ = terminated => info!("[+] SIGTERM received, shutting down"),
            }
            let _ = tx.send(true);
        });

        self.run_until(rx).await;
        Ok(())
    }

    /// Serves until `shutdown` turns `true`.
    pub async fn run_until(&mut self, shutdown: watch::Receiver<bool>) {
        info!(
            "[+] Accepting up to {} concurrent connection(s), telemetry in {}",
            self.config.max_connections,
            self.config.log_file.display()
        );
        self.listener.run(shutdown).await;
        info!(
            "[+] Controller stopped: {} byte(s) received, {} handler(s) still running",
            self.counter.get(),
            self.admission.in_flight()
        );
    }
}
