/// === IMPORTS ===

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

// Tokio's non-blocking TCP listener and stream for incoming connections.
use tokio::net::{TcpListener, TcpStream};

// broadcast: one-to-many channel used as the stop signal.
use tokio::sync::broadcast;

// Tracks every spawned session so shutdown can wait for them.
use tokio::task::{JoinError, JoinSet};

use tokio::time::{self, Duration};

/// === MODULES ===

pub mod broadcaster;
pub mod connection;
pub mod ratelimiter;
pub mod registry;
pub mod session;

use crate::config::ServerConfig;
use crate::error::{RelayError, Result};
use crate::logger::Logger;

use self::broadcaster::Broadcaster;
use self::connection::Connection;
use self::registry::Registry;
use self::session::{SessionOutcome, SessionSettings, SessionWorker};

type SessionResult = std::result::Result<SessionOutcome, RelayError>;

enum AcceptEvent {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Finished(std::result::Result<SessionResult, JoinError>),
    Stop,
}

/// === RUN_SERVER ===

/// Bind the listener, install the ctrl-c stop signal and serve until it fires.
///
/// Only a bind failure is returned; everything after that is per-connection.
pub async fn run_server(config: ServerConfig, logger: Logger) -> Result<()> {
    let addr = config.address();
    let listener = TcpListener::bind(&addr).await?;
    logger.info(&format!("🚀 Chat relay listening on {}", listener.local_addr()?));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let shutdown_handle = spawn_shutdown_listener(shutdown_tx.clone(), logger.clone());

    let server = RelayServer::new(config, logger);
    server.serve(listener, shutdown_tx).await;

    shutdown_handle.abort();
    Ok(())
}

/// Spawn a task that waits for Ctrl+C and then fires the stop signal.
fn spawn_shutdown_listener(
    shutdown_tx: broadcast::Sender<()>,
    logger: Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            logger.error(&format!("Failed to listen for ctrl_c: {}", e));
            return;
        }
        logger.warn("🛑 Ctrl+C received — shutting down.");
        let _ = shutdown_tx.send(());
    })
}

/// === SERVER ===

/// Owns the registry for the lifetime of one `serve` call and hands it to
/// every session through the broadcaster.
pub struct RelayServer {
    config: ServerConfig,
    logger: Logger,
    broadcaster: Broadcaster,
}

impl RelayServer {
    pub fn new(config: ServerConfig, logger: Logger) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(registry, config.write_timeout(), logger.clone());
        Self {
            config,
            logger,
            broadcaster,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.broadcaster.registry().clone()
    }

    /// The acceptor loop.
    ///
    /// Accepts connections and spawns a session for each without waiting on
    /// it. A message on `shutdown_tx` stops accepting, releases the listener,
    /// gives sessions `shutdown_grace` to leave and then closes whatever is
    /// still registered.
    pub async fn serve(&self, listener: TcpListener, shutdown_tx: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut sessions: JoinSet<SessionResult> = JoinSet::new();

        loop {
            // Subscribed before the accept can resolve, so a stop sent in the
            // same round as the accept still reaches the new session.
            let session_rx = shutdown_tx.subscribe();
            let event = tokio::select! {
                accepted = listener.accept() => AcceptEvent::Accepted(accepted),
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    AcceptEvent::Finished(finished)
                }
                _ = shutdown_rx.recv() => AcceptEvent::Stop,
            };

            match event {
                AcceptEvent::Accepted(Ok((stream, addr))) => {
                    self.spawn_session(&mut sessions, stream, addr, session_rx);
                }
                AcceptEvent::Accepted(Err(e)) => {
                    // e.g. too many open files; back off briefly and keep going
                    self.logger.warn(&format!("⚠️ Failed to accept connection: {}", e));
                    time::sleep(Duration::from_millis(self.config.accept_error_backoff_ms)).await;
                }
                AcceptEvent::Finished(finished) => self.log_session_end(finished),
                AcceptEvent::Stop => {
                    self.logger.info("🧹 Server received shutdown signal.");
                    break;
                }
            }
        }

        drop(listener);
        self.wind_down(sessions).await;
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<SessionResult>,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        let connection = Connection::from_tcp(stream, addr, self.config.max_line_bytes);
        let id = connection.id();

        let worker = SessionWorker::new(
            connection,
            self.broadcaster.clone(),
            SessionSettings::from(&self.config),
            shutdown_rx,
            self.logger.clone(),
        );
        sessions.spawn(worker.run());

        self.logger.info(&format!(
            "🔌 {} connected as {}. Active sessions: {}",
            addr,
            id,
            sessions.len()
        ));
    }

    fn log_session_end(&self, finished: std::result::Result<SessionResult, JoinError>) {
        match finished {
            Ok(Ok(outcome)) => self.logger.info(&format!(
                "🔌 {} ({}) closed: {:?}",
                outcome.id,
                outcome.name.as_deref().unwrap_or("unregistered"),
                outcome.reason
            )),
            Ok(Err(e)) => self.logger.warn(&format!("⚠️ Session ended before registering: {}", e)),
            Err(e) => self.logger.error(&format!("Session task failed: {}", e)),
        }
    }

    async fn wind_down(&self, mut sessions: JoinSet<SessionResult>) {
        let grace = self.config.shutdown_grace();
        let drained = time::timeout(grace, async {
            while let Some(finished) = sessions.join_next().await {
                self.log_session_end(finished);
            }
        })
        .await;

        if drained.is_err() {
            self.logger.warn(&format!(
                "⏱️ {} sessions still running after {:?}; aborting them",
                sessions.len(),
                grace
            ));
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        // Anything still registered belongs to an aborted session
        for entry in self.broadcaster.registry().drain().await {
            entry.connection.close().await;
        }

        self.logger.info("🧼 Server stopped");
    }
}
