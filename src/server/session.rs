use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::time::{self, Duration, Instant};

use super::broadcaster::Broadcaster;
use super::connection::{Connection, ConnectionId};
use super::ratelimiter::RateLimiter;
use crate::config::ServerConfig;
use crate::error::{RegistrationError, RelayError};
use crate::logger::Logger;

pub const RATE_LIMIT_WARNING: &str = "Warning: You are sending messages too quickly. Please slow down.";
pub const IDLE_WARNING: &str = "Warning: You have been disconnected due to inactivity.";
pub const SHUTDOWN_WARNING: &str = "Warning: Server is shutting down.";

pub fn join_notice(name: &str) -> String {
    format!("{} has joined the chat", name)
}

pub fn leave_notice(name: &str) -> String {
    format!("{} has left the chat", name)
}

pub fn chat_line(name: &str, message: &str) -> String {
    format!("{}: {}", name, message)
}

/// Lifecycle of one session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Registering,
    Active,
    Closing,
    Closed,
}

/// Why an active session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed its side cleanly.
    Disconnected,
    ReadError,
    LineTooLong,
    IdleTimeout,
    /// A write to the client failed or timed out.
    WriteFailed,
    Shutdown,
}

/// The per-session subset of `ServerConfig`.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub rate_limit: u32,
    pub client_timeout: Option<Duration>,
    pub timeout_check_interval: Duration,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            rate_limit: config.rate_limit_msgs_per_minute,
            client_timeout: config.client_timeout(),
            timeout_check_interval: Duration::from_secs(config.timeout_check_interval_secs),
        }
    }
}

/// What a finished session reports back to whoever spawned it.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub id: ConnectionId,
    /// `None` if the session was stopped before it registered.
    pub name: Option<String>,
    pub reason: CloseReason,
}

enum Event {
    Line(Result<Option<String>, RelayError>),
    IdleCheck,
    WriteBroken,
    Shutdown,
}

/// Drives one connection from accept to close:
/// `Connecting → Registering → Active → Closing → Closed`.
pub struct SessionWorker<R> {
    connection: Connection<R>,
    broadcaster: Broadcaster,
    settings: SessionSettings,
    shutdown_rx: broadcast::Receiver<()>,
    logger: Logger,
    state: SessionState,
}

impl<R> SessionWorker<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(
        connection: Connection<R>,
        broadcaster: Broadcaster,
        settings: SessionSettings,
        shutdown_rx: broadcast::Receiver<()>,
        logger: Logger,
    ) -> Self {
        Self {
            connection,
            broadcaster,
            settings,
            shutdown_rx,
            logger,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        self.logger.debug(&format!(
            "{} ({}): {:?} -> {:?}",
            self.connection.id(),
            self.connection.handle().peer(),
            self.state,
            next
        ));
        self.state = next;
    }

    /// Run the session to completion.
    ///
    /// Returns `Err` only when the client never registered; in that case no
    /// registry entry was created and nothing was broadcast. Any failure after
    /// registration is reported through `SessionOutcome::reason` once teardown
    /// has finished.
    pub async fn run(mut self) -> Result<SessionOutcome, RelayError> {
        let id = self.connection.id();

        self.transition(SessionState::Registering);
        let name = match self.register().await {
            Ok(Some(name)) => name,
            Ok(None) => {
                self.finish().await;
                return Ok(SessionOutcome {
                    id,
                    name: None,
                    reason: CloseReason::Shutdown,
                });
            }
            Err(e) => {
                self.finish().await;
                return Err(e);
            }
        };

        self.transition(SessionState::Active);
        let reason = self.relay(&name).await;

        self.transition(SessionState::Closing);
        self.leave().await;
        self.finish().await;

        Ok(SessionOutcome {
            id,
            name: Some(name),
            reason,
        })
    }

    /// Wait for the display name, insert into the registry and announce the join.
    /// `Ok(None)` if the server shut down first.
    async fn register(&mut self) -> Result<Option<String>, RelayError> {
        let first = tokio::select! {
            line = self.connection.read_line() => line,
            _ = self.shutdown_rx.recv() => return Ok(None),
        };

        let name = match first {
            Ok(Some(line)) => line.trim().to_string(),
            Ok(None) => return Err(RegistrationError::StreamClosed.into()),
            Err(e) => return Err(e),
        };
        if name.is_empty() {
            return Err(RegistrationError::EmptyName.into());
        }

        let handle = self.connection.handle().clone();
        let id = handle.id();
        self.broadcaster.registry().register(handle, name.clone()).await;
        self.logger.info(&format!("👋 {} registered as \"{}\"", id, name));

        // The new client does not see its own join notice
        self.broadcaster.broadcast(&join_notice(&name), Some(id)).await;

        Ok(Some(name))
    }

    /// The read loop. Returns once the session should close.
    async fn relay(&mut self, name: &str) -> CloseReason {
        let id = self.connection.id();
        let mut limiter = RateLimiter::new(self.settings.rate_limit);
        let mut last_active = Instant::now();
        let mut idle_check = time::interval(self.settings.timeout_check_interval);
        let handle = self.connection.handle().clone();

        loop {
            let event = tokio::select! {
                line = self.connection.read_line() => Event::Line(line),
                _ = idle_check.tick() => Event::IdleCheck,
                _ = handle.broken() => Event::WriteBroken,
                _ = self.shutdown_rx.recv() => Event::Shutdown,
            };

            match event {
                Event::Line(Ok(Some(line))) => {
                    last_active = Instant::now();
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !limiter.check_limit() {
                        self.logger.warn(&format!("⏳ {} ({}) is over the rate limit", id, name));
                        self.notify(RATE_LIMIT_WARNING).await;
                        continue;
                    }
                    self.broadcaster.broadcast(&chat_line(name, &line), Some(id)).await;
                }
                Event::Line(Ok(None)) => {
                    self.logger.info(&format!("⚠️ {} ({}) disconnected gracefully.", id, name));
                    return CloseReason::Disconnected;
                }
                Event::Line(Err(RelayError::LineTooLong { max })) => {
                    self.logger.warn(&format!("✂️ {} ({}) sent a line over {} bytes", id, name, max));
                    return CloseReason::LineTooLong;
                }
                Event::Line(Err(e)) => {
                    self.logger.warn(&format!("❌ Error reading from {} ({}): {}", id, name, e));
                    return CloseReason::ReadError;
                }
                Event::IdleCheck => {
                    if let Some(timeout) = self.settings.client_timeout {
                        if last_active.elapsed() > timeout {
                            self.logger.info(&format!(
                                "⏰ {} ({}) timed out after {:?} of inactivity",
                                id, name, timeout
                            ));
                            self.notify(IDLE_WARNING).await;
                            return CloseReason::IdleTimeout;
                        }
                    }
                }
                Event::WriteBroken => {
                    self.logger.warn(&format!("❌ {} ({}) can no longer be written to", id, name));
                    return CloseReason::WriteFailed;
                }
                Event::Shutdown => {
                    self.logger.warn(&format!("🛑 {} ({}) disconnected due to shutdown.", id, name));
                    self.notify(SHUTDOWN_WARNING).await;
                    return CloseReason::Shutdown;
                }
            }
        }
    }

    /// Send a line to this client only. Bounded by the broadcaster's write
    /// timeout so a client that stopped reading cannot hold the session open.
    async fn notify(&self, line: &str) {
        let handle = self.connection.handle();
        if let Err(e) = handle.send_line(line, self.broadcaster.write_timeout()).await {
            self.logger.warn(&format!("❌ Notice to {} failed: {}", handle.id(), e));
        }
    }

    /// Unregister, then tell everyone left. The entry is gone before the
    /// connection is closed, so no broadcast can target a closed handle.
    async fn leave(&mut self) {
        let id = self.connection.id();
        if let Some(name) = self.broadcaster.registry().unregister(id).await {
            let remaining = self.broadcaster.registry().len().await;
            self.logger.info(&format!("🧼 {} ({}) removed; {} clients remain", id, name, remaining));
            self.broadcaster.broadcast(&leave_notice(&name), None).await;
        }
    }

    async fn finish(&mut self) {
        self.connection.handle().close().await;
        self.transition(SessionState::Closed);
    }
}
