//! A newline-delimited TCP chat relay.
//!
//! Clients connect, send a display name as their first line, and every line
//! after that is relayed to all other connected clients as `"<name>: <line>"`.
//! Joins and departures are announced as `"<name> has joined the chat"` and
//! `"<name> has left the chat"`.

// Settings loaded from an optional JSON file.
pub mod config;

// Error taxonomy shared by every component.
pub mod error;

// fern-backed logging for lifecycle events and relayed messages.
pub mod logger;

// Registry, broadcaster, session workers and the acceptor loop.
pub mod server;

pub use config::{LoggerConfig, ServerConfig};
pub use error::{RegistrationError, RelayError, Result, WriteFailure};
pub use logger::{Logger, init_logger};
pub use server::{RelayServer, run_server};

/// Build a Tokio runtime sized by `worker_threads`, set up logging under
/// `name`, and run the relay until the stop signal fires.
///
/// Blocks the calling thread. Returns an error if the runtime cannot be built
/// or the listener cannot be bound.
pub fn start_server(name: &str, config: ServerConfig) -> Result<()> {
    config.validate()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("chat-relay-worker")
        .enable_all()
        .build()
        .map_err(|e| RelayError::Runtime(format!("Failed to build Tokio runtime: {}", e)))?;

    let logger = init_logger(name, &config.logger);

    rt.block_on(async {
        match run_server(config, logger.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                logger.error(&format!("Chat relay error: {}", e));
                Err(e)
            }
        }
    })
}
