// Deserialize the config file with serde
use serde::Deserialize;

// We need Duration to turn seconds into a Rust time value
use std::time::Duration;

use std::fs;
use std::path::Path;

use crate::error::{RelayError, Result};

//////////////////////
// LoggerConfig     //
//////////////////////

/// Where and how log lines are written
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum level ("trace", "debug", "info", "warn", "error")
    pub log_level: String,

    /// Colored lines on stdout
    pub enable_console_log: bool,

    /// Plain or JSON lines in `<log_file_path>/<name>.log`
    pub enable_file_log: bool,

    /// Directory for the log file (empty = current directory)
    pub log_file_path: String,

    /// Emit file lines as JSON envelopes
    pub enable_json_log: bool,

    /// chrono format string for timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            enable_json_log: false,
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

//////////////////////
// ServerConfig     //
//////////////////////

/// All the settings the relay needs. Every key is optional in the JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP or hostname to listen on
    pub host: String,

    /// Port number (0 picks an ephemeral port)
    pub port: u16,

    /// Longest accepted inbound line, newline excluded
    pub max_line_bytes: usize,

    /// Max messages each client can send per minute
    pub rate_limit_msgs_per_minute: u32,

    /// Seconds before we drop an idle client (None = never)
    pub client_timeout_secs: Option<u64>,

    /// Seconds between checking for idle clients
    pub timeout_check_interval_secs: u64,

    /// Milliseconds a single broadcast write may take before it counts as failed
    pub write_timeout_ms: u64,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// Milliseconds to wait for sessions to wind down on shutdown
    pub shutdown_grace_ms: u64,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    pub logger: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            max_line_bytes: 4096,
            rate_limit_msgs_per_minute: 300,
            client_timeout_secs: None,
            timeout_check_interval_secs: 30,
            write_timeout_ms: 5000,
            accept_error_backoff_ms: 100,
            shutdown_grace_ms: 2000,
            // Default worker threads = #cores minus one, but at least one
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            logger: LoggerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse a JSON document, filling in defaults for missing keys.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: ServerConfig = serde_json::from_str(raw)
            .map_err(|e| RelayError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|e| {
                    RelayError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_json_str(&raw)
            }
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_line_bytes == 0 {
            return Err(RelayError::Config("max_line_bytes must be > 0".into()));
        }
        if self.rate_limit_msgs_per_minute == 0 {
            return Err(RelayError::Config(
                "rate_limit_msgs_per_minute must be > 0".into(),
            ));
        }
        if self.timeout_check_interval_secs == 0 {
            return Err(RelayError::Config(
                "timeout_check_interval_secs must be > 0".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(RelayError::Config("worker_threads must be > 0".into()));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_timeout(&self) -> Option<Duration> {
        self.client_timeout_secs.map(Duration::from_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
