// Local time for log timestamps
use chrono::Local;

// Level filter parsed from the config
use log::LevelFilter;

// Dispatch builder plus level coloring for the console branch
use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};

use serde_json::Value as JsonValue;

use std::{fs, io};

// The global dispatcher can only be installed once per process
use std::sync::OnceLock;

use crate::config::LoggerConfig;

/// Clonable handle passed to every task.
///
/// All methods go through the `log` facade, so before `init_logger` runs
/// (e.g. in tests) they are silent no-ops.
#[derive(Clone, Debug, Default)]
pub struct Logger;

impl Logger {
    pub fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    pub fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }
}

static LOGGER: OnceLock<Logger> = OnceLock::new();

/// Build the JSON envelope written to the log file when `enable_json_log` is set.
pub fn json_envelope(timestamp: &str, name: &str, level: log::Level, message: &str) -> JsonValue {
    serde_json::json!({
        "timestamp": timestamp,
        "name":      name,
        "level":     level.to_string(),
        "message":   message,
    })
}

/// `<dir>/<name>.log`, with dots in the name turned into underscores.
pub fn log_file_name(dir: &str, name: &str) -> String {
    let safe_name = name.replace('.', "_");
    if dir.is_empty() {
        format!("{}.log", safe_name)
    } else {
        format!("{}/{}.log", dir.trim_end_matches('/'), safe_name)
    }
}

/// Install the global fern dispatcher exactly once and return a handle.
/// Later calls ignore their arguments and return the same handle.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            // Unknown level strings fall back to Info
            let level = cfg.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

            let mut base = Dispatch::new().level(level);

            // ── console: colored level, green timestamp, blue name ──
            if cfg.enable_console_log {
                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let colors = ColoredLevelConfig::new()
                    .info(Color::Green)
                    .warn(Color::Yellow)
                    .error(Color::Red)
                    .debug(Color::Blue)
                    .trace(Color::Magenta);

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            out.finish(format_args!(
                                "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                                Local::now().format(&datefmt),
                                nm,
                                colors.color(record.level()),
                                message
                            ))
                        })
                        .chain(io::stdout()),
                );
            }

            // ── file: plain text or JSON envelope per line ──
            if cfg.enable_file_log {
                if !cfg.log_file_path.is_empty() {
                    let _ = fs::create_dir_all(&cfg.log_file_path);
                }

                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let enable_json = cfg.enable_json_log;
                let filepath = log_file_name(&cfg.log_file_path, name);

                // Don't panic on a bad path, just log nowhere
                let file_output: Box<dyn io::Write + Send> = match fern::log_file(&filepath) {
                    Ok(fh) => Box::new(fh),
                    Err(err) => {
                        eprintln!("Warning: could not open log file {}: {}", filepath, err);
                        Box::new(io::sink())
                    }
                };

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            let timestamp = Local::now().format(&datefmt).to_string();
                            if enable_json {
                                let envelope = json_envelope(
                                    &timestamp,
                                    &nm,
                                    record.level(),
                                    &message.to_string(),
                                );
                                out.finish(format_args!("{}", envelope))
                            } else {
                                out.finish(format_args!(
                                    "{} - {} - {} - {}",
                                    timestamp,
                                    nm,
                                    record.level(),
                                    message
                                ))
                            }
                        })
                        .chain(file_output),
                );
            }

            // Another global logger may already be installed (e.g. by an embedding app)
            if let Err(e) = base.apply() {
                eprintln!("Warning: logger already initialised: {}", e);
            }

            Logger
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_replaces_dots() {
        assert_eq!(log_file_name("", "relay.main"), "relay_main.log");
        assert_eq!(log_file_name("logs/", "relay"), "logs/relay.log");
    }

    #[test]
    fn envelope_carries_all_fields() {
        let v = json_envelope("2026-01-01 00:00:00", "relay", log::Level::Warn, "alice: hi");
        assert_eq!(v["level"], "WARN");
        assert_eq!(v["name"], "relay");
        assert_eq!(v["message"], "alice: hi");
    }
}
