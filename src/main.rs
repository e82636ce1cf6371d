use std::path::PathBuf;
use std::process::ExitCode;

use chat_relay::{ServerConfig, start_server};

fn main() -> ExitCode {
    // Optional single argument: path to a JSON config file
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);

    let config = match ServerConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chat-relay: {}", e);
            return ExitCode::from(2);
        }
    };

    match start_server("chat_relay", config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("chat-relay: {}", e);
            ExitCode::FAILURE
        }
    }
}
