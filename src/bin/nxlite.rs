//! CLI entry point: `nxlite [config_path]`.
//!
//! Parses an optional config file path, loads configuration, initializes
//! logging, and hands off to the master process. The only logic here is
//! argument handling and translating the master's shutdown into an exit
//! code — everything else lives in the library.

use nxlite::server::master;
use nxlite::{logging, Configuration};
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "./nxlite.conf";

fn main() {
    logging::init_tracing();

    let explicit_arg = std::env::args().nth(1);
    let config_path = explicit_arg
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if config_path.exists() {
        match Configuration::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        }
    } else if explicit_arg.is_some() {
        tracing::error!(path = %config_path.display(), "config path given but does not exist");
        std::process::exit(1);
    } else {
        tracing::info!("no config file found, using built-in defaults");
        Configuration::default()
    };

    let code = master::run(config, config_path);
    std::process::exit(code);
}
