//! Binary entry point: parse arguments, resolve configuration, run one
//! sync, and exit non-zero on any fatal error.

use gitup::cli::{self, Command};
use gitup::config;
use gitup::errors::ConfigError;

fn main() {
    let parsed = match cli::parse_args() {
        Command::Version => {
            println!("gitup version {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Command::Run(parsed) => parsed,
    };

    let config_path = parsed
        .config_path
        .clone()
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());

    let config = match config::load(&config_path, &parsed) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gitup: {err}");
            if matches!(err, ConfigError::UnknownSection { .. }) {
                eprintln!();
                cli::print_usage(&config_path);
            }
            std::process::exit(1);
        }
    };

    if parsed.config_path.is_some() && config.verbosity > 0 {
        eprintln!("# Configuration file: {config_path}");
    }

    if let Err(err) = gitup::run(config) {
        eprintln!("gitup: {err}");
        std::process::exit(1);
    }
}
