//! Binary entry point. Parses the CLI (C11), installs the structured
//! logger (C8) before any SSH work starts, then dispatches the requested
//! verb and exits with the code it reports.

use clap::Parser;
use fleetssh::cli::{self, Cli};
use fleetssh::config::Config;
use fleetssh::logger::StructuredLogger;

fn main() {
    let cli = Cli::parse();

    let mut config = cli::load_config(&cli.common).unwrap_or_else(|_| placeholder_config());
    if cli.common.verbose {
        config.log_level = "debug".to_string();
    }
    let _logger = StructuredLogger::init(&config);

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime")
        .block_on(cli::run(cli));

    std::process::exit(exit_code);
}

/// Used only to seed the logger when the real config fails to load —
/// `cli::run` re-validates and reports the actual error afterward.
fn placeholder_config() -> Config {
    Config {
        hosts: Vec::new(),
        user: String::new(),
        password: None,
        key_file: None,
        port: 22,
        timeout: 30,
        max_parallel: 1,
        log_level: "info".to_string(),
        log_file: None,
        log_format: "text".to_string(),
        connection_pool_size: 1,
        connection_idle_timeout: 300,
        max_retries: 3,
        retry_delay: 4,
        jumphost: None,
        log_capture: Default::default(),
        file_transfer: Default::default(),
        security: Default::default(),
    }
}
