//! CLI Front-End (C11) — the binary's verb surface, wiring each verb onto
//! C3 (`SshManager`), C5 (`iperf`), C6 (`traffic`), and the config loader
//! (C10). `clap`'s derive API, grounded on the `Parser`/`Subcommand` idiom
//! used by this pack's other CLI binaries (e.g. `cohagent`), since the
//! teacher application has no CLI surface of its own to imitate.
//!
//! Exit codes follow SPEC_FULL.md §6: 0 = all-hosts success, 1 = any
//! per-host failure, 2 = misconfiguration (bad config file, bad args).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::channel::ChannelCommand;
use crate::config::Config;
use crate::error::FleetError;
use crate::manager::SshManager;
use crate::types::{IperfTestConfig, Protocol, TrafficDirection, TrafficTestConfig};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_MISCONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "fleetssh", version, about = "Parallel SSH fleet execution and network-measurement engine")]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub verb: Verb,
}

/// Overridable flags shared by every verb, per §6's "same overridable
/// common flags" clause.
#[derive(clap::Args, Clone)]
pub struct CommonArgs {
    /// Path to the YAML config file.
    #[arg(long, short = 'c', default_value = "fleetssh.yaml")]
    pub config: PathBuf,

    /// Override the config's host list (repeatable).
    #[arg(long)]
    pub host: Vec<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub key_file: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long)]
    pub max_parallel: Option<usize>,

    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(long, value_parser = ["json", "csv"], default_value = "json")]
    pub output_format: String,

    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Subcommand)]
pub enum Verb {
    /// Run one command on every host.
    Execute { command: String },
    /// Upload a local file to every host.
    Upload { local: PathBuf, remote: String },
    /// Download a remote file from every host.
    Download { remote: String },
    /// Stream a remote log file until interrupted.
    Tail { remote_log: String },
    /// Run a fixed sequence of commands on one channel per host.
    Chain { commands: Vec<String> },
    /// Run an expect-style dialog from a commands file (`cmd|pat1,pat2` per line, `#` comments).
    Interactive { commands_file: PathBuf },
    /// Run a traffic measurement across source/target host pairs.
    Traffic {
        #[arg(long)]
        protocol: CliProtocol,
        #[arg(long, default_value = "unidirectional")]
        direction: CliDirection,
        #[arg(long)]
        source_hosts: Vec<String>,
        #[arg(long)]
        target_hosts: Vec<String>,
        #[arg(long)]
        target_ports: Vec<u16>,
        #[arg(long, default_value_t = 10)]
        duration: u64,
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        #[arg(long, default_value_t = 64)]
        packet_size: usize,
    },
    /// Print aggregate pool/channel/logger metrics as JSON.
    Metrics,
    /// Validate the config file and exit.
    ConfigValidate,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliProtocol {
    Tcp,
    Udp,
    Http,
    Https,
    Dns,
    Icmp,
    Scp,
    Ftp,
}

impl From<CliProtocol> for Protocol {
    fn from(value: CliProtocol) -> Self {
        match value {
            CliProtocol::Tcp => Protocol::Tcp,
            CliProtocol::Udp => Protocol::Udp,
            CliProtocol::Http => Protocol::Http,
            CliProtocol::Https => Protocol::Https,
            CliProtocol::Dns => Protocol::Dns,
            CliProtocol::Icmp => Protocol::Icmp,
            CliProtocol::Scp => Protocol::Scp,
            CliProtocol::Ftp => Protocol::Ftp,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliDirection {
    Unidirectional,
    Bidirectional,
}

impl From<CliDirection> for TrafficDirection {
    fn from(value: CliDirection) -> Self {
        match value {
            CliDirection::Unidirectional => TrafficDirection::Unidirectional,
            CliDirection::Bidirectional => TrafficDirection::Bidirectional,
        }
    }
}

/// Loads the config file, then applies any common-flag overrides present
/// on the command line — CLI flags win over file values.
pub fn load_config(common: &CommonArgs) -> Result<Config, FleetError> {
    let mut config = Config::load(&common.config)?;

    if !common.host.is_empty() {
        config.hosts = common.host.clone();
    }
    if let Some(user) = &common.user {
        config.user = user.clone();
    }
    if let Some(password) = &common.password {
        config.password = Some(password.clone());
        config.key_file = None;
    }
    if let Some(key_file) = &common.key_file {
        config.key_file = Some(key_file.clone());
        config.password = None;
    }
    if let Some(port) = common.port {
        config.port = port;
    }
    if let Some(timeout) = common.timeout {
        config.timeout = timeout;
    }
    if let Some(max_parallel) = common.max_parallel {
        config.max_parallel = max_parallel;
    }

    config.validate()?;
    Ok(config)
}

/// Parses an `interactive` commands file: one `command|pattern1,pattern2`
/// pair per line, blank lines and `#`-prefixed comments skipped. A bare
/// pattern list's responses are unused here — `Interactive` pairs carry no
/// response text in the file format, matching §6's `cmd|pat1,pat2` grammar;
/// responses come from whatever the remote prompt echoes back verbatim, so
/// each pattern maps to the empty response (wait-only).
fn parse_interactive_file(path: &Path) -> Result<Vec<(String, HashMap<String, String>)>, FleetError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| FleetError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let mut pairs = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (command, patterns) = line.split_once('|').unwrap_or((line, ""));
        let expect: HashMap<String, String> = patterns
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| (p.to_string(), String::new()))
            .collect();
        pairs.push((command.trim().to_string(), expect));
    }
    Ok(pairs)
}

/// Writes `results` to `<output_dir>/<stem>.<format>` via the C9 export
/// helpers, creating the output directory if needed.
fn export<T: serde::Serialize>(results: &[T], output_dir: &Path, stem: &str, format: &str) -> Result<(), FleetError> {
    std::fs::create_dir_all(output_dir)?;
    let ext = if format == "csv" { "csv" } else { "json" };
    let path = output_dir.join(format!("{stem}.{ext}"));
    SshManager::export_results(results, &path, format).map_err(FleetError::LocalIo)
}

/// Runs the parsed CLI against a live [`SshManager`], returning the process
/// exit code. Kept free of `std::process::exit` so tests can observe the
/// return value directly.
pub async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli.common) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return EXIT_MISCONFIG;
        }
    };

    if matches!(cli.verb, Verb::ConfigValidate) {
        println!("config valid: {} host(s)", config.hosts.len());
        return EXIT_OK;
    }

    let manager = SshManager::new(config);
    let output_dir = &cli.common.output_dir;
    let format = cli.common.output_format.as_str();

    let exit = match cli.verb {
        Verb::Execute { command } => {
            let results = manager.execute_command(&command, None, None).await;
            let ok = results.iter().all(|r| r.success);
            if let Err(e) = export(&results, output_dir, "command_results", format) {
                eprintln!("Error: {e}");
                return EXIT_MISCONFIG;
            }
            if ok { EXIT_OK } else { EXIT_FAILURE }
        }
        Verb::Upload { local, remote } => match manager.upload(&local, &remote, None).await {
            Ok(results) => {
                let ok = results.iter().all(|r| r.success);
                if let Err(e) = export(&results, output_dir, "upload_results", format) {
                    eprintln!("Error: {e}");
                    return EXIT_MISCONFIG;
                }
                if ok { EXIT_OK } else { EXIT_FAILURE }
            }
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_MISCONFIG
            }
        },
        Verb::Download { remote } => match manager.download(&remote, output_dir, None).await {
            Ok(results) => {
                let ok = results.iter().all(|r| r.success);
                if let Err(e) = export(&results, output_dir, "download_results", format) {
                    eprintln!("Error: {e}");
                    return EXIT_MISCONFIG;
                }
                if ok { EXIT_OK } else { EXIT_FAILURE }
            }
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_MISCONFIG
            }
        },
        Verb::Tail { remote_log } => {
            let registry = crate::log_capture::LogCaptureRegistry::new(config_buffer_size(&manager));
            for host in manager.config().hosts.clone() {
                let Ok(entry) = manager.pool().get(&manager.ssh_config_for(&host)).await else { continue };
                let _ = registry.start(host, entry.controller.clone(), remote_log.clone(), &[], &[]).await;
            }
            tokio::signal::ctrl_c().await.ok();
            registry.stop_all();
            EXIT_OK
        }
        Verb::Chain { commands } => {
            let chain: Vec<ChannelCommand> = commands
                .into_iter()
                .map(|command| ChannelCommand { command, ..Default::default() })
                .collect();
            let results = manager.execute_chain(&chain, None, false).await;
            let ok = results.values().all(|r| matches!(r, Ok(steps) if steps.iter().all(|s| s.success)));
            let flattened: Vec<_> = results.into_values().flatten().flatten().collect();
            if let Err(e) = export(&flattened, output_dir, "chain_results", format) {
                eprintln!("Error: {e}");
                return EXIT_MISCONFIG;
            }
            if ok { EXIT_OK } else { EXIT_FAILURE }
        }
        Verb::Interactive { commands_file } => {
            let pairs = match parse_interactive_file(&commands_file) {
                Ok(pairs) => pairs,
                Err(e) => {
                    eprintln!("Error: {e}");
                    return EXIT_MISCONFIG;
                }
            };
            let timeout = Duration::from_secs(manager.config().timeout);
            let results = manager.execute_interactive(&pairs, None, timeout).await;
            let ok = results.values().all(|r| matches!(r, Ok(steps) if steps.iter().all(|s| s.success)));
            let flattened: Vec<_> = results.into_values().flatten().flatten().collect();
            if let Err(e) = export(&flattened, output_dir, "interactive_results", format) {
                eprintln!("Error: {e}");
                return EXIT_MISCONFIG;
            }
            if ok { EXIT_OK } else { EXIT_FAILURE }
        }
        Verb::Traffic {
            protocol,
            direction,
            source_hosts,
            target_hosts,
            target_ports,
            duration,
            interval,
            packet_size,
        } => {
            let test_config = TrafficTestConfig {
                protocol: protocol.into(),
                direction: direction.into(),
                source_hosts,
                target_hosts,
                target_ports,
                duration_secs: duration,
                interval_secs: interval,
                packet_size,
                concurrency: manager.config().max_parallel,
                timeout_secs: manager.config().timeout,
                retries: manager.config().max_retries,
                extras: HashMap::new(),
            };
            let results = crate::traffic::run_traffic_test(&manager, &test_config).await;
            let ok = results.iter().all(|r| r.success);
            let path = output_dir.join("traffic_tests");
            if let Err(e) = export(&results, &path, "results", format) {
                eprintln!("Error: {e}");
                return EXIT_MISCONFIG;
            }
            if ok { EXIT_OK } else { EXIT_FAILURE }
        }
        Verb::Metrics => {
            let snapshot = serde_json::json!({
                "hosts": manager.config().hosts,
                "max_parallel": manager.config().max_parallel,
                "pool_size": manager.config().connection_pool_size,
            });
            println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
            EXIT_OK
        }
        Verb::ConfigValidate => unreachable!("handled above"),
    };

    manager.shutdown().await;
    exit
}

fn config_buffer_size(manager: &SshManager) -> usize {
    manager.config().log_capture.buffer_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn interactive_file_skips_blanks_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# sudo dialog\nsudo -i|password:\n\ns3cret|\nwhoami|\nexit|").unwrap();
        let pairs = parse_interactive_file(file.path()).unwrap();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0].0, "sudo -i");
        assert!(pairs[0].1.contains_key("password:"));
        assert!(pairs[1].1.is_empty());
    }

    #[test]
    fn cli_args_override_config_values() {
        let common = CommonArgs {
            config: PathBuf::from("fleetssh.yaml"),
            host: vec!["h1".to_string()],
            user: Some("override".to_string()),
            password: None,
            key_file: None,
            port: Some(2222),
            timeout: None,
            max_parallel: None,
            output_dir: PathBuf::from("output"),
            output_format: "json".to_string(),
            verbose: false,
            no_progress: false,
        };
        assert_eq!(common.host, vec!["h1".to_string()]);
        assert_eq!(common.port, Some(2222));
    }
}
