//! Shared result/record types (C9), re-expressed from the Python original's
//! dataclasses (`CommandResult`, `FileTransferResult` in `ssh_manager.py`;
//! the traffic/iperf/log dataclasses in their respective modules) as
//! `serde`-derived structs so every component can export results uniformly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub host: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

impl CommandResult {
    pub fn failed(host: impl Into<String>, command: impl Into<String>, error: impl std::fmt::Display, timestamp: DateTime<Utc>) -> Self {
        Self {
            host: host.into(),
            command: command.into(),
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: -1,
            duration_secs: 0.0,
            timestamp,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferResult {
    pub host: String,
    pub direction: TransferDirection,
    pub local_path: String,
    pub remote_path: String,
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    /// Present only when checksum verification was enabled and the remote
    /// MD5 was captured. Comparing it against the local file is the
    /// caller's responsibility (see DESIGN.md open-question decisions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of a channel's state machine position at the time a result was
/// produced (for diagnostics / the interactive command's output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Created,
    Sending,
    Reading,
    Responding,
    Idle,
    Completed,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub state: ChannelState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Scan a line for case-varied level tokens; default INFO (spec §4.4 step 5).
    pub fn detect(line: &str) -> Self {
        let upper = line.to_uppercase();
        if upper.contains("CRITICAL") || upper.contains("FATAL") {
            LogLevel::Critical
        } else if upper.contains("ERROR") {
            LogLevel::Error
        } else if upper.contains("WARN") {
            LogLevel::Warning
        } else if upper.contains("DEBUG") {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub host: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tid: Option<u32>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

// --- Traffic testing (C6) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
    Dns,
    Icmp,
    Scp,
    Ftp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficDirection {
    Unidirectional,
    Bidirectional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficTestConfig {
    pub protocol: Protocol,
    pub direction: TrafficDirection,
    pub source_hosts: Vec<String>,
    pub target_hosts: Vec<String>,
    pub target_ports: Vec<u16>,
    pub duration_secs: u64,
    pub interval_secs: f64,
    pub packet_size: usize,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub retries: u32,
    #[serde(default)]
    pub extras: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub stddev_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub min_mbps: f64,
    pub mean_mbps: f64,
    pub peak_mbps: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketMetrics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub loss_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed_connections: u64,
    pub success_rate: f64,
    pub mean_connect_time_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput: Option<ThroughputMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<PacketMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<ConnectionMetrics>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub protocol_specific: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficTestResult {
    pub test_id: String,
    pub protocol: Protocol,
    pub direction: TrafficDirection,
    pub source: String,
    pub target: String,
    pub port: u16,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TrafficMetrics>,
    pub raw_samples: Vec<f64>,
}

// --- Iperf (C5) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IperfTestConfig {
    pub test_duration_secs: u64,
    pub parallel_streams: u32,
    pub mtu_size: u32,
    pub interval_secs: u32,
    pub output_dir: String,
    #[serde(default)]
    pub expected_result_gbps: Option<f64>,
    #[serde(default)]
    pub tolerance_pct: Option<f64>,
}

impl Default for IperfTestConfig {
    fn default() -> Self {
        Self {
            test_duration_secs: 10,
            parallel_streams: 1,
            mtu_size: 1460,
            interval_secs: 1,
            output_dir: "iperf_results".to_string(),
            expected_result_gbps: None,
            tolerance_pct: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IperfRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputPercentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IperfTestResult {
    pub client_host: String,
    pub server_host: String,
    pub role: IperfRole,
    pub command: String,
    pub raw_output: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: f64,
    pub success: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub average_throughput_gbps: f64,
    pub percentiles_gbps: ThroughputPercentiles,
    pub retransmits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_result_gbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance_pct: Option<f64>,
    pub test_result_fail: bool,
}

/// Percentiles at 10/25/50/75/90/99, matching C5's summarization step.
/// `samples` must be non-empty.
pub fn percentiles(samples: &[f64]) -> ThroughputPercentiles {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let pick = |p: f64| -> f64 {
        if sorted.is_empty() {
            return 0.0;
        }
        let rank = (p / 100.0 * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    };
    ThroughputPercentiles {
        p10: pick(10.0),
        p25: pick(25.0),
        p50: pick(50.0),
        p75: pick(75.0),
        p90: pick(90.0),
        p99: pick(99.0),
    }
}

/// Result export shared by every component — JSON array or CSV table.
///
/// CSV export requires `T: serde::Serialize` to flatten into a record; the
/// `csv` crate's `Writer` handles the header row from the struct's field
/// names via `serde`.
pub fn export_json<T: Serialize>(results: &[T], path: &std::path::Path) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

pub fn export_csv<T: Serialize>(results: &[T], path: &std::path::Path) -> std::io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in results {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_monotonicity() {
        let samples = vec![10.0, 12.0, 11.0, 300.0, 13.0];
        let p = percentiles(&samples);
        assert!(p.p10 <= p.p25);
        assert!(p.p25 <= p.p50);
        assert!(p.p50 <= p.p75);
        assert!(p.p75 <= p.p90);
        assert!(p.p90 <= p.p99);
    }

    #[test]
    fn log_level_detection_defaults_info() {
        assert_eq!(LogLevel::detect("just some text"), LogLevel::Info);
        assert_eq!(LogLevel::detect("ERROR: failed"), LogLevel::Error);
        assert_eq!(LogLevel::detect("warning: low disk"), LogLevel::Warning);
        assert_eq!(LogLevel::detect("FATAL crash"), LogLevel::Critical);
    }
}
