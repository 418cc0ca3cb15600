//! Traffic Tester (C6) — timed per-protocol probe loops reduced into
//! summary metric blocks.
//!
//! Grounded on `original_source/vwt_monitor/traffic_manager.py`'s
//! `protocol_handlers` dispatch and per-protocol probe bodies. TCP/UDP are
//! ported to native `tokio` sockets (in-process) rather than shelling a
//! remote client out, per SPEC_FULL §4.6's expansion of the reference's
//! open question; HTTP(S)/DNS/ICMP/SCP/FTP stay remote-exec via the SSH
//! Manager (C3) since they depend on tools assumed present on the remote
//! host, not this process.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::warn;

use crate::error::FleetError;
use crate::manager::SshManager;
use crate::types::{
    ConnectionMetrics, LatencyMetrics, PacketMetrics, Protocol, ThroughputMetrics, TrafficMetrics,
    TrafficTestConfig, TrafficTestResult,
};

/// p95/p99 require this many samples before being computed directly;
/// below it, both fall back to the sample max (spec §4.6).
const P95_MIN_SAMPLES: usize = 20;
const P99_MIN_SAMPLES: usize = 100;

struct Sample {
    latency_ms: Option<f64>,
    throughput_mbps: Option<f64>,
    connect_ms: Option<f64>,
    sent: bool,
    received: bool,
}

impl Sample {
    fn failed() -> Self {
        Self {
            latency_ms: None,
            throughput_mbps: None,
            connect_ms: None,
            sent: true,
            received: false,
        }
    }
}

/// Runs every `(source, target, port)` combination implied by
/// `config.source_hosts` × `config.target_hosts` × `config.target_ports`,
/// sequentially per source (different sources may overlap via C3's
/// semaphore on the underlying command calls).
pub async fn run_traffic_test(manager: &SshManager, config: &TrafficTestConfig) -> Vec<TrafficTestResult> {
    let mut results = Vec::new();
    for source in &config.source_hosts {
        for target in &config.target_hosts {
            for &port in &config.target_ports {
                results.push(run_single_test(manager, config, source, target, port).await);
            }
        }
    }
    results
}

async fn run_single_test(
    manager: &SshManager,
    config: &TrafficTestConfig,
    source: &str,
    target: &str,
    port: u16,
) -> TrafficTestResult {
    let test_id = uuid::Uuid::new_v4().to_string();
    let start = Utc::now();
    let deadline = Instant::now() + Duration::from_secs(config.duration_secs);
    let interval = Duration::from_secs_f64(config.interval_secs.max(0.0));

    let mut samples = Vec::new();
    while Instant::now() < deadline {
        let loop_start = Instant::now();
        let sample = probe(manager, config, source, target, port).await;
        if let Err(e) = &sample {
            warn!(source, target, port, "probe failed: {}", e);
        }
        samples.push(sample.unwrap_or_else(|_| Sample::failed()));

        let elapsed = loop_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }

    let metrics = reduce_metrics(config.protocol, &samples);
    let raw_samples = samples.iter().filter_map(|s| s.latency_ms.or(s.throughput_mbps)).collect();

    TrafficTestResult {
        test_id,
        protocol: config.protocol,
        direction: config.direction,
        source: source.to_string(),
        target: target.to_string(),
        port,
        start,
        end: Utc::now(),
        success: true,
        metrics: Some(metrics),
        raw_samples,
    }
}

async fn probe(
    manager: &SshManager,
    config: &TrafficTestConfig,
    source: &str,
    target: &str,
    port: u16,
) -> Result<Sample, FleetError> {
    match config.protocol {
        Protocol::Tcp => probe_tcp(config, target, port).await,
        Protocol::Udp => probe_udp(config, target, port).await,
        Protocol::Http => probe_http(manager, config, source, target, port, false).await,
        Protocol::Https => probe_http(manager, config, source, target, port, true).await,
        Protocol::Dns => probe_dns(manager, source, target).await,
        Protocol::Icmp => probe_icmp(manager, config, source, target).await,
        Protocol::Scp => probe_scp(manager, config, source, target, port).await,
        Protocol::Ftp => probe_ftp(manager, config, source, target, port).await,
    }
}

async fn probe_tcp(config: &TrafficTestConfig, target: &str, port: u16) -> Result<Sample, FleetError> {
    let sample_start = Instant::now();
    let connect_start = Instant::now();
    let mut stream = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        TcpStream::connect((target, port)),
    )
    .await
    .map_err(|_| FleetError::Timeout { host: target.to_string(), timeout_secs: config.timeout_secs })?
    .map_err(|e| FleetError::unreachable(target, e))?;
    let connect_ms = connect_start.elapsed().as_secs_f64() * 1000.0;

    let payload = vec![b'X'; config.packet_size];
    stream.write_all(&payload).await.map_err(FleetError::LocalIo)?;
    let mut buf = vec![0u8; config.packet_size];
    let n = stream.read(&mut buf).await.map_err(FleetError::LocalIo)?;

    let latency_ms = sample_start.elapsed().as_secs_f64() * 1000.0;
    let throughput_mbps = (payload.len() + n) as f64 / (latency_ms / 1000.0) / 1024.0 / 1024.0;

    Ok(Sample {
        latency_ms: Some(latency_ms),
        throughput_mbps: Some(throughput_mbps),
        connect_ms: Some(connect_ms),
        sent: true,
        received: true,
    })
}

async fn probe_udp(config: &TrafficTestConfig, target: &str, port: u16) -> Result<Sample, FleetError> {
    let sample_start = Instant::now();
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(FleetError::LocalIo)?;
    socket.connect((target, port)).await.map_err(|e| FleetError::unreachable(target, e))?;

    let payload = vec![b'X'; config.packet_size];
    socket.send(&payload).await.map_err(FleetError::LocalIo)?;

    let mut buf = vec![0u8; config.packet_size];
    match tokio::time::timeout(Duration::from_secs(config.timeout_secs), socket.recv(&mut buf)).await {
        Ok(Ok(n)) => {
            let latency_ms = sample_start.elapsed().as_secs_f64() * 1000.0;
            let throughput_mbps = (payload.len() + n) as f64 / (latency_ms / 1000.0) / 1024.0 / 1024.0;
            Ok(Sample {
                latency_ms: Some(latency_ms),
                throughput_mbps: Some(throughput_mbps),
                connect_ms: None,
                sent: true,
                received: true,
            })
        }
        // UDP is unreliable: a timed-out receive is a lost packet, not an error.
        _ => Ok(Sample::failed()),
    }
}

async fn run_on_source(manager: &SshManager, source: &str, command: &str) -> Result<(String, bool), FleetError> {
    let results = manager.execute_command(command, Some(&[source.to_string()]), None).await;
    let result = results.into_iter().next().ok_or_else(|| FleetError::Config("no result returned".into()))?;
    Ok((result.stdout, result.success))
}

async fn probe_http(
    manager: &SshManager,
    config: &TrafficTestConfig,
    source: &str,
    target: &str,
    port: u16,
    tls: bool,
) -> Result<Sample, FleetError> {
    let scheme = if tls { "https" } else { "http" };
    let verify_flag = if tls && !config.extras.get("verify_ssl").map(|v| v == "true").unwrap_or(true) {
        "-k "
    } else {
        ""
    };
    let command = format!(
        "curl -s {verify_flag}-w '%{{http_code}},%{{time_total}},%{{size_download}}' -o /dev/null {scheme}://{target}:{port}"
    );
    let (stdout, success) = run_on_source(manager, source, &command).await?;
    if !success {
        return Ok(Sample::failed());
    }
    let parts: Vec<&str> = stdout.trim().split(',').collect();
    if parts.len() < 3 {
        return Ok(Sample::failed());
    }
    let total_ms: f64 = parts[1].parse().unwrap_or(0.0) * 1000.0;
    let bytes: f64 = parts[2].parse().unwrap_or(0.0);
    Ok(Sample {
        latency_ms: Some(total_ms),
        throughput_mbps: Some(bytes / (total_ms / 1000.0).max(0.001) / 1024.0 / 1024.0),
        connect_ms: Some(total_ms),
        sent: true,
        received: true,
    })
}

async fn probe_dns(manager: &SshManager, source: &str, target: &str) -> Result<Sample, FleetError> {
    let sample_start = Instant::now();
    let (_stdout, success) = run_on_source(manager, source, &format!("nslookup {target}")).await?;
    if !success {
        return Ok(Sample::failed());
    }
    Ok(Sample {
        latency_ms: Some(sample_start.elapsed().as_secs_f64() * 1000.0),
        throughput_mbps: None,
        connect_ms: None,
        sent: true,
        received: true,
    })
}

async fn probe_icmp(manager: &SshManager, config: &TrafficTestConfig, source: &str, target: &str) -> Result<Sample, FleetError> {
    let command = format!("ping -c 1 -W {} {target}", config.timeout_secs);
    let (stdout, success) = run_on_source(manager, source, &command).await?;
    if !success {
        return Ok(Sample::failed());
    }
    let latency_ms = stdout
        .split("time=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.parse::<f64>().ok());
    match latency_ms {
        Some(ms) => Ok(Sample {
            latency_ms: Some(ms),
            throughput_mbps: None,
            connect_ms: None,
            sent: true,
            received: true,
        }),
        None => Ok(Sample::failed()),
    }
}

async fn probe_scp(manager: &SshManager, config: &TrafficTestConfig, source: &str, target: &str, port: u16) -> Result<Sample, FleetError> {
    let file_size = config.packet_size * 100;
    let remote_user = config.extras.get("scp_user").cloned().unwrap_or_else(|| "root".to_string());
    let tmp_name = format!("/tmp/fleetssh_traffic_{}", uuid::Uuid::new_v4());
    run_on_source(manager, source, &format!("dd if=/dev/zero of={tmp_name} bs={file_size} count=1 2>/dev/null")).await?;

    let transfer_start = Instant::now();
    let (_stdout, success) = run_on_source(
        manager,
        source,
        &format!("scp -P {port} -o StrictHostKeyChecking=no {tmp_name} {remote_user}@{target}:/tmp/"),
    )
    .await?;
    let transfer_secs = transfer_start.elapsed().as_secs_f64();
    let _ = run_on_source(manager, source, &format!("rm -f {tmp_name}")).await;

    if !success {
        return Ok(Sample::failed());
    }
    Ok(Sample {
        latency_ms: None,
        throughput_mbps: Some(file_size as f64 / transfer_secs.max(0.001) / 1024.0 / 1024.0),
        connect_ms: None,
        sent: true,
        received: true,
    })
}

async fn probe_ftp(manager: &SshManager, config: &TrafficTestConfig, source: &str, target: &str, port: u16) -> Result<Sample, FleetError> {
    let file_size = config.packet_size * 100;
    let user = config.extras.get("ftp_user").cloned().unwrap_or_default();
    let password = config.extras.get("ftp_password").cloned().unwrap_or_default();
    let tmp_name = format!("/tmp/fleetssh_traffic_{}", uuid::Uuid::new_v4());
    run_on_source(manager, source, &format!("dd if=/dev/zero of={tmp_name} bs={file_size} count=1 2>/dev/null")).await?;

    let script = format!(
        "ftp -n {target} {port} <<EOF\nuser {user} {password}\nput {tmp_name}\nquit\nEOF"
    );
    let transfer_start = Instant::now();
    let (_stdout, success) = run_on_source(manager, source, &script).await?;
    let transfer_secs = transfer_start.elapsed().as_secs_f64();
    let _ = run_on_source(manager, source, &format!("rm -f {tmp_name}")).await;

    if !success {
        return Ok(Sample::failed());
    }
    Ok(Sample {
        latency_ms: None,
        throughput_mbps: Some(file_size as f64 / transfer_secs.max(0.001) / 1024.0 / 1024.0),
        connect_ms: None,
        sent: true,
        received: true,
    })
}

fn reduce_metrics(protocol: Protocol, samples: &[Sample]) -> TrafficMetrics {
    let latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms).collect();
    let throughputs: Vec<f64> = samples.iter().filter_map(|s| s.throughput_mbps).collect();
    let connect_times: Vec<f64> = samples.iter().filter_map(|s| s.connect_ms).collect();
    let sent = samples.iter().filter(|s| s.sent).count() as u64;
    let received = samples.iter().filter(|s| s.received).count() as u64;

    let latency = if latencies.is_empty() { None } else { Some(latency_metrics(&latencies)) };
    let throughput = if throughputs.is_empty() { None } else { Some(throughput_metrics(&throughputs)) };

    let packets = matches!(protocol, Protocol::Tcp | Protocol::Udp | Protocol::Icmp).then(|| {
        let lost = sent.saturating_sub(received);
        PacketMetrics {
            packets_sent: sent,
            packets_received: received,
            packets_lost: lost,
            loss_percent: if sent > 0 { lost as f64 / sent as f64 * 100.0 } else { 0.0 },
        }
    });

    let connections = Some(ConnectionMetrics {
        attempted: sent,
        succeeded: received,
        failed_connections: sent.saturating_sub(received),
        success_rate: if sent > 0 { received as f64 / sent as f64 * 100.0 } else { 0.0 },
        mean_connect_time_ms: mean(&connect_times),
    });

    TrafficMetrics {
        latency,
        throughput,
        packets,
        connections,
        protocol_specific: std::collections::HashMap::new(),
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn latency_metrics(samples: &[f64]) -> LatencyMetrics {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let max = *sorted.last().unwrap();
    let mean_ms = mean(samples);
    let variance = if samples.len() > 1 {
        samples.iter().map(|v| (v - mean_ms).powi(2)).sum::<f64>() / (samples.len() - 1) as f64
    } else {
        0.0
    };

    LatencyMetrics {
        min_ms: sorted[0],
        max_ms: max,
        mean_ms,
        median_ms: percentile_of(&sorted, 50.0),
        p95_ms: if sorted.len() >= P95_MIN_SAMPLES { percentile_of(&sorted, 95.0) } else { max },
        p99_ms: if sorted.len() >= P99_MIN_SAMPLES { percentile_of(&sorted, 99.0) } else { max },
        stddev_ms: variance.sqrt(),
    }
}

fn percentile_of(sorted: &[f64], p: f64) -> f64 {
    let rank = (p / 100.0 * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn throughput_metrics(samples: &[f64]) -> ThroughputMetrics {
    ThroughputMetrics {
        min_mbps: samples.iter().cloned().fold(f64::INFINITY, f64::min),
        mean_mbps: mean(samples),
        peak_mbps: samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p95_falls_back_to_max_below_threshold() {
        let samples: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let metrics = latency_metrics(&samples);
        assert_eq!(metrics.p95_ms, 10.0);
        assert_eq!(metrics.p99_ms, 10.0);
    }

    #[test]
    fn p95_computed_directly_at_threshold() {
        let samples: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let metrics = latency_metrics(&samples);
        assert!(metrics.p95_ms < 20.0);
    }

    #[test]
    fn packet_loss_percent_matches_sent_received() {
        let samples = vec![Sample::failed(), Sample::failed()];
        let metrics = reduce_metrics(Protocol::Udp, &samples);
        let packets = metrics.packets.unwrap();
        assert_eq!(packets.packets_sent, 2);
        assert_eq!(packets.packets_received, 0);
        assert_eq!(packets.loss_percent, 100.0);
    }

    #[test]
    fn throughput_block_omitted_when_no_samples_captured() {
        let samples = vec![Sample::failed()];
        let metrics = reduce_metrics(Protocol::Tcp, &samples);
        assert!(metrics.throughput.is_none());
    }

    /// §8 scenario: 5 TCP probe RTTs with one outlier. p95/p99 fall back to
    /// the sample max since 5 samples is below the 20/100 thresholds.
    #[test]
    fn latency_metrics_match_five_sample_rtt_scenario() {
        let samples = vec![10.0, 12.0, 11.0, 300.0, 13.0];
        let metrics = latency_metrics(&samples);
        assert_eq!(metrics.min_ms, 10.0);
        assert_eq!(metrics.max_ms, 300.0);
        assert_eq!(metrics.median_ms, 12.0);
        assert!((metrics.mean_ms - 69.2).abs() < 0.1);
        assert_eq!(metrics.p95_ms, 300.0);
        assert_eq!(metrics.p99_ms, 300.0);
    }
}
