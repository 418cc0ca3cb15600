//! Iperf Orchestrator (C5) — two-phase `iperf3` server/client workflow
//! across host pairs, with PID-file lifecycle, JSON-then-text parsing, and
//! percentile/pass-fail summarization.
//!
//! Grounded on `original_source/vwt_monitor/iperf_manager.py` (phase
//! sequencing: start servers, settle, start clients, wait, collect, parse)
//! re-expressed around PID files per SPEC_FULL §4.5's expansion — the
//! reference's servers run for the process lifetime of the monitor instead
//! of being explicitly stopped, which doesn't fit a one-shot CLI.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::FleetError;
use crate::manager::SshManager;
use crate::ssh::HandleController;
use crate::transfer;
use crate::types::{percentiles, IperfRole, IperfTestConfig, IperfTestResult};

const SETTLE_TIME: Duration = Duration::from_secs(2);
const STOP_SAFETY: Duration = Duration::from_secs(5);

fn pair_remote_dir(config: &IperfTestConfig, client_host: &str, server_host: &str, port: u16) -> String {
    format!("{}/iperf/{client_host}_{server_host}_{port}", config.output_dir)
}

async fn exec_oneshot(controller: &HandleController, host: &str, command: &str) -> Result<(String, i32), FleetError> {
    let mut channel = controller
        .open_session_channel()
        .await
        .map_err(|e| FleetError::from_ssh(host.to_string(), e))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| FleetError::protocol(host.to_string(), format!("exec failed: {e}")))?;

    let mut stdout = Vec::new();
    let mut exit_code = 0i32;
    while let Some(msg) = channel.wait().await {
        match msg {
            russh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            russh::ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
            russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok((String::from_utf8_lossy(&stdout).into_owned(), exit_code))
}

/// Reads a PID file, sends `kill`, then removes the file. A missing PID
/// file is treated as already-stopped — this makes the call idempotent.
async fn stop_by_pidfile(controller: &HandleController, host: &str, pid_file: &str) -> Result<(), FleetError> {
    let (pid_out, code) = exec_oneshot(controller, host, &format!("cat -- '{pid_file}' 2>/dev/null")).await?;
    let pid = pid_out.trim();
    if code != 0 || pid.is_empty() {
        return Ok(());
    }
    exec_oneshot(
        controller,
        host,
        &format!("kill {pid} 2>/dev/null; rm -f -- '{pid_file}'"),
    )
    .await?;
    Ok(())
}

/// Runs one client/server iperf pair end to end: start server, settle,
/// start client, wait, stop both, collect result files, parse, summarize.
pub async fn run_pair(
    manager: &SshManager,
    client_host: &str,
    server_host: &str,
    port: u16,
    config: &IperfTestConfig,
) -> Result<IperfTestResult, FleetError> {
    let start = Utc::now();
    let remote_dir = pair_remote_dir(config, client_host, server_host, port);
    let server_out = format!("{remote_dir}/server.json");
    let server_pid = format!("{remote_dir}/server.pid");
    let client_out = format!("{remote_dir}/client.json");
    let client_pid = format!("{remote_dir}/client.pid");

    let server_entry = manager.pool().get(&manager.ssh_config_for(server_host)).await?;
    let client_entry = manager.pool().get(&manager.ssh_config_for(client_host)).await?;

    // Phase 1: start server, detached, PID recorded.
    let server_cmd = format!(
        "mkdir -p '{remote_dir}' && nohup iperf3 -s -J -p {port} > '{server_out}' 2>&1 & echo $! > '{server_pid}'"
    );
    exec_oneshot(&server_entry.controller, server_host, &server_cmd).await?;
    info!(server_host, port, "iperf server started");
    tokio::time::sleep(SETTLE_TIME).await;

    // Phase 2: start client, detached, PID recorded.
    let client_cmd = format!(
        "mkdir -p '{remote_dir}' && nohup iperf3 -c {server_host} -p {port} -O1 -P {streams} -M {mtu} -t {duration} -i {interval} -J \
         > '{client_out}' 2>&1 & echo $! > '{client_pid}'",
        streams = config.parallel_streams,
        mtu = config.mtu_size,
        duration = config.test_duration_secs,
        interval = config.interval_secs,
    );
    exec_oneshot(&client_entry.controller, client_host, &client_cmd).await?;
    info!(client_host, server_host, port, "iperf client started");

    // Phase 3: wait for the run plus a safety margin.
    tokio::time::sleep(Duration::from_secs(config.test_duration_secs) + STOP_SAFETY).await;

    // Phase 4: stop client then server, both idempotent.
    stop_by_pidfile(&client_entry.controller, client_host, &client_pid).await?;
    stop_by_pidfile(&server_entry.controller, server_host, &server_pid).await?;

    // Phase 5: collect result files to local storage.
    let local_dir = Path::new(&config.output_dir).join(format!("{client_host}_{server_host}_{port}"));
    let client_file = transfer::download(client_host, &client_entry.controller, &client_out, &local_dir).await;
    let server_file = transfer::download(server_host, &server_entry.controller, &server_out, &local_dir).await;

    let raw_output = match &client_file {
        Ok(result) => tokio::fs::read_to_string(&result.local_path).await.unwrap_or_default(),
        Err(e) => {
            warn!(client_host, "failed to collect iperf client output: {}", e);
            String::new()
        }
    };
    if let Err(e) = &server_file {
        warn!(server_host, "failed to collect iperf server output: {}", e);
    }

    // Phase 6/7: parse, then derive both the mean and the percentiles from
    // the same interval series (falling back to the single end-summary
    // value when no intervals were reported) so the two never disagree.
    let parsed = parse_iperf_output(&raw_output);
    let duration_secs = Utc::now().signed_duration_since(start).num_milliseconds() as f64 / 1000.0;
    let samples: &[f64] = if parsed.intervals_gbps.is_empty() {
        std::slice::from_ref(&parsed.average_gbps)
    } else {
        &parsed.intervals_gbps
    };
    let (average_gbps, percentiles_gbps) = summarize(samples);

    // Phase 8: pass/fail.
    let test_result_fail = evaluate_pass_fail(average_gbps, config.expected_result_gbps, config.tolerance_pct);

    Ok(IperfTestResult {
        client_host: client_host.to_string(),
        server_host: server_host.to_string(),
        role: IperfRole::Client,
        command: client_cmd,
        raw_output,
        start,
        end: Utc::now(),
        duration_secs,
        success: !raw_output_is_error(&parsed),
        bytes_sent: parsed.bytes_sent,
        bytes_received: parsed.bytes_received,
        average_throughput_gbps: average_gbps,
        percentiles_gbps,
        retransmits: parsed.retransmits,
        expected_result_gbps: config.expected_result_gbps,
        tolerance_pct: config.tolerance_pct,
        test_result_fail,
    })
}

fn raw_output_is_error(parsed: &ParsedIperf) -> bool {
    parsed.bytes_sent == 0 && parsed.average_gbps == 0.0
}

/// Reduces one sample series into the mean and the percentile block reported
/// alongside it, so both are always computed from the same data.
fn summarize(samples: &[f64]) -> (f64, crate::types::ThroughputPercentiles) {
    let average = samples.iter().sum::<f64>() / samples.len() as f64;
    (average, percentiles(samples))
}

/// `true` when the measured average misses both the expected throughput and
/// its tolerance floor.
fn evaluate_pass_fail(average_gbps: f64, expected: Option<f64>, tolerance_pct: Option<f64>) -> bool {
    match expected {
        Some(expected) => {
            let tolerance = tolerance_pct.unwrap_or(0.0);
            let floor = expected * (1.0 - tolerance / 100.0);
            average_gbps < expected && average_gbps < floor
        }
        None => false,
    }
}

struct ParsedIperf {
    bytes_sent: u64,
    bytes_received: u64,
    retransmits: u64,
    average_gbps: f64,
    intervals_gbps: Vec<f64>,
}

/// Tries the `-J` JSON payload first; falls back to the text-output regex
/// when JSON parsing fails (truncated payload, or `-J` unsupported).
fn parse_iperf_output(output: &str) -> ParsedIperf {
    if let Some(parsed) = parse_iperf_json(output) {
        return parsed;
    }
    parse_iperf_text(output)
}

fn parse_iperf_json(output: &str) -> Option<ParsedIperf> {
    let data: Value = serde_json::from_str(output).ok()?;
    let end = data.get("end")?;
    let sum_sent = end.get("sum_sent")?;
    let sum_received = end.get("sum_received")?;

    let bytes_sent = sum_sent.get("bytes").and_then(Value::as_u64).unwrap_or(0);
    let bytes_received = sum_received.get("bytes").and_then(Value::as_u64).unwrap_or(0);
    let retransmits = sum_sent.get("retransmits").and_then(Value::as_u64).unwrap_or(0);
    let average_bps = sum_received.get("bits_per_second").and_then(Value::as_f64).unwrap_or(0.0);

    let intervals_gbps = data
        .get("intervals")
        .and_then(Value::as_array)
        .map(|intervals| {
            intervals
                .iter()
                .filter_map(|interval| interval.get("sum")?.get("bits_per_second")?.as_f64())
                .map(|bps| bps / 1_000_000_000.0)
                .collect()
        })
        .unwrap_or_default();

    Some(ParsedIperf {
        bytes_sent,
        bytes_received,
        retransmits,
        average_gbps: average_bps / 1_000_000_000.0,
        intervals_gbps,
    })
}

fn parse_iperf_text(output: &str) -> ParsedIperf {
    let re = Regex::new(r"(\d+\.?\d*)\s+(G|M|K)?bits/sec").expect("static regex is valid");
    let average_gbps = re
        .captures_iter(output)
        .last()
        .and_then(|caps| {
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("M");
            Some(match unit {
                "G" => value,
                "K" => value / 1_000_000.0,
                _ => value / 1000.0,
            })
        })
        .unwrap_or(0.0);

    ParsedIperf {
        bytes_sent: 0,
        bytes_received: 0,
        retransmits: 0,
        average_gbps,
        intervals_gbps: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_JSON: &str = r#"{
        "intervals": [
            {"sum": {"bits_per_second": 8000000000.0}},
            {"sum": {"bits_per_second": 9000000000.0}}
        ],
        "end": {
            "sum_sent": {"bytes": 1000000, "bits_per_second": 8500000000.0, "retransmits": 3},
            "sum_received": {"bytes": 990000, "bits_per_second": 8400000000.0}
        }
    }"#;

    #[test]
    fn parses_json_payload() {
        let parsed = parse_iperf_json(SAMPLE_JSON).expect("valid json");
        assert_eq!(parsed.bytes_sent, 1000000);
        assert_eq!(parsed.retransmits, 3);
        assert!((parsed.average_gbps - 8.4).abs() < 1e-9);
        assert_eq!(parsed.intervals_gbps, vec![8.0, 9.0]);
    }

    #[test]
    fn falls_back_to_text_on_malformed_json() {
        let parsed = parse_iperf_output("not json at all, but [ 5]  9.50 Gbits/sec  receiver");
        assert!((parsed.average_gbps - 9.5).abs() < 1e-6);
    }

    #[test]
    fn pass_fail_uses_expected_and_tolerance() {
        // 7.5 is below expected (8.0) but within the 10% tolerance floor
        // (7.2), so the test should not be marked failed.
        assert!(!evaluate_pass_fail(7.5, Some(8.0), Some(10.0)));

        // 7.0 is below both the expected value and the tolerance floor, so
        // it should fail.
        assert!(evaluate_pass_fail(7.0, Some(8.0), Some(10.0)));
    }

    /// §8 scenario: 10 interval samples averaging exactly 8.0 Gbps. Against
    /// `expected=8.0`/`tolerance=10%` the run passes; against `expected=9.5`
    /// (floor 8.55, above the measured average) it fails.
    #[test]
    fn average_and_pass_fail_share_one_sample_source() {
        let gbps_values = [7.55, 7.65, 7.75, 7.85, 7.95, 8.05, 8.15, 8.25, 8.35, 8.45];
        let intervals_json: Vec<String> = gbps_values
            .iter()
            .map(|g| format!(r#"{{"sum": {{"bits_per_second": {}}}}}"#, g * 1_000_000_000.0))
            .collect();
        let json = format!(
            r#"{{
                "intervals": [{}],
                "end": {{
                    "sum_sent": {{"bytes": 1, "bits_per_second": 1.0, "retransmits": 0}},
                    "sum_received": {{"bytes": 1, "bits_per_second": 1.0}}
                }}
            }}"#,
            intervals_json.join(",")
        );

        let parsed = parse_iperf_json(&json).expect("valid json");
        let (average, _) = summarize(&parsed.intervals_gbps);
        assert!((average - 8.0).abs() < 1e-9);

        assert!(!evaluate_pass_fail(average, Some(8.0), Some(10.0)));
        assert!(evaluate_pass_fail(average, Some(9.5), Some(10.0)));
    }
}
