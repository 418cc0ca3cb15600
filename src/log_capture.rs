//! Log Capture (C4) — per-host `tail -f` ingestion, parsing, filtering, and
//! a bounded recent-entries window.
//!
//! Grounded on `channel/mod.rs`'s poll-and-drain shape (timeout-gated
//! `channel.wait()` as a stand-in for readiness polling) and on
//! `ring_buffer::RingBuffer` for the bounded window, matching the Python
//! original's `log_capture.py::_tail_loop` (spawn `tail -f`, read lines,
//! filter, parse, append) but torn down by closing the exec channel rather
//! than PID bookkeeping — no local process is spawned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use regex::RegexSet;
use tracing::{debug, warn};

use crate::error::FleetError;
use crate::ring_buffer::RingBuffer;
use crate::ssh::HandleController;
use crate::types::{LogEntry, LogLevel};

/// Timestamp patterns tried in order, per spec §4.4 step 4, with ISO-8601
/// appended as the fourth, expanded format.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%b %d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

fn parse_timestamp(line: &str) -> DateTime<Utc> {
    let prefix_len = line.len().min(40);
    for format in TIMESTAMP_FORMATS {
        for candidate_len in (10..=prefix_len).rev() {
            let Some(candidate) = line.get(..candidate_len) else { continue };
            // "Mon DD HH:MM:SS" carries no year; splice in the current one
            // before parsing so chrono has a complete date to work with.
            if *format == "%b %d %H:%M:%S" {
                let with_year = format!("{} {candidate}", Utc::now().format("%Y"));
                if let Ok(naive) = NaiveDateTime::parse_from_str(&with_year, "%Y %b %d %H:%M:%S") {
                    if let chrono::LocalResult::Single(dt) = Utc.from_local_datetime(&naive) {
                        return dt;
                    }
                }
                continue;
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(candidate, format) {
                if let chrono::LocalResult::Single(dt) = Utc.from_local_datetime(&naive) {
                    return dt;
                }
            }
        }
    }
    Utc::now()
}

/// Filter ordering from spec §4.4 step 3: exclude first, then include.
pub struct LineFilter {
    exclude: Option<RegexSet>,
    include: Option<RegexSet>,
}

impl LineFilter {
    pub fn new(include_patterns: &[String], exclude_patterns: &[String]) -> Result<Self, FleetError> {
        let exclude = if exclude_patterns.is_empty() {
            None
        } else {
            Some(RegexSet::new(exclude_patterns).map_err(|e| FleetError::Config(format!("bad exclude pattern: {e}")))?)
        };
        let include = if include_patterns.is_empty() {
            None
        } else {
            Some(RegexSet::new(include_patterns).map_err(|e| FleetError::Config(format!("bad include pattern: {e}")))?)
        };
        Ok(Self { exclude, include })
    }

    /// `true` if the line survives filtering.
    pub fn allows(&self, line: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(line) {
                return false;
            }
        }
        if let Some(include) = &self.include {
            return include.is_match(line);
        }
        true
    }
}

fn parse_line(host: &str, source_file: &str, line: &str) -> LogEntry {
    LogEntry {
        host: host.to_string(),
        timestamp: parse_timestamp(line),
        level: LogLevel::detect(line),
        message: line.to_string(),
        source_file: source_file.to_string(),
        line_number: None,
        pid: None,
        tid: None,
        metadata: HashMap::new(),
    }
}

#[derive(Default)]
struct Counters {
    per_host: HashMap<String, u64>,
    per_level: HashMap<LogLevel, u64>,
}

/// Bounded, indexed store of captured log entries shared by every active
/// capture task.
pub struct LogStore {
    buffer: Mutex<RingBuffer<LogEntry>>,
    counters: Mutex<Counters>,
}

impl LogStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(RingBuffer::new(capacity)),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn record(&self, entry: LogEntry) {
        let mut counters = self.counters.lock();
        *counters.per_host.entry(entry.host.clone()).or_insert(0) += 1;
        *counters.per_level.entry(entry.level).or_insert(0) += 1;
        drop(counters);
        self.buffer.lock().push(entry);
    }

    /// Most recent `count` entries across all hosts, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogEntry> {
        self.buffer.lock().tail(count).into_iter().cloned().collect()
    }

    /// Most recent entries for a single host, oldest first.
    pub fn tail_for_host(&self, host: &str, count: usize) -> Vec<LogEntry> {
        self.buffer
            .lock()
            .iter()
            .filter(|e| e.host == host)
            .rev()
            .take(count)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn count_for_host(&self, host: &str) -> u64 {
        self.counters.lock().per_host.get(host).copied().unwrap_or(0)
    }

    pub fn count_for_level(&self, level: LogLevel) -> u64 {
        self.counters.lock().per_level.get(&level).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

/// Handle to one running `tail -f` capture; dropping it does not stop the
/// loop — call [`Self::stop`] to signal the background task.
pub struct CaptureHandle {
    host: String,
    stop: Arc<AtomicBool>,
    lines_captured: Arc<AtomicU64>,
}

impl CaptureHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn lines_captured(&self) -> u64 {
        self.lines_captured.load(Ordering::Relaxed)
    }

    /// Sets the stop flag; the capture task closes its channel and exits on
    /// its next poll.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Starts a `tail -f <path>` capture on `host` over `controller`, streaming
/// parsed, filtered entries into `store` until [`CaptureHandle::stop`] is
/// called. Spawns its own task; the returned handle controls it.
pub async fn start_capture(
    host: String,
    controller: HandleController,
    path: String,
    filter: Arc<LineFilter>,
    store: Arc<LogStore>,
) -> Result<CaptureHandle, FleetError> {
    let mut channel = controller
        .open_session_channel()
        .await
        .map_err(|e| FleetError::from_ssh(host.clone(), e))?;
    let command = format!("tail -n0 -f -- '{}'", path.replace('\'', "'\\''"));
    channel
        .exec(true, command)
        .await
        .map_err(|e| FleetError::protocol(host.clone(), format!("tail -f failed to start: {e}")))?;

    let stop = Arc::new(AtomicBool::new(false));
    let lines_captured = Arc::new(AtomicU64::new(0));
    let handle = CaptureHandle {
        host: host.clone(),
        stop: stop.clone(),
        lines_captured: lines_captured.clone(),
    };

    tokio::spawn(async move {
        let mut pending = Vec::new();
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match tokio::time::timeout(Duration::from_millis(200), channel.wait()).await {
                Ok(Some(russh::ChannelMsg::Data { data })) => {
                    pending.extend_from_slice(&data);
                    drain_lines(&mut pending, &host, &path, &filter, &store, &lines_captured);
                }
                Ok(Some(russh::ChannelMsg::ExtendedData { .. })) => {}
                Ok(Some(russh::ChannelMsg::Eof)) | Ok(Some(russh::ChannelMsg::Close)) => break,
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_timeout) => {}
            }
        }
        let _ = channel.eof().await;
        let _ = channel.close().await;
        debug!(host = %host, path = %path, "log capture stopped");
    });

    Ok(handle)
}

fn drain_lines(
    pending: &mut Vec<u8>,
    host: &str,
    path: &str,
    filter: &LineFilter,
    store: &LogStore,
    lines_captured: &AtomicU64,
) {
    loop {
        let Some(pos) = pending.iter().position(|&b| b == b'\n') else {
            break;
        };
        let raw = pending.drain(..=pos).collect::<Vec<u8>>();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if !filter.allows(line) {
            continue;
        }
        store.record(parse_line(host, path, line));
        lines_captured.fetch_add(1, Ordering::Relaxed);
    }
}

/// Registry of active per-host captures, owned by the façade layer.
#[derive(Default)]
pub struct LogCaptureRegistry {
    handles: Mutex<HashMap<String, CaptureHandle>>,
    store: Arc<LogStore>,
}

impl LogCaptureRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            store: Arc::new(LogStore::new(buffer_size)),
        }
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub async fn start(
        &self,
        host: String,
        controller: HandleController,
        path: String,
        include_patterns: &[String],
        exclude_patterns: &[String],
    ) -> Result<(), FleetError> {
        let filter = Arc::new(LineFilter::new(include_patterns, exclude_patterns)?);
        let handle = start_capture(host.clone(), controller, path, filter, self.store.clone()).await?;
        if let Some(previous) = self.handles.lock().insert(host.clone(), handle) {
            previous.stop();
            warn!(host = %host, "replaced an already-running log capture");
        }
        Ok(())
    }

    pub fn stop(&self, host: &str) {
        if let Some(handle) = self.handles.lock().remove(host) {
            handle.stop();
        }
    }

    pub fn stop_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.stop();
        }
    }

    pub fn is_capturing(&self, host: &str) -> bool {
        self.handles.lock().contains_key(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_excludes_before_include() {
        let filter = LineFilter::new(&["keep".into()], &["drop".into()]).unwrap();
        assert!(!filter.allows("keep this but drop it"));
        assert!(filter.allows("please keep this line"));
        assert!(!filter.allows("no matching include token"));
    }

    #[test]
    fn filter_with_no_patterns_allows_everything() {
        let filter = LineFilter::new(&[], &[]).unwrap();
        assert!(filter.allows("anything at all"));
    }

    #[test]
    fn parses_standard_timestamp_formats() {
        let entry = parse_line("h1", "/var/log/app.log", "2026-07-30 12:00:05 INFO started");
        assert_eq!(entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-07-30 12:00:05");

        let entry = parse_line("h1", "/var/log/app.log", "2026/07/30 12:00:05 INFO started");
        assert_eq!(entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-07-30 12:00:05");
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_now() {
        let before = Utc::now();
        let entry = parse_line("h1", "/var/log/app.log", "no timestamp here at all");
        assert!(entry.timestamp >= before);
    }

    #[test]
    fn detects_level_and_defaults_to_info() {
        let entry = parse_line("h1", "app.log", "ERROR: disk full");
        assert_eq!(entry.level, LogLevel::Error);
        let entry = parse_line("h1", "app.log", "just a message");
        assert_eq!(entry.level, LogLevel::Info);
    }

    #[test]
    fn drain_lines_handles_split_chunks() {
        let filter = LineFilter::new(&[], &[]).unwrap();
        let store = LogStore::new(10);
        let lines_captured = AtomicU64::new(0);
        let mut pending = b"partial".to_vec();
        drain_lines(&mut pending, "h1", "app.log", &filter, &store, &lines_captured);
        assert_eq!(store.len(), 0);

        pending.extend_from_slice(b" line\nsecond\n");
        drain_lines(&mut pending, "h1", "app.log", &filter, &store, &lines_captured);
        assert_eq!(store.len(), 2);
        assert_eq!(lines_captured.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn ring_buffer_eviction_matches_overflow_semantics() {
        let store = LogStore::new(2);
        for i in 0..3 {
            store.record(parse_line("h1", "app.log", &format!("line {i}")));
        }
        assert_eq!(store.len(), 2);
        let tail = store.tail(10);
        assert_eq!(tail[0].message, "line 1");
        assert_eq!(tail[1].message, "line 2");
    }

    /// §8 scenario: `buffer_size = 100`, 150 captured lines — the store
    /// holds only the most recent 100, but the running counter still
    /// reflects every line seen.
    #[test]
    fn capture_overflow_keeps_only_most_recent_window() {
        let filter = LineFilter::new(&[], &[]).unwrap();
        let store = LogStore::new(100);
        let lines_captured = AtomicU64::new(0);

        let mut pending = Vec::new();
        for i in 0..150 {
            pending.extend_from_slice(format!("line {i}\n").as_bytes());
        }
        drain_lines(&mut pending, "h1", "app.log", &filter, &store, &lines_captured);

        assert_eq!(store.len(), 100);
        assert_eq!(lines_captured.load(Ordering::Relaxed), 150);
        assert_eq!(store.count_for_host("h1"), 150);
        let tail = store.tail(1);
        assert_eq!(tail[0].message, "line 149");
    }
}
