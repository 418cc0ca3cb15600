//! Structured Logger (C8) — built on `tracing`/`tracing-subscriber`, the
//! stack already used throughout the transport layer, in place of the
//! Python original's `structlog`. A custom [`Layer`] appends every event to
//! a bounded in-memory tail (`parking_lot::Mutex<VecDeque<..>>`); a second
//! layer renders to stderr and, when configured, to a rotating file via
//! `tracing-appender`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, String>,
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl Visit for EventVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{:?}", value);
        if field.name() == "message" {
            self.message = text;
        } else {
            self.fields.insert(field.name().to_string(), text);
        }
    }
}

/// Appends each event to the bounded tail. Never blocks on I/O — the
/// console/file rendering is a separate layer.
pub struct TailLayer {
    tail: Arc<Mutex<RingBuffer<TailEntry>>>,
}

impl<S: Subscriber> Layer<S> for TailLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        let entry = TailEntry {
            timestamp: Utc::now(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        };
        self.tail.lock().push(entry);
    }
}

/// Process-wide structured logger: owns the bounded tail and installs the
/// `tracing-subscriber` pipeline. Per §9's "Global state" note, this must be
/// created before any component that emits logs.
pub struct StructuredLogger {
    tail: Arc<Mutex<RingBuffer<TailEntry>>>,
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl StructuredLogger {
    pub fn init(config: &Config) -> Self {
        let tail = Arc::new(Mutex::new(RingBuffer::new(config.log_capture.buffer_size.max(1000))));
        let tail_layer = TailLayer { tail: tail.clone() };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

        let json = config.log_format == "json";

        let (file_layer, file_guard) = match &config.log_file {
            Some(path) => {
                let path = std::path::PathBuf::from(path);
                let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
                let file_name = path
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| "fleetssh.log".to_string());
                let appender = tracing_appender::rolling::daily(dir, file_name);
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = if json {
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .boxed()
                } else {
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .boxed()
                };
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let console_layer = if json {
            tracing_subscriber::fmt::layer().json().boxed()
        } else {
            tracing_subscriber::fmt::layer().boxed()
        };

        use tracing_subscriber::util::SubscriberInitExt;
        let registry = tracing_subscriber::registry()
            .with(env_filter)
            .with(tail_layer)
            .with(console_layer);

        match file_layer {
            Some(layer) => registry.with(layer).try_init().ok(),
            None => registry.try_init().ok(),
        };

        Self {
            tail,
            _file_guard: file_guard,
        }
    }

    /// Last `count` entries, oldest first, matching the Python original's
    /// `get_recent_logs(count=50)`.
    pub fn recent(&self, count: usize) -> Vec<TailEntry> {
        self.tail.lock().tail(count).into_iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.tail.lock().clear();
    }

    pub fn export_json(&self, path: &std::path::Path) -> std::io::Result<()> {
        let entries = self.tail.lock().iter().cloned().collect::<Vec<_>>();
        crate::types::export_json(&entries, path)
    }

    pub fn export_csv(&self, path: &std::path::Path) -> std::io::Result<()> {
        let entries = self.tail.lock().iter().cloned().collect::<Vec<_>>();
        crate::types::export_csv(&entries, path)
    }
}

/// Per-host metrics and a tracing span carrying the `host` field, mirroring
/// the Python original's `HostLogger`.
pub struct HostLogger {
    host: String,
    commands_executed: AtomicU64,
    files_transferred: AtomicU64,
    connection_attempts: AtomicU64,
    connection_failures: AtomicU64,
    total_duration_millis: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostMetrics {
    pub host: String,
    pub commands_executed: u64,
    pub files_transferred: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub total_duration_secs: f64,
    pub success_rate: f64,
}

impl HostLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            commands_executed: AtomicU64::new(0),
            files_transferred: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            total_duration_millis: AtomicU64::new(0),
        }
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!("host", host = %self.host)
    }

    pub fn log_command_result(&self, command: &str, success: bool, duration_secs: f64) {
        let _enter = self.span().entered();
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_millis
            .fetch_add((duration_secs * 1000.0) as u64, Ordering::Relaxed);
        if success {
            tracing::info!(command, duration_secs, "command completed");
        } else {
            tracing::warn!(command, duration_secs, "command failed");
        }
    }

    pub fn log_connection_event(&self, success: bool) {
        let _enter = self.span().entered();
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            tracing::info!("connection established");
        } else {
            self.connection_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("connection attempt failed");
        }
    }

    pub fn log_file_transfer(&self, path: &str, success: bool, duration_secs: f64) {
        let _enter = self.span().entered();
        self.files_transferred.fetch_add(1, Ordering::Relaxed);
        self.total_duration_millis
            .fetch_add((duration_secs * 1000.0) as u64, Ordering::Relaxed);
        if success {
            tracing::info!(path, duration_secs, "file transfer completed");
        } else {
            tracing::warn!(path, duration_secs, "file transfer failed");
        }
    }

    pub fn get_metrics(&self) -> HostMetrics {
        let attempts = self.connection_attempts.load(Ordering::Relaxed);
        let failures = self.connection_failures.load(Ordering::Relaxed);
        let success_rate = if attempts == 0 {
            0.0
        } else {
            (attempts - failures) as f64 / attempts as f64
        };
        HostMetrics {
            host: self.host.clone(),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            connection_attempts: attempts,
            connection_failures: failures,
            total_duration_secs: self.total_duration_millis.load(Ordering::Relaxed) as f64 / 1000.0,
            success_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_metrics_success_rate() {
        let logger = HostLogger::new("h1");
        logger.log_connection_event(true);
        logger.log_connection_event(false);
        logger.log_connection_event(true);
        let metrics = logger.get_metrics();
        assert_eq!(metrics.connection_attempts, 3);
        assert_eq!(metrics.connection_failures, 1);
        assert!((metrics.success_rate - (2.0 / 3.0)).abs() < 1e-9);
    }
}
