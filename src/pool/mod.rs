//! Connection Pool (C1) — owns the set of live SSH connections, hands out
//! reusable ones keyed by `(host, port, user)`, evicts broken or idle ones,
//! and bounds transport-layer concurrency.
//!
//! Grounded on `ssh/connection_registry.rs`'s interior-mutability idiom
//! (atomics for counters, `RwLock`/`parking_lot` for mutable state) combined
//! with the Python original's `connection_pool.py` reuse/health-check/retry
//! algorithm, which the Rust teacher's registry doesn't implement (it scores
//! reuse quality for a terminal-UI session instead of doing a plain
//! probe-then-reuse-or-evict).

mod jumphost;

pub use jumphost::connect_through_jumphost;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, JumphostConfig};
use crate::error::FleetError;
use crate::ssh::{spawn_handle_owner_task, HandleController, SshClient, SshConfig};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

pub struct ConnectionEntry {
    pub endpoint: Endpoint,
    pub controller: HandleController,
    pub created_at: Instant,
    last_used_millis: AtomicU64,
    use_count: AtomicU64,
    error_count: AtomicU32,
    last_error: Mutex<Option<String>>,
}

impl ConnectionEntry {
    fn new(endpoint: Endpoint, controller: HandleController) -> Self {
        let now = Instant::now();
        Self {
            endpoint,
            controller,
            created_at: now,
            last_used_millis: AtomicU64::new(0),
            use_count: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn idle_for(&self) -> Duration {
        let elapsed_ms = self.created_at.elapsed().as_millis() as u64;
        let last_used = self.last_used_millis.load(Ordering::Relaxed);
        Duration::from_millis(elapsed_ms.saturating_sub(last_used))
    }

    pub fn touch(&self) {
        self.last_used_millis
            .store(self.created_at.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.use_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    fn record_probe_failure(&self, err: impl std::fmt::Display) -> u32 {
        *self.last_error.lock() = Some(err.to_string());
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_probe_success(&self) {
        self.error_count.store(0, Ordering::Relaxed);
    }
}

pub struct PoolConfig {
    pub max_entries: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_retries: u32,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
    /// Evict an entry once 3 consecutive health-check probes fail.
    pub max_error_count: u32,
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_entries: config.connection_pool_size,
            idle_timeout: Duration::from_secs(config.connection_idle_timeout),
            health_check_interval: Duration::from_secs(60),
            max_retries: config.max_retries,
            retry_delay_min: Duration::from_secs(config.retry_delay),
            retry_delay_max: Duration::from_secs(config.retry_delay.max(4) * 2 + 2),
            max_error_count: 3,
        }
    }
}

pub struct ConnectionPool {
    entries: DashMap<Endpoint, Arc<ConnectionEntry>>,
    config: PoolConfig,
    jumphost: Option<JumphostConfig>,
    jumphost_conn: Mutex<Option<Arc<ConnectionEntry>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, jumphost: Option<JumphostConfig>) -> Arc<Self> {
        let pool = Arc::new(Self {
            entries: DashMap::new(),
            config,
            jumphost,
            jumphost_conn: Mutex::new(None),
        });
        pool.clone().start_health_check();
        pool
    }

    /// Get a healthy, reusable connection for `ssh_config`, creating one if
    /// necessary. Evicts the most-idle entry first if at capacity.
    pub async fn get(&self, ssh_config: &SshConfig) -> Result<Arc<ConnectionEntry>, FleetError> {
        let endpoint = Endpoint::new(ssh_config.host.clone(), ssh_config.port, ssh_config.username.clone());

        if let Some(entry) = self.entries.get(&endpoint).map(|e| e.value().clone()) {
            if self.probe(&entry).await {
                entry.touch();
                return Ok(entry);
            }
            debug!("stale connection for {}, recreating", endpoint.key());
            self.entries.remove(&endpoint);
        }

        if self.entries.len() >= self.config.max_entries {
            self.evict_most_idle();
        }

        let entry = self.create_with_retry(ssh_config).await?;
        entry.touch();
        self.entries.insert(endpoint, entry.clone());
        Ok(entry)
    }

    /// Hint that the caller is done; does not close (convention-only — see
    /// DESIGN.md's "pool borrow enforcement" decision).
    pub fn return_connection(&self, endpoint: &Endpoint) {
        let _ = endpoint;
    }

    pub async fn close(&self, endpoint: &Endpoint) {
        if let Some((_, entry)) = self.entries.remove(endpoint) {
            entry.controller.disconnect().await;
        }
    }

    pub async fn clear(&self) {
        let endpoints: Vec<Endpoint> = self.entries.iter().map(|e| e.key().clone()).collect();
        for endpoint in endpoints {
            self.close(&endpoint).await;
        }
        if let Some(jh) = self.jumphost_conn.lock().take() {
            jh.controller.disconnect().await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    async fn probe(&self, entry: &Arc<ConnectionEntry>) -> bool {
        matches!(entry.controller.ping().await, crate::ssh::PingResult::Ok)
    }

    async fn create_with_retry(&self, ssh_config: &SshConfig) -> Result<Arc<ConnectionEntry>, FleetError> {
        let mut delay = self.config.retry_delay_min;
        let mut last_err = None;

        for attempt in 1..=self.config.max_retries.max(1) {
            match self.create_connection(ssh_config).await {
                Ok(entry) => return Ok(entry),
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(attempt, host = %ssh_config.host, "connection attempt failed: {}", err);
                    last_err = Some(err);
                    if !retryable || attempt == self.config.max_retries.max(1) {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.retry_delay_max);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FleetError::unreachable(ssh_config.host.clone(), "no attempts made")))
    }

    async fn create_connection(&self, ssh_config: &SshConfig) -> Result<Arc<ConnectionEntry>, FleetError> {
        let endpoint = Endpoint::new(ssh_config.host.clone(), ssh_config.port, ssh_config.username.clone());

        let controller = if let Some(jumphost) = &self.jumphost {
            self.ensure_jumphost_connection().await?;
            let jh_entry = self.jumphost_conn.lock().as_ref().cloned();
            let jh_entry = jh_entry.ok_or_else(|| FleetError::unreachable(jumphost.host.clone(), "jumphost connection missing"))?;
            connect_through_jumphost(&jh_entry.controller, ssh_config)
                .await
                .map_err(|e| FleetError::from_ssh(ssh_config.host.clone(), e))?
        } else {
            let handle = SshClient::new(ssh_config.clone())
                .connect()
                .await
                .map_err(|e| FleetError::from_ssh(ssh_config.host.clone(), e))?;
            spawn_handle_owner_task(handle, endpoint.key())
        };

        info!("established connection to {}", endpoint.key());
        Ok(Arc::new(ConnectionEntry::new(endpoint, controller)))
    }

    async fn ensure_jumphost_connection(&self) -> Result<(), FleetError> {
        {
            let guard = self.jumphost_conn.lock();
            if let Some(entry) = guard.as_ref() {
                if entry.controller.is_connected() {
                    return Ok(());
                }
            }
        }
        let jumphost = self.jumphost.as_ref().expect("checked by caller");
        let ssh_config = SshConfig {
            host: jumphost.host.clone(),
            port: jumphost.port,
            username: jumphost.user.clone(),
            auth: jumphost.auth_method(),
            timeout_secs: jumphost.timeout,
            ..Default::default()
        };
        let handle = SshClient::new(ssh_config)
            .connect()
            .await
            .map_err(|e| FleetError::from_ssh(jumphost.host.clone(), e))?;
        let controller = spawn_handle_owner_task(handle, format!("jumphost:{}", jumphost.host));
        let endpoint = Endpoint::new(jumphost.host.clone(), jumphost.port, jumphost.user.clone());
        *self.jumphost_conn.lock() = Some(Arc::new(ConnectionEntry::new(endpoint, controller)));
        Ok(())
    }

    fn evict_most_idle(&self) {
        let worst = self
            .entries
            .iter()
            .max_by_key(|e| e.value().idle_for())
            .map(|e| e.key().clone());
        if let Some(endpoint) = worst {
            debug!("evicting idle connection {}", endpoint.key());
            if let Some((_, entry)) = self.entries.remove(&endpoint) {
                let controller = entry.controller.clone();
                tokio::spawn(async move {
                    controller.disconnect().await;
                });
            }
        }
    }

    fn start_health_check(self: Arc<Self>) {
        let interval = self.config.health_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                self.run_health_check().await;
            }
        });
    }

    async fn run_health_check(&self) {
        let idle_timeout = self.config.idle_timeout;
        let stale: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|e| e.value().idle_for() > idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for endpoint in stale {
            debug!("health check: evicting idle connection {}", endpoint.key());
            self.close(&endpoint).await;
        }

        let remaining: Vec<Arc<ConnectionEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in remaining {
            if self.probe(&entry).await {
                entry.record_probe_success();
            } else {
                let failures = entry.record_probe_failure("health check probe failed");
                if failures >= self.config.max_error_count {
                    warn!("evicting {} after {} failed probes", entry.endpoint.key(), failures);
                    self.close(&entry.endpoint).await;
                }
            }
        }
    }
}
