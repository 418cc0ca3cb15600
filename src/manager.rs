//! SSH Manager (C3) — fans out commands, chains, interactive dialogs, and
//! file transfers across a host set under a `max_parallel` concurrency cap.
//! Composes the connection pool (C1) for one-shot exec and the channel
//! registry (C2) for chain/interactive paths.
//!
//! Grounded on `original_source/vwt_monitor/ssh_manager.py::execute_command`
//! (thread pool + `as_completed`, catch-log-materialize-failed-result per
//! host), re-expressed with `tokio::sync::Semaphore` + a `JoinSet` in place
//! of Python's `ThreadPoolExecutor`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::channel::{ChannelCommand, ChannelRegistry};
use crate::config::Config;
use crate::error::FleetError;
use crate::pool::{ConnectionPool, Endpoint, PoolConfig};
use crate::ssh::SshConfig;
use crate::transfer;
use crate::types::{ChannelResult, CommandResult, FileTransferResult};

pub struct SshManager {
    config: Config,
    pool: Arc<ConnectionPool>,
    channels: Arc<ChannelRegistry>,
    semaphore: Arc<Semaphore>,
}

impl SshManager {
    pub fn new(config: Config) -> Self {
        let pool = ConnectionPool::new(PoolConfig::from(&config), config.jumphost.clone());
        let semaphore = Arc::new(Semaphore::new(config.max_parallel));
        Self {
            channels: Arc::new(ChannelRegistry::new()),
            pool,
            semaphore,
            config,
        }
    }

    fn hosts_or_default<'a>(&'a self, hosts: Option<&'a [String]>) -> &'a [String] {
        hosts.unwrap_or(&self.config.hosts)
    }

    pub(crate) fn ssh_config_for(&self, host: &str) -> SshConfig {
        SshConfig {
            host: host.to_string(),
            port: self.config.port,
            username: self.config.user.clone(),
            auth: self.config.auth_method(),
            timeout_secs: self.config.timeout,
            strict_host_key_checking: self.config.security.strict_host_key_checking,
            ..Default::default()
        }
    }

    /// Runs `op` for each host in `hosts` under the semaphore, collecting
    /// every result — a per-host failure never aborts the others.
    async fn fan_out<T, F, Fut>(&self, hosts: &[String], op: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let op = Arc::new(op);
        let mut tasks = JoinSet::new();
        for host in hosts {
            let host = host.clone();
            let permit = self.semaphore.clone();
            let op = op.clone();
            tasks.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                op(host).await
            });
        }

        let mut results = Vec::with_capacity(hosts.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!("fan-out task panicked: {}", e),
            }
        }
        results
    }

    /// `ExecuteCommand`: one-shot exec over a pooled connection, no Channel
    /// Manager involved. Reads both streams to EOF and the exit status.
    pub async fn execute_command(
        &self,
        command: &str,
        hosts: Option<&[String]>,
        timeout: Option<Duration>,
    ) -> Vec<CommandResult> {
        let hosts = self.hosts_or_default(hosts).to_vec();
        let command = command.to_string();
        let timeout = timeout.unwrap_or_else(|| Duration::from_secs(self.config.timeout));
        let pool = self.pool.clone();
        let configs: HashMap<String, SshConfig> =
            hosts.iter().map(|h| (h.clone(), self.ssh_config_for(h))).collect();

        self.fan_out(&hosts, move |host| {
            let pool = pool.clone();
            let command = command.clone();
            let ssh_config = configs[&host].clone();
            async move { run_one_shot(&pool, &ssh_config, &command, timeout).await }
        })
        .await
    }

    /// `ExecuteChain`: delegate to the Channel Manager per host.
    pub async fn execute_chain(
        &self,
        commands: &[ChannelCommand],
        hosts: Option<&[String]>,
        create_new_channel: bool,
    ) -> HashMap<String, Result<Vec<ChannelResult>, FleetError>> {
        let hosts = self.hosts_or_default(hosts).to_vec();
        let mut out = HashMap::new();
        for host in hosts {
            let ssh_config = self.ssh_config_for(&host);
            let result = self.run_chain(&host, &ssh_config, commands, create_new_channel).await;
            out.insert(host, result);
        }
        out
    }

    /// `ExecuteInteractive`: each `(command, patterns)` pair is a chain step
    /// with `wait_for_prompt = true`.
    pub async fn execute_interactive(
        &self,
        pairs: &[(String, HashMap<String, String>)],
        hosts: Option<&[String]>,
        timeout: Duration,
    ) -> HashMap<String, Result<Vec<ChannelResult>, FleetError>> {
        let hosts = self.hosts_or_default(hosts).to_vec();
        let mut out = HashMap::new();
        for host in hosts {
            let entry = self.pool.get(&self.ssh_config_for(&host)).await;
            let result = match entry {
                Ok(entry) => {
                    self.channels
                        .execute_interactive(&host, &entry.controller, pairs, timeout)
                        .await
                }
                Err(e) => Err(e),
            };
            out.insert(host, result);
        }
        out
    }

    async fn run_chain(
        &self,
        host: &str,
        ssh_config: &SshConfig,
        commands: &[ChannelCommand],
        create_new: bool,
    ) -> Result<Vec<ChannelResult>, FleetError> {
        let entry = self.pool.get(ssh_config).await?;
        self.channels
            .execute_chain(host, &entry.controller, commands, create_new)
            .await
    }

    /// `Upload`: fan out a local file to every host's `remote_path`.
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        hosts: Option<&[String]>,
    ) -> Result<Vec<FileTransferResult>, FleetError> {
        if !local_path.exists() {
            return Err(FleetError::LocalIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("local path not found: {}", local_path.display()),
            )));
        }
        let hosts = self.hosts_or_default(hosts).to_vec();
        let local_path = local_path.to_path_buf();
        let remote_path = remote_path.to_string();
        let pool = self.pool.clone();
        let verify_checksum = self.config.file_transfer.verify_checksum;
        let configs: HashMap<String, SshConfig> =
            hosts.iter().map(|h| (h.clone(), self.ssh_config_for(h))).collect();

        let results = self
            .fan_out(&hosts, move |host| {
                let pool = pool.clone();
                let local_path = local_path.clone();
                let remote_path = remote_path.clone();
                let ssh_config = configs[&host].clone();
                async move {
                    match pool.get(&ssh_config).await {
                        Ok(entry) => transfer::upload(&host, &entry.controller, &local_path, &remote_path, verify_checksum)
                            .await
                            .unwrap_or_else(|e| failed_transfer(&host, crate::types::TransferDirection::Upload, e)),
                        Err(e) => failed_transfer(&host, crate::types::TransferDirection::Upload, e),
                    }
                }
            })
            .await;
        Ok(results)
    }

    /// `Download`: fan out fetching `remote_path` from every host into
    /// `local_dir/<host>/`.
    pub async fn download(
        &self,
        remote_path: &str,
        local_dir: &Path,
        hosts: Option<&[String]>,
    ) -> Result<Vec<FileTransferResult>, FleetError> {
        let hosts = self.hosts_or_default(hosts).to_vec();
        let remote_path = remote_path.to_string();
        let local_dir = local_dir.to_path_buf();
        let pool = self.pool.clone();
        let configs: HashMap<String, SshConfig> =
            hosts.iter().map(|h| (h.clone(), self.ssh_config_for(h))).collect();

        let results = self
            .fan_out(&hosts, move |host| {
                let pool = pool.clone();
                let remote_path = remote_path.clone();
                let host_dir = local_dir.join(&host);
                let ssh_config = configs[&host].clone();
                async move {
                    match pool.get(&ssh_config).await {
                        Ok(entry) => transfer::download(&host, &entry.controller, &remote_path, &host_dir)
                            .await
                            .unwrap_or_else(|e| failed_transfer(&host, crate::types::TransferDirection::Download, e)),
                        Err(e) => failed_transfer(&host, crate::types::TransferDirection::Download, e),
                    }
                }
            })
            .await;
        Ok(results)
    }

    pub async fn close_channel(&self, host: &str) {
        self.channels.close_channel(host).await;
    }

    pub async fn close_all_channels(&self) {
        self.channels.close_all().await;
    }

    pub async fn shutdown(&self) {
        self.channels.close_all().await;
        self.pool.clear().await;
    }

    pub fn pool_endpoint(&self, host: &str) -> Endpoint {
        Endpoint::new(host, self.config.port, self.config.user.clone())
    }

    /// `ExportResults`: json/csv via the shared §C9 helpers.
    pub fn export_results<T: serde::Serialize>(results: &[T], path: &Path, format: &str) -> std::io::Result<()> {
        match format {
            "csv" => crate::types::export_csv(results, path),
            _ => crate::types::export_json(results, path),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

async fn run_one_shot(pool: &ConnectionPool, ssh_config: &SshConfig, command: &str, timeout: Duration) -> CommandResult {
    let start = Instant::now();
    let entry = match pool.get(ssh_config).await {
        Ok(entry) => entry,
        Err(e) => return CommandResult::failed(&ssh_config.host, command, e, Utc::now()),
    };

    let exec = async {
        let mut channel = entry
            .controller
            .open_session_channel()
            .await
            .map_err(|e| FleetError::from_ssh(ssh_config.host.clone(), e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| FleetError::protocol(ssh_config.host.clone(), format!("exec failed: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0i32;
        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                russh::ChannelMsg::ExtendedData { data, ext } if ext == 1 => stderr.extend_from_slice(&data),
                russh::ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
                russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                _ => {}
            }
        }
        Ok::<_, FleetError>((stdout, stderr, exit_code))
    };

    match tokio::time::timeout(timeout, exec).await {
        Ok(Ok((stdout, stderr, exit_code))) => {
            let (stdout, _, _) = encoding_rs::UTF_8.decode(&stdout);
            let (stderr, _, _) = encoding_rs::UTF_8.decode(&stderr);
            CommandResult {
                host: ssh_config.host.clone(),
                command: command.to_string(),
                stdout: stdout.into_owned(),
                stderr: stderr.into_owned(),
                exit_code,
                duration_secs: start.elapsed().as_secs_f64(),
                timestamp: Utc::now(),
                success: exit_code == 0,
            }
        }
        Ok(Err(e)) => CommandResult::failed(&ssh_config.host, command, e, Utc::now()),
        Err(_) => CommandResult::failed(
            &ssh_config.host,
            command,
            FleetError::Timeout {
                host: ssh_config.host.clone(),
                timeout_secs: timeout.as_secs(),
            },
            Utc::now(),
        ),
    }
}

fn failed_transfer(host: &str, direction: crate::types::TransferDirection, err: FleetError) -> FileTransferResult {
    info!(host, "file transfer failed: {}", err);
    FileTransferResult {
        host: host.to_string(),
        direction,
        local_path: String::new(),
        remote_path: String::new(),
        size_bytes: 0,
        duration_secs: 0.0,
        timestamp: Utc::now(),
        success: false,
        checksum: None,
        error: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FileTransferConfig, LogCaptureConfig, SecurityConfig};
    use std::sync::atomic::AtomicUsize;

    fn test_config(hosts: &[&str], max_parallel: usize) -> Config {
        Config {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            user: "root".into(),
            password: Some("x".into()),
            key_file: None,
            port: 22,
            timeout: 5,
            max_parallel,
            log_level: "info".into(),
            log_file: None,
            log_format: "text".into(),
            connection_pool_size: 20,
            connection_idle_timeout: 300,
            max_retries: 1,
            retry_delay: 1,
            jumphost: None,
            log_capture: LogCaptureConfig::default(),
            file_transfer: FileTransferConfig::default(),
            security: SecurityConfig::default(),
        }
    }

    /// §8 scenario: `whoami` fanned out to 3 hosts under `max_parallel = 2`
    /// must never run more than 2 ops concurrently, yet still produce a
    /// result for every host.
    #[tokio::test]
    async fn fan_out_bounds_concurrency_to_max_parallel() {
        let manager = SshManager::new(test_config(&["h1", "h2", "h3"], 2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let hosts = manager.config.hosts.clone();
        let results = manager
            .fan_out(&hosts, {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                move |host| {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        (host, "root".to_string())
                    }
                }
            })
            .await;

        assert_eq!(results.len(), 3);
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
        assert!(results.iter().all(|(_, out)| out == "root"));
        manager.shutdown().await;
    }
}
