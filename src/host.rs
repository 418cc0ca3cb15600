//! Host Façade (C7) — a single-host adaptor over the SSH Manager (C3),
//! Iperf Orchestrator (C5), and Traffic Tester (C6). Stateless apart from
//! its reference to the owning manager; a convenience for callers who'd
//! rather not thread `hosts: Some(&[...])` through every C3 call.
//!
//! Grounded on `original_source/workload.py::HostWorkload` (`ping`,
//! `check_connectivity`, `install_package` + its distribution-detection
//! fallback chain), re-expressed over this crate's async C3/C5/C6 instead
//! of the reference's one-host-at-a-time synchronous `execute`.

use std::time::Duration;

use crate::iperf;
use crate::manager::SshManager;
use crate::traffic;
use crate::types::{CommandResult, IperfTestConfig, IperfTestResult, LogEntry, TrafficTestConfig, TrafficTestResult};

/// Binds every derived helper to one host on an owning [`SshManager`].
pub struct HostFacade<'a> {
    manager: &'a SshManager,
    host: String,
}

impl<'a> HostFacade<'a> {
    pub fn new(manager: &'a SshManager, host: impl Into<String>) -> Self {
        Self { manager, host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&self, command: &str) -> CommandResult {
        self.manager
            .execute_command(command, Some(std::slice::from_ref(&self.host)), None)
            .await
            .into_iter()
            .next()
            .expect("execute_command returns one result per requested host")
    }

    /// `ping <target>`, run on this host.
    pub async fn ping(&self, target: &str, count: u32) -> CommandResult {
        self.execute(&format!("ping -c {count} {target}")).await
    }

    /// `nc -zv <target> <port>`, run on this host.
    pub async fn check_connectivity(&self, target: &str, port: u16) -> CommandResult {
        self.execute(&format!("nc -zv {target} {port}")).await
    }

    /// Detects the Linux distribution, then picks the matching package
    /// manager; falls back to trying every known package manager in turn
    /// when detection is inconclusive.
    pub async fn install_package(&self, package: &str) -> CommandResult {
        let distro = self.detect_distribution().await;
        let distro = distro.to_lowercase();

        let command = if ["ubuntu", "debian", "mint", "kali"].iter().any(|d| distro.contains(d)) {
            Some(format!("apt-get update && apt-get install -y {package}"))
        } else if ["centos", "rhel", "redhat", "fedora", "rocky", "alma"].iter().any(|d| distro.contains(d)) {
            if distro.contains("fedora") || newest_release_version(&distro) >= 22 {
                Some(format!("dnf install -y {package}"))
            } else {
                Some(format!("yum install -y {package}"))
            }
        } else if distro.contains("alpine") {
            Some(format!("apk add {package}"))
        } else {
            None
        };

        match command {
            Some(command) => self.execute(&command).await,
            None => self.install_package_fallback(package).await,
        }
    }

    async fn detect_distribution(&self) -> String {
        const DETECTION_COMMANDS: &[&str] = &[
            "cat /etc/os-release",
            "cat /etc/redhat-release",
            "cat /etc/debian_version",
            "cat /etc/issue",
            "lsb_release -a",
        ];
        for command in DETECTION_COMMANDS {
            let result = self.execute(command).await;
            if result.success && !result.stdout.trim().is_empty() {
                return result.stdout;
            }
        }
        String::new()
    }

    async fn install_package_fallback(&self, package: &str) -> CommandResult {
        const MANAGERS: &[&str] = &[
            "apt-get update && apt-get install -y {pkg}",
            "yum install -y {pkg}",
            "dnf install -y {pkg}",
            "zypper install -y {pkg}",
            "pacman -S --noconfirm {pkg}",
            "apk add {pkg}",
        ];
        let mut last = None;
        for template in MANAGERS {
            let command = template.replace("{pkg}", package);
            let result = self.execute(&command).await;
            if result.success {
                return result;
            }
            last = Some(result);
        }
        last.expect("MANAGERS is non-empty")
    }

    /// Streams `tail -f <remote_log>` until `duration` elapses, returning
    /// every entry captured.
    pub async fn tail(&self, remote_log: &str, duration: Duration, buffer_size: usize) -> Vec<LogEntry> {
        let registry = crate::log_capture::LogCaptureRegistry::new(buffer_size);
        let Ok(entry) = self.manager.pool().get(&self.manager.ssh_config_for(&self.host)).await else {
            return Vec::new();
        };
        if registry
            .start(self.host.clone(), entry.controller.clone(), remote_log.to_string(), &[], &[])
            .await
            .is_err()
        {
            return Vec::new();
        }
        tokio::time::sleep(duration).await;
        registry.stop(&self.host);
        registry.store().tail_for_host(&self.host, buffer_size)
    }

    /// Like [`Self::tail`], filtered to lines matching `pattern`.
    pub async fn grep_log(&self, remote_log: &str, pattern: &str, duration: Duration, buffer_size: usize) -> Vec<LogEntry> {
        let registry = crate::log_capture::LogCaptureRegistry::new(buffer_size);
        let Ok(entry) = self.manager.pool().get(&self.manager.ssh_config_for(&self.host)).await else {
            return Vec::new();
        };
        let include = vec![pattern.to_string()];
        if registry
            .start(self.host.clone(), entry.controller.clone(), remote_log.to_string(), &include, &[])
            .await
            .is_err()
        {
            return Vec::new();
        }
        tokio::time::sleep(duration).await;
        registry.stop(&self.host);
        registry.store().tail_for_host(&self.host, buffer_size)
    }

    /// Per-level entry counts after a fixed-duration capture.
    pub async fn get_log_stats(&self, remote_log: &str, duration: Duration, buffer_size: usize) -> LogStats {
        let entries = self.tail(remote_log, duration, buffer_size).await;
        let mut stats = LogStats::default();
        for entry in &entries {
            use crate::types::LogLevel::*;
            match entry.level {
                Debug => stats.debug += 1,
                Info => stats.info += 1,
                Warning => stats.warning += 1,
                Error => stats.error += 1,
                Critical => stats.critical += 1,
            }
        }
        stats.total = entries.len() as u64;
        stats
    }

    /// Runs an iperf pair with this host as the client.
    pub async fn run_iperf_test(&self, server_host: &str, port: u16, config: &IperfTestConfig) -> Result<IperfTestResult, crate::error::FleetError> {
        iperf::run_pair(self.manager, &self.host, server_host, port, config).await
    }

    /// Runs a traffic test with this host as the sole source.
    pub async fn run_traffic_test(&self, mut config: TrafficTestConfig) -> Vec<TrafficTestResult> {
        config.source_hosts = vec![self.host.clone()];
        traffic::run_traffic_test(self.manager, &config).await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogStats {
    pub total: u64,
    pub debug: u64,
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub critical: u64,
}

fn newest_release_version(distro: &str) -> u32 {
    distro
        .split_whitespace()
        .last()
        .and_then(|token| token.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_version_parses_trailing_number() {
        assert_eq!(newest_release_version("centos linux release 8"), 8);
        assert_eq!(newest_release_version("rocky linux release 9.3"), 0);
    }
}
