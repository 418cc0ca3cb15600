//! Config Loader (C10) — parses the fleet's YAML config file into a
//! validated [`Config`], matching the key list in SPEC_FULL.md §6. Shape
//! mirrors `ssh::config::SshConfig`/`AuthMethod`'s serde idiom: defaults via
//! `#[serde(default = "fn")]`, a tagged enum for the auth sub-object.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::ssh::AuthMethod;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub hosts: Vec<String>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: usize,
    #[serde(default = "default_idle_timeout")]
    pub connection_idle_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jumphost: Option<JumphostConfig>,
    #[serde(default)]
    pub log_capture: LogCaptureConfig,
    #[serde(default)]
    pub file_transfer: FileTransferConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumphostConfig {
    pub host: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCaptureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for LogCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size: default_buffer_size(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferConfig {
    #[serde(default)]
    pub verify_checksum: bool,
    #[serde(default = "default_transfer_timeout")]
    pub timeout: u64,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            verify_checksum: false,
            timeout: default_transfer_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub strict_host_key_checking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<String>,
    #[serde(default)]
    pub key_types: Vec<String>,
    #[serde(default)]
    pub cipher_preferences: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            strict_host_key_checking: false,
            known_hosts_file: None,
            key_types: Vec::new(),
            cipher_preferences: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    22
}
fn default_timeout() -> u64 {
    30
}
fn default_max_parallel() -> usize {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_pool_size() -> usize {
    20
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    4
}
fn default_buffer_size() -> usize {
    1000
}
fn default_transfer_timeout() -> u64 {
    60
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| FleetError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.hosts.is_empty() {
            return Err(FleetError::Config("`hosts` must not be empty".to_string()));
        }
        validate_credential("top-level", self.password.is_some(), self.key_file.is_some())?;
        if self.max_parallel < 1 {
            return Err(FleetError::Config("`max_parallel` must be >= 1".to_string()));
        }
        if self.port == 0 {
            return Err(FleetError::Config("`port` must be in 1..=65535".to_string()));
        }
        if let Some(jh) = &self.jumphost {
            if jh.port == 0 {
                return Err(FleetError::Config("`jumphost.port` must be in 1..=65535".to_string()));
            }
            validate_credential("jumphost", jh.password.is_some(), jh.key_file.is_some())?;
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => {
                return Err(FleetError::Config(format!(
                    "`log_format` must be 'json' or 'text', got '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Resolve the primary auth method from the exclusive password/key_file pair.
    pub fn auth_method(&self) -> AuthMethod {
        if let Some(password) = &self.password {
            AuthMethod::password(password.clone())
        } else if let Some(key_file) = &self.key_file {
            AuthMethod::key(key_file.clone(), None)
        } else {
            AuthMethod::Agent
        }
    }
}

impl JumphostConfig {
    pub fn auth_method(&self) -> AuthMethod {
        if let Some(password) = &self.password {
            AuthMethod::password(password.clone())
        } else if let Some(key_file) = &self.key_file {
            AuthMethod::key(key_file.clone(), None)
        } else {
            AuthMethod::Agent
        }
    }
}

fn validate_credential(scope: &str, has_password: bool, has_key: bool) -> Result<(), FleetError> {
    if has_password && has_key {
        return Err(FleetError::Config(format!(
            "{}: exactly one of `password`/`key_file` may be set, got both",
            scope
        )));
    }
    // Absence of both is allowed (agent auth); the exclusivity rule only
    // forbids both being set simultaneously, matching §4.9's validation rule.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_hosts() {
        let cfg = Config {
            hosts: vec![],
            user: "root".into(),
            password: Some("x".into()),
            key_file: None,
            port: 22,
            timeout: 30,
            max_parallel: 1,
            log_level: "info".into(),
            log_file: None,
            log_format: "text".into(),
            connection_pool_size: 20,
            connection_idle_timeout: 300,
            max_retries: 3,
            retry_delay: 4,
            jumphost: None,
            log_capture: LogCaptureConfig::default(),
            file_transfer: FileTransferConfig::default(),
            security: SecurityConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_both_password_and_key() {
        let mut cfg = minimal_config();
        cfg.key_file = Some("/key".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_log_format() {
        let mut cfg = minimal_config();
        cfg.log_format = "xml".into();
        assert!(cfg.validate().is_err());
    }

    fn minimal_config() -> Config {
        Config {
            hosts: vec!["h1".into()],
            user: "root".into(),
            password: Some("x".into()),
            key_file: None,
            port: 22,
            timeout: 30,
            max_parallel: 4,
            log_level: "info".into(),
            log_file: None,
            log_format: "text".into(),
            connection_pool_size: 20,
            connection_idle_timeout: 300,
            max_retries: 3,
            retry_delay: 4,
            jumphost: None,
            log_capture: LogCaptureConfig::default(),
            file_transfer: FileTransferConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}
