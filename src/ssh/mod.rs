//! SSH transport layer — handles raw SSH connections and host-key trust.
//!
//! This module provides the core SSH protocol mechanics using the `russh`
//! library. Everything above it (connection pool, channel manager) talks to
//! a connection only through a [`handle_owner::HandleController`] — no other
//! code ever touches a `russh::client::Handle` directly.
//!
//! # Features
//! - Direct SSH connections, password/key/agent/certificate auth
//! - Host key verification via `~/.ssh/known_hosts` (TOFU)
//! - Single-owner actor around the connection handle (see `handle_owner`)

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, ProxyHopConfig, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{get_known_hosts, HostKeyVerification, KnownHostsStore};
