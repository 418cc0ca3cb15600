//! Channel Manager (C2) — persistent interactive shell sessions atop a
//! connection. Each host gets at most one tracked shell channel; running a
//! command against it drives the poll/pattern-match loop described in
//! `FetchOutput` below and keeps `current_directory` in sync with any `cd`.
//!
//! Grounded on `ssh::session::SshSession::request_shell_extended` for the
//! PTY + shell request shape, reworked from a terminal-I/O broadcast model
//! into a command/response engine: callers submit one command at a time and
//! get back the output collected up to the next prompt, not a byte stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use russh::{Channel, ChannelMsg};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::error::FleetError;
use crate::ssh::HandleController;
use crate::types::{ChannelResult, ChannelState};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_POLL_ITERATIONS: u32 = 50;

/// One step of a chain/interactive dialog.
#[derive(Debug, Clone)]
pub struct ChannelCommand {
    pub command: String,
    /// Pattern -> response. On a pattern hit in accumulated stdout, the
    /// response (if non-empty) is sent followed by `\n`.
    pub expect_patterns: HashMap<String, String>,
    pub wait_for_prompt: bool,
    pub timeout: Duration,
    /// Drain any bytes left over from a previous step before sending.
    pub clean_channel: bool,
}

impl Default for ChannelCommand {
    fn default() -> Self {
        Self {
            command: String::new(),
            expect_patterns: HashMap::new(),
            wait_for_prompt: true,
            timeout: Duration::from_secs(30),
            clean_channel: false,
        }
    }
}

impl ChannelCommand {
    pub fn simple(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

fn default_prompt_pattern() -> Regex {
    Regex::new(r"[$#]\s*$").expect("static prompt pattern is valid")
}

/// Which kind of channel `CreateChannel` should open. `Exec` is single-use
/// and never tracked in the registry; `Shell` is the persistent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Shell,
    Exec,
}

/// A single tracked interactive shell channel for one host.
pub struct ShellChannel {
    host: String,
    channel: AsyncMutex<Channel<russh::client::Msg>>,
    state: std::sync::Mutex<ChannelState>,
    current_directory: std::sync::Mutex<String>,
    previous_directory: std::sync::Mutex<Option<String>>,
    prompt_pattern: Regex,
    closed: AtomicBool,
}

impl ShellChannel {
    async fn open(host: &str, controller: &HandleController) -> Result<Self, FleetError> {
        let mut channel = controller
            .open_session_channel()
            .await
            .map_err(|e| FleetError::from_ssh(host.to_string(), e))?;

        channel
            .request_pty(false, "xterm-256color", 200, 50, 0, 0, &[])
            .await
            .map_err(|e| FleetError::protocol(host.to_string(), format!("pty request failed: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| FleetError::protocol(host.to_string(), format!("shell request failed: {e}")))?;

        Ok(Self {
            host: host.to_string(),
            channel: AsyncMutex::new(channel),
            state: std::sync::Mutex::new(ChannelState::Created),
            current_directory: std::sync::Mutex::new(".".to_string()),
            previous_directory: std::sync::Mutex::new(None),
            prompt_pattern: default_prompt_pattern(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn current_directory(&self) -> String {
        self.current_directory.lock().unwrap().clone()
    }

    fn set_state(&self, s: ChannelState) {
        *self.state.lock().unwrap() = s;
    }

    fn track_cd(&self, command: &str) {
        let Some(arg) = cd_argument(command) else {
            return;
        };
        let mut current = self.current_directory.lock().unwrap();
        let mut previous = self.previous_directory.lock().unwrap();
        apply_cd(&mut current, &mut previous, arg);
    }

    /// Run one command against this channel, implementing the `FetchOutput`
    /// poll loop: drain stdout before stderr each poll, fire each expect
    /// pattern at most once per contiguous new-data occurrence, stop on
    /// prompt match / exit status / idle timeout / overall deadline.
    pub async fn execute(&self, cmd: &ChannelCommand) -> ChannelResult {
        let start = Instant::now();
        let mut channel = self.channel.lock().await;

        self.set_state(ChannelState::Sending);

        if cmd.clean_channel {
            drain_pending(&mut channel).await;
        }

        if let Err(e) = channel.data(format!("{}\n", cmd.command).as_bytes()).await {
            self.set_state(ChannelState::Closed);
            return ChannelResult {
                command: cmd.command.clone(),
                stdout: String::new(),
                stderr: e.to_string(),
                exit_code: None,
                duration_secs: start.elapsed().as_secs_f64(),
                timestamp: Utc::now(),
                success: false,
                state: ChannelState::Closed,
            };
        }

        self.set_state(ChannelState::Reading);

        let mut stdout = String::new();
        let mut stderr = String::new();
        // Length of `stdout` the last time each pattern fired; a pattern may
        // fire again once `stdout` has grown past that mark.
        let mut fired_at: HashMap<String, usize> = HashMap::new();
        let mut no_data_polls: u32 = 0;
        let mut exit_code: Option<i32> = None;
        let mut timed_out = false;

        'poll: loop {
            if start.elapsed() > cmd.timeout {
                timed_out = true;
                break;
            }

            match tokio::time::timeout(POLL_INTERVAL, channel.wait()).await {
                Ok(Some(msg)) => {
                    no_data_polls = 0;
                    let mut pending_msgs = vec![msg];
                    // Drain anything else already queued so stdout for this
                    // poll is processed ahead of stderr, as specified.
                    while let Ok(Some(extra)) = tokio::time::timeout(Duration::from_millis(0), channel.wait()).await {
                        pending_msgs.push(extra);
                    }
                    pending_msgs.sort_by_key(|m| !matches!(m, ChannelMsg::Data { .. }));

                    for msg in pending_msgs {
                        match msg {
                            ChannelMsg::Data { data } => {
                                let (text, _, _) = encoding_rs::UTF_8.decode(&data);
                                stdout.push_str(&text);
                                fire_patterns(&stdout, &cmd.expect_patterns, &mut fired_at, &mut channel, &self.host).await;
                            }
                            ChannelMsg::ExtendedData { data, ext } => {
                                if ext == 1 {
                                    let (text, _, _) = encoding_rs::UTF_8.decode(&data);
                                    stderr.push_str(&text);
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                exit_code = Some(exit_status as i32);
                            }
                            ChannelMsg::Eof | ChannelMsg::Close => {
                                break 'poll;
                            }
                            _ => {}
                        }
                    }

                    if cmd.wait_for_prompt && self.prompt_pattern.is_match(&stdout) {
                        break;
                    }
                    if exit_code.is_some() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    no_data_polls += 1;
                    if no_data_polls >= DEFAULT_POLL_ITERATIONS {
                        break;
                    }
                }
            }
        }

        drop(channel);

        if timed_out {
            stderr.push_str("\n[fleetssh: channel command timed out]");
        }

        self.track_cd(&cmd.command);
        self.set_state(if timed_out { ChannelState::Closed } else { ChannelState::Idle });

        ChannelResult {
            command: cmd.command.clone(),
            stdout,
            stderr,
            exit_code,
            duration_secs: start.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            success: !timed_out,
            state: *self.state.lock().unwrap(),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channel = self.channel.lock().await;
        let _ = channel.eof().await;
        self.set_state(ChannelState::Closed);
    }
}

async fn fire_patterns(
    stdout: &str,
    patterns: &HashMap<String, String>,
    fired_at: &mut HashMap<String, usize>,
    channel: &mut Channel<russh::client::Msg>,
    host: &str,
) {
    for (pattern, response) in patterns {
        let last_fired = fired_at.get(pattern).copied().unwrap_or(0);
        if stdout.len() <= last_fired {
            continue;
        }
        let Ok(re) = Regex::new(pattern) else {
            warn!(host, pattern, "invalid expect pattern, skipping");
            continue;
        };
        if re.is_match(stdout) {
            fired_at.insert(pattern.clone(), stdout.len());
            if !response.is_empty() {
                if let Err(e) = channel.data(format!("{response}\n").as_bytes()).await {
                    warn!(host, "failed to send expect response: {}", e);
                }
            }
        }
    }
}

fn cd_argument(command: &str) -> Option<&str> {
    let arg = command.trim().strip_prefix("cd").map(str::trim)?;
    if arg.is_empty() {
        None
    } else {
        Some(arg)
    }
}

/// Pure state transition behind `cd`/`cd -` tracking (testable property #4):
/// absolute paths replace, relative paths concatenate, `-` swaps with the
/// previously tracked directory.
fn apply_cd(current: &mut String, previous: &mut Option<String>, arg: &str) {
    if arg == "-" {
        if let Some(prev) = previous.take() {
            let old_current = std::mem::replace(current, prev);
            *previous = Some(old_current);
        }
    } else if arg.starts_with('/') {
        *previous = Some(current.clone());
        *current = arg.to_string();
    } else {
        *previous = Some(current.clone());
        if current.ends_with('/') {
            current.push_str(arg);
        } else {
            current.push('/');
            current.push_str(arg);
        }
    }
}

async fn drain_pending(channel: &mut Channel<russh::client::Msg>) {
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(5), channel.wait()).await {
        match msg {
            ChannelMsg::Data { .. } | ChannelMsg::ExtendedData { .. } => continue,
            _ => break,
        }
    }
}

/// Runs `exec` against each command in order, stopping after the first
/// failing step — the chain-stop-on-failure rule shared by `ExecuteChain`
/// and `ExecuteInteractive`. Kept independent of `ShellChannel` so it can be
/// driven by a stand-in executor in tests.
async fn run_steps<E, Fut>(commands: &[ChannelCommand], mut exec: E) -> Vec<ChannelResult>
where
    E: FnMut(&ChannelCommand) -> Fut,
    Fut: std::future::Future<Output = ChannelResult>,
{
    let mut results = Vec::with_capacity(commands.len());
    for cmd in commands {
        let result = exec(cmd).await;
        let success = result.success;
        results.push(result);
        if !success {
            break;
        }
    }
    results
}

/// Maps `ExecuteInteractive` pairs into chain steps: every step waits for the
/// shell prompt before returning.
fn interactive_commands(pairs: &[(String, HashMap<String, String>)], timeout: Duration) -> Vec<ChannelCommand> {
    pairs
        .iter()
        .map(|(command, expect_patterns)| ChannelCommand {
            command: command.clone(),
            expect_patterns: expect_patterns.clone(),
            wait_for_prompt: true,
            timeout,
            clean_channel: false,
        })
        .collect()
}

/// Per-host registry of tracked shell channels, owned by the SSH Manager
/// alongside the connection pool.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, std::sync::Arc<ShellChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `GetChannel`/`CreateChannel(host, Shell)`: return the existing
    /// tracked channel or open a new one.
    pub async fn get_or_create(
        &self,
        host: &str,
        controller: &HandleController,
    ) -> Result<std::sync::Arc<ShellChannel>, FleetError> {
        if let Some(existing) = self.channels.get(host) {
            return Ok(existing.value().clone());
        }
        let channel = std::sync::Arc::new(ShellChannel::open(host, controller).await?);
        self.channels.insert(host.to_string(), channel.clone());
        Ok(channel)
    }

    /// `ExecuteChain`: run commands in order, stopping after the first
    /// failure. Each successful/failed step is appended to the result list.
    pub async fn execute_chain(
        &self,
        host: &str,
        controller: &HandleController,
        commands: &[ChannelCommand],
        create_new: bool,
    ) -> Result<Vec<ChannelResult>, FleetError> {
        if create_new {
            self.close_channel(host).await;
        }
        let channel = self.get_or_create(host, controller).await?;
        Ok(run_steps(commands, |cmd| channel.execute(cmd)).await)
    }

    /// `ExecuteInteractive`: each `(command, patterns)` pair runs as a chain
    /// step with `wait_for_prompt = true`.
    pub async fn execute_interactive(
        &self,
        host: &str,
        controller: &HandleController,
        pairs: &[(String, HashMap<String, String>)],
        timeout: Duration,
    ) -> Result<Vec<ChannelResult>, FleetError> {
        let commands = interactive_commands(pairs, timeout);
        self.execute_chain(host, controller, &commands, false).await
    }

    pub async fn close_channel(&self, host: &str) {
        if let Some((_, channel)) = self.channels.remove(host) {
            channel.close().await;
        }
    }

    pub async fn close_all(&self) {
        let hosts: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for host in hosts {
            self.close_channel(&host).await;
        }
    }

    pub fn current_directory(&self, host: &str) -> Option<String> {
        self.channels.get(host).map(|c| c.value().current_directory())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cd_absolute_replaces() {
        let mut current = "/home/user".to_string();
        let mut previous = None;
        apply_cd(&mut current, &mut previous, cd_argument("cd /var/log").unwrap());
        assert_eq!(current, "/var/log");
        assert_eq!(previous, Some("/home/user".to_string()));
    }

    #[test]
    fn cd_relative_concatenates() {
        let mut current = "/home/user".to_string();
        let mut previous = None;
        apply_cd(&mut current, &mut previous, cd_argument("cd sub").unwrap());
        assert_eq!(current, "/home/user/sub");
    }

    #[test]
    fn cd_dash_swaps_with_previous() {
        let mut current = "/home/user".to_string();
        let mut previous = None;
        apply_cd(&mut current, &mut previous, "/var/log");
        assert_eq!(current, "/var/log");
        apply_cd(&mut current, &mut previous, "-");
        assert_eq!(current, "/home/user");
        apply_cd(&mut current, &mut previous, "-");
        assert_eq!(current, "/var/log");
    }

    #[test]
    fn cd_with_no_argument_is_ignored() {
        assert_eq!(cd_argument("cd"), None);
        assert_eq!(cd_argument("cd   "), None);
        assert_eq!(cd_argument("echo cd"), None);
    }

    #[test]
    fn pattern_high_water_mark_prevents_refire_without_new_data() {
        let mut fired_at: HashMap<String, usize> = HashMap::new();
        let stdout = "Enter password: ";
        fired_at.insert("password:".to_string(), stdout.len());
        // Same stdout length: the pattern must not be eligible to fire again.
        assert!(stdout.len() <= fired_at["password:"]);
        let stdout = format!("{stdout}still waiting\nEnter password: ");
        // New data appended past the high-water mark: eligible again.
        assert!(stdout.len() > fired_at["password:"]);
    }

    fn stub_result(command: &str, stdout: &str, success: bool) -> ChannelResult {
        ChannelResult {
            command: command.to_string(),
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(if success { 0 } else { 1 }),
            duration_secs: 0.0,
            timestamp: Utc::now(),
            success,
            state: ChannelState::Idle,
        }
    }

    /// `cd /tmp`, `ls`, `false`, `echo skipped`: the chain must stop after
    /// `false` fails and never run the fourth step.
    #[tokio::test]
    async fn chain_stops_after_first_failing_step() {
        let commands = vec![
            ChannelCommand::simple("cd /tmp"),
            ChannelCommand::simple("ls"),
            ChannelCommand::simple("false"),
            ChannelCommand::simple("echo skipped"),
        ];
        let executed = std::sync::Mutex::new(Vec::new());

        let results = run_steps(&commands, |cmd| {
            executed.lock().unwrap().push(cmd.command.clone());
            let success = cmd.command != "false";
            let command = cmd.command.clone();
            async move { stub_result(&command, "", success) }
        })
        .await;

        assert_eq!(results.len(), 3);
        assert!(!results.last().unwrap().success);
        assert_eq!(
            executed.into_inner().unwrap(),
            vec!["cd /tmp".to_string(), "ls".to_string(), "false".to_string()]
        );
    }

    /// `(sudo -i, {password:->""}), (s3cret, {}), (whoami, {}), (exit, {})`:
    /// every step maps to a prompt-waiting chain step, and running them
    /// through to completion surfaces the final `whoami` output.
    #[tokio::test]
    async fn interactive_sudo_dialog_runs_to_completion() {
        let mut expect_password = HashMap::new();
        expect_password.insert("password:".to_string(), String::new());
        let pairs = vec![
            ("sudo -i".to_string(), expect_password),
            ("s3cret".to_string(), HashMap::new()),
            ("whoami".to_string(), HashMap::new()),
            ("exit".to_string(), HashMap::new()),
        ];

        let commands = interactive_commands(&pairs, Duration::from_secs(5));
        assert_eq!(commands.len(), 4);
        assert!(commands.iter().all(|c| c.wait_for_prompt));

        let results = run_steps(&commands, |cmd| {
            let stdout = if cmd.command == "whoami" { "root\n" } else { "" };
            let command = cmd.command.clone();
            async move { stub_result(&command, stdout, true) }
        })
        .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[2].stdout.trim(), "root");
    }
}
