use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::TerminalGateway;
use crate::markers::NO_TARGET;

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Gap between typing the payload and pressing Enter. The target's input
/// handler can drop the Enter if both arrive in one batch.
// TODO: replace the fixed delay with a capture-pane check that the payload landed.
const SUBMIT_DELAY: Duration = Duration::from_millis(500);

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    available: OnceCell<bool>,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self::with_path("tmux")
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            tmux_path: path.into(),
            available: OnceCell::new(),
        }
    }

    /// Run one tmux invocation with a hard timeout.
    async fn run(&self, args: &[&str], limit: Duration) -> Result<Output> {
        let child = Command::new(&self.tmux_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        tokio::time::timeout(limit, child)
            .await
            .with_context(|| format!("tmux {} timed out after {:?}", args[0], limit))?
            .with_context(|| format!("Failed to execute tmux {}", args[0]))
    }

    /// Run and report only whether tmux exited cleanly.
    async fn run_ok(&self, args: &[&str], limit: Duration) -> bool {
        match self.run(args, limit).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                debug!(
                    command = args[0],
                    code = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "tmux returned non-zero"
                );
                false
            }
            Err(e) => {
                warn!("{:#}", e);
                false
            }
        }
    }

    async fn check_version(&self) -> bool {
        match self.run(&["-V"], QUERY_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                debug!(
                    version = %String::from_utf8_lossy(&output.stdout).trim(),
                    "tmux is available"
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!("tmux version check failed: {:#}", e);
                false
            }
        }
    }

    /// PID of the process running in the target's active pane.
    async fn pane_pid(&self, target: &str) -> Option<u32> {
        let output = self
            .run(
                &["display-message", "-t", target, "-p", "#{pane_pid}"],
                QUERY_TIMEOUT,
            )
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_pane_pid(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

/// `send-keys` argv typing `payload` literally; `--` ends option parsing so
/// a payload starting with `-` is never read as a flag.
fn literal_keys_args<'a>(target: &'a str, payload: &'a str) -> [&'a str; 6] {
    ["send-keys", "-t", target, "-l", "--", payload]
}

fn parse_pane_pid(stdout: &str) -> Option<u32> {
    stdout
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid != 0)
}

#[async_trait]
impl TerminalGateway for TmuxClient {
    async fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.check_version()).await
    }

    async fn session_exists(&self, target: &str) -> bool {
        if !self.is_available().await {
            return false;
        }
        self.run_ok(&["has-session", "-t", target], QUERY_TIMEOUT)
            .await
    }

    async fn validate_target(&self, target: &str) -> bool {
        if target == NO_TARGET || !self.session_exists(target).await {
            debug!(target, "validation failed: target does not exist");
            return false;
        }
        match self.pane_pid(target).await {
            Some(pid) => {
                debug!(target, pane_pid = pid, "target validated");
                true
            }
            None => {
                debug!(target, "validation failed: no live pane process");
                false
            }
        }
    }

    async fn send_keys(&self, target: &str, text: &str) -> bool {
        if !self.is_available().await {
            return false;
        }
        let payload = text.trim_end_matches(['\r', '\n']);

        if !self
            .run_ok(&literal_keys_args(target, payload), SEND_TIMEOUT)
            .await
        {
            return false;
        }

        tokio::time::sleep(SUBMIT_DELAY).await;

        // The payload is already typed at this point; a failed Enter still
        // counts as a failed send.
        self.run_ok(&["send-keys", "-t", target, "Enter"], SEND_TIMEOUT)
            .await
    }
}
