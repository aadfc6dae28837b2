//! Monitor configuration: defaults, clamping, and startup loading.
//!
//! Durations are whole seconds. Every write path goes through
//! [`MonitorConfig::apply`], so the minimums hold no matter whether a value
//! came from the TOML file, a `SESSION_PULSE_*` environment variable, or a
//! runtime `configure` call.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};

pub const MIN_PING_INTERVAL: u64 = 5;
pub const MIN_STALE_TIMEOUT: u64 = 30;
pub const MIN_FORGET_TIMEOUT: u64 = 60;

const DEFAULT_PING_INTERVAL: u64 = 30;
const DEFAULT_STALE_TIMEOUT: u64 = 150;
const DEFAULT_FORGET_TIMEOUT: u64 = 600;

const CONFIG_ENV: &str = "SESSION_PULSE_CONFIG";
const PING_INTERVAL_ENV: &str = "SESSION_PULSE_PING_INTERVAL";
const STALE_TIMEOUT_ENV: &str = "SESSION_PULSE_STALE_TIMEOUT";
const FORGET_TIMEOUT_ENV: &str = "SESSION_PULSE_FORGET_TIMEOUT";
const SESSIONS_ROOT_ENV: &str = "SESSION_PULSE_SESSIONS_ROOT";
const SIGNATURE_ENV: &str = "SESSION_PULSE_PROCESS_SIGNATURE";
const PLUGIN_ROOT_ENV: &str = "CLAUDE_PLUGIN_ROOT";
const SESSIONS_DIR: &str = ".sessions";

fn default_messages() -> Vec<String> {
    [
        "Please continue working...",
        "Continue with the next tasks...",
        "Let's keep going...",
        "Please proceed...",
        "Continue...",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Runtime-mutable monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Seconds between sweeps
    pub ping_interval: u64,
    /// Seconds of inactivity before a session is stale
    pub stale_timeout: u64,
    /// Seconds of inactivity before a session is forgotten
    pub forget_timeout: u64,
    /// Pool the revival message is drawn from; never empty
    pub continuation_messages: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            forget_timeout: DEFAULT_FORGET_TIMEOUT,
            continuation_messages: default_messages(),
        }
    }
}

/// Partial update accepted by `configure`. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub ping_interval: Option<u64>,
    pub stale_timeout: Option<u64>,
    pub forget_timeout: Option<u64>,
    pub continuation_messages: Option<Vec<String>>,
}

impl MonitorConfig {
    /// Merge an update, clamping durations to their minimums.
    ///
    /// An empty (or all-blank) message list leaves the current pool alone.
    pub fn apply(&mut self, update: ConfigUpdate) {
        if let Some(secs) = update.ping_interval {
            self.ping_interval = secs.max(MIN_PING_INTERVAL);
        }
        if let Some(secs) = update.stale_timeout {
            self.stale_timeout = secs.max(MIN_STALE_TIMEOUT);
        }
        if let Some(secs) = update.forget_timeout {
            self.forget_timeout = secs.max(MIN_FORGET_TIMEOUT);
        }
        if self.forget_timeout <= self.stale_timeout {
            warn!(
                stale_timeout = self.stale_timeout,
                forget_timeout = self.forget_timeout,
                "forget_timeout must exceed stale_timeout, raising it"
            );
            self.forget_timeout = self.stale_timeout + 1;
        }
        if let Some(messages) = update.continuation_messages {
            let messages: Vec<String> = messages
                .into_iter()
                .filter(|m| !m.trim().is_empty())
                .collect();
            if messages.is_empty() {
                debug!("ignoring empty continuation message list");
            } else {
                self.continuation_messages = messages;
            }
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout)
    }

    pub fn forget_timeout(&self) -> Duration {
        Duration::from_secs(self.forget_timeout)
    }
}

/// On-disk TOML layout. All keys optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    ping_interval: Option<u64>,
    stale_timeout: Option<u64>,
    forget_timeout: Option<u64>,
    continuation_messages: Option<Vec<String>>,
    sessions_root: Option<PathBuf>,
    process_signature: Option<String>,
}

impl FileConfig {
    /// Layer environment overrides on top of the file values.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(PING_INTERVAL_ENV) {
            self.ping_interval = Some(parse_secs(PING_INTERVAL_ENV, &raw)?);
        }
        if let Some(raw) = lookup(STALE_TIMEOUT_ENV) {
            self.stale_timeout = Some(parse_secs(STALE_TIMEOUT_ENV, &raw)?);
        }
        if let Some(raw) = lookup(FORGET_TIMEOUT_ENV) {
            self.forget_timeout = Some(parse_secs(FORGET_TIMEOUT_ENV, &raw)?);
        }
        if let Some(root) = lookup(SESSIONS_ROOT_ENV).filter(|r| !r.trim().is_empty()) {
            self.sessions_root = Some(PathBuf::from(root));
        }
        if let Some(signature) = lookup(SIGNATURE_ENV) {
            self.process_signature = Some(signature);
        }
        Ok(())
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| MonitorError::Config(format!("{key} must be whole seconds, got {raw:?}")))
}

/// Everything the host needs to build a monitor.
#[derive(Debug, Clone)]
pub struct Settings {
    pub monitor: MonitorConfig,
    /// Directory holding `<project_key>/<session_id>.<ext>` markers
    pub sessions_root: PathBuf,
    /// Command-line fragment identifying sibling monitor processes
    pub process_signature: String,
}

impl Settings {
    /// Resolve settings from defaults, the optional config file, and env.
    pub fn load() -> Result<Self> {
        let path = config_file_path();
        let mut file = match path {
            Some(ref p) if p.exists() => {
                debug!(path = %p.display(), "loading config file");
                read_file_config(p)?
            }
            Some(ref p) => {
                if env::var_os(CONFIG_ENV).is_some() {
                    warn!(path = %p.display(), "config file not found, using defaults");
                }
                FileConfig::default()
            }
            None => FileConfig::default(),
        };
        file.apply_env(|key| env::var(key).ok())?;
        Ok(Self::from_file_config(file))
    }

    /// Parse settings from TOML text, applying the same rules as [`load`](Self::load).
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(text)?;
        Ok(Self::from_file_config(file))
    }

    fn from_file_config(file: FileConfig) -> Self {
        let mut monitor = MonitorConfig::default();
        monitor.apply(ConfigUpdate {
            ping_interval: file.ping_interval,
            stale_timeout: file.stale_timeout,
            forget_timeout: file.forget_timeout,
            continuation_messages: file.continuation_messages,
        });

        Self {
            monitor,
            sessions_root: file.sessions_root.unwrap_or_else(default_sessions_root),
            process_signature: file
                .process_signature
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(default_process_signature),
        }
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| MonitorError::io(path.display().to_string(), e))?;
    Ok(toml::from_str(&text)?)
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(explicit) = env::var(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }
    dirs::config_dir().map(|d| d.join("session-pulse").join("config.toml"))
}

/// `$CLAUDE_PLUGIN_ROOT/.sessions`, or `./.sessions` when unset.
pub fn default_sessions_root() -> PathBuf {
    let base = env::var_os(PLUGIN_ROOT_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(SESSIONS_DIR)
}

fn default_process_signature() -> String {
    env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "session-pulse".to_string())
}
