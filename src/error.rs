use thiserror::Error;

/// Result alias used across the monitor.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Failures surfaced to callers of the monitor's operations.
///
/// Gateway and leader-election problems are deliberately absent: those are
/// folded into `false` / assume-leader verdicts and only logged.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Filesystem failure while reading the marker store or config file.
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration file contents.
    #[error("invalid config: {0}")]
    Config(String),

    /// No session with this id in the current snapshot.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The multiplexer reports no such session or pane.
    #[error("tmux target does not exist: {0}")]
    TargetNotFound(String),

    /// tmux is not installed or not answering.
    #[error("tmux is not available")]
    TmuxUnavailable,

    /// A background task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl MonitorError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for MonitorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<toml::de::Error> for MonitorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
