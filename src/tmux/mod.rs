mod client;

pub use client::TmuxClient;

use async_trait::async_trait;

/// Narrow interface to the terminal multiplexer.
///
/// Every method folds failures (missing binary, timeout, non-zero exit)
/// into `false`; callers only ever learn "worked" or "did not".
#[async_trait]
pub trait TerminalGateway: Send + Sync + 'static {
    /// Whether the multiplexer binary answered its version check.
    /// Evaluated once per gateway and remembered.
    async fn is_available(&self) -> bool;

    /// Existence check for a session or pane.
    async fn session_exists(&self, target: &str) -> bool;

    /// Exists and has a live process attached.
    async fn validate_target(&self, target: &str) -> bool;

    /// Type `text` literally into the target, pause, then press Enter.
    async fn send_keys(&self, target: &str, text: &str) -> bool;
}
