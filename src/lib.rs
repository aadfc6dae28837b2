//! Session liveness monitor for tmux-hosted agent sessions.
//!
//! External hooks keep one marker file per working session under
//! `<root>/<project_key>/<session_id>.<ext>`. The monitor polls that tree,
//! classifies each session by marker age, and when this process is the
//! elected leader types a continuation prompt into stale sessions that
//! still have open work.

pub mod config;
pub mod error;
pub mod leader;
pub mod markers;
pub mod monitor;
pub mod revival;
pub mod staleness;
pub mod tmux;

pub use config::{ConfigUpdate, MonitorConfig, Settings};
pub use error::{MonitorError, Result};
pub use monitor::{SessionListing, SessionMonitor, SessionView, SweepReport};
