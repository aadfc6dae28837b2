mod reader;

pub use reader::MarkerReader;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Routing token meaning "no multiplexer target".
pub const NO_TARGET: &str = "none";

/// Status of a work item as written by the hook. Unknown values are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    Other(String),
}

impl From<String> for WorkStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            _ => Self::Other(s),
        }
    }
}

impl From<WorkStatus> for String {
    fn from(status: WorkStatus) -> Self {
        match status {
            WorkStatus::Pending => "pending".to_string(),
            WorkStatus::InProgress => "in_progress".to_string(),
            WorkStatus::Completed => "completed".to_string(),
            WorkStatus::Other(s) => s,
        }
    }
}

impl WorkStatus {
    /// Pending and in-progress items are the ones worth reviving for
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One todo entry from a structured marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    pub status: WorkStatus,
}

/// Decoded marker file body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerContent {
    /// Plain-text routing token; carries no work items
    Plain { token: String },
    /// JSON payload with a work list and possibly an explicit target
    Structured {
        target: Option<String>,
        work_items: Vec<WorkItem>,
    },
}

/// A session discovered from one marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub project_key: String,
    pub routing_token: String,
    pub last_activity: SystemTime,
    /// `None` for marker formats that carry no work list
    pub work_items: Option<Vec<WorkItem>>,
}

impl SessionDescriptor {
    pub fn from_marker(
        session_id: String,
        project_key: String,
        last_activity: SystemTime,
        content: MarkerContent,
    ) -> Self {
        let (routing_token, work_items) = match content {
            MarkerContent::Plain { token } => (token, None),
            MarkerContent::Structured { target, work_items } => (
                target
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| session_id.clone()),
                Some(work_items),
            ),
        };

        Self {
            session_id,
            project_key,
            routing_token,
            last_activity,
            work_items,
        }
    }

    /// Count of pending / in-progress items, or `None` when the format has no list.
    pub fn active_work_count(&self) -> Option<usize> {
        self.work_items
            .as_ref()
            .map(|items| items.iter().filter(|i| i.status.is_open()).count())
    }

    pub fn has_target(&self) -> bool {
        !self.routing_token.is_empty() && self.routing_token != NO_TARGET
    }
}
