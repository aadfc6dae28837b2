use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{MarkerContent, SessionDescriptor, WorkItem, WorkStatus, NO_TARGET};
use crate::error::{MonitorError, Result};

/// JSON shapes a structured marker may take.
#[derive(Deserialize)]
#[serde(untagged)]
enum StructuredBody {
    List(Vec<Value>),
    Object(ObjectBody),
}

#[derive(Deserialize)]
struct ObjectBody {
    #[serde(default, alias = "tmux_session", alias = "tmuxSession")]
    target: Option<String>,
    #[serde(default)]
    todos: Vec<Value>,
}

/// Reads `<root>/<project_key>/<session_id>.<ext>` marker files.
///
/// Pure with respect to monitor state: every call walks the tree afresh.
#[derive(Debug, Clone)]
pub struct MarkerReader {
    root: PathBuf,
}

impl MarkerReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate every marker file and decode it.
    ///
    /// A missing root yields an empty list. Bad JSON degrades to an empty
    /// work list for that session only.
    pub fn discover(&self) -> Result<Vec<SessionDescriptor>> {
        if !self.root.is_dir() {
            debug!(root = %self.root.display(), "sessions root does not exist");
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    let path = self.root.display().to_string();
                    return Err(match e.into_io_error() {
                        Some(io) => MonitorError::io(path, io),
                        None => MonitorError::io(path, std::io::ErrorKind::Other.into()),
                    });
                }
                Err(e) => {
                    warn!("skipping unreadable marker entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            match read_marker(entry.path()) {
                Some(session) => {
                    debug!(
                        session_id = %session.session_id,
                        project = %session.project_key,
                        target = %session.routing_token,
                        active_work = ?session.active_work_count(),
                        "discovered session"
                    );
                    sessions.push(session);
                }
                None => continue,
            }
        }

        debug!(count = sessions.len(), "session discovery complete");
        Ok(sessions)
    }
}

fn read_marker(path: &Path) -> Option<SessionDescriptor> {
    let file_name = path.file_name()?.to_string_lossy();
    if file_name.starts_with('.') {
        return None;
    }
    let session_id = path.file_stem()?.to_string_lossy().into_owned();
    let project_key = path
        .parent()
        .and_then(Path::file_name)?
        .to_string_lossy()
        .into_owned();

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(e) => {
            warn!(path = %path.display(), "failed to stat marker: {}", e);
            return None;
        }
    };
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), "failed to read marker: {}", e);
            return None;
        }
    };

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let content = if is_json {
        parse_structured(path, &raw)
    } else {
        parse_plain(&raw)
    };

    Some(SessionDescriptor::from_marker(
        session_id,
        project_key,
        modified,
        content,
    ))
}

fn parse_plain(raw: &str) -> MarkerContent {
    let token = raw.trim();
    MarkerContent::Plain {
        token: if token.is_empty() {
            NO_TARGET.to_string()
        } else {
            token.to_string()
        },
    }
}

fn parse_structured(path: &Path, raw: &str) -> MarkerContent {
    let raw = raw.trim();
    if raw.is_empty() {
        return MarkerContent::Structured {
            target: None,
            work_items: Vec::new(),
        };
    }

    let (target, values) = match serde_json::from_str::<StructuredBody>(raw) {
        Ok(StructuredBody::List(values)) => (None, values),
        Ok(StructuredBody::Object(body)) => (body.target, body.todos),
        Err(e) => {
            warn!(path = %path.display(), "unparseable marker JSON, treating as empty: {}", e);
            (None, Vec::new())
        }
    };

    let work_items = values.iter().filter_map(work_item).collect();

    MarkerContent::Structured { target, work_items }
}

/// Only the status decides whether an entry is a work item; other fields are
/// hook-owned and may be any JSON type.
fn work_item(value: &Value) -> Option<WorkItem> {
    let status = value.get("status")?.as_str()?;
    Some(WorkItem {
        id: value.get("id").and_then(scalar_text),
        content: value.get("content").and_then(scalar_text),
        status: WorkStatus::from(status.to_string()),
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn write(root: &Path, rel: &str, body: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = MarkerReader::new(dir.path().join("nope"));
        assert!(reader.discover().unwrap().is_empty());
    }

    #[test]
    fn test_discovers_both_marker_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "proj-a/abc.json",
            r#"[{"content":"x","status":"pending"},{"content":"y","status":"completed"},"junk"]"#,
        );
        write(dir.path(), "proj-b/def.txt", "work:2.1\n");

        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        assert_eq!(sessions.len(), 2);

        let abc = &sessions[0];
        assert_eq!(abc.session_id, "abc");
        assert_eq!(abc.project_key, "proj-a");
        assert_eq!(abc.routing_token, "abc");
        assert_eq!(abc.active_work_count(), Some(1));
        let items = abc.work_items.as_ref().unwrap();
        assert_eq!(items[1].status, WorkStatus::Completed);

        let def = &sessions[1];
        assert_eq!(def.project_key, "proj-b");
        assert_eq!(def.routing_token, "work:2.1");
        assert_eq!(def.active_work_count(), None);
    }

    #[test]
    fn test_object_marker_with_explicit_target() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "proj/abc.json",
            r#"{"tmux_session":"dev:0.1","todos":[{"status":"in_progress"}]}"#,
        );
        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        assert_eq!(sessions[0].routing_token, "dev:0.1");
        assert_eq!(sessions[0].active_work_count(), Some(1));
    }

    #[test]
    fn test_malformed_json_falls_back_to_empty_work() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "proj/bad.json", "{not json");
        write(dir.path(), "proj/good.json", r#"[{"status":"pending"}]"#);

        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "bad");
        assert_eq!(sessions[0].active_work_count(), Some(0));
        assert_eq!(sessions[1].active_work_count(), Some(1));
    }

    #[test]
    fn test_non_string_ids_still_count_as_work() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "proj/abc.json",
            r#"[
                {"id": 1, "content": "a", "status": "pending"},
                {"id": 2, "content": "b", "status": "in_progress"},
                {"id": null, "content": ["odd"], "status": "pending"},
                {"id": 4, "status": 7},
                {"id": 5}
            ]"#,
        );
        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        assert_eq!(sessions[0].active_work_count(), Some(3));

        let items = sessions[0].work_items.as_ref().unwrap();
        assert_eq!(items[0].id.as_deref(), Some("1"));
        assert_eq!(items[2].id, None);
        assert_eq!(items[2].content, None);
    }

    #[test]
    fn test_empty_plain_marker_has_no_target() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "proj/s1.session", "   \n");
        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        assert_eq!(sessions[0].routing_token, NO_TARGET);
    }

    #[test]
    fn test_skips_stray_files_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stray.json", "[]");
        write(dir.path(), "proj/.hidden.json", "[]");
        write(dir.path(), "proj/nested/deep.json", "[]");
        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_last_activity_is_file_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "proj/abc.json", "[]");
        let then = SystemTime::now() - Duration::from_secs(300);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(then)).unwrap();

        let sessions = MarkerReader::new(dir.path()).discover().unwrap();
        let drift = sessions[0]
            .last_activity
            .duration_since(then)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1));
    }
}
