//! Built-in middleware.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

/// Log every dispatched payload with its type and JSON encoding.
pub fn log_event<P: Serialize>(payload: &P) {
    let event = std::any::type_name::<P>();
    match serde_json::to_string(payload) {
        Ok(json) => info!(event, payload = %json, "event dispatched"),
        Err(err) => warn!(event, error = %err, "event dispatched (payload not serializable)"),
    }
}

/// Append-only JSON-lines log of dispatched payloads.
///
/// Each line is `{"at": <rfc3339>, "event": <type name>, "payload": <json>}`.
/// Write failures are logged and swallowed: middleware must not fail a
/// dispatch.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one payload.
    pub fn record<P: Serialize>(&self, payload: &P) {
        let event = std::any::type_name::<P>();
        let line = match serde_json::to_value(payload) {
            Ok(payload) => serde_json::json!({
                "at": Utc::now().to_rfc3339(),
                "event": event,
                "payload": payload,
            }),
            Err(err) => {
                warn!(event, error = %err, "event log skipped unserializable payload");
                return;
            }
        };

        // Lines from concurrent dispatches must not interleave.
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));

        if let Err(err) = written {
            warn!(event, path = %self.path.display(), error = %err, "failed to write event log");
        }
    }

    /// Adapt into a closure suitable for `EventBus::add_middleware`.
    pub fn middleware<P: Serialize + 'static>(self: Arc<Self>) -> impl Fn(&P) + Send + Sync + 'static {
        move |payload: &P| self.record(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventBus;

    #[derive(Debug, Clone, Serialize)]
    struct CreateUser {
        name: String,
    }

    #[tokio::test]
    async fn file_log_appends_one_line_per_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(FileEventLog::new(dir.path().join("events.log")));

        let mut bus: EventBus<CreateUser, ()> = EventBus::new().with_default_middleware();
        bus.add_middleware(log.clone().middleware());
        bus.set_handler(|_| Ok(()));

        for name in ["alice", "bob"] {
            bus.dispatch(CreateUser {
                name: name.to_string(),
            })
            .await
            .unwrap();
        }

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"]["name"], "alice");
        assert_eq!(lines[1]["payload"]["name"], "bob");
        assert!(lines[0]["event"].as_str().unwrap().ends_with("CreateUser"));
    }

    #[test]
    fn unwritable_path_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let log = FileEventLog::new(dir.path());

        log.record(&CreateUser {
            name: "alice".to_string(),
        });
    }
}
