use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use boardwalk_core::event::{EventBus, RunEvent};
use boardwalk_core::types::RunId;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line, flushing
/// after each entry so a crashed process leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=graph boundaries, outputs and errors,
    /// 2=per node, 3=every event.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events until the run ends or `cancel` fires.
    pub async fn run(self, event_bus: Arc<EventBus>, run_id: RunId, cancel: CancellationToken) {
        // Subscribe before any await so events published meanwhile are kept.
        let mut rx = event_bus.subscribe();

        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&run_id.0, &event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, RunEvent::End(_)) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert a RunEvent to a log entry (None if filtered by level).
    fn event_to_entry(&self, run_id: &str, event: &RunEvent) -> Option<LogEntry> {
        let detail = match event {
            // L1: run and graph boundaries, results, failures
            RunEvent::Start(d) => Some(serde_json::json!({ "url": d.url })),
            RunEvent::GraphStart(d) | RunEvent::GraphEnd(d) => Some(serde_json::json!({
                "url": d.url,
                "title": d.title,
                "nesting": d.origin.nesting,
            })),
            RunEvent::Output(d) => Some(serde_json::json!({
                "outputs": truncate_json(&serde_json::Value::Object(d.outputs.clone()), 500),
                "bubbled": d.bubbled,
            })),
            RunEvent::Error(d) => Some(serde_json::json!({ "kind": d.kind, "message": d.message })),
            RunEvent::End(_) => None,

            // L2: per node
            RunEvent::NodeStart(d) if self.level >= 2 => {
                Some(serde_json::json!({ "type": d.node.node_type }))
            }
            RunEvent::NodeEnd(d) if self.level >= 2 => Some(serde_json::json!({
                "type": d.node.node_type,
                "outputs": d.outputs.as_ref().map(|o| truncate_json(&serde_json::Value::Object(o.clone()), 500)),
            })),
            RunEvent::Input(d) if self.level >= 2 => Some(serde_json::json!({ "bubbled": d.bubbled })),
            RunEvent::Secret(d) if self.level >= 2 => Some(serde_json::json!({ "keys": d.keys })),

            // L3: everything else
            RunEvent::Skip(d) if self.level >= 3 => {
                Some(serde_json::json!({ "missing_inputs": d.missing_inputs }))
            }
            RunEvent::Pause(_) | RunEvent::Resume(_) if self.level >= 3 => None,

            _ => return None,
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event.name(),
            node: event.node_id().map(str::to_string),
            path: event.origin().map(|o| o.path.clone()),
            detail,
        })
    }
}

/// Truncate a JSON value for logging.
fn truncate_json(value: &serde_json::Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use boardwalk_core::event::{EndData, EventOrigin, NodeData, PauseData, SkipData, StartData};
    use boardwalk_core::types::{NodeDescriptor, Values};

    fn start() -> RunEvent {
        RunEvent::Start(StartData {
            run_id: RunId("r".into()),
            url: None,
            timestamp: Utc::now(),
        })
    }

    fn node_start() -> RunEvent {
        RunEvent::NodeStart(NodeData {
            node: NodeDescriptor::new("b", "passthrough"),
            inputs: Values::new(),
            outputs: None,
            origin: EventOrigin::default(),
            timestamp: Utc::now(),
        })
    }

    fn skip() -> RunEvent {
        RunEvent::Skip(SkipData {
            node: NodeDescriptor::new("c", "output"),
            inputs: Values::new(),
            missing_inputs: vec!["text".into()],
            origin: EventOrigin::default(),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_jsonl_entry_format() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger.event_to_entry("run-1", &start()).unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"start\""));
        assert!(json.contains("run-1"));
        assert!(!json.contains("\"node\""));
        assert!(!json.contains("\"path\""));
    }

    #[test]
    fn test_truncate_json() {
        let value = serde_json::json!({"key": "a very long string that should be truncated"});
        let result = truncate_json(&value, 20);
        assert!(result.len() <= 23);
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_event_level_filtering() {
        let pause = RunEvent::Pause(PauseData {
            origin: EventOrigin::default(),
            timestamp: Utc::now(),
        });

        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.event_to_entry("r", &start()).is_some());
        assert!(logger.event_to_entry("r", &node_start()).is_none());
        assert!(logger.event_to_entry("r", &skip()).is_none());

        let logger2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger2.event_to_entry("r", &node_start()).unwrap();
        assert_eq!(entry.node.as_deref(), Some("b"));
        assert!(logger2.event_to_entry("r", &skip()).is_none());

        let logger3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(logger3.event_to_entry("r", &skip()).is_some());
        assert!(logger3.event_to_entry("r", &pause).is_some());
    }

    #[tokio::test]
    async fn test_writes_until_end() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let logger = RunLogger::new(dir.path().to_path_buf(), 3);
        let run_id = RunId("run-x".into());
        let handle = tokio::spawn(logger.run(bus.clone(), run_id.clone(), CancellationToken::new()));

        // Give the logger a chance to subscribe.
        tokio::task::yield_now().await;
        while bus.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.publish(start());
        bus.publish(skip());
        bus.publish(RunEvent::End(EndData {
            run_id: run_id.clone(),
            timestamp: Utc::now(),
        }));
        handle.await.unwrap();

        let run_dir = dir.path().join("run-x");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap().path();
        let text = std::fs::read_to_string(file).unwrap();
        let types: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event_type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["start", "skip", "end"]);
    }
}
