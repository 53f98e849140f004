// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use serde_json::{Map, Value, json};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::event::{Event, EventKind};
use crate::publisher::{Batch, Sink, SinkError};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes one JSON object per event, newline separated.
pub struct NdjsonSink {
    target: Option<PathBuf>,
    writer: Mutex<Writer>,
}

impl NdjsonSink {
    pub fn stdout() -> Self {
        Self {
            target: None,
            writer: Mutex::new(Box::new(tokio::io::stdout())),
        }
    }

    /// Append to `path`, creating it and its parent directory if needed.
    pub async fn file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = ?path, "Opened NDJSON output file");
        Ok(Self {
            target: Some(path),
            writer: Mutex::new(Box::new(file)),
        })
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }
}

impl Sink for NdjsonSink {
    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut buf = Vec::with_capacity(batch.bytes() + batch.len() * 128);
        for event in batch.events() {
            serde_json::to_writer(&mut buf, &encode(event))?;
            buf.push(b'\n');
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ndjson"
    }
}

fn encode(event: &Event) -> Value {
    let mut record = Map::new();
    record.insert(
        "@timestamp".to_string(),
        json!(event.timestamp_read.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    record.insert("type".to_string(), json!(event.kind.as_str()));

    match event.kind {
        EventKind::Line => {
            record.insert("path".to_string(), json!(event.source_path.to_string_lossy()));
            record.insert("source".to_string(), json!(event.source.key()));
            record.insert("generation".to_string(), json!(event.generation));
            record.insert("offset".to_string(), json!(event.offset_range.start));
            record.insert(
                "message".to_string(),
                json!(String::from_utf8_lossy(&event.payload)),
            );
        }
        EventKind::Usage => match serde_json::from_slice::<Map<String, Value>>(&event.payload) {
            Ok(fields) => record.extend(fields),
            Err(_) => {
                record.insert("path".to_string(), json!(event.source_path.to_string_lossy()));
                record.insert(
                    "message".to_string(),
                    json!(String::from_utf8_lossy(&event.payload)),
                );
            }
        },
    }

    Value::Object(record)
}
