//! Append-only, line-delimited JSON event log with size-based rotation.
//!
//! Used both for the task-level transition log (`_handoff/transition.ndjson`)
//! and the process-level audit log (`data/audit.ndjson`); both are instances
//! of the same primitive.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const DEFAULT_ROTATION_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

pub struct EventLog {
    path: PathBuf,
    rotation_threshold_bytes: u64,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rotation_threshold_bytes: DEFAULT_ROTATION_THRESHOLD_BYTES,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_rotation_threshold(mut self, bytes: u64) -> Self {
        self.rotation_threshold_bytes = bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a single record, rotating the log first if it has grown past
    /// the threshold. Keeps exactly one rotated generation (`<path>.1`).
    pub async fn append<T: Serialize>(&self, record: &T) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.rotate_if_needed().await?;

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn rotate_if_needed(&self) -> anyhow::Result<()> {
        let Ok(metadata) = tokio::fs::metadata(&self.path).await else {
            return Ok(());
        };
        if metadata.len() < self.rotation_threshold_bytes {
            return Ok(());
        }

        let rotated = rotated_path(&self.path);
        // Discard any previous rotated generation, then rotate current -> .1
        let _ = tokio::fs::remove_file(&rotated).await;
        tokio::fs::rename(&self.path, &rotated).await?;
        Ok(())
    }

    /// Reads every record in the active log (not the rotated generation),
    /// newest-first, optionally filtered by a predicate over the parsed
    /// JSON value. Used by the cost/audit log's `get_events`.
    pub async fn read_all(&self) -> anyhow::Result<Vec<Value>> {
        let Some(contents) = crate::atomic_write::safe_read(&self.path).await? else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        records.reverse();
        Ok(records)
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".1");
    path.with_file_name(name)
}
