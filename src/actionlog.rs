//! Bounded JSON-Lines action log.
//!
//! Every dispatched recovery action (and every recovery itself) is appended
//! to `$DATA_DIR/watchdog.log`, one JSON object per line. The file is capped:
//! before each append the current size is checked against the cap and the
//! backups rotate `current → .1 → .2`, discarding the oldest. A small
//! in-memory ring keeps the newest entries for cheap status snapshots.
//!
//! Log I/O failures are reported through `tracing` and dropped — the
//! supervisor must keep running even on a full disk.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

/// One durable audit record. Recovery entries reuse the same shape with
/// `level = 0`, `level_name = "RECOVERY"` and the two trailing extras set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    /// RFC 3339 dispatch time.
    pub timestamp: String,
    pub modem_id: String,
    pub level: u8,
    pub level_name: String,
    pub problem_type: String,
    pub problem_message: String,
    pub action_success: bool,
    pub action_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_duration_secs: Option<u64>,
}

/// On-disk footprint summary for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub exists: bool,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub entries: usize,
    pub backups: Vec<String>,
    pub max_size_mb: f64,
    pub path: String,
}

pub struct ActionLog {
    path: PathBuf,
    max_size_bytes: u64,
    max_memory_entries: usize,
    ring: Mutex<VecDeque<ActionEntry>>,
    /// The rotate-then-append sequence must be mutually excluded from itself.
    file_gate: Mutex<()>,
}

impl ActionLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_size_bytes: u64, max_memory_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_size_bytes,
            max_memory_entries,
            ring: Mutex::new(VecDeque::with_capacity(max_memory_entries)),
            file_gate: Mutex::new(()),
        }
    }

    fn backup_path(&self, n: u8) -> PathBuf {
        PathBuf::from(format!("{}.{n}", self.path.display()))
    }

    /// Append one entry, rotating first if the current file is at the cap.
    pub async fn write(&self, entry: &ActionEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                error!("Action log serialize error: {e}");
                return;
            }
        };

        {
            let _gate = self.file_gate.lock().await;
            if let Err(e) = self.rotate_and_append(&line).await {
                error!("Action log write failed: {e}");
            }
        }

        let mut ring = self.ring.lock().await;
        ring.push_front(entry.clone());
        ring.truncate(self.max_memory_entries);
    }

    async fn rotate_and_append(&self, line: &str) -> std::io::Result<()> {
        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            if meta.len() >= self.max_size_bytes {
                let _ = tokio::fs::remove_file(self.backup_path(2)).await;
                let _ = tokio::fs::rename(self.backup_path(1), self.backup_path(2)).await;
                tokio::fs::rename(&self.path, self.backup_path(1)).await?;
            }
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Newest entries from the in-memory ring, most recent first.
    pub async fn recent(&self, limit: usize) -> Vec<ActionEntry> {
        let ring = self.ring.lock().await;
        ring.iter().take(limit).cloned().collect()
    }

    /// Last `limit` entries of the current file, most recent first.
    /// Malformed lines come back as `{"raw": <line>}` rather than vanishing.
    pub async fn read_recent(&self, limit: usize) -> Vec<Value> {
        let Ok(content) = tokio::fs::read_to_string(&self.path).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .rev()
            .take(limit)
            .map(|l| serde_json::from_str::<Value>(l).unwrap_or_else(|_| json!({ "raw": l })))
            .collect()
    }

    pub async fn stats(&self) -> LogStats {
        let meta = tokio::fs::metadata(&self.path).await.ok();
        let exists = meta.is_some();
        let size_bytes = meta.map_or(0, |m| m.len());
        let entries = if exists {
            tokio::fs::read_to_string(&self.path)
                .await
                .map_or(0, |c| c.lines().filter(|l| !l.trim().is_empty()).count())
        } else {
            0
        };

        let mut backups = Vec::new();
        for n in [1u8, 2] {
            let p = self.backup_path(n);
            if tokio::fs::metadata(&p).await.is_ok() {
                if let Some(name) = p.file_name().and_then(|f| f.to_str()) {
                    backups.push(name.to_string());
                }
            }
        }

        LogStats {
            exists,
            size_bytes,
            size_mb: round2(size_bytes),
            entries,
            backups,
            max_size_mb: round2(self.max_size_bytes),
            path: self.path.display().to_string(),
        }
    }

    /// Remove the current file, all backups, and the in-memory ring.
    pub async fn clear(&self) {
        {
            let _gate = self.file_gate.lock().await;
            let _ = tokio::fs::remove_file(&self.path).await;
            let _ = tokio::fs::remove_file(self.backup_path(1)).await;
            let _ = tokio::fs::remove_file(self.backup_path(2)).await;
        }
        self.ring.lock().await.clear();
    }
}

#[allow(clippy::cast_precision_loss)]
fn round2(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
