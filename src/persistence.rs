// =============================================================================
// Persistence: append-only logs and atomic state snapshots
// =============================================================================
//
// Two append-only JSONL logs (trades, rebalances) plus a periodically written
// portfolio snapshot for crash recovery. Snapshot writes use the tmp + rename
// pattern so a crash mid-write never corrupts the previous state.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

/// Append-only JSON-lines writer. The file handle opens lazily and stays
/// open; each record is flushed immediately.
pub struct JsonlAppender {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlAppender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialise log record")?;
        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("file opened above");
        writeln!(file, "{line}").context("failed to append log record")?;
        file.flush().context("failed to flush log record")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for JsonlAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlAppender")
            .field("path", &self.path)
            .finish()
    }
}

/// Atomic JSON write: tmp sibling then rename.
pub fn save_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value).context("failed to serialise state")?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    debug!(path = %path.display(), "state snapshot written (atomic)");
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Root of all persisted engine state.
pub struct StateStore {
    data_dir: PathBuf,
    trade_log: JsonlAppender,
    rebalance_log: JsonlAppender,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            trade_log: JsonlAppender::new(data_dir.join("trade_log.jsonl")),
            rebalance_log: JsonlAppender::new(data_dir.join("rebalance_log.jsonl")),
            data_dir,
        }
    }

    pub fn append_trade<T: Serialize>(&self, record: &T) -> Result<()> {
        self.trade_log.append(record)
    }

    pub fn append_rebalance<T: Serialize>(&self, record: &T) -> Result<()> {
        self.rebalance_log.append(record)
    }

    fn portfolio_path(&self) -> PathBuf {
        self.data_dir.join("portfolio_state.json")
    }

    pub fn save_portfolio<T: Serialize>(&self, snapshot: &T) -> Result<()> {
        save_json_atomic(self.portfolio_path(), snapshot)
    }

    pub fn load_portfolio<T: DeserializeOwned>(&self) -> Result<T> {
        let snapshot = load_json(self.portfolio_path())?;
        info!(path = %self.portfolio_path().display(), "portfolio state loaded");
        Ok(snapshot)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        value: f64,
    }

    #[test]
    fn appender_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let appender = JsonlAppender::new(&path);

        for i in 0..3 {
            appender
                .append(&Record {
                    name: format!("r{i}"),
                    value: i as f64,
                })
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: Record = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(parsed.name, "r2");
    }

    #[test]
    fn atomic_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let record = Record {
            name: "snapshot".into(),
            value: 42.0,
        };
        save_json_atomic(&path, &record).unwrap();
        let loaded: Record = load_json(&path).unwrap();
        assert_eq!(loaded, record);
        // No stray tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn state_store_separates_logs() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .append_trade(&Record {
                name: "trade".into(),
                value: 1.0,
            })
            .unwrap();
        store
            .append_rebalance(&Record {
                name: "rebalance".into(),
                value: 2.0,
            })
            .unwrap();

        assert!(dir.path().join("trade_log.jsonl").exists());
        assert!(dir.path().join("rebalance_log.jsonl").exists());
        let trades = std::fs::read_to_string(dir.path().join("trade_log.jsonl")).unwrap();
        assert!(trades.contains("trade"));
        assert!(!trades.contains("rebalance"));
    }

    #[test]
    fn load_missing_portfolio_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let result: Result<Record> = store.load_portfolio();
        assert!(result.is_err());
    }
}
