//! Memory backend mirrored to a JSON-lines append log.
//!
//! Each write appends one record to `<dir>/<namespace>.jsonl`. At load the
//! log is replayed, expired entries are dropped and the file is compacted.
//! The log is compacted again whenever dead lines outnumber live entries.

use super::memory::MemoryOnly;
use super::{CacheBackend, CacheEntry};
use crate::error::{AppError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Log lines tolerated before compaction is considered.
const MIN_COMPACT_LINES: usize = 64;

/// One line of the snapshot log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Record {
    Put(CacheEntry),
    Remove { key: String },
}

struct SnapshotLog {
    path: PathBuf,
    file: Option<File>,
    lines: usize,
}

impl SnapshotLog {
    fn append(&mut self, record: &Record) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if self.file.is_none() {
            self.file = Some(open_append(&self.path)?);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(line.as_bytes())?;
            file.flush()?;
        }
        self.lines += 1;
        Ok(())
    }

    /// Replace the log with one `put` per live entry.
    ///
    /// Runs synchronously under the namespace lock, so writers to the same
    /// namespace wait for the rename.
    fn rewrite(&mut self, entries: &[CacheEntry]) -> Result<()> {
        self.file = None;

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                serde_json::to_writer(&mut writer, &Record::Put(entry.clone()))?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.file = Some(open_append(&self.path)?);
        self.lines = entries.len();
        Ok(())
    }
}

/// [`MemoryOnly`] whose writes are persisted to a snapshot file.
pub struct MemoryWithSnapshot {
    memory: MemoryOnly,
    log: Mutex<SnapshotLog>,
}

impl MemoryWithSnapshot {
    /// Open the snapshot at `path`, replaying any existing log.
    ///
    /// A corrupt snapshot is logged and replaced by an empty one.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = match replay(&path) {
            Ok(entries) => entries,
            Err(AppError::CacheCorruption(reason)) => {
                tracing::warn!(
                    path = %path.display(),
                    reason = %reason,
                    "Cache snapshot is corrupt, starting empty"
                );
                HashMap::new()
            }
            Err(e) => return Err(e),
        };

        let backend = Self {
            memory: MemoryOnly::with_entries(entries),
            log: Mutex::new(SnapshotLog {
                path,
                file: None,
                lines: 0,
            }),
        };

        {
            let mut log = backend.log.lock();
            log.rewrite(&backend.memory.live_entries())?;
            tracing::debug!(path = %log.path.display(), entries = log.lines, "Cache snapshot loaded");
        }

        Ok(backend)
    }

    fn compact_if_needed(&self, log: &mut SnapshotLog) {
        let live = self.memory.len();
        if log.lines > MIN_COMPACT_LINES && log.lines > live * 2 {
            self.compact(log);
        }
    }

    fn compact(&self, log: &mut SnapshotLog) {
        if let Err(e) = log.rewrite(&self.memory.live_entries()) {
            tracing::warn!(path = %log.path.display(), error = %e, "Failed to compact cache snapshot");
        }
    }

    fn persist(&self, log: &mut SnapshotLog, record: &Record) {
        if let Err(e) = log.append(record) {
            tracing::warn!(path = %log.path.display(), error = %e, "Failed to write cache snapshot");
        }
    }
}

impl CacheBackend for MemoryWithSnapshot {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.memory.get(key)
    }

    fn set(&self, entry: CacheEntry) {
        let mut log = self.log.lock();
        let record = Record::Put(entry.clone());
        self.memory.set(entry);
        self.persist(&mut log, &record);
        self.compact_if_needed(&mut log);
    }

    fn remove(&self, key: &str) -> bool {
        let mut log = self.log.lock();
        let removed = self.memory.remove(key);
        if removed {
            self.persist(
                &mut log,
                &Record::Remove {
                    key: key.to_string(),
                },
            );
            self.compact_if_needed(&mut log);
        }
        removed
    }

    fn clear(&self) {
        let mut log = self.log.lock();
        self.memory.clear();
        self.compact(&mut log);
    }

    fn sweep(&self) -> usize {
        let mut log = self.log.lock();
        let removed = self.memory.sweep();
        if removed > 0 {
            self.compact(&mut log);
        }
        removed
    }

    fn len(&self) -> usize {
        self.memory.len()
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Replay the log at `path` into the live entry set.
fn replay(path: &Path) -> Result<HashMap<String, CacheEntry>> {
    let mut entries = HashMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| AppError::CacheCorruption(format!("line {}: {e}", index + 1)))?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = serde_json::from_str(&line)
            .map_err(|e| AppError::CacheCorruption(format!("line {}: {e}", index + 1)))?;
        match record {
            Record::Put(entry) => {
                entries.insert(entry.key.clone(), entry);
            }
            Record::Remove { key } => {
                entries.remove(&key);
            }
        }
    }

    let now = Utc::now();
    entries.retain(|_, e| !e.is_expired_at(now));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(key: &str, value: serde_json::Value) -> CacheEntry {
        CacheEntry::new(key, value, Duration::from_secs(3600))
    }

    fn line_count(path: &Path) -> usize {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");

        {
            let backend = MemoryWithSnapshot::open(&path).unwrap();
            backend.set(entry("a", json!({"title": "Dune"})));
            backend.set(entry("b", json!([1, 2, 3])));
        }

        let backend = MemoryWithSnapshot::open(&path).unwrap();
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.get("a").unwrap().value, json!({"title": "Dune"}));
        assert_eq!(backend.get("b").unwrap().value, json!([1, 2, 3]));
    }

    #[test]
    fn entries_expired_on_disk_are_dropped_at_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.jsonl");

        {
            let backend = MemoryWithSnapshot::open(&path).unwrap();
            let mut stale = entry("stale", json!("old"));
            stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
            backend.set(stale);
            backend.set(entry("fresh", json!("new")));
        }

        let backend = MemoryWithSnapshot::open(&path).unwrap();
        assert!(backend.get("stale").is_none());
        assert!(backend.get("fresh").is_some());
        assert_eq!(line_count(&path), 1);
    }

    #[test]
    fn removals_are_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.jsonl");

        {
            let backend = MemoryWithSnapshot::open(&path).unwrap();
            backend.set(entry("a", json!(1)));
            backend.set(entry("b", json!(2)));
            assert!(backend.remove("a"));
        }

        let backend = MemoryWithSnapshot::open(&path).unwrap();
        assert!(backend.get("a").is_none());
        assert!(backend.get("b").is_some());
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        fs::write(&path, "{\"op\":\"put\",\"key\":\"a\"\nnot json at all\n").unwrap();

        let backend = MemoryWithSnapshot::open(&path).unwrap();
        assert!(backend.is_empty());
        assert_eq!(line_count(&path), 0);

        backend.set(entry("a", json!(1)));
        drop(backend);

        let backend = MemoryWithSnapshot::open(&path).unwrap();
        assert_eq!(backend.get("a").unwrap().value, json!(1));
    }

    #[test]
    fn log_is_compacted_when_dead_lines_dominate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        let backend = MemoryWithSnapshot::open(&path).unwrap();

        for i in 0..200 {
            backend.set(entry("same", json!(i)));
        }

        assert!(line_count(&path) <= MIN_COMPACT_LINES + 1);
        assert_eq!(backend.get("same").unwrap().value, json!(199));
    }

    #[test]
    fn clear_truncates_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.jsonl");
        let backend = MemoryWithSnapshot::open(&path).unwrap();
        backend.set(entry("a", json!(1)));

        backend.clear();

        assert!(backend.is_empty());
        assert_eq!(line_count(&path), 0);
    }

    #[test]
    fn creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache").join("auth.jsonl");

        let backend = MemoryWithSnapshot::open(&path).unwrap();
        backend.set(entry("a", json!(1)));

        assert!(path.exists());
    }
}
