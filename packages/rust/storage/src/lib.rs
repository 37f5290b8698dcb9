//! Durable state for Paperflow runs.
//!
//! Everything lives under one state directory:
//!
//! ```text
//! <state_dir>/
//! ├── manifest.json            which records have exited, and under which pipeline
//! ├── cache/<stage>/<shard>/   one JSON file per (stage, record)
//! ├── checkpoints/<stage>.json in-progress stage snapshots
//! ├── failures.jsonl           append-only failure log
//! └── records.db               libSQL output store
//! ```
//!
//! JSON artifacts are replaced atomically (temp file + rename), so an
//! interrupted run never leaves a half-written manifest or cache entry.

mod atomic;
pub mod cache;
pub mod checkpoint;
pub mod failures;
pub mod manifest;
mod migrations;
pub mod records;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use paperflow_shared::{PaperflowError, Result};

pub use atomic::{write_atomic, write_json_atomic};
pub use cache::{CacheLookup, StageCacheStats, VersionedCache};
pub use checkpoint::{CheckpointPolicy, CheckpointStore, Checkpointer};
pub use failures::FailureLog;
pub use manifest::ManifestStore;
pub use records::{RecordCounts, RecordStore, RunRow, StoredRecord};

/// Paths inside a state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn failures_path(&self) -> PathBuf {
        self.root.join("failures.jsonl")
    }

    pub fn records_db_path(&self) -> PathBuf {
        self.root.join("records.db")
    }

    /// Create the directory tree. Failing here means the state dir is unusable.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root.clone(), self.cache_dir(), self.checkpoints_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| PaperflowError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn cache(&self) -> VersionedCache {
        VersionedCache::new(self.cache_dir())
    }

    pub fn manifest(&self) -> ManifestStore {
        ManifestStore::new(self.manifest_path())
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.checkpoints_dir())
    }

    pub fn failures(&self) -> FailureLog {
        FailureLog::new(self.failures_path())
    }

    pub async fn open_records(&self) -> Result<RecordStore> {
        RecordStore::open(&self.records_db_path()).await
    }

    /// Records whose last logged failure still stands.
    ///
    /// A failure is resolved once a later run committed the record again;
    /// records that failed in the same run that committed them (degraded)
    /// or were never committed stay outstanding.
    pub async fn outstanding_failures(&self) -> Result<BTreeSet<String>> {
        let latest = self.failures().latest_by_record()?;
        if latest.is_empty() || !self.records_db_path().exists() {
            return Ok(latest.into_keys().collect());
        }

        let store = self.open_records().await?;
        let mut outstanding = BTreeSet::new();
        for (record_id, failure) in latest {
            let resolved = match store.get(&record_id).await? {
                Some(stored) => {
                    failure.run_id.as_deref() != Some(stored.run_id.as_str())
                        && stored.updated_at > failure.timestamp
                }
                None => false,
            };
            if !resolved {
                outstanding.insert(record_id);
            }
        }
        Ok(outstanding)
    }
}
