//! Intra-stage checkpoints.
//!
//! While a stage works through a chunk, its progress is flushed to
//! `checkpoints/<stage>.json` whenever `every_records` records were handled or
//! `every` elapsed since the last flush, whichever comes first. Files stay
//! until the chunk's exits are committed to the manifest, so a crash in a
//! later stage still remembers which records already failed here.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use paperflow_shared::{PaperflowError, Result, StageCheckpoint, StageCounts};
use tracing::{debug, warn};

use crate::atomic::write_json_atomic;
use crate::cache::sanitize;

/// When to flush a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointPolicy {
    pub every_records: usize,
    pub every: Duration,
}

impl CheckpointPolicy {
    pub fn new(every_records: usize, every: Duration) -> Self {
        Self {
            every_records: every_records.max(1),
            every,
        }
    }
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::new(50, Duration::from_secs(30))
    }
}

/// Directory of per-stage checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(stage)))
    }

    /// Load the checkpoint for `stage` if it was written by `version`.
    /// Corrupt or outdated files are discarded.
    pub fn load(&self, stage: &str, version: u32) -> Option<StageCheckpoint> {
        let path = self.path(stage);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<StageCheckpoint>(&content) {
            Ok(cp) if cp.stage_name == stage && cp.stage_version == version => Some(cp),
            Ok(cp) => {
                debug!(stage, found = cp.stage_version, version, "discarding outdated checkpoint");
                let _ = std::fs::remove_file(&path);
                None
            }
            Err(e) => {
                warn!(?path, error = %e, "corrupt checkpoint discarded");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    pub fn save(&self, checkpoint: &StageCheckpoint) -> Result<()> {
        write_json_atomic(&self.path(&checkpoint.stage_name), checkpoint)
    }

    pub fn clear(&self, stage: &str) -> Result<()> {
        let path = self.path(stage);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PaperflowError::io(&path, e)),
        }
    }

    /// Remove every checkpoint file. Called once a chunk is committed.
    pub fn clear_all(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PaperflowError::io(&self.dir, e)),
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(&path).map_err(|e| PaperflowError::io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All readable checkpoints, for status reporting.
    pub fn list(&self) -> Vec<StageCheckpoint> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<StageCheckpoint> = entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
            .filter_map(|e| std::fs::read_to_string(e.path()).ok())
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect();
        out.sort_by(|a, b| a.stage_name.cmp(&b.stage_name));
        out
    }
}

/// Tracks one stage's progress over a chunk and flushes it on the policy.
pub struct Checkpointer<'a> {
    store: &'a CheckpointStore,
    policy: CheckpointPolicy,
    state: StageCheckpoint,
    since_flush: usize,
    last_flush: Instant,
    flushes: usize,
}

impl<'a> Checkpointer<'a> {
    /// Resume from a stored checkpoint for this run's stage version, or start fresh.
    pub fn resume(
        store: &'a CheckpointStore,
        policy: CheckpointPolicy,
        stage: &str,
        version: u32,
        run_id: &str,
    ) -> Self {
        let state = store
            .load(stage, version)
            .unwrap_or_else(|| StageCheckpoint::new(stage, version, run_id));
        Self {
            store,
            policy,
            state,
            since_flush: 0,
            last_flush: Instant::now(),
            flushes: 0,
        }
    }

    pub fn state(&self) -> &StageCheckpoint {
        &self.state
    }

    pub fn counts_mut(&mut self) -> &mut StageCounts {
        &mut self.state.counts
    }

    /// Whether a previous attempt recorded a failure for `record_id`.
    pub fn previously_failed(&self, record_id: &str) -> bool {
        self.state.failed.contains(record_id)
    }

    /// A record served from the cache. Records this stage already processed
    /// before an interruption come back as cache hits and are not counted again.
    pub fn mark_cached(&mut self, record_id: &str) -> Result<()> {
        if self.state.processed.contains(record_id) {
            return Ok(());
        }
        self.state.counts.cache_hits += 1;
        self.tick()
    }

    pub fn mark_processed(&mut self, record_id: &str) -> Result<()> {
        self.state.failed.remove(record_id);
        if self.state.processed.insert(record_id.to_string()) {
            self.state.counts.processed += 1;
        }
        self.tick()
    }

    pub fn mark_failed(&mut self, record_id: &str) -> Result<()> {
        if self.state.failed.insert(record_id.to_string()) {
            self.state.counts.failed += 1;
        }
        self.tick()
    }

    /// Number of flushes so far.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    fn tick(&mut self) -> Result<()> {
        self.since_flush += 1;
        if self.since_flush >= self.policy.every_records
            || self.last_flush.elapsed() >= self.policy.every
        {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        self.store.save(&self.state)?;
        self.since_flush = 0;
        self.last_flush = Instant::now();
        self.flushes += 1;
        debug!(
            stage = %self.state.stage_name,
            processed = self.state.counts.processed,
            cache_hits = self.state.counts.cache_hits,
            failed = self.state.counts.failed,
            "checkpoint flushed"
        );
        Ok(())
    }

    /// The stage is done with the chunk: persist the final state and hand it back.
    pub fn finish(mut self) -> Result<StageCheckpoint> {
        self.flush()?;
        Ok(self.state)
    }
}
