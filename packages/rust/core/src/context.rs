//! Everything a run needs, passed explicitly.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use paperflow_shared::AppConfig;
use paperflow_storage::{
    CheckpointPolicy, CheckpointStore, FailureLog, ManifestStore, StateLayout, VersionedCache,
};
use uuid::Uuid;

/// Knobs for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Reprocess the whole corpus.
    pub force: bool,
    /// Reprocess these records even if they already exited.
    pub force_ids: BTreeSet<String>,
    /// Ignore cached results for these stages (implies reprocessing the corpus).
    pub refresh_stages: BTreeSet<String>,
    /// Records carried through all stages before a manifest commit.
    pub chunk_size: usize,
    pub checkpoint: CheckpointPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: false,
            force_ids: BTreeSet::new(),
            refresh_stages: BTreeSet::new(),
            chunk_size: 256,
            checkpoint: CheckpointPolicy::default(),
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.defaults.chunk_size.max(1),
            checkpoint: CheckpointPolicy::new(
                config.checkpoint.every_records,
                Duration::from_secs(config.checkpoint.every_secs),
            ),
            ..Self::default()
        }
    }

    /// Whether `record_id` must be reprocessed regardless of the manifest.
    pub fn is_forced(&self, record_id: &str) -> bool {
        self.force || !self.refresh_stages.is_empty() || self.force_ids.contains(record_id)
    }
}

/// State stores and options for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    layout: StateLayout,
    cache: VersionedCache,
    manifest: ManifestStore,
    checkpoints: CheckpointStore,
    failures: FailureLog,
    options: RunOptions,
    run_id: String,
}

impl RunContext {
    pub fn new(state_dir: impl Into<PathBuf>, options: RunOptions) -> Self {
        let layout = StateLayout::new(state_dir);
        Self {
            cache: layout.cache(),
            manifest: layout.manifest(),
            checkpoints: layout.checkpoints(),
            failures: layout.failures(),
            layout,
            options,
            run_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn cache(&self) -> &VersionedCache {
        &self.cache
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}
