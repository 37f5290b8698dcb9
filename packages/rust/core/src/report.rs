//! What a run did, per stage and overall.

use paperflow_shared::{ErrorKind, StageCounts};
use serde::Serialize;

/// Counters and timing for one stage across the whole run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub version: u32,
    pub counts: StageCounts,
    pub elapsed_ms: u64,
}

/// One failure recorded during the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRecord {
    pub record_id: String,
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Whether the record still exited. `false` means it stays pending and
    /// the next run retries it.
    pub committed: bool,
}

/// Summary returned by [`crate::Orchestrator::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub signature: String,
    pub corpus_size: usize,
    pub pending: usize,
    pub completed: usize,
    pub rejected: usize,
    /// Records that did not exit because a retryable error was exhausted.
    pub failed: usize,
    pub failures: Vec<FailedRecord>,
    pub stages: Vec<StageReport>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn new(run_id: &str, signature: &str, corpus_size: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            signature: signature.to_string(),
            corpus_size,
            pending: 0,
            completed: 0,
            rejected: 0,
            failed: 0,
            failures: Vec::new(),
            stages: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Nothing was pending; no stage ran and no state was written.
    pub fn is_zero_work(&self) -> bool {
        self.pending == 0
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Newly processed plus failed records across all stages.
    pub fn invocations(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.counts.processed + s.counts.failed)
            .sum()
    }

    pub fn cache_hits(&self) -> usize {
        self.stages.iter().map(|s| s.counts.cache_hits).sum()
    }
}
