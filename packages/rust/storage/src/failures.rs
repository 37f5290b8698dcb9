//! Append-only failure log (`failures.jsonl`).

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use paperflow_shared::{FailureRecord, PaperflowError, Result};
use tracing::warn;

/// One JSON object per line. A torn last line (crash mid-append) is skipped
/// on read.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &FailureRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PaperflowError::io(parent, e))?;
        }
        let mut line = serde_json::to_string(record)
            .map_err(|e| PaperflowError::Storage(format!("failed to encode failure: {e}")))?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PaperflowError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| PaperflowError::io(&self.path, e))
    }

    /// Every readable entry, oldest first.
    pub fn read_all(&self) -> Result<Vec<FailureRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PaperflowError::io(&self.path, e)),
        };

        let mut out = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => out.push(record),
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable failure entry"),
            }
        }
        Ok(out)
    }

    /// Entries for one stage.
    pub fn for_stage(&self, stage: &str) -> Result<Vec<FailureRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|f| f.stage_name == stage)
            .collect())
    }

    /// Distinct record IDs that ever failed.
    pub fn failed_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.read_all()?.into_iter().map(|f| f.record_id).collect())
    }

    /// The most recent entry for each record that ever failed.
    pub fn latest_by_record(&self) -> Result<BTreeMap<String, FailureRecord>> {
        let mut latest = BTreeMap::new();
        for record in self.read_all()? {
            latest.insert(record.record_id.clone(), record);
        }
        Ok(latest)
    }
}
