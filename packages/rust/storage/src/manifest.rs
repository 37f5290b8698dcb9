//! `manifest.json`: the authority on which records have exited the pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use paperflow_shared::{CURRENT_SCHEMA_VERSION, ManifestEntry, ManifestState, PaperflowError, Result};
use tracing::{debug, info};

use crate::atomic::write_json_atomic;

/// Loads and atomically commits the manifest.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest, or an empty one if it does not exist yet.
    ///
    /// An unreadable or unparseable manifest is an error: without it there is
    /// no way to tell which records are done.
    pub fn load(&self) -> Result<ManifestState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "no manifest yet, starting empty");
                return Ok(ManifestState::default());
            }
            Err(e) => return Err(PaperflowError::io(&self.path, e)),
        };

        let state: ManifestState = serde_json::from_str(&content).map_err(|e| {
            PaperflowError::manifest(format!("{} is corrupt: {e}", self.path.display()))
        })?;

        if state.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(PaperflowError::manifest(format!(
                "schema version {} is newer than supported version {}",
                state.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        Ok(state)
    }

    /// Record exits and the stage versions they were produced under, then
    /// replace the file atomically. Nothing is written when `exits` is empty.
    ///
    /// Returns the number of entries applied.
    pub fn commit(
        &self,
        state: &mut ManifestState,
        exits: impl IntoIterator<Item = (String, ManifestEntry)>,
        stage_versions: &BTreeMap<String, u32>,
    ) -> Result<usize> {
        let mut applied = 0;
        for (record_id, entry) in exits {
            state.exited.insert(record_id, entry);
            applied += 1;
        }
        if applied == 0 {
            return Ok(0);
        }

        for (stage, version) in stage_versions {
            state.stage_versions.insert(stage.clone(), *version);
        }
        state.schema_version = CURRENT_SCHEMA_VERSION;
        state.last_update = Some(Utc::now());

        write_json_atomic(&self.path, state)?;
        info!(applied, total = state.exited.len(), "manifest committed");
        Ok(applied)
    }
}
