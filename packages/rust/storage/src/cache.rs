//! Versioned per-stage result cache.
//!
//! Layout: `<root>/<stage>/<shard>/<sanitized-id>-<hash>.json`, where the
//! shard is the first two characters of the sanitized record ID. Each file
//! holds one [`CacheEntry`]; an entry is only valid for the stage version it
//! was written under.

use std::path::{Path, PathBuf};

use chrono::Utc;
use paperflow_shared::{CacheEntry, PaperflowError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::atomic::write_json_atomic;

/// Longest sanitized ID kept in a file name.
const MAX_STEM_LEN: usize = 96;

/// Result of probing the cache for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Entry written under the requested version.
    Hit(CacheEntry),
    /// Entry exists but was written by another stage version.
    Stale { found_version: u32 },
    /// No usable entry.
    Miss,
}

/// Entry count and size for one stage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCacheStats {
    pub stage: String,
    pub entries: usize,
    pub bytes: u64,
}

/// Filesystem cache of stage payloads, keyed by `(stage, record_id)`.
#[derive(Debug, Clone)]
pub struct VersionedCache {
    root: PathBuf,
}

impl VersionedCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry file for `record_id` under `stage`.
    pub fn entry_path(&self, stage: &str, record_id: &str) -> PathBuf {
        let stem = sanitize(record_id);
        let shard: String = stem.chars().chain("__".chars()).take(2).collect();
        let digest = Sha256::digest(record_id.as_bytes());
        let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
        self.root
            .join(sanitize(stage))
            .join(shard)
            .join(format!("{stem}-{suffix}.json"))
    }

    /// Probe the cache. Unreadable entries are deleted and reported as a miss.
    pub fn lookup(&self, stage: &str, version: u32, record_id: &str) -> CacheLookup {
        match self.read_entry(stage, record_id) {
            Some(entry) if entry.stage_version == version => CacheLookup::Hit(entry),
            Some(entry) => CacheLookup::Stale {
                found_version: entry.stage_version,
            },
            None => CacheLookup::Miss,
        }
    }

    /// Payload for `record_id` if it was cached under `version`.
    pub fn get(&self, stage: &str, version: u32, record_id: &str) -> Option<Value> {
        match self.lookup(stage, version, record_id) {
            CacheLookup::Hit(entry) => Some(entry.payload),
            _ => None,
        }
    }

    /// Entry for `record_id` regardless of version (inspection only).
    pub fn peek(&self, stage: &str, record_id: &str) -> Option<CacheEntry> {
        self.read_entry(stage, record_id)
    }

    /// Store a payload, replacing any previous entry for the record.
    pub fn put(&self, stage: &str, version: u32, record_id: &str, payload: &Value) -> Result<()> {
        let entry = CacheEntry {
            record_id: record_id.to_string(),
            stage_name: stage.to_string(),
            stage_version: version,
            payload: payload.clone(),
            cached_at: Utc::now(),
        };
        write_json_atomic(&self.entry_path(stage, record_id), &entry)
    }

    /// Delete one entry. Returns whether a file was removed.
    pub fn remove(&self, stage: &str, record_id: &str) -> Result<bool> {
        let path = self.entry_path(stage, record_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PaperflowError::io(&path, e)),
        }
    }

    /// Names of stages that have a cache directory.
    pub fn stages(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut stages = Vec::new();
        let entries = std::fs::read_dir(&self.root).map_err(|e| PaperflowError::io(&self.root, e))?;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                stages.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        stages.sort();
        Ok(stages)
    }

    /// Entry counts and sizes per stage.
    pub fn stats(&self) -> Result<Vec<StageCacheStats>> {
        let mut out = Vec::new();
        for stage in self.stages()? {
            let mut stats = StageCacheStats {
                stage: stage.clone(),
                entries: 0,
                bytes: 0,
            };
            let stage_dir = self.root.join(&stage);
            let shards =
                std::fs::read_dir(&stage_dir).map_err(|e| PaperflowError::io(&stage_dir, e))?;
            for shard in shards.flatten() {
                let Ok(files) = std::fs::read_dir(shard.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let name = file.file_name();
                    let name = name.to_string_lossy();
                    if name.ends_with(".json") && !name.starts_with('.') {
                        stats.entries += 1;
                        stats.bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
                    }
                }
            }
            out.push(stats);
        }
        Ok(out)
    }

    /// Remove cached entries for one stage, or for all stages.
    /// Returns the number of entries deleted.
    pub fn clear(&self, stage: Option<&str>) -> Result<usize> {
        let stats = self.stats()?;
        let mut removed = 0;
        for s in stats {
            if stage.is_some_and(|name| sanitize(name) != s.stage) {
                continue;
            }
            let dir = self.root.join(&s.stage);
            std::fs::remove_dir_all(&dir).map_err(|e| PaperflowError::io(&dir, e))?;
            removed += s.entries;
        }
        debug!(removed, stage = stage.unwrap_or("*"), "cache cleared");
        Ok(removed)
    }

    fn read_entry(&self, stage: &str, record_id: &str) -> Option<CacheEntry> {
        let path = self.entry_path(stage, record_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(?path, error = %e, "unreadable cache entry, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.record_id == record_id && entry.stage_name == stage => Some(entry),
            Ok(_) | Err(_) => {
                warn!(?path, record_id, stage, "corrupt cache entry discarded");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }
}

/// Map an identifier onto a portable file-name stem.
pub(crate) fn sanitize(id: &str) -> String {
    let mut out: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();
    if out.starts_with('.') {
        out.replace_range(..1, "_");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
