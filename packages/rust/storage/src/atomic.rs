//! Crash-safe file replacement.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use paperflow_shared::{PaperflowError, Result};
use serde::Serialize;
use uuid::Uuid;

/// Write `bytes` to `path` by writing a sibling temp file and renaming it
/// over the target. Readers see either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PaperflowError::validation(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent).map_err(|e| PaperflowError::io(parent, e))?;

    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{filename}.{}.tmp", Uuid::now_v7().simple()));

    let written = File::create(&temp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp);
        return Err(PaperflowError::io(&temp, e));
    }

    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        PaperflowError::io(path, e)
    })
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(data).map_err(|e| {
        PaperflowError::Storage(format!("failed to serialize {}: {e}", path.display()))
    })?;
    json.push(b'\n');
    write_atomic(path, &json)
}
