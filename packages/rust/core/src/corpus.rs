//! JSONL corpus loading.
//!
//! Each non-empty line is one record, in either form:
//!
//! ```text
//! {"record_id": "W1", "fields": {"title": "...", "doi": "..."}}
//! {"id": "W1", "title": "...", "doi": "..."}
//! ```
//!
//! Every input field lands in the `source` namespace, so only stages write
//! outside it. `title` becomes `source.title`, `source.title` is kept, and a
//! dotted name such as `enrich.venue` becomes `source.enrich.venue`.

use std::collections::HashSet;
use std::path::Path;

use paperflow_shared::{PaperflowError, Record, Result, SOURCE_NAMESPACE};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Load every record from a JSONL file. Later duplicates of an ID are ignored.
pub fn load_corpus(path: &Path) -> Result<Vec<Record>> {
    let content = std::fs::read_to_string(path).map_err(|e| PaperflowError::io(path, e))?;
    let records = parse_corpus(&content)?;
    info!(path = %path.display(), records = records.len(), "corpus loaded");
    Ok(records)
}

/// Parse JSONL content into records.
pub fn parse_corpus(content: &str) -> Result<Vec<Record>> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|e| {
            PaperflowError::validation(format!("corpus line {}: {e}", lineno + 1))
        })?;
        let record = parse_record(value)
            .map_err(|msg| PaperflowError::validation(format!("corpus line {}: {msg}", lineno + 1)))?;

        if !seen.insert(record.record_id.clone()) {
            warn!(record_id = %record.record_id, line = lineno + 1, "duplicate record_id ignored");
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_record(value: Value) -> std::result::Result<Record, String> {
    let Value::Object(mut obj) = value else {
        return Err("expected a JSON object".into());
    };

    let id = obj
        .remove("record_id")
        .or_else(|| obj.remove("id"))
        .ok_or("missing record_id")?;
    let record_id = match id {
        Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err("record_id must be a non-empty string or number".into()),
    };

    let fields: Map<String, Value> = match obj.remove("fields") {
        Some(Value::Object(fields)) => fields,
        Some(_) => return Err("fields must be an object".into()),
        None => obj,
    };

    let prefix = format!("{SOURCE_NAMESPACE}.");
    let mut record = Record::new(record_id);
    for (key, value) in fields {
        let key = if key.starts_with(&prefix) {
            key
        } else {
            format!("{prefix}{key}")
        };
        record.fields.insert(key, value);
    }
    Ok(record)
}
