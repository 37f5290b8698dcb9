//! Core domain types for Paperflow.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

/// Current schema version for the manifest format.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Namespace holding baseline fields supplied by the corpus.
pub const SOURCE_NAMESPACE: &str = "source";

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One paper travelling through the pipeline.
///
/// Fields are keyed `<namespace>.<field>`; each stage writes only under its
/// own namespace, so a merge can add or overwrite but never removes data
/// written by another stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable, externally-assigned identifier.
    pub record_id: String,
    /// Accumulated fields.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record.
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style helper used by corpus loading and tests.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a namespaced field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    /// Look up a non-empty string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Look up a numeric field (accepts numbers and numeric strings).
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Whether the field is present and carries content.
    pub fn has(&self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }

    /// Merge a stage payload under `namespace`.
    ///
    /// Object payloads are flattened one level (`{"doi": ..}` becomes
    /// `<namespace>.doi`); any other payload is stored as `<namespace>.value`.
    /// Returns the number of fields written.
    pub fn merge_namespace(&mut self, namespace: &str, payload: &Value) -> usize {
        match payload {
            Value::Object(map) => {
                for (key, value) in map {
                    self.fields
                        .insert(format!("{namespace}.{key}"), value.clone());
                }
                map.len()
            }
            other => {
                self.fields
                    .insert(format!("{namespace}.value"), other.clone());
                1
            }
        }
    }

    /// Fields written under `namespace`, with the prefix stripped.
    pub fn namespace_fields<'a>(
        &'a self,
        namespace: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.fields.iter().filter_map(move |(key, value)| {
            key.strip_prefix(namespace)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|field| (field, value))
        })
    }
}

// ---------------------------------------------------------------------------
// StageDescriptor
// ---------------------------------------------------------------------------

/// What dominates a stage's cost. The quality gate must sit before the first
/// `Inference` stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageCost {
    /// Pure local computation.
    Local,
    /// Bound by calls to an external source.
    Network,
    /// Dominated by model inference.
    Inference,
}

/// Declared contract of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique stage name (also the cache directory name).
    pub name: String,
    /// Logic version; bumping it invalidates this stage's cache entries only.
    pub version: u32,
    /// Fields that must be present before the stage can run for a record.
    pub required_fields: Vec<String>,
    /// Namespace the stage writes into.
    pub namespace: String,
    /// Error kinds the stage treats as retryable.
    pub transient: Vec<ErrorKind>,
    /// Maximum number of records per invocation.
    pub batch_size: usize,
    /// Cost class.
    pub cost: StageCost,
}

impl StageDescriptor {
    /// A local, single-record stage writing under `namespace`.
    pub fn new(name: impl Into<String>, version: u32, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            required_fields: Vec::new(),
            namespace: namespace.into(),
            transient: ErrorKind::DEFAULT_TRANSIENT.to_vec(),
            batch_size: 1,
            cost: StageCost::Local,
        }
    }

    pub fn requires(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_transient(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.transient = kinds;
        self
    }

    pub fn with_cost(mut self, cost: StageCost) -> Self {
        self.cost = cost;
        self
    }

    /// Required fields missing from `record`.
    pub fn missing_inputs<'a>(&'a self, record: &Record) -> Vec<&'a str> {
        self.required_fields
            .iter()
            .filter(|f| !record.has(f))
            .map(String::as_str)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A stage result for one record, tagged with the stage version that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub record_id: String,
    pub stage_name: String,
    pub stage_version: u32,
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FailureRecord
// ---------------------------------------------------------------------------

/// One line of the append-only failure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub record_id: String,
    pub stage_name: String,
    pub error_kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

fn default_attempts() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// How a record left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Ran every stage (possibly with degraded, failed stages).
    Completed,
    /// Stopped at the quality gate; excluded from the searchable index.
    Rejected,
}

impl ExitOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }
}

/// Manifest entry for one exited record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub outcome: ExitOutcome,
    /// Pipeline signature the record exited under.
    pub signature: String,
}

/// The `manifest.json` structure at the root of the state directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestState {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Records that have exited the pipeline, ordered by ID.
    #[serde(default)]
    pub exited: BTreeMap<String, ManifestEntry>,
    /// Last-seen version of every stage that committed records.
    #[serde(default)]
    pub stage_versions: BTreeMap<String, u32>,
    /// When the manifest was last committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for ManifestState {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            exited: BTreeMap::new(),
            stage_versions: BTreeMap::new(),
            last_update: None,
        }
    }
}

impl ManifestState {
    /// Whether `record_id` exited under `signature`.
    pub fn is_done(&self, record_id: &str, signature: &str) -> bool {
        self.exited
            .get(record_id)
            .is_some_and(|entry| entry.signature == signature)
    }

    /// Outcome recorded for `record_id`, regardless of signature.
    pub fn outcome(&self, record_id: &str) -> Option<ExitOutcome> {
        self.exited.get(record_id).map(|e| e.outcome)
    }

    /// `(completed, rejected)` counts.
    pub fn counts(&self) -> (usize, usize) {
        self.exited
            .values()
            .fold((0, 0), |(c, r), entry| match entry.outcome {
                ExitOutcome::Completed => (c + 1, r),
                ExitOutcome::Rejected => (c, r + 1),
            })
    }

    /// Number of exited records whose signature differs from `signature`.
    pub fn stale_count(&self, signature: &str) -> usize {
        self.exited
            .values()
            .filter(|e| e.signature != signature)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Per-stage counters, shared by checkpoints and run reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    /// Valid cache entries reused.
    pub cache_hits: usize,
    /// Records newly processed by an invocation.
    pub processed: usize,
    /// Records that produced a failure record.
    pub failed: usize,
    /// Records stopped by the quality gate (gate stage only).
    pub rejected: usize,
}

impl StageCounts {
    pub fn add(&mut self, other: &StageCounts) {
        self.cache_hits += other.cache_hits;
        self.processed += other.processed;
        self.failed += other.failed;
        self.rejected += other.rejected;
    }
}

/// In-progress snapshot of a stage's work over the current chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub stage_name: String,
    pub stage_version: u32,
    pub run_id: String,
    /// Records whose result is committed to the cache.
    #[serde(default)]
    pub processed: BTreeSet<String>,
    /// Records that failed permanently in this stage.
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub counts: StageCounts,
    pub updated_at: DateTime<Utc>,
}

impl StageCheckpoint {
    pub fn new(stage_name: &str, stage_version: u32, run_id: &str) -> Self {
        Self {
            stage_name: stage_name.to_string(),
            stage_version,
            run_id: run_id.to_string(),
            processed: BTreeSet::new(),
            failed: BTreeSet::new(),
            counts: StageCounts::default(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_namespace_flattens_objects() {
        let mut record = Record::new("A");
        let written = record.merge_namespace("validate", &json!({"doi": "10.1/x", "year": 2020}));
        assert_eq!(written, 2);
        assert_eq!(record.get_str("validate.doi"), Some("10.1/x"));
        assert_eq!(record.get_f64("validate.year"), Some(2020.0));
    }

    #[test]
    fn merge_never_touches_other_namespaces() {
        let mut record = Record::new("A").with_field("source.title", "Attention");
        record.merge_namespace("enrich", &json!({"title": "Other"}));
        assert_eq!(record.get_str("source.title"), Some("Attention"));
        assert_eq!(record.get_str("enrich.title"), Some("Other"));
    }

    #[test]
    fn scalar_payload_goes_to_value_key() {
        let mut record = Record::new("A");
        record.merge_namespace("score", &json!(42));
        assert_eq!(record.get_f64("score.value"), Some(42.0));
    }

    #[test]
    fn namespace_fields_strips_prefix() {
        let record = Record::new("A")
            .with_field("enrich.a", 1)
            .with_field("enrich.b", 2)
            .with_field("enrichment.c", 3);
        let fields: Vec<&str> = record.namespace_fields("enrich").map(|(k, _)| k).collect();
        assert_eq!(fields, vec!["a", "b"]);
    }

    #[test]
    fn has_treats_blank_values_as_absent() {
        let record = Record::new("A")
            .with_field("source.title", "  ")
            .with_field("source.authors", json!([]))
            .with_field("source.year", Value::Null);
        assert!(!record.has("source.title"));
        assert!(!record.has("source.authors"));
        assert!(!record.has("source.year"));
        assert!(!record.has("source.missing"));
    }

    #[test]
    fn descriptor_reports_missing_inputs() {
        let desc = StageDescriptor::new("enrich", 1, "enrich").requires("validate.doi");
        let record = Record::new("A");
        assert_eq!(desc.missing_inputs(&record), vec!["validate.doi"]);
        let record = record.with_field("validate.doi", "10.1/x");
        assert!(desc.missing_inputs(&record).is_empty());
    }

    #[test]
    fn manifest_serialization() {
        let mut manifest = ManifestState::default();
        manifest.exited.insert(
            "A".into(),
            ManifestEntry {
                outcome: ExitOutcome::Completed,
                signature: "sig".into(),
            },
        );
        manifest.stage_versions.insert("validate".into(), 1);

        let json = serde_json::to_string_pretty(&manifest).expect("serialize");
        let parsed: ManifestState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(parsed.is_done("A", "sig"));
        assert!(!parsed.is_done("A", "other"));
        assert_eq!(parsed.counts(), (1, 0));
    }

    #[test]
    fn failure_record_defaults_attempts() {
        let json = r#"{"record_id":"B","stage_name":"enrich","error_kind":"not_found","message":"x","timestamp":"2024-01-01T00:00:00Z"}"#;
        let parsed: FailureRecord = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.attempts, 1);
        assert_eq!(parsed.error_kind, ErrorKind::NotFound);
    }
}
