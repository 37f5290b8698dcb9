//! Quality gate: scores records and stops low-quality ones before the
//! expensive stages.
//!
//! Scoring is split in two. [`QualityStage`] computes the four component
//! scores (each in `0.0..=1.0`) and is cached like any other stage under
//! `components_version`. [`QualityGate::apply`] then combines the cached
//! components with the *current* weights and threshold, so a re-weighting
//! never reruns anything upstream.

use async_trait::async_trait;
use paperflow_shared::{GateConfig, GateFields, Record, StageDescriptor, StageError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::stage::{RecordOutcome, Stage};

/// Per-component scores, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityComponents {
    pub citation_impact: f64,
    pub venue_signal: f64,
    pub section_completeness: f64,
    pub metadata_richness: f64,
}

/// Gate decision for one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateVerdict {
    pub score: f64,
    pub passed: bool,
}

/// Weighted scoring and thresholding.
#[derive(Debug, Clone)]
pub struct QualityGate {
    config: GateConfig,
}

impl QualityGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn stage_name(&self) -> &str {
        &self.config.stage_name
    }

    pub fn threshold(&self) -> f64 {
        self.config.threshold
    }

    /// Compute components from the record's current fields.
    pub fn components(&self, record: &Record) -> QualityComponents {
        let fields = &self.config.fields;
        QualityComponents {
            citation_impact: citation_impact(record, fields),
            venue_signal: venue_signal(record, fields),
            section_completeness: section_completeness(record, fields),
            metadata_richness: metadata_richness(record, fields),
        }
    }

    /// Weighted total in `0.0..=100.0`, rounded to two decimals.
    pub fn score(&self, c: &QualityComponents) -> f64 {
        let w = &self.config.weights;
        let total_weight =
            w.citation_impact + w.venue_signal + w.section_completeness + w.metadata_richness;
        if total_weight <= 0.0 {
            return 0.0;
        }
        let weighted = w.citation_impact * c.citation_impact
            + w.venue_signal * c.venue_signal
            + w.section_completeness * c.section_completeness
            + w.metadata_richness * c.metadata_richness;
        let score = (100.0 * weighted / total_weight).clamp(0.0, 100.0);
        (score * 100.0).round() / 100.0
    }

    /// Score `record` and write the verdict under the gate namespace.
    ///
    /// Uses the component breakdown already merged by [`QualityStage`] when
    /// present, and computes it from the record otherwise.
    pub fn apply(&self, record: &mut Record) -> GateVerdict {
        let ns = &self.config.stage_name;
        let components = record
            .get(&format!("{ns}.components"))
            .and_then(|v| serde_json::from_value::<QualityComponents>(v.clone()).ok())
            .unwrap_or_else(|| self.components(record));

        let score = self.score(&components);
        let passed = score >= self.config.threshold;
        record.merge_namespace(
            ns,
            &json!({
                "score": score,
                "passed": passed,
                "threshold": self.config.threshold,
                "weights_version": self.config.weights_version,
            }),
        );
        GateVerdict { score, passed }
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

fn first_present<'a>(record: &'a Record, keys: &[String]) -> Option<&'a Value> {
    keys.iter().find_map(|k| record.get(k))
}

/// Log-scaled citation count, saturating at `citation_saturation`.
fn citation_impact(record: &Record, fields: &GateFields) -> f64 {
    let count = fields
        .citation_count
        .iter()
        .find_map(|k| record.get_f64(k))
        .unwrap_or(0.0);
    if count <= 0.0 || fields.citation_saturation <= 0.0 {
        return 0.0;
    }
    ((1.0 + count).ln() / (1.0 + fields.citation_saturation).ln()).min(1.0)
}

/// 1.0 for a listed top venue, 0.75 for a known peer-reviewed venue type,
/// 0.5 for any other named venue.
fn venue_signal(record: &Record, fields: &GateFields) -> f64 {
    let Some(venue) = first_present(record, &fields.venue)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return 0.0;
    };

    let venue = venue.to_lowercase();
    if fields
        .top_venues
        .iter()
        .any(|top| !top.is_empty() && venue.contains(&top.to_lowercase()))
    {
        return 1.0;
    }

    let peer_reviewed = first_present(record, &fields.venue_type)
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .is_some_and(|t| {
            ["journal", "conference", "proceedings"]
                .iter()
                .any(|kind| t.contains(kind))
        });
    if peer_reviewed { 0.75 } else { 0.5 }
}

/// Share of expected section names found among the record's section titles.
fn section_completeness(record: &Record, fields: &GateFields) -> f64 {
    if fields.expected_sections.is_empty() {
        return 0.0;
    }
    let titles: Vec<String> = match record.get(&fields.sections) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.to_lowercase()),
                Value::Object(obj) => obj
                    .get("title")
                    .or_else(|| obj.get("heading"))
                    .and_then(Value::as_str)
                    .map(str::to_lowercase),
                _ => None,
            })
            .collect(),
        Some(Value::Object(obj)) => obj.keys().map(|k| k.to_lowercase()).collect(),
        _ => return 0.0,
    };

    let found = fields
        .expected_sections
        .iter()
        .filter(|expected| {
            let expected = expected.to_lowercase();
            titles.iter().any(|t| t.contains(&expected))
        })
        .count();
    found as f64 / fields.expected_sections.len() as f64
}

/// Share of the configured metadata fields that carry content.
fn metadata_richness(record: &Record, fields: &GateFields) -> f64 {
    if fields.richness.is_empty() {
        return 0.0;
    }
    let present = fields.richness.iter().filter(|f| record.has(f)).count();
    present as f64 / fields.richness.len() as f64
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Computes and caches the component breakdown.
pub struct QualityStage {
    gate: QualityGate,
    descriptor: StageDescriptor,
}

impl QualityStage {
    pub fn new(gate: QualityGate) -> Self {
        let name = gate.config.stage_name.clone();
        let descriptor = StageDescriptor::new(&name, gate.config.components_version, &name)
            .with_batch_size(256)
            .with_transient(Vec::new());
        Self { gate, descriptor }
    }
}

#[async_trait]
impl Stage for QualityStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run_batch(&self, batch: &[Record]) -> Result<Vec<RecordOutcome>, StageError> {
        Ok(batch
            .iter()
            .map(|record| {
                let components = self.gate.components(record);
                (
                    record.record_id.clone(),
                    Ok(json!({ "components": components })),
                )
            })
            .collect())
    }
}
