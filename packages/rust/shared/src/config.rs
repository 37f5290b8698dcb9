//! Application configuration for Paperflow.
//!
//! User config lives at `~/.paperflow/paperflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ErrorKind, PaperflowError, Result};
use crate::types::SOURCE_NAMESPACE;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "paperflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".paperflow";

/// Name of the built-in metadata validation stage.
pub const VALIDATE_STAGE: &str = "validate";

// ---------------------------------------------------------------------------
// Config structs (matching paperflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Checkpoint cadence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Stage ordering.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Quality gate settings.
    #[serde(default)]
    pub gate: GateConfig,

    /// External sources, each usable as a stage.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Directory holding manifest, cache, checkpoints, failure log and record store.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Records carried through all stages before the manifest is committed.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_state_dir() -> String {
    "~/.paperflow/state".into()
}
fn default_chunk_size() -> usize {
    256
}

/// `[checkpoint]` section. A checkpoint is written when either threshold is hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Records processed since the last checkpoint.
    #[serde(default = "default_every_records")]
    pub every_records: usize,

    /// Seconds elapsed since the last checkpoint.
    #[serde(default = "default_every_secs")]
    pub every_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every_records: default_every_records(),
            every_secs: default_every_secs(),
        }
    }
}

fn default_every_records() -> usize {
    50
}
fn default_every_secs() -> u64 {
    30
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered stage names: `validate`, the gate stage name, or a source name.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: default_stages(),
        }
    }
}

fn default_stages() -> Vec<String> {
    vec![VALIDATE_STAGE.into(), default_gate_stage()]
}

/// `[gate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Stage name of the gate within `[pipeline].stages`.
    #[serde(default = "default_gate_stage")]
    pub stage_name: String,

    /// Version of the component computations (cache version of the gate stage).
    #[serde(default = "default_version")]
    pub components_version: u32,

    /// Version of the weighting formula; bumping it only recomputes totals.
    #[serde(default = "default_version")]
    pub weights_version: u32,

    /// Records scoring below this (0–100) are rejected.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Component weights.
    #[serde(default)]
    pub weights: GateWeights,

    /// Field paths read by each component.
    #[serde(default)]
    pub fields: GateFields,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            stage_name: default_gate_stage(),
            components_version: default_version(),
            weights_version: default_version(),
            threshold: default_threshold(),
            weights: GateWeights::default(),
            fields: GateFields::default(),
        }
    }
}

fn default_gate_stage() -> String {
    "quality".into()
}
fn default_version() -> u32 {
    1
}
fn default_threshold() -> f64 {
    40.0
}

/// `[gate.weights]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateWeights {
    #[serde(default = "default_citation_weight")]
    pub citation_impact: f64,
    #[serde(default = "default_venue_weight")]
    pub venue_signal: f64,
    #[serde(default = "default_sections_weight")]
    pub section_completeness: f64,
    #[serde(default = "default_richness_weight")]
    pub metadata_richness: f64,
}

impl Default for GateWeights {
    fn default() -> Self {
        Self {
            citation_impact: default_citation_weight(),
            venue_signal: default_venue_weight(),
            section_completeness: default_sections_weight(),
            metadata_richness: default_richness_weight(),
        }
    }
}

fn default_citation_weight() -> f64 {
    0.35
}
fn default_venue_weight() -> f64 {
    0.25
}
fn default_sections_weight() -> f64 {
    0.20
}
fn default_richness_weight() -> f64 {
    0.20
}

/// `[gate.fields]` section. The first present field of each list wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateFields {
    #[serde(default = "default_citation_fields")]
    pub citation_count: Vec<String>,
    /// Citation count at which the citation component saturates.
    #[serde(default = "default_citation_saturation")]
    pub citation_saturation: f64,
    #[serde(default = "default_venue_fields")]
    pub venue: Vec<String>,
    #[serde(default = "default_venue_type_fields")]
    pub venue_type: Vec<String>,
    /// Venue names (case-insensitive substrings) scored as top venues.
    #[serde(default)]
    pub top_venues: Vec<String>,
    #[serde(default = "default_sections_field")]
    pub sections: String,
    #[serde(default = "default_expected_sections")]
    pub expected_sections: Vec<String>,
    #[serde(default = "default_richness_fields")]
    pub richness: Vec<String>,
}

impl Default for GateFields {
    fn default() -> Self {
        Self {
            citation_count: default_citation_fields(),
            citation_saturation: default_citation_saturation(),
            venue: default_venue_fields(),
            venue_type: default_venue_type_fields(),
            top_venues: Vec::new(),
            sections: default_sections_field(),
            expected_sections: default_expected_sections(),
            richness: default_richness_fields(),
        }
    }
}

fn default_citation_fields() -> Vec<String> {
    vec!["enrich.cited_by_count".into(), "source.citation_count".into()]
}
fn default_citation_saturation() -> f64 {
    500.0
}
fn default_venue_fields() -> Vec<String> {
    vec!["enrich.venue".into(), "source.venue".into()]
}
fn default_venue_type_fields() -> Vec<String> {
    vec!["enrich.venue_type".into(), "source.venue_type".into()]
}
fn default_sections_field() -> String {
    "source.sections".into()
}
fn default_expected_sections() -> Vec<String> {
    ["abstract", "introduction", "method", "result", "conclusion"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_richness_fields() -> Vec<String> {
    [
        "validate.doi",
        "validate.year",
        "validate.author_count",
        "source.abstract",
        "enrich.venue",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Protocol spoken by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Batched identifier lookup returning one JSON object per identifier.
    Lookup,
    /// OpenAI-compatible embedding endpoint.
    Embedding,
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stage name.
    pub name: String,
    /// Protocol.
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    /// Stage logic version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// HTTP endpoint.
    pub endpoint: String,
    /// Record field holding the identifier sent to a lookup source.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Record fields concatenated into the text sent to an embedding source.
    #[serde(default = "default_text_fields")]
    pub text_fields: Vec<String>,
    /// Output namespace (defaults to `name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Maximum identifiers per request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Error kinds retried for this source.
    #[serde(default = "default_transient")]
    pub transient: Vec<ErrorKind>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Embedding model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Marks an expensive lookup; the gate must run before it.
    /// Embedding sources are always costly.
    #[serde(default)]
    pub costly: bool,
    /// Rate/retry tuning.
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl SourceConfig {
    /// Effective output namespace.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }

    /// Whether the gate has to come before this source.
    pub fn is_costly(&self) -> bool {
        self.costly || self.kind == SourceKind::Embedding
    }

    /// API key read from the configured env var, if any.
    pub fn api_key(&self) -> Option<String> {
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

fn default_source_kind() -> SourceKind {
    SourceKind::Lookup
}
fn default_id_field() -> String {
    "validate.doi".into()
}
fn default_text_fields() -> Vec<String> {
    vec!["validate.title".into(), "source.abstract".into()]
}
fn default_batch_size() -> usize {
    50
}
fn default_transient() -> Vec<ErrorKind> {
    ErrorKind::DEFAULT_TRANSIENT.to_vec()
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[sources.throttle]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Smallest enforced inter-call delay once throttling kicked in.
    #[serde(default = "default_floor_ms")]
    pub floor_ms: u64,
    /// Cap on the inter-call delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied on every rate-limit signal.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Consecutive successes before the delay relaxes one step.
    #[serde(default = "default_relax_after")]
    pub relax_after: u32,
    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry backoff.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Cap on retry backoff.
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            floor_ms: default_floor_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            relax_after: default_relax_after(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

fn default_floor_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_relax_after() -> u32 {
    20
}
fn default_max_attempts() -> u32 {
    4
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Look up a source by stage name.
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Structural checks run before any work starts.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.chunk_size == 0 {
        return Err(PaperflowError::config("defaults.chunk_size must be at least 1"));
    }
    if config.checkpoint.every_records == 0 {
        return Err(PaperflowError::config(
            "checkpoint.every_records must be at least 1",
        ));
    }

    let mut seen = HashSet::new();
    for source in &config.sources {
        if source.name == VALIDATE_STAGE || source.name == config.gate.stage_name {
            return Err(PaperflowError::config(format!(
                "source name '{}' collides with a built-in stage",
                source.name
            )));
        }
        if !seen.insert(source.name.as_str()) {
            return Err(PaperflowError::config(format!(
                "duplicate source '{}'",
                source.name
            )));
        }
        Url::parse(&source.endpoint).map_err(|e| {
            PaperflowError::config(format!(
                "source '{}': invalid endpoint '{}': {e}",
                source.name, source.endpoint
            ))
        })?;
        if source.batch_size == 0 {
            return Err(PaperflowError::config(format!(
                "source '{}': batch_size must be at least 1",
                source.name
            )));
        }
        let t = &source.throttle;
        if t.backoff_factor < 1.0 || t.max_attempts == 0 || t.max_delay_ms < t.floor_ms {
            return Err(PaperflowError::config(format!(
                "source '{}': invalid throttle settings",
                source.name
            )));
        }
    }

    let mut namespaces = HashSet::new();
    for source in &config.sources {
        let ns = source.namespace();
        if ns.is_empty() || ns.contains('.') {
            return Err(PaperflowError::config(format!(
                "source '{}': invalid namespace '{ns}'",
                source.name
            )));
        }
        if ns == SOURCE_NAMESPACE || ns == VALIDATE_STAGE || ns == config.gate.stage_name {
            return Err(PaperflowError::config(format!(
                "source '{}': namespace '{ns}' is reserved",
                source.name
            )));
        }
        if config.sources.iter().any(|other| other.name != source.name && other.name == ns) {
            return Err(PaperflowError::config(format!(
                "source '{}': namespace '{ns}' belongs to stage '{ns}'",
                source.name
            )));
        }
        if !namespaces.insert(ns) {
            return Err(PaperflowError::config(format!(
                "namespace '{ns}' is written by more than one source"
            )));
        }
    }

    let mut stages = HashSet::new();
    for name in &config.pipeline.stages {
        let known = name == VALIDATE_STAGE
            || *name == config.gate.stage_name
            || config.source(name).is_some();
        if !known {
            return Err(PaperflowError::config(format!(
                "pipeline references unknown stage '{name}'"
            )));
        }
        if !stages.insert(name.as_str()) {
            return Err(PaperflowError::config(format!(
                "stage '{name}' appears twice in the pipeline"
            )));
        }
    }

    let gate_pos = config
        .pipeline
        .stages
        .iter()
        .position(|s| *s == config.gate.stage_name);
    let first_costly = config
        .pipeline
        .stages
        .iter()
        .position(|s| config.source(s).is_some_and(SourceConfig::is_costly));
    if let Some(costly) = first_costly {
        if gate_pos.is_none_or(|gate| gate > costly) {
            return Err(PaperflowError::config(format!(
                "quality gate '{}' must run before costly stage '{}'",
                config.gate.stage_name, config.pipeline.stages[costly]
            )));
        }
    }

    let gate = &config.gate;
    if !(0.0..=100.0).contains(&gate.threshold) {
        return Err(PaperflowError::config("gate.threshold must be within 0..=100"));
    }
    let w = &gate.weights;
    let weights = [
        w.citation_impact,
        w.venue_signal,
        w.section_completeness,
        w.metadata_richness,
    ];
    if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
        return Err(PaperflowError::config(
            "gate weights must be non-negative with a positive sum",
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.paperflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PaperflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.paperflow/paperflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PaperflowError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        PaperflowError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PaperflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PaperflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PaperflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| PaperflowError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
