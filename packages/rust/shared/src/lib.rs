//! Shared types, error model, and configuration for Paperflow.
//!
//! This crate is the foundation depended on by all other Paperflow crates.
//! It provides:
//! - [`PaperflowError`] and the per-record [`StageError`] taxonomy
//! - Domain types ([`Record`], [`StageDescriptor`], [`ManifestState`], [`StageCheckpoint`])
//! - Configuration ([`AppConfig`], [`SourceConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CheckpointConfig, DefaultsConfig, GateConfig, GateFields, GateWeights,
    PipelineConfig, SourceConfig, SourceKind, ThrottleConfig, VALIDATE_STAGE, config_dir,
    config_file_path, expand_home, init_config, load_config, load_config_from, validate_config,
};
pub use error::{ErrorClass, ErrorKind, PaperflowError, Result, StageError};
pub use types::{
    CURRENT_SCHEMA_VERSION, CacheEntry, ExitOutcome, FailureRecord, ManifestEntry, ManifestState,
    Record, SOURCE_NAMESPACE, StageCheckpoint, StageCost, StageCounts, StageDescriptor,
};
