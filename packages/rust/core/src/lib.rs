//! Core pipeline orchestration and domain logic for Paperflow.
//!
//! This crate ties the stages (validation, source lookups, quality scoring,
//! embeddings) to the state stores and drives them over a corpus with
//! [`Orchestrator::run`].

pub mod batch;
pub mod builder;
pub mod context;
pub mod corpus;
pub mod gate;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod stage;
pub mod stages;

pub use builder::build_pipeline;
pub use context::{RunContext, RunOptions};
pub use corpus::{load_corpus, parse_corpus};
pub use gate::{GateVerdict, QualityComponents, QualityGate, QualityStage};
pub use orchestrator::{Orchestrator, ProgressReporter, SilentProgress};
pub use pipeline::Pipeline;
pub use report::{FailedRecord, RunReport, StageReport};
pub use stage::{RecordOutcome, Stage};
