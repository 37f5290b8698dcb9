//! Assemble a [`Pipeline`] from configuration.

use std::sync::Arc;

use paperflow_shared::{
    AppConfig, PaperflowError, Result, SourceKind, VALIDATE_STAGE, validate_config,
};
use paperflow_sources::{SourceController, ThrottlePolicy};
use tracing::debug;

use crate::gate::{QualityGate, QualityStage};
use crate::pipeline::Pipeline;
use crate::stage::Stage;
use crate::stages::{EmbeddingStage, LookupStage, ValidateStage};

/// Build the pipeline named by `config.pipeline.stages`.
///
/// Every source stage gets its own [`SourceController`].
pub fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    validate_config(config)?;

    let mut stages: Vec<Box<dyn Stage>> = Vec::with_capacity(config.pipeline.stages.len());
    let mut gated = false;

    for name in &config.pipeline.stages {
        if name == VALIDATE_STAGE {
            stages.push(Box::new(ValidateStage::new()));
        } else if *name == config.gate.stage_name {
            stages.push(Box::new(QualityStage::new(QualityGate::new(
                config.gate.clone(),
            ))));
            gated = true;
        } else {
            let source = config
                .source(name)
                .ok_or_else(|| PaperflowError::config(format!("unknown stage '{name}'")))?;
            let controller = Arc::new(SourceController::new(
                &source.name,
                ThrottlePolicy::from(&source.throttle),
            ));
            match source.kind {
                SourceKind::Lookup => {
                    stages.push(Box::new(LookupStage::from_config(source, controller)?))
                }
                SourceKind::Embedding => {
                    stages.push(Box::new(EmbeddingStage::from_config(source, controller)?))
                }
            }
        }
        debug!(stage = %name, "stage added");
    }

    let pipeline = Pipeline::new(stages)?;
    if gated {
        pipeline.with_gate(QualityGate::new(config.gate.clone()))
    } else {
        Ok(pipeline)
    }
}
