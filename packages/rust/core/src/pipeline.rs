//! An ordered, validated list of stages plus the quality gate binding.

use std::collections::{BTreeMap, HashSet};

use paperflow_shared::{PaperflowError, Result, SOURCE_NAMESPACE, StageCost};
use sha2::{Digest, Sha256};

use crate::gate::QualityGate;
use crate::stage::Stage;

/// Stages in execution order.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    gate: Option<(usize, QualityGate)>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .stages
            .iter()
            .map(|s| s.descriptor().name.as_str())
            .collect();
        f.debug_struct("Pipeline")
            .field("stages", &names)
            .field("gate", &self.gate.as_ref().map(|(i, _)| i))
            .finish()
    }
}

impl Pipeline {
    /// Build a pipeline without a gate.
    ///
    /// Stage names must be unique, and each stage owns its output namespace:
    /// no two stages share one, none writes into `source`, and none writes
    /// into the namespace named after another stage.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        let mut names = HashSet::new();
        for stage in &stages {
            let name = &stage.descriptor().name;
            if !names.insert(name.as_str()) {
                return Err(PaperflowError::config(format!(
                    "stage '{name}' appears twice in the pipeline"
                )));
            }
        }

        let mut namespaces = HashSet::new();
        for stage in &stages {
            let d = stage.descriptor();
            let ns = d.namespace.as_str();
            if ns == SOURCE_NAMESPACE {
                return Err(PaperflowError::config(format!(
                    "stage '{}' may not write into the '{SOURCE_NAMESPACE}' namespace",
                    d.name
                )));
            }
            if ns != d.name && names.contains(ns) {
                return Err(PaperflowError::config(format!(
                    "stage '{}' writes into the namespace of stage '{ns}'",
                    d.name
                )));
            }
            if !namespaces.insert(ns) {
                return Err(PaperflowError::config(format!(
                    "namespace '{ns}' is written by more than one stage"
                )));
            }
        }
        Ok(Self { stages, gate: None })
    }

    /// Bind `gate` to the stage of the same name. The gate must run before
    /// every inference-cost stage.
    pub fn with_gate(mut self, gate: QualityGate) -> Result<Self> {
        let index = self
            .stages
            .iter()
            .position(|s| s.descriptor().name == gate.stage_name())
            .ok_or_else(|| {
                PaperflowError::config(format!(
                    "quality gate stage '{}' is not in the pipeline",
                    gate.stage_name()
                ))
            })?;

        if let Some(costly) = self.stages[..index]
            .iter()
            .find(|s| s.descriptor().cost == StageCost::Inference)
        {
            return Err(PaperflowError::config(format!(
                "quality gate '{}' must run before costly stage '{}'",
                gate.stage_name(),
                costly.descriptor().name
            )));
        }

        self.gate = Some((index, gate));
        Ok(self)
    }

    pub fn stages(&self) -> &[Box<dyn Stage>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Index of the gate stage and the gate itself.
    pub fn gate(&self) -> Option<(usize, &QualityGate)> {
        self.gate.as_ref().map(|(i, g)| (*i, g))
    }

    /// Current version of every stage.
    pub fn stage_versions(&self) -> BTreeMap<String, u32> {
        self.stages
            .iter()
            .map(|s| (s.descriptor().name.clone(), s.descriptor().version))
            .collect()
    }

    /// Fingerprint of everything that decides a record's final state: stage
    /// order and versions, plus gate versions, weights and threshold.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        for stage in &self.stages {
            let d = stage.descriptor();
            hasher.update(format!("stage:{}:{}\n", d.name, d.version));
        }
        if let Some((index, gate)) = &self.gate {
            let cfg = gate.config();
            let w = &cfg.weights;
            hasher.update(format!(
                "gate:{index}:{}:{}:{:.4}:{:.4}:{:.4}:{:.4}:{:.4}\n",
                cfg.components_version,
                cfg.weights_version,
                cfg.threshold,
                w.citation_impact,
                w.venue_signal,
                w.section_completeness,
                w.metadata_richness,
            ));
        }
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}
