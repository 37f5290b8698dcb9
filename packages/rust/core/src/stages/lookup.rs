//! Stage backed by a batched HTTP lookup source.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paperflow_shared::{
    PaperflowError, Record, Result, SourceConfig, StageCost, StageDescriptor, StageError,
};
use paperflow_sources::{LookupClient, SourceController};
use tracing::debug;
use url::Url;

use crate::batch::disassemble;
use crate::stage::{RecordOutcome, Stage};

/// Sends the value of `id_field` for each record to the source and merges
/// the returned object under the stage namespace.
pub struct LookupStage {
    descriptor: StageDescriptor,
    id_field: String,
    client: LookupClient,
    controller: Arc<SourceController>,
}

impl LookupStage {
    pub fn new(
        descriptor: StageDescriptor,
        id_field: impl Into<String>,
        client: LookupClient,
        controller: Arc<SourceController>,
    ) -> Self {
        Self {
            descriptor,
            id_field: id_field.into(),
            client,
            controller,
        }
    }

    pub fn from_config(cfg: &SourceConfig, controller: Arc<SourceController>) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint).map_err(|e| {
            PaperflowError::config(format!("source '{}': invalid endpoint: {e}", cfg.name))
        })?;
        let client = LookupClient::new(endpoint, Duration::from_secs(cfg.timeout_secs), cfg.api_key())?;
        let cost = if cfg.is_costly() {
            StageCost::Inference
        } else {
            StageCost::Network
        };
        let descriptor = StageDescriptor::new(&cfg.name, cfg.version, cfg.namespace())
            .requires(&cfg.id_field)
            .with_batch_size(cfg.batch_size)
            .with_transient(cfg.transient.clone())
            .with_cost(cost);
        Ok(Self::new(descriptor, &cfg.id_field, client, controller))
    }
}

#[async_trait]
impl Stage for LookupStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run_batch(&self, batch: &[Record]) -> std::result::Result<Vec<RecordOutcome>, StageError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut keyed: Vec<(&str, String)> = Vec::with_capacity(batch.len());
        for record in batch {
            match record.get_str(&self.id_field) {
                Some(key) => keyed.push((record.record_id.as_str(), key.to_string())),
                None => outcomes.push((
                    record.record_id.clone(),
                    Err(StageError::invalid_input(format!("missing {}", self.id_field))),
                )),
            }
        }
        if keyed.is_empty() {
            return Ok(outcomes);
        }

        let mut seen = HashSet::with_capacity(keyed.len());
        let unique: Vec<String> = keyed
            .iter()
            .filter(|(_, key)| seen.insert(key.as_str()))
            .map(|(_, key)| key.clone())
            .collect();

        debug!(stage = %self.descriptor.name, ids = unique.len(), "dispatching lookup");
        let results = self
            .controller
            .call(&self.descriptor.transient, || self.client.fetch_batch(&unique))
            .await?;

        let keys: Vec<String> = keyed.iter().map(|(_, key)| key.clone()).collect();
        let aligned = disassemble(&keys, results);
        outcomes.extend(
            keyed
                .into_iter()
                .zip(aligned)
                .map(|((record_id, _), result)| (record_id.to_string(), result)),
        );
        Ok(outcomes)
    }
}
