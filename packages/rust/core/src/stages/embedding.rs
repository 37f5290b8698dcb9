//! Stage backed by an OpenAI-compatible embedding source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paperflow_shared::{
    PaperflowError, Record, Result, SourceConfig, StageCost, StageDescriptor, StageError,
};
use paperflow_sources::{EmbeddingClient, SourceController};
use serde_json::json;
use url::Url;

use crate::stage::{RecordOutcome, Stage};

/// Default model when a source config does not name one.
const DEFAULT_MODEL: &str = "text-embedding-3-small";

pub struct EmbeddingStage {
    descriptor: StageDescriptor,
    text_fields: Vec<String>,
    client: EmbeddingClient,
    controller: Arc<SourceController>,
}

impl EmbeddingStage {
    pub fn new(
        descriptor: StageDescriptor,
        text_fields: Vec<String>,
        client: EmbeddingClient,
        controller: Arc<SourceController>,
    ) -> Self {
        Self {
            descriptor,
            text_fields,
            client,
            controller,
        }
    }

    pub fn from_config(cfg: &SourceConfig, controller: Arc<SourceController>) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint).map_err(|e| {
            PaperflowError::config(format!("source '{}': invalid endpoint: {e}", cfg.name))
        })?;
        let client = EmbeddingClient::new(
            endpoint,
            cfg.model.as_deref().unwrap_or(DEFAULT_MODEL),
            Duration::from_secs(cfg.timeout_secs),
            cfg.api_key(),
        )?;
        let descriptor = StageDescriptor::new(&cfg.name, cfg.version, cfg.namespace())
            .with_batch_size(cfg.batch_size)
            .with_transient(cfg.transient.clone())
            .with_cost(StageCost::Inference);
        Ok(Self::new(descriptor, cfg.text_fields.clone(), client, controller))
    }

    /// Text sent for `record`: the configured fields joined by blank lines.
    fn text_for(&self, record: &Record) -> Option<String> {
        let parts: Vec<&str> = self
            .text_fields
            .iter()
            .filter_map(|f| record.get_str(f))
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }
}

#[async_trait]
impl Stage for EmbeddingStage {
    fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    async fn run_batch(&self, batch: &[Record]) -> std::result::Result<Vec<RecordOutcome>, StageError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut ids = Vec::with_capacity(batch.len());
        let mut texts = Vec::with_capacity(batch.len());
        for record in batch {
            match self.text_for(record) {
                Some(text) => {
                    ids.push(record.record_id.clone());
                    texts.push(text);
                }
                None => outcomes.push((
                    record.record_id.clone(),
                    Err(StageError::invalid_input("no text to embed")),
                )),
            }
        }
        if texts.is_empty() {
            return Ok(outcomes);
        }

        let embeddings = self
            .controller
            .call(&self.descriptor.transient, || self.client.embed(&texts))
            .await?;

        let model = embeddings.model;
        outcomes.extend(ids.into_iter().zip(embeddings.vectors).map(|(id, vector)| {
            let dims = vector.len();
            (
                id,
                Ok(json!({ "model": model, "dims": dims, "vector": vector })),
            )
        }));
        Ok(outcomes)
    }
}
