//! OpenAI-compatible embedding client.
//!
//! `POST <endpoint>` with `{"model": .., "input": [..]}`; the response's
//! `data[].index` ties each vector back to its input.

use std::time::Duration;

use paperflow_shared::{ErrorKind, Result, StageError};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::http::{build_client, classify_status, classify_transport};

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// One vector per input, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub model: String,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl EmbeddingClient {
    pub fn new(
        endpoint: Url,
        model: impl Into<String>,
        timeout: Duration,
        api_key: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            model: model.into(),
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn embed(&self, inputs: &[String]) -> std::result::Result<Embeddings, StageError> {
        let url = self.endpoint.as_str();
        debug!(url, model = %self.model, count = inputs.len(), "embedding request");

        let mut request = self.client.post(url).json(&EmbeddingRequest {
            model: &self.model,
            input: inputs,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(url, status, &headers, &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| StageError::new(ErrorKind::Corruption, format!("{url}: {e}")))?;

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; inputs.len()];
        for datum in parsed.data {
            match vectors.get_mut(datum.index) {
                Some(slot) => *slot = Some(datum.embedding),
                None => {
                    return Err(StageError::new(
                        ErrorKind::Corruption,
                        format!("{url}: embedding index {} out of range", datum.index),
                    ));
                }
            }
        }
        let vectors = vectors
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| {
                    StageError::new(ErrorKind::Corruption, format!("{url}: no embedding for input {i}"))
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Embeddings {
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            vectors,
        })
    }
}
