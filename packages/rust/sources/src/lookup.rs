//! Batched identifier lookup over HTTP.
//!
//! Request: `POST <endpoint>` with `{"ids": [...]}`.
//! Response: a JSON array (or `{"results": [...]}`) of objects, each carrying
//! the `id` it answers. An object with an `error` field reports a per-id
//! failure. IDs absent from the response are left for the caller to resolve.

use std::time::Duration;

use paperflow_shared::{ErrorKind, Result, StageError};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::http::{build_client, classify_status, classify_transport};

/// Per-id outcome from one lookup call.
pub type LookupResult = (String, std::result::Result<Value, StageError>);

/// Client for one lookup source.
#[derive(Debug, Clone)]
pub struct LookupClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl LookupClient {
    pub fn new(endpoint: Url, timeout: Duration, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            api_key,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Look up `ids` in one request. Results may be partial and in any order.
    pub async fn fetch_batch(
        &self,
        ids: &[String],
    ) -> std::result::Result<Vec<LookupResult>, StageError> {
        let url = self.endpoint.as_str();
        debug!(url, count = ids.len(), "lookup request");

        let mut request = self.client.post(url).json(&json!({ "ids": ids }));
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

        let body: Value = response
            .json()
            .await
            .map_err(|e| StageError::new(ErrorKind::Corruption, format!("{url}: {e}")))?;
        parse_results(url, body)
    }
}

fn parse_results(url: &str, body: Value) -> std::result::Result<Vec<LookupResult>, StageError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(StageError::new(
                    ErrorKind::Corruption,
                    format!("{url}: response has no results array"),
                ));
            }
        },
        _ => {
            return Err(StageError::new(
                ErrorKind::Corruption,
                format!("{url}: unexpected response shape"),
            ));
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(mut obj) = item else {
            debug!(url, "skipping non-object result");
            continue;
        };
        let Some(id) = obj.remove("id").and_then(|v| v.as_str().map(String::from)) else {
            debug!(url, "skipping result without id");
            continue;
        };

        match obj.remove("error") {
            Some(err) => {
                let kind = obj
                    .remove("error_kind")
                    .and_then(|k| serde_json::from_value::<ErrorKind>(k).ok())
                    .unwrap_or(ErrorKind::NotFound);
                let message = err.as_str().map_or_else(|| err.to_string(), String::from);
                out.push((id, Err(StageError::new(kind, message))));
            }
            None => out.push((id, Ok(Value::Object(obj)))),
        }
    }
    Ok(out)
}
