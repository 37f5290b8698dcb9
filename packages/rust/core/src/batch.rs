//! Splitting work into stage-sized batches and mapping results back.

use std::collections::{HashMap, HashSet};

use paperflow_shared::StageError;
use serde_json::Value;
use tracing::debug;

/// Split `items` into consecutive batches of at most `max_batch_size`,
/// preserving order.
pub fn assemble<T>(items: Vec<T>, max_batch_size: usize) -> Vec<Vec<T>> {
    let size = max_batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Align keyed `results` with `keys`.
///
/// The output has one entry per key, in key order. Keys without a result
/// become `NotFound`; results for unknown keys are dropped; when a key is
/// answered twice the first answer wins. Repeated keys share one answer.
pub fn disassemble(
    keys: &[String],
    results: Vec<(String, Result<Value, StageError>)>,
) -> Vec<Result<Value, StageError>> {
    let requested: HashSet<&str> = keys.iter().map(String::as_str).collect();
    let mut by_key: HashMap<String, Result<Value, StageError>> = HashMap::with_capacity(results.len());
    for (key, result) in results {
        if !requested.contains(key.as_str()) {
            debug!(key, "dropping result for unrequested key");
            continue;
        }
        by_key.entry(key).or_insert(result);
    }

    keys.iter()
        .map(|key| match by_key.get(key) {
            Some(result) => result.clone(),
            None => Err(StageError::not_found(format!("no result for '{key}'"))),
        })
        .collect()
}
