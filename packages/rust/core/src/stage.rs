//! The contract every pipeline stage implements.

use async_trait::async_trait;
use paperflow_shared::{Record, StageDescriptor, StageError};
use serde_json::Value;

/// Result for one record of a batch, keyed by `record_id`.
pub type RecordOutcome = (String, Result<Value, StageError>);

/// A named, versioned transformation over records.
///
/// `run_batch` receives at most `descriptor().batch_size` records. It may
/// return results in any order and may omit records; omitted records are
/// treated as not found. An `Err` means the whole call failed, and the
/// orchestrator retries each record on its own.
///
/// The returned payload is merged under `descriptor().namespace`. Given the
/// same input fields and version, a stage must produce an equivalent payload.
#[async_trait]
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> &StageDescriptor;

    async fn run_batch(&self, batch: &[Record]) -> Result<Vec<RecordOutcome>, StageError>;
}
