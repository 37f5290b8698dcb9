//! Clients for the external sources Paperflow enriches records from, and the
//! per-source rate/retry controller they are driven through.

pub mod embedding;
pub mod http;
pub mod lookup;
pub mod throttle;

pub use embedding::{EmbeddingClient, Embeddings};
pub use lookup::{LookupClient, LookupResult};
pub use throttle::{SourceController, ThrottlePolicy, ThrottleSnapshot};
