//! Built-in stage implementations.

pub mod embedding;
pub mod lookup;
pub mod validate;

pub use embedding::EmbeddingStage;
pub use lookup::LookupStage;
pub use validate::ValidateStage;
