//! Inference provider trait

use async_trait::async_trait;

use crate::error::ProviderError;

use super::types::ExtractedGraph;

/// The external inference dependency: embeddings and entity extraction.
///
/// Implementations classify every failure into a [`ProviderError`]; they do
/// not retry internally. Retrying and circuit breaking belong to the caller.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Compute a vector embedding for `text`
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError>;

    /// Extract entities and facts from an episode body
    async fn extract_entities(&self, text: &str) -> std::result::Result<ExtractedGraph, ProviderError>;

    /// Cheap liveness check used by the background health probe
    async fn probe(&self) -> std::result::Result<(), ProviderError> {
        self.embed("health check").await.map(|_| ())
    }
}
