//! Embedding preparer
//!
//! Resolves every missing embedding of a draft before the batch may be
//! written. Calls run concurrently, bounded by the configured limit, each one
//! through the health monitor with its own timeout.

use std::sync::Arc;

use futures_util::{StreamExt, stream};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::{GraphDraft, PreparedBatch};
use crate::error::Result;
use crate::llm::InferenceProvider;

use super::health::{CallKind, HealthMonitor};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Entity(usize),
    Edge(usize),
}

/// Computes embeddings for entities and facts outside any storage transaction
pub struct EmbeddingPreparer {
    provider: Arc<dyn InferenceProvider>,
    health: Arc<HealthMonitor>,
    concurrency: usize,
}

impl EmbeddingPreparer {
    pub fn new(provider: Arc<dyn InferenceProvider>, health: Arc<HealthMonitor>, concurrency: usize) -> Self {
        Self {
            provider,
            health,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve all missing embeddings and seal the draft for writing.
    ///
    /// All or nothing: the first failed call aborts the remaining ones and the
    /// error is returned, so a batch never mixes real and missing embeddings.
    pub async fn prepare(&self, mut draft: GraphDraft) -> Result<PreparedBatch> {
        let mut jobs = Vec::new();
        for (i, entity) in draft.entities.iter().enumerate() {
            if entity.name_embedding.is_none() {
                jobs.push((Slot::Entity(i), entity.name.clone()));
            }
        }
        for (i, edge) in draft.edges.iter().enumerate() {
            if edge.fact_embedding.is_none() {
                jobs.push((Slot::Edge(i), edge.fact_text.clone()));
            }
        }

        if jobs.is_empty() {
            return PreparedBatch::full(draft);
        }

        let total = jobs.len();
        let started = Instant::now();

        let mut results = stream::iter(jobs)
            .map(|(slot, text)| async move {
                let vector = self
                    .health
                    .call(CallKind::Embedding, self.provider.embed(&text))
                    .await;
                (slot, vector)
            })
            .buffer_unordered(self.concurrency);

        let mut resolved = Vec::with_capacity(total);
        while let Some((slot, vector)) = results.next().await {
            match vector {
                Ok(vector) => resolved.push((slot, vector)),
                Err(err) => {
                    warn!(
                        episode_id = %draft.episode.episode.id,
                        resolved = resolved.len(),
                        total,
                        error = %err,
                        "Embedding preparation failed"
                    );
                    return Err(err);
                }
            }
        }

        for (slot, vector) in resolved {
            match slot {
                Slot::Entity(i) => draft.entities[i].name_embedding = Some(vector),
                Slot::Edge(i) => draft.edges[i].fact_embedding = Some(vector),
            }
        }

        debug!(
            episode_id = %draft.episode.episode.id,
            embeddings = total,
            concurrency = self.concurrency,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Embeddings prepared"
        );

        PreparedBatch::full(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use crate::domain::{BatchMode, EntityEdge, EntityNode, Episode, NewEpisode};
    use crate::error::Error;
    use crate::ingest::testing::FakeProvider;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn draft(entities: usize, edges: usize) -> GraphDraft {
        let episode = Episode::accept(NewEpisode::new("g1", "ep", "body", Utc::now()), Utc::now()).unwrap();
        let mut draft = GraphDraft::raw(episode, None);
        draft.entities = (0..entities)
            .map(|i| EntityNode::new("g1", format!("entity {}", i)))
            .collect();
        let a = draft.entities.first().map(|e| e.id).unwrap_or_default();
        draft.edges = (0..edges)
            .map(|i| EntityEdge::new("g1", a, a, "relates_to", format!("fact {}", i), Utc::now()))
            .collect();
        draft
    }

    fn preparer(provider: Arc<FakeProvider>, concurrency: usize) -> EmbeddingPreparer {
        let health = Arc::new(HealthMonitor::new(CircuitConfig::default(), Duration::from_secs(30)));
        EmbeddingPreparer::new(provider, health, concurrency)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency_timing() {
        let provider = Arc::new(FakeProvider::with_latency(Duration::from_millis(300)));
        let preparer = preparer(provider.clone(), 10);

        let started = Instant::now();
        let batch = preparer.prepare(draft(50, 100)).await.unwrap();
        let elapsed = started.elapsed();

        // 150 calls, 10 at a time, 300ms each
        assert!(elapsed >= Duration::from_millis(4500), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(4600), "elapsed {:?}", elapsed);
        assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 150);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 10);
        assert_eq!(batch.mode(), BatchMode::Full);
        assert_eq!(batch.draft().pending_embeddings(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_embeddings_are_not_recomputed() {
        let provider = Arc::new(FakeProvider::default());
        let preparer = preparer(provider.clone(), 4);

        let mut draft = draft(3, 0);
        draft.entities[0].name_embedding = Some(vec![9.0]);
        let batch = preparer.prepare(draft).await.unwrap();

        assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 2);
        assert_eq!(batch.draft().entities[0].name_embedding, Some(vec![9.0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_draft_needs_no_calls() {
        let provider = Arc::new(FakeProvider::default());
        let batch = preparer(provider.clone(), 4).prepare(draft(0, 0)).await.unwrap();

        assert_eq!(batch.mode(), BatchMode::Full);
        assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_failure_fails_whole_batch() {
        let provider = Arc::new(FakeProvider::default());
        provider.set_failing(true);

        let err = preparer(provider, 4).prepare(draft(5, 5)).await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits_remaining_calls() {
        let provider = Arc::new(FakeProvider::default());
        provider.set_failing(true);
        let health = Arc::new(HealthMonitor::new(
            CircuitConfig {
                failure_threshold: 1,
                ..CircuitConfig::default()
            },
            Duration::from_secs(30),
        ));
        let preparer = EmbeddingPreparer::new(provider.clone(), health.clone(), 1);

        assert!(preparer.prepare(draft(10, 0)).await.is_err());
        assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 1);

        let err = preparer.prepare(draft(10, 0)).await.unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { .. }));
        assert_eq!(provider.embed_calls.load(Ordering::SeqCst), 1);
    }
}
