//! Fakes shared by the ingest unit tests

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::{
    EntityEdge, EntityNode, EpisodeState, EpisodicEdge, EpisodicNode, GraphStore, GraphTransaction,
    Invalidation,
};
use crate::error::{Error, ProviderError, ProviderErrorKind, Result};
use crate::llm::{ExtractedEntity, ExtractedFact, ExtractedGraph, InferenceProvider};

use super::notify::{NotificationSink, PermanentFailure};

/// Provider with configurable latency and failure, counting calls
#[derive(Debug, Default)]
pub struct FakeProvider {
    pub latency: Duration,
    pub failing: AtomicBool,
    pub fail_kind: Mutex<Option<ProviderErrorKind>>,
    pub embed_calls: AtomicUsize,
    pub extract_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn failure(&self) -> Option<ProviderError> {
        if !self.failing.load(Ordering::SeqCst) {
            return None;
        }
        let kind = self
            .fail_kind
            .lock()
            .unwrap()
            .unwrap_or(ProviderErrorKind::Network);
        Some(ProviderError::new(kind, "simulated outage"))
    }
}

/// Parses bodies of the form `Alice works_at Acme; Bob knows Alice: Bob met Alice`
pub fn fake_extraction(text: &str) -> ExtractedGraph {
    let mut graph = ExtractedGraph::default();
    for clause in text.split(';') {
        let (triple, fact) = match clause.split_once(':') {
            Some((triple, fact)) => (triple, Some(fact.trim().to_string())),
            None => (clause, None),
        };
        let parts: Vec<&str> = triple.split_whitespace().collect();
        if parts.len() != 3 {
            continue;
        }
        for name in [parts[0], parts[2]] {
            if !graph.entities.iter().any(|e| e.name == name) {
                graph.entities.push(ExtractedEntity {
                    name: name.to_string(),
                    summary: None,
                });
            }
        }
        graph.facts.push(ExtractedFact {
            source: parts[0].to_string(),
            target: parts[2].to_string(),
            relation: parts[1].to_string(),
            fact: fact.unwrap_or_else(|| triple.trim().to_string()),
        });
    }
    graph
}

#[async_trait]
impl InferenceProvider for FakeProvider {
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.failure() {
            Some(err) => Err(err),
            None => Ok(vec![text.len() as f32, 1.0]),
        }
    }

    async fn extract_entities(&self, text: &str) -> std::result::Result<ExtractedGraph, ProviderError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(fake_extraction(text)),
        }
    }
}

/// Graph store that records operations and when they ran
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub op_latency: Duration,
    pub fail_on: Option<&'static str>,
    pub hang_on: Option<&'static str>,
    pub ops: Mutex<Vec<(&'static str, Instant)>>,
    pub committed: Mutex<Vec<EpisodicNode>>,
}

impl RecordingStore {
    pub fn ops(&self) -> Vec<&'static str> {
        self.ops.lock().unwrap().iter().map(|(op, _)| *op).collect()
    }

    pub fn time_of(&self, op: &str) -> Option<Instant> {
        self.ops.lock().unwrap().iter().find(|(o, _)| *o == op).map(|(_, at)| *at)
    }

    async fn op(&self, name: &'static str) -> Result<()> {
        self.ops.lock().unwrap().push((name, Instant::now()));
        if self.hang_on == Some(name) {
            std::future::pending::<()>().await;
        }
        if !self.op_latency.is_zero() {
            tokio::time::sleep(self.op_latency).await;
        }
        if self.fail_on == Some(name) {
            return Err(Error::StorageWriteFailure(format!("{} failed", name)));
        }
        Ok(())
    }
}

pub struct RecordingTransaction<'a> {
    store: &'a RecordingStore,
    episodes: Vec<EpisodicNode>,
}

#[async_trait]
impl GraphStore for RecordingStore {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>> {
        self.op("begin").await?;
        Ok(Box::new(RecordingTransaction {
            store: self,
            episodes: Vec::new(),
        }))
    }

    async fn find_entities(&self, _group_id: &str, _names: &[String]) -> Result<Vec<EntityNode>> {
        Ok(Vec::new())
    }

    async fn active_edges_for(&self, _group_id: &str, _ids: &[Uuid]) -> Result<Vec<EntityEdge>> {
        Ok(Vec::new())
    }

    async fn previous_episode_id(
        &self,
        group_id: &str,
        _before: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<Uuid>> {
        Ok(self
            .committed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|n| n.episode.group_id == group_id && n.episode.id != exclude)
            .map(|n| n.episode.id))
    }

    async fn episode_state(&self, episode_id: Uuid) -> Result<Option<EpisodeState>> {
        Ok(self
            .committed
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.episode.id == episode_id)
            .map(|n| n.state))
    }
}

#[async_trait]
impl GraphTransaction for RecordingTransaction<'_> {
    async fn upsert_episodes(&mut self, episodes: &[EpisodicNode]) -> Result<()> {
        self.store.op("upsert_episodes").await?;
        self.episodes.extend_from_slice(episodes);
        Ok(())
    }

    async fn upsert_entities(&mut self, _entities: &[EntityNode]) -> Result<()> {
        self.store.op("upsert_entities").await
    }

    async fn insert_entity_edges(&mut self, _edges: &[EntityEdge]) -> Result<()> {
        self.store.op("insert_entity_edges").await
    }

    async fn invalidate_edges(&mut self, invalidations: &[Invalidation]) -> Result<u64> {
        self.store.op("invalidate_edges").await?;
        Ok(invalidations.len() as u64)
    }

    async fn insert_episodic_edges(&mut self, _edges: &[EpisodicEdge]) -> Result<()> {
        self.store.op("insert_episodic_edges").await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.store.op("commit").await?;
        self.store.committed.lock().unwrap().extend(self.episodes);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.store.op("rollback").await
    }
}

/// Notification sink that keeps every permanent failure it receives
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub failures: Mutex<Vec<PermanentFailure>>,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn permanent_failure(&self, failure: &PermanentFailure) -> Result<()> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }
}
