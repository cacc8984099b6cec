//! Graph store driver traits
//!
//! Reads run directly against the store. Writes only happen inside a
//! [`GraphTransaction`], and each write method takes a whole slice so a batch is
//! written in a constant number of round trips regardless of its size.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

use super::graph::{EntityEdge, EntityNode, EpisodeState, EpisodicEdge, EpisodicNode, Invalidation};

/// Storage backend for the temporal knowledge graph
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Open a write transaction
    async fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>>;

    /// Existing entity nodes of a group, matched by canonical name
    async fn find_entities(&self, group_id: &str, canonical_names: &[String]) -> Result<Vec<EntityNode>>;

    /// Facts touching any of the given entities that have not been invalidated
    async fn active_edges_for(&self, group_id: &str, entity_ids: &[Uuid]) -> Result<Vec<EntityEdge>>;

    /// Most recent episode of the group received before `before`, other than `exclude`
    async fn previous_episode_id(
        &self,
        group_id: &str,
        before: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<Uuid>>;

    /// Stored state of an episode, if it has been committed
    async fn episode_state(&self, episode_id: Uuid) -> Result<Option<EpisodeState>>;
}

/// One short-lived write transaction
#[async_trait]
pub trait GraphTransaction: Send {
    /// Insert episodes; an existing `full` episode is never downgraded to `raw`
    async fn upsert_episodes(&mut self, episodes: &[EpisodicNode]) -> Result<()>;

    /// Insert entity nodes, keeping existing embeddings on conflict
    async fn upsert_entities(&mut self, entities: &[EntityNode]) -> Result<()>;

    /// Insert facts; facts are immutable apart from invalidation
    async fn insert_entity_edges(&mut self, edges: &[EntityEdge]) -> Result<()>;

    /// Set `invalid_at` on facts that are still active; returns rows changed
    async fn invalidate_edges(&mut self, invalidations: &[Invalidation]) -> Result<u64>;

    /// Insert provenance edges, ignoring ones already recorded
    async fn insert_episodic_edges(&mut self, edges: &[EpisodicEdge]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
