//! SQLite implementation of the GraphStore
//!
//! Every transaction write is a multi-row statement built with `QueryBuilder`,
//! so a batch costs one round trip per table (per `MAX_ROWS_PER_STATEMENT` rows).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    EntityEdge, EntityNode, Episode, EpisodeState, EpisodicEdge, EpisodicNode, GraphStore,
    GraphTransaction, Invalidation, SourceKind,
};
use crate::error::{Error, Result};
use crate::storage::{decode_embedding, encode_embedding, format_timestamp, parse_timestamp};

/// Upper bound on rows per statement, well under SQLite's bind-variable limit
const MAX_ROWS_PER_STATEMENT: usize = 500;

/// SQLite implementation of the graph store
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Create a new SQLite graph store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load a stored episode
    pub async fn get_episode(&self, episode_id: Uuid) -> Result<Option<EpisodicNode>> {
        let row: Option<EpisodeRow> = sqlx::query_as("SELECT * FROM episodes WHERE id = ?")
            .bind(episode_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_node()).transpose()
    }

    /// All episodes of a group in arrival order
    pub async fn list_episodes(&self, group_id: &str) -> Result<Vec<EpisodicNode>> {
        let rows: Vec<EpisodeRow> =
            sqlx::query_as("SELECT * FROM episodes WHERE group_id = ? ORDER BY received_at, id")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_node()).collect()
    }

    /// All entity nodes of a group
    pub async fn list_entities(&self, group_id: &str) -> Result<Vec<EntityNode>> {
        let rows: Vec<EntityRow> =
            sqlx::query_as("SELECT * FROM entity_nodes WHERE group_id = ? ORDER BY name")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_node()).collect()
    }

    /// All facts of a group, including invalidated ones
    pub async fn list_edges(&self, group_id: &str) -> Result<Vec<EntityEdge>> {
        let rows: Vec<EdgeRow> =
            sqlx::query_as("SELECT * FROM entity_edges WHERE group_id = ? ORDER BY valid_at, created_at")
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_edge()).collect()
    }

    /// Provenance edges recorded for an episode
    pub async fn list_episodic_edges(&self, episode_id: Uuid) -> Result<Vec<(Uuid, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT target_id, kind FROM episodic_edges WHERE episode_id = ? ORDER BY kind, target_id",
        )
        .bind(episode_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(target, kind)| Ok((parse_uuid(&target)?, kind)))
            .collect()
    }

    /// Count committed episodes with this id (0 or 1)
    pub async fn count_episodes_with_id(&self, episode_id: Uuid) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM episodes WHERE id = ?")
            .bind(episode_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn begin(&self) -> Result<Box<dyn GraphTransaction + '_>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteGraphTransaction { tx }))
    }

    async fn find_entities(&self, group_id: &str, canonical_names: &[String]) -> Result<Vec<EntityNode>> {
        if canonical_names.is_empty() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for chunk in canonical_names.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM entity_nodes WHERE group_id = ");
            query.push_bind(group_id);
            query.push(" AND canonical_name IN (");
            let mut names = query.separated(", ");
            for name in chunk {
                names.push_bind(name);
            }
            names.push_unseparated(")");

            let rows: Vec<EntityRow> = query.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                found.push(row.into_node()?);
            }
        }

        Ok(found)
    }

    async fn active_edges_for(&self, group_id: &str, entity_ids: &[Uuid]) -> Result<Vec<EntityEdge>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = entity_ids.iter().map(Uuid::to_string).collect();
        let mut found = Vec::new();
        for chunk in ids.chunks(MAX_ROWS_PER_STATEMENT / 2) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "SELECT * FROM entity_edges WHERE invalid_at IS NULL AND group_id = ",
            );
            query.push_bind(group_id);
            query.push(" AND (source_node_id IN (");
            let mut sources = query.separated(", ");
            for id in chunk {
                sources.push_bind(id);
            }
            sources.push_unseparated(") OR target_node_id IN (");
            let mut targets = query.separated(", ");
            for id in chunk {
                targets.push_bind(id);
            }
            targets.push_unseparated("))");

            let rows: Vec<EdgeRow> = query.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                let edge = row.into_edge()?;
                if !found.iter().any(|e: &EntityEdge| e.id == edge.id) {
                    found.push(edge);
                }
            }
        }

        Ok(found)
    }

    async fn previous_episode_id(
        &self,
        group_id: &str,
        before: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM episodes
            WHERE group_id = ? AND received_at < ? AND id != ?
            ORDER BY received_at DESC
            LIMIT 1
            "#,
        )
        .bind(group_id)
        .bind(format_timestamp(&before))
        .bind(exclude.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id,)| parse_uuid(&id)).transpose()
    }

    async fn episode_state(&self, episode_id: Uuid) -> Result<Option<EpisodeState>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM episodes WHERE id = ?")
            .bind(episode_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|(status,)| EpisodeState::parse(&status)))
    }
}

/// A write transaction on the SQLite graph store
pub struct SqliteGraphTransaction {
    tx: Transaction<'static, Sqlite>,
}

fn write_failure(operation: &'static str) -> impl Fn(sqlx::Error) -> Error {
    move |e| Error::StorageWriteFailure(format!("{}: {}", operation, e))
}

#[async_trait]
impl GraphTransaction for SqliteGraphTransaction {
    async fn upsert_episodes(&mut self, episodes: &[EpisodicNode]) -> Result<()> {
        let now = format_timestamp(&Utc::now());

        for chunk in episodes.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "INSERT INTO episodes (id, group_id, name, body, source_kind, source_description, \
                 reference_time, received_at, status, previous_episode_id, created_at, updated_at) ",
            );
            query.push_values(chunk, |mut row, node| {
                let episode = &node.episode;
                row.push_bind(episode.id.to_string())
                    .push_bind(&episode.group_id)
                    .push_bind(&episode.name)
                    .push_bind(&episode.body)
                    .push_bind(episode.source_kind.as_str())
                    .push_bind(&episode.source_description)
                    .push_bind(format_timestamp(&episode.reference_time))
                    .push_bind(format_timestamp(&episode.received_at))
                    .push_bind(node.state.as_str())
                    .push_bind(node.previous_episode_id.map(|id| id.to_string()))
                    .push_bind(now.clone())
                    .push_bind(now.clone());
            });
            query.push(
                r#"
                ON CONFLICT(id) DO UPDATE SET
                    status = CASE WHEN episodes.status = 'full' THEN 'full' ELSE excluded.status END,
                    previous_episode_id = COALESCE(episodes.previous_episode_id, excluded.previous_episode_id),
                    updated_at = excluded.updated_at
                "#,
            );

            query
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(write_failure("upsert episodes"))?;
        }

        debug!(count = episodes.len(), "Episodes upserted");
        Ok(())
    }

    async fn upsert_entities(&mut self, entities: &[EntityNode]) -> Result<()> {
        let now = format_timestamp(&Utc::now());

        for chunk in entities.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "INSERT INTO entity_nodes (id, group_id, name, canonical_name, summary, \
                 name_embedding, created_at, updated_at) ",
            );
            query.push_values(chunk, |mut row, node| {
                row.push_bind(node.id.to_string())
                    .push_bind(&node.group_id)
                    .push_bind(&node.name)
                    .push_bind(&node.canonical_name)
                    .push_bind(&node.summary)
                    .push_bind(node.name_embedding.as_deref().map(encode_embedding))
                    .push_bind(format_timestamp(&node.created_at))
                    .push_bind(now.clone());
            });
            query.push(
                r#"
                ON CONFLICT(group_id, canonical_name) DO UPDATE SET
                    summary = COALESCE(excluded.summary, entity_nodes.summary),
                    name_embedding = COALESCE(entity_nodes.name_embedding, excluded.name_embedding),
                    updated_at = excluded.updated_at
                "#,
            );

            query
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(write_failure("upsert entities"))?;
        }

        debug!(count = entities.len(), "Entities upserted");
        Ok(())
    }

    async fn insert_entity_edges(&mut self, edges: &[EntityEdge]) -> Result<()> {
        for chunk in edges.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "INSERT INTO entity_edges (id, group_id, source_node_id, target_node_id, relation, \
                 fact_text, fact_embedding, valid_at, invalid_at, created_at) ",
            );
            query.push_values(chunk, |mut row, edge| {
                row.push_bind(edge.id.to_string())
                    .push_bind(&edge.group_id)
                    .push_bind(edge.source_node_id.to_string())
                    .push_bind(edge.target_node_id.to_string())
                    .push_bind(&edge.relation)
                    .push_bind(&edge.fact_text)
                    .push_bind(edge.fact_embedding.as_deref().map(encode_embedding))
                    .push_bind(format_timestamp(&edge.valid_at))
                    .push_bind(edge.invalid_at.as_ref().map(format_timestamp))
                    .push_bind(format_timestamp(&edge.created_at));
            });
            query.push(" ON CONFLICT(id) DO NOTHING");

            query
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(write_failure("insert entity edges"))?;
        }

        debug!(count = edges.len(), "Entity edges inserted");
        Ok(())
    }

    async fn invalidate_edges(&mut self, invalidations: &[Invalidation]) -> Result<u64> {
        let mut changed = 0;

        for chunk in invalidations.chunks(MAX_ROWS_PER_STATEMENT / 3) {
            let mut query = QueryBuilder::<Sqlite>::new("UPDATE entity_edges SET invalid_at = CASE id");
            for inv in chunk {
                query.push(" WHEN ");
                query.push_bind(inv.edge_id.to_string());
                query.push(" THEN ");
                query.push_bind(format_timestamp(&inv.invalid_at));
            }
            query.push(" END WHERE invalid_at IS NULL AND id IN (");
            let mut ids = query.separated(", ");
            for inv in chunk {
                ids.push_bind(inv.edge_id.to_string());
            }
            ids.push_unseparated(")");

            let result = query
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(write_failure("invalidate edges"))?;
            changed += result.rows_affected();
        }

        debug!(requested = invalidations.len(), changed, "Entity edges invalidated");
        Ok(changed)
    }

    async fn insert_episodic_edges(&mut self, edges: &[EpisodicEdge]) -> Result<()> {
        for chunk in edges.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "INSERT INTO episodic_edges (id, group_id, episode_id, target_id, kind, created_at) ",
            );
            query.push_values(chunk, |mut row, edge| {
                row.push_bind(edge.id.to_string())
                    .push_bind(&edge.group_id)
                    .push_bind(edge.episode_id.to_string())
                    .push_bind(edge.target_id.to_string())
                    .push_bind(edge.kind.as_str())
                    .push_bind(format_timestamp(&edge.created_at));
            });
            query.push(" ON CONFLICT(episode_id, target_id, kind) DO NOTHING");

            query
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(write_failure("insert episodic edges"))?;
        }

        debug!(count = edges.len(), "Episodic edges inserted");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(write_failure("commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(write_failure("rollback"))
    }
}

// ========== Database Row Types ==========

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Other(format!("Invalid id '{}': {}", value, e)))
}

fn parse_required_timestamp(value: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value).ok_or_else(|| Error::Other(format!("Invalid timestamp: {}", value)))
}

#[derive(Debug, FromRow)]
struct EpisodeRow {
    id: String,
    group_id: String,
    name: String,
    body: String,
    source_kind: String,
    source_description: String,
    reference_time: String,
    received_at: String,
    status: String,
    previous_episode_id: Option<String>,
}

impl EpisodeRow {
    fn into_node(self) -> Result<EpisodicNode> {
        let source_kind = SourceKind::parse(&self.source_kind)
            .ok_or_else(|| Error::Other(format!("Invalid source kind: {}", self.source_kind)))?;
        let state = EpisodeState::parse(&self.status)
            .ok_or_else(|| Error::Other(format!("Invalid episode status: {}", self.status)))?;

        Ok(EpisodicNode {
            episode: Episode {
                id: parse_uuid(&self.id)?,
                group_id: self.group_id,
                name: self.name,
                body: self.body,
                source_kind,
                source_description: self.source_description,
                reference_time: parse_required_timestamp(&self.reference_time)?,
                received_at: parse_required_timestamp(&self.received_at)?,
            },
            state,
            previous_episode_id: self.previous_episode_id.as_deref().map(parse_uuid).transpose()?,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    group_id: String,
    name: String,
    canonical_name: String,
    summary: Option<String>,
    name_embedding: Option<Vec<u8>>,
    created_at: String,
}

impl EntityRow {
    fn into_node(self) -> Result<EntityNode> {
        Ok(EntityNode {
            id: parse_uuid(&self.id)?,
            group_id: self.group_id,
            name: self.name,
            canonical_name: self.canonical_name,
            summary: self.summary,
            name_embedding: self.name_embedding.as_deref().map(decode_embedding),
            created_at: parse_timestamp(&self.created_at).unwrap_or_else(Utc::now),
        })
    }
}

#[derive(Debug, FromRow)]
struct EdgeRow {
    id: String,
    group_id: String,
    source_node_id: String,
    target_node_id: String,
    relation: String,
    fact_text: String,
    fact_embedding: Option<Vec<u8>>,
    valid_at: String,
    invalid_at: Option<String>,
    created_at: String,
}

impl EdgeRow {
    fn into_edge(self) -> Result<EntityEdge> {
        Ok(EntityEdge {
            id: parse_uuid(&self.id)?,
            group_id: self.group_id,
            source_node_id: parse_uuid(&self.source_node_id)?,
            target_node_id: parse_uuid(&self.target_node_id)?,
            relation: self.relation,
            fact_text: self.fact_text,
            fact_embedding: self.fact_embedding.as_deref().map(decode_embedding),
            valid_at: parse_required_timestamp(&self.valid_at)?,
            invalid_at: self.invalid_at.as_deref().and_then(parse_timestamp),
            created_at: parse_timestamp(&self.created_at).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EpisodicEdgeKind, GraphDraft, NewEpisode};
    use crate::storage::run_migrations;
    use chrono::{Duration, TimeZone};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqliteGraphStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool");

        run_migrations(&pool).await.expect("Failed to run migrations");

        SqliteGraphStore::new(pool)
    }

    fn episode(group: &str, body: &str, received_at: DateTime<Utc>) -> Episode {
        Episode::accept(NewEpisode::new(group, "ep", body, received_at), received_at).unwrap()
    }

    fn node(episode: Episode, state: EpisodeState) -> EpisodicNode {
        EpisodicNode {
            episode,
            state,
            previous_episode_id: None,
        }
    }

    #[tokio::test]
    async fn test_episode_upsert_never_downgrades() {
        let store = setup_test_db().await;
        let ep = episode("g1", "Alice joined", Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.upsert_episodes(&[node(ep.clone(), EpisodeState::Full)]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.upsert_episodes(&[node(ep.clone(), EpisodeState::Raw)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.episode_state(ep.id).await.unwrap(), Some(EpisodeState::Full));
        assert_eq!(store.count_episodes_with_id(ep.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_raw_episode_upgrades_to_full() {
        let store = setup_test_db().await;
        let ep = episode("g1", "Bob left", Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.upsert_episodes(&[node(ep.clone(), EpisodeState::Raw)]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.episode_state(ep.id).await.unwrap(), Some(EpisodeState::Raw));

        let mut tx = store.begin().await.unwrap();
        tx.upsert_episodes(&[node(ep.clone(), EpisodeState::Full)]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.episode_state(ep.id).await.unwrap(), Some(EpisodeState::Full));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = setup_test_db().await;
        let ep = episode("g1", "discarded", Utc::now());

        let mut tx = store.begin().await.unwrap();
        tx.upsert_episodes(&[node(ep.clone(), EpisodeState::Raw)]).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.episode_state(ep.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entities_resolved_by_canonical_name_and_keep_embedding() {
        let store = setup_test_db().await;

        let mut alice = EntityNode::new("g1", "Alice");
        alice.name_embedding = Some(vec![1.0, 0.0]);
        let mut tx = store.begin().await.unwrap();
        tx.upsert_entities(&[alice.clone(), EntityNode::new("g2", "Alice")]).await.unwrap();
        tx.commit().await.unwrap();

        // Conflicting insert with a new id and no embedding keeps the original row
        let mut dup = EntityNode::new("g1", "ALICE").with_summary("engineer");
        dup.name_embedding = None;
        let mut tx = store.begin().await.unwrap();
        tx.upsert_entities(&[dup]).await.unwrap();
        tx.commit().await.unwrap();

        let found = store.find_entities("g1", &["alice".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, alice.id);
        assert_eq!(found[0].name_embedding, Some(vec![1.0, 0.0]));
        assert_eq!(found[0].summary.as_deref(), Some("engineer"));
    }

    #[tokio::test]
    async fn test_invalidation_is_set_only() {
        let store = setup_test_db().await;
        let a = EntityNode::new("g1", "Alice");
        let b = EntityNode::new("g1", "Acme");
        let t0 = Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap();
        let edge = EntityEdge::new("g1", a.id, b.id, "works_at", "Alice works at Acme", t0);

        let mut tx = store.begin().await.unwrap();
        tx.upsert_entities(&[a.clone(), b.clone()]).await.unwrap();
        tx.insert_entity_edges(&[edge.clone()]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.active_edges_for("g1", &[a.id]).await.unwrap().len(), 1);

        let first = t0 + Duration::days(1);
        let mut tx = store.begin().await.unwrap();
        let changed = tx
            .invalidate_edges(&[Invalidation { edge_id: edge.id, invalid_at: first }])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(changed, 1);

        // A second invalidation does not move the timestamp
        let mut tx = store.begin().await.unwrap();
        let changed = tx
            .invalidate_edges(&[Invalidation {
                edge_id: edge.id,
                invalid_at: first + Duration::days(1),
            }])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(changed, 0);

        let edges = store.list_edges("g1").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].invalid_at, Some(first));
        assert!(store.active_edges_for("g1", &[a.id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_previous_episode_lookup() {
        let store = setup_test_db().await;
        let t0 = Utc::now();
        let first = episode("g1", "one", t0);
        let second = episode("g1", "two", t0 + Duration::seconds(1));
        let other_group = episode("g2", "three", t0 + Duration::seconds(2));

        let mut tx = store.begin().await.unwrap();
        tx.upsert_episodes(&[
            node(first.clone(), EpisodeState::Full),
            node(second.clone(), EpisodeState::Full),
            node(other_group, EpisodeState::Full),
        ])
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let later = t0 + Duration::seconds(10);
        assert_eq!(
            store.previous_episode_id("g1", later, Uuid::new_v4()).await.unwrap(),
            Some(second.id)
        );
        assert_eq!(
            store.previous_episode_id("g1", second.received_at, second.id).await.unwrap(),
            Some(first.id)
        );
        assert_eq!(store.previous_episode_id("g1", t0, first.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_episodic_edges_deduplicated() {
        let store = setup_test_db().await;
        let prev = episode("g1", "prev", Utc::now() - Duration::seconds(5));
        let ep = episode("g1", "current", Utc::now());
        let draft = GraphDraft::raw(ep.clone(), Some(prev.id));

        for _ in 0..2 {
            let mut tx = store.begin().await.unwrap();
            tx.upsert_episodes(&[node(prev.clone(), EpisodeState::Raw), draft.episode.clone()])
                .await
                .unwrap();
            tx.insert_episodic_edges(&draft.episodic_edges).await.unwrap();
            tx.commit().await.unwrap();
        }

        let links = store.list_episodic_edges(ep.id).await.unwrap();
        assert_eq!(links, vec![(prev.id, EpisodicEdgeKind::PrecededBy.as_str().to_string())]);
    }

    #[tokio::test]
    async fn test_large_batch_is_chunked() {
        let store = setup_test_db().await;
        let entities: Vec<EntityNode> = (0..1200)
            .map(|i| EntityNode::new("g1", format!("entity {}", i)))
            .collect();

        let mut tx = store.begin().await.unwrap();
        tx.upsert_entities(&entities).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.list_entities("g1").await.unwrap().len(), 1200);
    }
}
