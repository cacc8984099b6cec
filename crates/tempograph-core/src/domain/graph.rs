//! Temporal knowledge graph types
//!
//! Nodes and edges produced from episodes. Entity nodes are unique per group by
//! canonical name. Entity edges ("facts") are never deleted; a superseded fact
//! gets an `invalid_at` timestamp instead. Episodic edges record provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::episode::Episode;

/// Whether an episodic node carries derived data yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    /// Stored without extraction or embeddings
    Raw,
    /// Fully processed
    Full,
}

impl EpisodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// The stored form of an episode
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodicNode {
    pub episode: Episode,
    pub state: EpisodeState,
    /// Previous episode in the same group (session continuity chain)
    pub previous_episode_id: Option<Uuid>,
}

/// An entity node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: Uuid,
    pub group_id: String,
    pub name: String,
    pub canonical_name: String,
    pub summary: Option<String>,
    pub name_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl EntityNode {
    pub fn new(group_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            canonical_name: canonicalize(&name),
            name,
            summary: None,
            name_embedding: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A fact connecting two entities, valid from `valid_at` until `invalid_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEdge {
    pub id: Uuid,
    pub group_id: String,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub relation: String,
    pub fact_text: String,
    pub fact_embedding: Option<Vec<f32>>,
    pub valid_at: DateTime<Utc>,
    pub invalid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EntityEdge {
    pub fn new(
        group_id: impl Into<String>,
        source_node_id: Uuid,
        target_node_id: Uuid,
        relation: impl Into<String>,
        fact_text: impl Into<String>,
        valid_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            source_node_id,
            target_node_id,
            relation: canonicalize(&relation.into()).replace(' ', "_"),
            fact_text: fact_text.into(),
            fact_embedding: None,
            valid_at,
            invalid_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.invalid_at.is_none()
    }

    /// Whether `other` states the same relation between the same entities
    pub fn same_slot(&self, other: &EntityEdge) -> bool {
        self.source_node_id == other.source_node_id
            && self.target_node_id == other.target_node_id
            && self.relation == other.relation
    }
}

/// Kind of provenance link from an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodicEdgeKind {
    /// Episode mentions an entity node
    Mentions,
    /// Episode supports (produced) a fact
    Supports,
    /// Episode follows another episode of the same group
    PrecededBy,
}

impl EpisodicEdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mentions => "mentions",
            Self::Supports => "supports",
            Self::PrecededBy => "preceded_by",
        }
    }
}

/// Provenance edge from an episode to a node, fact, or earlier episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodicEdge {
    pub id: Uuid,
    pub group_id: String,
    pub episode_id: Uuid,
    pub target_id: Uuid,
    pub kind: EpisodicEdgeKind,
    pub created_at: DateTime<Utc>,
}

impl EpisodicEdge {
    pub fn new(episode: &Episode, target_id: Uuid, kind: EpisodicEdgeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: episode.group_id.clone(),
            episode_id: episode.id,
            target_id,
            kind,
            created_at: Utc::now(),
        }
    }
}

/// An existing fact to close, set-only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidation {
    pub edge_id: Uuid,
    pub invalid_at: DateTime<Utc>,
}

/// Everything one episode contributes to the graph, before embeddings are resolved
#[derive(Debug, Clone)]
pub struct GraphDraft {
    pub episode: EpisodicNode,
    pub entities: Vec<EntityNode>,
    pub edges: Vec<EntityEdge>,
    pub invalidations: Vec<Invalidation>,
    pub episodic_edges: Vec<EpisodicEdge>,
}

impl GraphDraft {
    /// Draft carrying only the raw episode and its continuity link
    pub fn raw(episode: Episode, previous_episode_id: Option<Uuid>) -> Self {
        let episodic_edges = previous_episode_id
            .map(|prev| EpisodicEdge::new(&episode, prev, EpisodicEdgeKind::PrecededBy))
            .into_iter()
            .collect();

        Self {
            episode: EpisodicNode {
                episode,
                state: EpisodeState::Raw,
                previous_episode_id,
            },
            entities: Vec::new(),
            edges: Vec::new(),
            invalidations: Vec::new(),
            episodic_edges,
        }
    }

    /// Number of entity names and facts still lacking an embedding
    pub fn pending_embeddings(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| e.name_embedding.is_none())
            .count()
            + self
                .edges
                .iter()
                .filter(|e| e.fact_embedding.is_none())
                .count()
    }

    pub fn item_count(&self) -> usize {
        1 + self.entities.len() + self.edges.len() + self.episodic_edges.len()
    }
}

/// How a prepared batch is to be committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Every entity and fact carries a resolved embedding
    Full,
    /// Explicitly degraded: raw episode only, no derived data
    Raw,
}

/// A batch ready for the bulk writer.
///
/// Only constructible once every embedding it needs is resolved, or when it is
/// explicitly raw. The writer accepts nothing else, so no transaction can be
/// opened while inference work for the batch is outstanding.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    draft: GraphDraft,
    mode: BatchMode,
}

impl PreparedBatch {
    /// A degraded batch: the raw episode plus its continuity link
    pub fn raw(episode: Episode, previous_episode_id: Option<Uuid>) -> Self {
        Self {
            draft: GraphDraft::raw(episode, previous_episode_id),
            mode: BatchMode::Raw,
        }
    }

    /// Seal a fully embedded draft
    pub(crate) fn full(mut draft: GraphDraft) -> Result<Self> {
        let pending = draft.pending_embeddings();
        if pending > 0 {
            return Err(Error::InvalidInput(format!(
                "{} entities/facts still lack embeddings",
                pending
            )));
        }
        draft.episode.state = EpisodeState::Full;
        Ok(Self {
            draft,
            mode: BatchMode::Full,
        })
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn draft(&self) -> &GraphDraft {
        &self.draft
    }

    pub fn episode_id(&self) -> Uuid {
        self.draft.episode.episode.id
    }
}

/// Canonicalize a name for deduplication
///
/// Lowercase, alphanumerics and whitespace only, whitespace collapsed.
pub fn canonicalize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
