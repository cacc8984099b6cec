//! Domain types for episode ingestion
//!
//! - **Episode**: one unit of submitted content, scoped to a group
//! - **Graph**: entity nodes, facts, and provenance edges derived from episodes
//! - **Store**: the driver traits the bulk writer commits through

mod episode;
mod graph;
mod store;

pub use episode::{Disposition, Episode, IngestionStatus, NewEpisode, SourceKind};
pub use graph::{
    BatchMode, EntityEdge, EntityNode, EpisodeState, EpisodicEdge, EpisodicEdgeKind,
    EpisodicNode, GraphDraft, Invalidation, PreparedBatch, canonicalize,
};
pub use store::{GraphStore, GraphTransaction};
