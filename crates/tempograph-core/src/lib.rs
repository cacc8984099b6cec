//! Tempograph Core Library
//!
//! Resilient ingestion of episodes into a temporal knowledge graph:
//! - Group ingestion queue (per-group FIFO workers)
//! - Embedding preparation outside storage transactions
//! - Bulk graph writes (SQLite)
//! - Circuit breaking over the inference provider (OpenRouter API)
//! - Graceful degradation and a durable retry ledger

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod ingest;
pub mod llm;
pub mod storage;
pub mod telemetry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::{Disposition, Episode, IngestionStatus, NewEpisode, SourceKind};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::ingest::IngestionPipeline;
}
