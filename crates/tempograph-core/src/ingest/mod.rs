//! Resilient episode ingestion
//!
//! - **health**: circuit breaker over the inference provider, plus the background probe
//! - **degradation**: picks full, degraded or rejected processing per episode
//! - **embedding**: resolves embeddings concurrently, before any transaction opens
//! - **writer**: commits a prepared batch in one short transaction
//! - **queue**: one FIFO worker per group
//! - **ledger**: durable, backoff-scheduled retries of raw episodes
//! - **rejections**: durable record of episodes rejected without a commit
//! - **pipeline**: wires the above together behind [`IngestionPipeline`]

mod degradation;
mod embedding;
mod health;
mod ledger;
mod notify;
mod pipeline;
mod queue;
mod rejections;
mod status;
mod writer;

#[cfg(test)]
mod testing;

pub use degradation::{DegradationController, DegradedMode, ProcessingMode};
pub use embedding::EmbeddingPreparer;
pub use health::{
    Availability, CallKind, CallPermit, CircuitBreaker, CircuitEvent, CircuitState, CircuitStatus,
    Decision, HealthMonitor, transition,
};
pub use ledger::{EnqueueOutcome, FailureOutcome, QuarantinedEntry, RetryEntry, RetryLedger};
pub use notify::{LogNotifier, NotificationSink, PermanentFailure, WebhookNotifier};
pub use pipeline::{DrainReport, IngestionPipeline, IngestionPipelineBuilder};
pub use queue::{Attempt, EpisodeProcessor, GroupQueue};
pub use rejections::RejectionLog;
pub use status::StatusTracker;
pub use writer::{BulkGraphWriter, WriteReceipt};
