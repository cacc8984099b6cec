//! Bulk graph writer
//!
//! Commits one prepared batch in one short transaction. Each table is written
//! with a single batched call, and every storage call has its own timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{BatchMode, GraphDraft, GraphStore, GraphTransaction, PreparedBatch};
use crate::error::{Error, Result};

/// Result of a committed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub episode_id: Uuid,
    pub mode: BatchMode,
    pub entities: usize,
    pub facts: usize,
    pub invalidated: u64,
    /// Time between opening the transaction and the end of its commit
    pub tx_held: Duration,
}

/// Run a storage call under a timeout, reporting expiry as `StorageTimeout`
pub(crate) async fn with_storage_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::StorageTimeout(operation.to_string()))?
}

pub struct BulkGraphWriter {
    store: Arc<dyn GraphStore>,
    operation_timeout: Duration,
}

impl BulkGraphWriter {
    pub fn new(store: Arc<dyn GraphStore>, operation_timeout: Duration) -> Self {
        Self {
            store,
            operation_timeout,
        }
    }

    /// Write a prepared batch atomically. Any failure rolls the whole batch back.
    pub async fn write(&self, batch: &PreparedBatch) -> Result<WriteReceipt> {
        let draft = batch.draft();
        let started = Instant::now();

        let mut tx = with_storage_timeout("begin", self.operation_timeout, self.store.begin()).await?;

        let invalidated = match self.write_draft(tx.as_mut(), draft).await {
            Ok(invalidated) => invalidated,
            Err(err) => {
                if let Err(rollback_err) =
                    with_storage_timeout("rollback", self.operation_timeout, tx.rollback()).await
                {
                    warn!(
                        episode_id = %batch.episode_id(),
                        error = %rollback_err,
                        "Rollback failed after write error"
                    );
                }
                warn!(episode_id = %batch.episode_id(), error = %err, "Batch write aborted");
                return Err(err);
            }
        };

        with_storage_timeout("commit", self.operation_timeout, tx.commit()).await?;
        let tx_held = started.elapsed();

        debug!(
            episode_id = %batch.episode_id(),
            mode = ?batch.mode(),
            items = draft.item_count(),
            tx_held_ms = tx_held.as_millis() as u64,
            "Batch committed"
        );

        Ok(WriteReceipt {
            episode_id: batch.episode_id(),
            mode: batch.mode(),
            entities: draft.entities.len(),
            facts: draft.edges.len(),
            invalidated,
            tx_held,
        })
    }

    async fn write_draft(&self, tx: &mut (dyn GraphTransaction + '_), draft: &GraphDraft) -> Result<u64> {
        let timeout = self.operation_timeout;

        with_storage_timeout(
            "upsert episodes",
            timeout,
            tx.upsert_episodes(std::slice::from_ref(&draft.episode)),
        )
        .await?;

        if !draft.entities.is_empty() {
            with_storage_timeout("upsert entities", timeout, tx.upsert_entities(&draft.entities)).await?;
        }
        if !draft.edges.is_empty() {
            with_storage_timeout("insert entity edges", timeout, tx.insert_entity_edges(&draft.edges))
                .await?;
        }

        let invalidated = if draft.invalidations.is_empty() {
            0
        } else {
            with_storage_timeout("invalidate edges", timeout, tx.invalidate_edges(&draft.invalidations))
                .await?
        };

        if !draft.episodic_edges.is_empty() {
            with_storage_timeout(
                "insert episodic edges",
                timeout,
                tx.insert_episodic_edges(&draft.episodic_edges),
            )
            .await?;
        }

        Ok(invalidated)
    }
}
