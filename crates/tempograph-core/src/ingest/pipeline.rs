//! Episode ingestion pipeline
//!
//! Wires the group queue, degradation controller, embedding preparer, bulk
//! writer and retry ledger together, and owns the background probe and
//! drain loops.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DegradationPolicy};
use crate::domain::{
    Disposition, EntityEdge, EntityNode, Episode, EpisodeState, EpisodicEdge, EpisodicEdgeKind,
    GraphDraft, GraphStore, IngestionStatus, Invalidation, NewEpisode, PreparedBatch, canonicalize,
};
use crate::error::{Error, ErrorCategory, Result};
use crate::infrastructure::graph::SqliteGraphStore;
use crate::llm::{ExtractedGraph, InferenceProvider, LlmClient};
use crate::storage::{Database, DatabaseConfig};

use super::degradation::{DegradationController, DegradedMode, ProcessingMode};
use super::embedding::EmbeddingPreparer;
use super::health::{Availability, CallKind, HealthMonitor};
use super::ledger::{FailureOutcome, RetryEntry, RetryLedger};
use super::notify::{LogNotifier, NotificationSink, PermanentFailure, WebhookNotifier};
use super::queue::{Attempt, EpisodeProcessor, GroupQueue};
use super::rejections::RejectionLog;
use super::status::StatusTracker;
use super::writer::{BulkGraphWriter, WriteReceipt, with_storage_timeout};

/// Processes one episode end to end
pub(crate) struct EpisodeIngestor {
    provider: Arc<dyn InferenceProvider>,
    store: Arc<dyn GraphStore>,
    health: Arc<HealthMonitor>,
    controller: DegradationController,
    preparer: EmbeddingPreparer,
    writer: BulkGraphWriter,
    ledger: RetryLedger,
    rejections: RejectionLog,
    storage_timeout: Duration,
}

#[async_trait]
impl EpisodeProcessor for EpisodeIngestor {
    async fn process(&self, episode: Episode, attempt: Attempt) -> Disposition {
        match attempt {
            Attempt::Initial => self.process_initial(episode).await,
            Attempt::Retry { number } => {
                debug!(episode_id = %episode.id, attempt = number, "Retrying full processing");
                match self.ingest_full(&episode).await {
                    Ok(receipt) => full_disposition(&receipt),
                    Err(err) => Disposition::rejected(&err),
                }
            }
        }
    }

    /// The aborted run may already have committed; report what the store holds
    async fn timed_out(&self, episode: &Episode, attempt: Attempt, err: Error) -> Disposition {
        let stored = with_storage_timeout(
            "episode state",
            self.storage_timeout,
            self.store.episode_state(episode.id),
        )
        .await
        .unwrap_or_else(|check_err| {
            warn!(episode_id = %episode.id, error = %check_err, "Could not check state of timed out episode");
            None
        });

        match (stored, attempt) {
            (Some(EpisodeState::Full), _) => {
                self.clear_ledger_entry(episode.id).await;
                Disposition::CommittedFull { entities: 0, facts: 0 }
            }
            (Some(EpisodeState::Raw), Attempt::Initial) => self.keep_timed_out_raw(episode).await,
            (None, Attempt::Initial) => self.reject(episode, err).await,
            (_, Attempt::Retry { .. }) => Disposition::rejected(&err),
        }
    }
}

impl EpisodeIngestor {
    async fn process_initial(&self, episode: Episode) -> Disposition {
        let mode = match self.controller.decide() {
            ProcessingMode::Full => match self.ingest_full(&episode).await {
                Ok(receipt) => {
                    self.clear_ledger_entry(episode.id).await;
                    return full_disposition(&receipt);
                }
                Err(err) if err.is_provider_failure() => match self.controller.on_provider_failure(err) {
                    Ok(degraded) => degraded,
                    Err(err) => return self.reject(&episode, err).await,
                },
                Err(err) => return self.reject(&episode, err).await,
            },
            ProcessingMode::Degraded(degraded) => degraded,
            ProcessingMode::Rejected(err) => return self.reject(&episode, err).await,
        };

        match self.commit_degraded(&episode, mode).await {
            Ok(disposition) => disposition,
            Err(err) => self.reject(&episode, err).await,
        }
    }

    async fn reject(&self, episode: &Episode, err: Error) -> Disposition {
        warn!(
            episode_id = %episode.id,
            group_id = %episode.group_id,
            category = %err.category(),
            error = %err,
            "Episode rejected"
        );

        if let Err(record_err) = self
            .rejections
            .record(episode, err.category(), err.retry_after(), Utc::now())
            .await
        {
            warn!(episode_id = %episode.id, error = %record_err, "Failed to record rejection");
        }
        Disposition::rejected(&err)
    }

    /// A raw commit survived the timeout: make sure it is scheduled like any
    /// other degraded episode
    async fn keep_timed_out_raw(&self, episode: &Episode) -> Disposition {
        let category = ErrorCategory::EpisodeTimeout;
        let retry_scheduled = self.controller.policy() == DegradationPolicy::StoreRawAndRetry
            && match self.ledger.enqueue(episode, Some(category), Utc::now()).await {
                Ok(_) => true,
                Err(err) => {
                    error!(
                        episode_id = %episode.id,
                        group_id = %episode.group_id,
                        error = %err,
                        "Timed out episode stored raw but could not be scheduled for retry"
                    );
                    false
                }
            };

        warn!(episode_id = %episode.id, retry_scheduled, "Episode timed out after its raw commit");
        Disposition::CommittedDegraded {
            category,
            retry_after: None,
            retry_scheduled,
        }
    }

    /// A fresh full commit supersedes any pending retry of the same episode
    async fn clear_ledger_entry(&self, episode_id: Uuid) {
        match self.ledger.remove(episode_id).await {
            Ok(true) => debug!(episode_id = %episode_id, "Removed retry entry after full commit"),
            Ok(false) => {}
            Err(err) => warn!(episode_id = %episode_id, error = %err, "Failed to clear retry entry"),
        }
    }

    /// Extract, resolve, embed, then write in one short transaction
    async fn ingest_full(&self, episode: &Episode) -> Result<WriteReceipt> {
        let extracted = self
            .health
            .call(CallKind::Extraction, self.provider.extract_entities(&episode.body))
            .await?;

        let draft = self.build_draft(episode, extracted).await?;
        let batch = self.preparer.prepare(draft).await?;
        self.writer.write(&batch).await
    }

    async fn previous_episode(&self, episode: &Episode) -> Result<Option<Uuid>> {
        with_storage_timeout(
            "previous episode",
            self.storage_timeout,
            self.store
                .previous_episode_id(&episode.group_id, episode.received_at, episode.id),
        )
        .await
    }

    /// Turn an extraction result into a draft against the group's current graph
    async fn build_draft(&self, episode: &Episode, extracted: ExtractedGraph) -> Result<GraphDraft> {
        let group_id = episode.group_id.as_str();
        let previous = self.previous_episode(episode).await?;
        let mut draft = GraphDraft::raw(episode.clone(), previous);

        let mut names: Vec<(String, String, Option<String>)> = Vec::new();
        let mut seen = HashSet::new();
        let mentioned = extracted
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e.summary.clone()))
            .chain(extracted.facts.iter().flat_map(|f| {
                [(f.source.as_str(), None), (f.target.as_str(), None)]
            }));
        for (name, summary) in mentioned {
            let canonical = canonicalize(name);
            if canonical.is_empty() || !seen.insert(canonical.clone()) {
                continue;
            }
            names.push((canonical, name.trim().to_string(), summary));
        }

        let canonical_names: Vec<String> = names.iter().map(|(c, _, _)| c.clone()).collect();
        let existing = with_storage_timeout(
            "find entities",
            self.storage_timeout,
            self.store.find_entities(group_id, &canonical_names),
        )
        .await?;
        let mut existing: HashMap<String, EntityNode> = existing
            .into_iter()
            .map(|node| (node.canonical_name.clone(), node))
            .collect();

        let mut ids = HashMap::new();
        for (canonical, name, summary) in names {
            let mut node = existing
                .remove(&canonical)
                .unwrap_or_else(|| EntityNode::new(group_id, name));
            if node.summary.is_none() {
                node.summary = summary;
            }
            ids.insert(canonical, node.id);
            draft.entities.push(node);
        }

        let entity_ids: Vec<Uuid> = draft.entities.iter().map(|e| e.id).collect();
        let active = if entity_ids.is_empty() {
            Vec::new()
        } else {
            with_storage_timeout(
                "active edges",
                self.storage_timeout,
                self.store.active_edges_for(group_id, &entity_ids),
            )
            .await?
        };

        let mut supported = Vec::new();
        let mut invalidated = HashSet::new();
        for fact in extracted.facts {
            let (Some(source), Some(target)) = (
                ids.get(&canonicalize(&fact.source)),
                ids.get(&canonicalize(&fact.target)),
            ) else {
                continue;
            };
            if fact.fact.trim().is_empty() {
                continue;
            }

            let mut edge = EntityEdge::new(
                group_id,
                *source,
                *target,
                fact.relation,
                fact.fact.trim(),
                episode.reference_time,
            );
            if edge.relation.is_empty() {
                continue;
            }

            if let Some(same) = active
                .iter()
                .chain(draft.edges.iter())
                .find(|e| e.is_active() && e.same_slot(&edge) && e.fact_text == edge.fact_text)
            {
                supported.push(same.id);
                continue;
            }

            let mut superseded_at = None;
            for older in active.iter().filter(|e| e.same_slot(&edge)) {
                if older.valid_at > edge.valid_at {
                    // The stored fact is newer: this one was already superseded
                    superseded_at = Some(match superseded_at {
                        Some(at) if at < older.valid_at => at,
                        _ => older.valid_at,
                    });
                } else if invalidated.insert(older.id) {
                    draft.invalidations.push(Invalidation {
                        edge_id: older.id,
                        invalid_at: edge.valid_at,
                    });
                }
            }
            if superseded_at.is_some() {
                edge.invalid_at = superseded_at;
            }

            supported.push(edge.id);
            draft.edges.push(edge);
        }

        for entity_id in &entity_ids {
            draft
                .episodic_edges
                .push(EpisodicEdge::new(episode, *entity_id, EpisodicEdgeKind::Mentions));
        }
        for edge_id in supported {
            draft
                .episodic_edges
                .push(EpisodicEdge::new(episode, edge_id, EpisodicEdgeKind::Supports));
        }

        debug!(
            episode_id = %episode.id,
            entities = draft.entities.len(),
            facts = draft.edges.len(),
            invalidations = draft.invalidations.len(),
            "Draft built"
        );

        Ok(draft)
    }

    /// Commit the raw episode, then schedule it for retry if the mode asks for it
    async fn commit_degraded(&self, episode: &Episode, mode: DegradedMode) -> Result<Disposition> {
        let stored = with_storage_timeout(
            "episode state",
            self.storage_timeout,
            self.store.episode_state(episode.id),
        )
        .await?;
        if stored == Some(EpisodeState::Full) {
            info!(episode_id = %episode.id, "Episode already fully processed, nothing to degrade");
            return Ok(Disposition::CommittedFull { entities: 0, facts: 0 });
        }

        let previous = self.previous_episode(episode).await?;
        self.writer
            .write(&PreparedBatch::raw(episode.clone(), previous))
            .await?;

        warn!(
            episode_id = %episode.id,
            group_id = %episode.group_id,
            category = %mode.category,
            "Episode committed raw without derived data"
        );

        if !mode.schedule_retry {
            return Ok(Disposition::CommittedDegraded {
                category: mode.category,
                retry_after: mode.retry_after,
                retry_scheduled: false,
            });
        }

        match self.ledger.enqueue(episode, Some(mode.category), Utc::now()).await {
            Ok(_) => Ok(Disposition::CommittedDegraded {
                category: mode.category,
                retry_after: mode.retry_after,
                retry_scheduled: true,
            }),
            Err(err) => {
                error!(
                    episode_id = %episode.id,
                    group_id = %episode.group_id,
                    error = %err,
                    "Episode stored raw but could not be scheduled for retry"
                );
                Ok(Disposition::CommittedDegraded {
                    category: err.category(),
                    retry_after: mode.retry_after,
                    retry_scheduled: false,
                })
            }
        }
    }
}

fn full_disposition(receipt: &WriteReceipt) -> Disposition {
    Disposition::CommittedFull {
        entities: receipt.entities,
        facts: receipt.facts,
    }
}

/// Outcome of one pass over the due retry entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// The provider was unavailable, nothing was attempted
    pub skipped: bool,
    pub recovered: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Rejected by an open circuit; left due without using an attempt
    pub deferred: usize,
    /// Failed in a way no further attempt can fix; removed and reported
    pub abandoned: usize,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.recovered + self.rescheduled + self.exhausted + self.deferred + self.abandoned
    }
}

struct PipelineInner {
    config: Config,
    queue: GroupQueue,
    status: Arc<StatusTracker>,
    store: Arc<dyn GraphStore>,
    ledger: RetryLedger,
    rejections: RejectionLog,
    health: Arc<HealthMonitor>,
    provider: Arc<dyn InferenceProvider>,
    notifiers: Vec<Arc<dyn NotificationSink>>,
    drain_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Resilient episode ingestion into the temporal knowledge graph
///
/// Cheap to clone; all clones share one set of workers and background loops.
#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<PipelineInner>,
}

/// Builder for [`IngestionPipeline`]
pub struct IngestionPipelineBuilder {
    config: Config,
    provider: Option<Arc<dyn InferenceProvider>>,
    store: Option<Arc<dyn GraphStore>>,
    ledger: Option<RetryLedger>,
    notifiers: Vec<Arc<dyn NotificationSink>>,
}

impl IngestionPipelineBuilder {
    pub fn provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: RetryLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Add a permanent-failure sink; failures are always logged as well
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn build(self) -> Result<IngestionPipeline> {
        let provider = self
            .provider
            .ok_or_else(|| Error::ConfigError("Pipeline requires an inference provider".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| Error::ConfigError("Pipeline requires a graph store".to_string()))?;
        let ledger = self
            .ledger
            .ok_or_else(|| Error::ConfigError("Pipeline requires a retry ledger".to_string()))?;

        let rejections = RejectionLog::new(ledger.pool().clone());
        let config = self.config;
        let ingestion = &config.ingestion;
        let storage_timeout = config.storage.operation_timeout();

        let health = Arc::new(HealthMonitor::new(
            config.circuit.clone(),
            ingestion.provider_call_timeout(),
        ));

        let ingestor = Arc::new(EpisodeIngestor {
            provider: provider.clone(),
            store: store.clone(),
            health: health.clone(),
            controller: DegradationController::new(health.clone(), config.degradation.policy),
            preparer: EmbeddingPreparer::new(
                provider.clone(),
                health.clone(),
                ingestion.embedding_concurrency,
            ),
            writer: BulkGraphWriter::new(store.clone(), storage_timeout),
            ledger: ledger.clone(),
            rejections: rejections.clone(),
            storage_timeout,
        });

        let status = Arc::new(StatusTracker::new(ingestion.status_cache_size));
        let queue = GroupQueue::new(
            ingestor,
            status.clone(),
            ingestion.episode_timeout(),
            ingestion.group_idle_grace(),
        );

        let mut notifiers: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogNotifier)];
        notifiers.extend(self.notifiers);

        Ok(IngestionPipeline {
            inner: Arc::new(PipelineInner {
                config,
                queue,
                status,
                store,
                ledger,
                rejections,
                health,
                provider,
                notifiers,
                drain_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

impl IngestionPipeline {
    pub fn builder(config: Config) -> IngestionPipelineBuilder {
        IngestionPipelineBuilder {
            config,
            provider: None,
            store: None,
            ledger: None,
            notifiers: Vec::new(),
        }
    }

    /// Open the SQLite database, the provider client and any configured webhook
    pub async fn open(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let db = Database::new(DatabaseConfig::from_storage_config(&config.storage))
            .await
            .map_err(|e| Error::Other(format!("{:#}", e)))?;
        let store = Arc::new(SqliteGraphStore::new(db.pool().clone()));
        let ledger = RetryLedger::new(db.pool().clone(), &config.retry);
        let provider = Arc::new(LlmClient::from_config(config.llm.clone())?);

        let mut builder = Self::builder(config.clone())
            .provider(provider)
            .store(store)
            .ledger(ledger);

        if let Some(url) = &config.notifications.webhook_url {
            let timeout = Duration::from_secs(config.notifications.webhook_timeout_secs);
            builder = builder.notifier(Arc::new(WebhookNotifier::new(url.as_str(), timeout)?));
        }

        builder.build()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.inner.ledger
    }

    /// Groups that currently have a live worker
    pub async fn active_groups(&self) -> usize {
        self.inner.queue.active_groups().await
    }

    /// Accept an episode and queue it on its group's worker.
    ///
    /// Returns the content-derived episode id. A payload that is already
    /// pending is not queued a second time.
    pub async fn submit_episode(&self, new: NewEpisode) -> Result<Uuid> {
        let episode = Episode::accept(new, Utc::now())?;
        let episode_id = episode.id;

        if !self.inner.status.mark_pending(episode_id) {
            debug!(episode_id = %episode_id, "Episode already pending, not queued again");
            return Ok(episode_id);
        }

        debug!(episode_id = %episode_id, group_id = %episode.group_id, "Episode accepted");
        drop(self.inner.queue.submit(episode, Attempt::Initial).await);
        Ok(episode_id)
    }

    /// Submit an episode and wait for its terminal disposition
    pub async fn submit_and_wait(&self, new: NewEpisode) -> Result<Disposition> {
        let episode = Episode::accept(new, Utc::now())?;
        self.inner.status.mark_pending(episode.id);

        let reply = self.inner.queue.submit(episode, Attempt::Initial).await;
        reply
            .await
            .map_err(|_| Error::Other("Group worker dropped the episode without a disposition".to_string()))
    }

    /// Pending or terminal state of an episode, `None` if it is unknown.
    ///
    /// Recent statuses come from memory; older ones from the stored episode or
    /// the rejection log.
    pub async fn get_ingestion_status(&self, episode_id: Uuid) -> Result<Option<IngestionStatus>> {
        if let Some(status) = self.inner.status.get(episode_id) {
            return Ok(Some(status));
        }

        let stored = with_storage_timeout(
            "episode state",
            self.inner.config.storage.operation_timeout(),
            self.inner.store.episode_state(episode_id),
        )
        .await?;

        Ok(match stored {
            Some(EpisodeState::Full) => Some(IngestionStatus::CommittedFull),
            Some(EpisodeState::Raw) => {
                let entry = self.inner.ledger.get(episode_id).await?;
                Some(IngestionStatus::CommittedDegraded {
                    category: entry.and_then(|e| e.last_error_category),
                    retry_after: None,
                })
            }
            None => self.inner.rejections.status(episode_id).await?,
        })
    }

    /// Re-drive every due ledger entry through its group's queue once
    pub async fn drain_retries_once(&self) -> Result<DrainReport> {
        let _running = self.inner.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if let Availability::Unavailable { retry_after } = self.inner.health.availability() {
            debug!(retry_after_secs = retry_after.as_secs(), "Provider unavailable, skipping retry drain");
            report.skipped = true;
            return Ok(report);
        }

        let due = self
            .inner
            .ledger
            .due(Utc::now(), self.inner.config.retry.drain_batch_size)
            .await?;
        if due.is_empty() {
            return Ok(report);
        }

        // Submit in due order so each group sees its retries in that order
        let mut pending = Vec::with_capacity(due.len());
        for entry in due {
            let attempt = Attempt::Retry {
                number: entry.attempt_count + 1,
            };
            let reply = self.inner.queue.submit(entry.episode.clone(), attempt).await;
            pending.push(async move {
                let disposition = reply.await.unwrap_or_else(|_| {
                    Disposition::rejected(&Error::Other("retry dropped by group worker".to_string()))
                });
                (entry, disposition)
            });
        }

        for (entry, disposition) in join_all(pending).await {
            if let Err(err) = self.settle_retry(&entry, disposition, &mut report).await {
                error!(episode_id = %entry.episode_id(), error = %err, "Failed to settle retry");
            }
        }

        info!(
            recovered = report.recovered,
            rescheduled = report.rescheduled,
            exhausted = report.exhausted,
            deferred = report.deferred,
            abandoned = report.abandoned,
            "Retry drain completed"
        );

        Ok(report)
    }

    async fn settle_retry(
        &self,
        entry: &RetryEntry,
        disposition: Disposition,
        report: &mut DrainReport,
    ) -> Result<()> {
        let episode_id = entry.episode_id();
        let category = match disposition {
            Disposition::CommittedFull { .. } => {
                self.inner.ledger.remove(episode_id).await?;
                info!(episode_id = %episode_id, attempt = entry.attempt_count + 1, "Episode recovered");
                report.recovered += 1;
                return Ok(());
            }
            Disposition::Rejected {
                category: ErrorCategory::CircuitOpen,
                ..
            } => {
                report.deferred += 1;
                return Ok(());
            }
            Disposition::Rejected { category, .. } | Disposition::CommittedDegraded { category, .. } => {
                category
            }
        };

        if !category.is_retryable() {
            return self.abandon_retry(entry, category, report).await;
        }

        let outcome = match self
            .inner
            .ledger
            .record_failure(episode_id, category, Utc::now())
            .await
        {
            Ok(outcome) => outcome,
            Err(Error::EpisodeNotFound(_)) => {
                debug!(episode_id = %episode_id, "Retry entry already settled");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match outcome {
            FailureOutcome::Rescheduled {
                attempt_count,
                next_retry_at,
            } => {
                debug!(
                    episode_id = %episode_id,
                    attempt = attempt_count,
                    next_retry_at = %next_retry_at,
                    "Retry failed, rescheduled"
                );
                report.rescheduled += 1;
            }
            FailureOutcome::Exhausted { attempt_count } => {
                report.exhausted += 1;
                let failure = PermanentFailure::from_entry(entry, attempt_count, category, Utc::now());
                self.notify(&failure).await;
            }
        }

        Ok(())
    }

    /// Drop an entry whose failure no retry can fix, reporting it like an
    /// exhausted one
    async fn abandon_retry(
        &self,
        entry: &RetryEntry,
        category: ErrorCategory,
        report: &mut DrainReport,
    ) -> Result<()> {
        let episode_id = entry.episode_id();
        if !self.inner.ledger.remove(episode_id).await? {
            debug!(episode_id = %episode_id, "Retry entry already settled");
            return Ok(());
        }

        warn!(episode_id = %episode_id, category = %category, "Retry failed permanently, not rescheduled");
        report.abandoned += 1;
        let failure = PermanentFailure::from_entry(entry, entry.attempt_count + 1, category, Utc::now());
        self.notify(&failure).await;
        Ok(())
    }

    async fn notify(&self, failure: &PermanentFailure) {
        for notifier in &self.inner.notifiers {
            if let Err(err) = notifier.permanent_failure(failure).await {
                warn!(episode_id = %failure.episode_id, error = %err, "Failed to deliver failure notification");
            }
        }
    }

    /// Start the health probe and retry drain loops. Calling it twice is a no-op.
    ///
    /// Both loops run once immediately. After [`shutdown`](Self::shutdown) the
    /// pipeline cannot be started again.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() || self.inner.cancel.is_cancelled() {
            return;
        }

        let config = &self.inner.config;
        tasks.push(self.inner.health.clone().spawn_probe(
            self.inner.provider.clone(),
            config.circuit.probe_interval(),
            self.inner.cancel.child_token(),
        ));

        let pipeline = self.clone();
        let interval = config.retry.drain_interval();
        let cancel = self.inner.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            pipeline.run_drain_loop(interval, cancel).await;
        }));

        info!(
            probe_interval_secs = config.circuit.probe_interval_secs,
            drain_interval_secs = config.retry.drain_interval_secs,
            policy = config.degradation.policy.as_str(),
            "Ingestion pipeline started"
        );
    }

    async fn run_drain_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.drain_retries_once().await {
                        error!(error = %err, "Retry drain failed");
                    }
                }
            }
        }

        debug!("Retry drain loop stopped");
    }

    /// Stop the background loops and wait for them to exit.
    /// Group workers finish their queued episodes on their own.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }

        info!("Ingestion pipeline stopped");
    }
}
