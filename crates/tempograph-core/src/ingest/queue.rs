//! Group ingestion queue
//!
//! One worker task per group with pending work. Within a group, episodes are
//! processed strictly in submission order and never overlap; different groups
//! run concurrently. A worker exits once its queue has stayed empty for the
//! idle grace period, and the next submission for that group spawns a new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::{Disposition, Episode, IngestionStatus};
use crate::error::Error;

use super::status::StatusTracker;

/// Whether an episode is being processed for the first time or re-driven
/// from the retry ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Initial,
    Retry { number: u32 },
}

/// Processes one episode to a terminal disposition
#[async_trait]
pub trait EpisodeProcessor: Send + Sync + 'static {
    async fn process(&self, episode: Episode, attempt: Attempt) -> Disposition;

    /// Disposition for an episode whose run was aborted by the per-episode timeout
    async fn timed_out(&self, _episode: &Episode, _attempt: Attempt, err: Error) -> Disposition {
        Disposition::rejected(&err)
    }
}

struct Job {
    episode: Episode,
    attempt: Attempt,
    reply: oneshot::Sender<Disposition>,
}

struct QueueShared {
    processor: Arc<dyn EpisodeProcessor>,
    status: Arc<StatusTracker>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    episode_timeout: Duration,
    idle_grace: Duration,
}

/// Per-group FIFO work queue
#[derive(Clone)]
pub struct GroupQueue {
    shared: Arc<QueueShared>,
}

impl GroupQueue {
    pub fn new(
        processor: Arc<dyn EpisodeProcessor>,
        status: Arc<StatusTracker>,
        episode_timeout: Duration,
        idle_grace: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                processor,
                status,
                workers: Mutex::new(HashMap::new()),
                episode_timeout,
                idle_grace,
            }),
        }
    }

    /// Append an episode to its group's queue, starting a worker if none is running.
    ///
    /// The returned receiver yields the terminal disposition; dropping it is fine.
    pub async fn submit(&self, episode: Episode, attempt: Attempt) -> oneshot::Receiver<Disposition> {
        let (reply, receiver) = oneshot::channel();
        let group_id = episode.group_id.clone();
        let job = Job {
            episode,
            attempt,
            reply,
        };

        let mut workers = self.shared.workers.lock().await;

        let job = match workers.get(&group_id) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return receiver,
                // Worker died without deregistering
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, jobs) = mpsc::unbounded_channel();
        workers.insert(group_id.clone(), sender);
        debug!(group_id = %group_id, "Starting group worker");
        tokio::spawn(run_worker(self.shared.clone(), group_id, job, jobs));

        receiver
    }

    /// Number of groups with a live worker
    pub async fn active_groups(&self) -> usize {
        self.shared.workers.lock().await.len()
    }
}

async fn run_worker(
    shared: Arc<QueueShared>,
    group_id: String,
    first: Job,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    shared.run_job(first).await;

    loop {
        match tokio::time::timeout(shared.idle_grace, jobs.recv()).await {
            Ok(Some(job)) => shared.run_job(job).await,
            Ok(None) => break,
            Err(_) => {
                // Deregister under the map lock so no submission can slip in
                // between the emptiness check and removal
                let mut workers = shared.workers.lock().await;
                match jobs.try_recv() {
                    Ok(job) => {
                        drop(workers);
                        shared.run_job(job).await;
                    }
                    Err(_) => {
                        workers.remove(&group_id);
                        break;
                    }
                }
            }
        }
    }

    debug!(group_id = %group_id, "Group worker idle, exiting");
}

impl QueueShared {
    async fn run_job(&self, job: Job) {
        let Job {
            episode,
            attempt,
            reply,
        } = job;
        let episode_id = episode.id;
        let group_id = episode.group_id.clone();

        let processor = self.processor.clone();
        let job_episode = episode.clone();
        let mut task = tokio::spawn(async move { processor.process(job_episode, attempt).await });

        let disposition = match tokio::time::timeout(self.episode_timeout, &mut task).await {
            Ok(Ok(disposition)) => disposition,
            Ok(Err(join_err)) => {
                error!(
                    episode_id = %episode_id,
                    group_id = %group_id,
                    error = %join_err,
                    "Episode processing panicked"
                );
                Disposition::rejected(&Error::Other(format!("episode processing panicked: {}", join_err)))
            }
            Err(_) => {
                task.abort();
                let _ = task.await;
                warn!(
                    episode_id = %episode_id,
                    group_id = %group_id,
                    timeout_ms = self.episode_timeout.as_millis() as u64,
                    "Episode timed out, continuing with next"
                );
                self.after_timeout(&episode, attempt).await
            }
        };

        self.status.record(episode_id, status_after(attempt, &disposition));
        let _ = reply.send(disposition);
    }

    async fn after_timeout(&self, episode: &Episode, attempt: Attempt) -> Disposition {
        let err = Error::EpisodeTimeout(self.episode_timeout);
        let fallback = Disposition::rejected(&err);
        tokio::time::timeout(
            self.episode_timeout,
            self.processor.timed_out(episode, attempt, err),
        )
        .await
        .unwrap_or(fallback)
    }
}

/// A failed retry leaves the earlier raw commit in place
fn status_after(attempt: Attempt, disposition: &Disposition) -> IngestionStatus {
    match (attempt, disposition) {
        (
            Attempt::Retry { .. },
            Disposition::Rejected {
                category,
                retry_after,
                ..
            },
        ) => IngestionStatus::CommittedDegraded {
            category: Some(*category),
            retry_after: *retry_after,
        },
        _ => IngestionStatus::from(disposition),
    }
}
