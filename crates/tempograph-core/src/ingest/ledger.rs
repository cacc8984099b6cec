//! Durable retry ledger
//!
//! Episodes that were committed raw wait here for full processing. Entries are
//! stored in SQLite so they survive restarts and are drained in
//! `next_retry_at` order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::domain::Episode;
use crate::error::{Error, ErrorCategory, Result};
use crate::storage::{format_timestamp, parse_timestamp};

/// An episode awaiting re-processing
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEntry {
    pub episode: Episode,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error_category: Option<ErrorCategory>,
    pub created_at: DateTime<Utc>,
}

impl RetryEntry {
    pub fn episode_id(&self) -> Uuid {
        self.episode.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Scheduled { next_retry_at: DateTime<Utc> },
    /// The episode already has an entry; its schedule is left untouched
    AlreadyQueued { next_retry_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        attempt_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts used up; the entry has been removed
    Exhausted { attempt_count: u32 },
}

/// A ledger row set aside because its payload could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedEntry {
    pub episode_id: String,
    pub group_id: String,
    pub attempt_count: u32,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

/// SQLite-backed retry ledger
#[derive(Debug, Clone)]
pub struct RetryLedger {
    pool: SqlitePool,
    schedule: Vec<Duration>,
    max_attempts: u32,
    max_size: usize,
}

impl RetryLedger {
    pub fn new(pool: SqlitePool, config: &RetryConfig) -> Self {
        let mut schedule = config.backoff_schedule();
        if schedule.is_empty() {
            schedule.push(Duration::from_secs(300));
        }

        Self {
            pool,
            schedule,
            max_attempts: config.max_attempts.max(1),
            max_size: config.max_ledger_size,
        }
    }

    /// Delay applied after `attempt_count` failed attempts
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let index = (attempt_count as usize).min(self.schedule.len() - 1);
        self.schedule[index]
    }

    /// Persist a new entry with `attempt_count = 0` due after the first delay.
    ///
    /// Fails with [`Error::LedgerFull`] when the ledger holds `max_ledger_size`
    /// entries; nothing is dropped silently.
    pub async fn enqueue(
        &self,
        episode: &Episode,
        category: Option<ErrorCategory>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let next_retry_at = now + chrono_duration(self.delay_for(0));
        let payload = serde_json::to_string(episode)?;
        let now_str = format_timestamp(&now);

        // Size check and insert in one statement
        let result = sqlx::query(
            r#"
            INSERT INTO retry_ledger (
                episode_id, group_id, payload, attempt_count, max_attempts,
                next_retry_at, last_error_category, created_at, updated_at
            )
            SELECT ?, ?, ?, 0, ?, ?, ?, ?, ?
            WHERE (SELECT COUNT(*) FROM retry_ledger) < ?
            ON CONFLICT(episode_id) DO NOTHING
            "#,
        )
        .bind(episode.id.to_string())
        .bind(&episode.group_id)
        .bind(&payload)
        .bind(self.max_attempts as i64)
        .bind(format_timestamp(&next_retry_at))
        .bind(category.map(|c| c.as_str()))
        .bind(&now_str)
        .bind(&now_str)
        .bind(self.max_size as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(
                episode_id = %episode.id,
                group_id = %episode.group_id,
                next_retry_at = %next_retry_at,
                "Episode scheduled for retry"
            );
            return Ok(EnqueueOutcome::Scheduled { next_retry_at });
        }

        if let Some(existing) = self.get(episode.id).await? {
            debug!(episode_id = %episode.id, "Episode already in retry ledger");
            return Ok(EnqueueOutcome::AlreadyQueued {
                next_retry_at: existing.next_retry_at,
            });
        }

        warn!(
            episode_id = %episode.id,
            max_size = self.max_size,
            "Retry ledger full, rejecting enqueue"
        );
        Err(Error::LedgerFull(self.max_size))
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Entries due at `now`, earliest first.
    ///
    /// Rows that no longer decode are moved to the quarantine table so the
    /// rest of the ledger keeps draining.
    pub async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<RetryEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT * FROM retry_ledger
            WHERE next_retry_at <= ?
            ORDER BY next_retry_at ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(format_timestamp(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row.to_entry() {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    if let Err(quarantine_err) = self.quarantine(&row, &err, now).await {
                        warn!(
                            episode_id = %row.episode_id,
                            error = %quarantine_err,
                            "Failed to quarantine retry entry, skipping it"
                        );
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn quarantine(&self, row: &LedgerRow, reason: &Error, now: DateTime<Utc>) -> Result<()> {
        error!(
            episode_id = %row.episode_id,
            group_id = %row.group_id,
            error = %reason,
            "Retry entry cannot be decoded, moving it to quarantine"
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO retry_ledger_quarantine (
                episode_id, group_id, payload, attempt_count, reason, quarantined_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.episode_id)
        .bind(&row.group_id)
        .bind(&row.payload)
        .bind(row.attempt_count)
        .bind(reason.to_string())
        .bind(format_timestamp(&now))
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM retry_ledger WHERE episode_id = ?")
            .bind(&row.episode_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Rows set aside by [`due`](Self::due), oldest first
    pub async fn quarantined(&self) -> Result<Vec<QuarantinedEntry>> {
        let rows: Vec<(String, String, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT episode_id, group_id, attempt_count, reason, quarantined_at
            FROM retry_ledger_quarantine
            ORDER BY quarantined_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(episode_id, group_id, attempt_count, reason, quarantined_at)| QuarantinedEntry {
                episode_id,
                group_id,
                attempt_count: attempt_count as u32,
                reason,
                quarantined_at: parse_timestamp(&quarantined_at).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    pub async fn get(&self, episode_id: Uuid) -> Result<Option<RetryEntry>> {
        let row: Option<LedgerRow> = sqlx::query_as("SELECT * FROM retry_ledger WHERE episode_id = ?")
            .bind(episode_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(LedgerRow::to_entry).transpose()
    }

    /// All decodable entries in due order
    pub async fn list(&self) -> Result<Vec<RetryEntry>> {
        let rows: Vec<LedgerRow> =
            sqlx::query_as("SELECT * FROM retry_ledger ORDER BY next_retry_at ASC, created_at ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match row.to_entry() {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(episode_id = %row.episode_id, error = %err, "Skipping undecodable retry entry");
                    None
                }
            })
            .collect())
    }

    /// Remove an entry after successful processing
    pub async fn remove(&self, episode_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM retry_ledger WHERE episode_id = ?")
            .bind(episode_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed attempt: reschedule along the backoff schedule, or
    /// remove the entry once `max_attempts` is reached.
    ///
    /// `next_retry_at` never moves backwards for an entry.
    pub async fn record_failure(
        &self,
        episode_id: Uuid,
        category: ErrorCategory,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT attempt_count, max_attempts, next_retry_at FROM retry_ledger WHERE episode_id = ?",
        )
        .bind(episode_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let (attempt_count, max_attempts, previous_next) =
            row.ok_or_else(|| Error::EpisodeNotFound(episode_id.to_string()))?;
        let attempt_count = attempt_count as u32 + 1;

        if attempt_count >= max_attempts as u32 {
            sqlx::query("DELETE FROM retry_ledger WHERE episode_id = ?")
                .bind(episode_id.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(FailureOutcome::Exhausted { attempt_count });
        }

        let scheduled = now + chrono_duration(self.delay_for(attempt_count));
        let next_retry_at = match parse_timestamp(&previous_next) {
            Some(previous) if previous > scheduled => previous,
            _ => scheduled,
        };

        sqlx::query(
            r#"
            UPDATE retry_ledger
            SET attempt_count = ?, next_retry_at = ?, last_error_category = ?, updated_at = ?
            WHERE episode_id = ?
            "#,
        )
        .bind(attempt_count as i64)
        .bind(format_timestamp(&next_retry_at))
        .bind(category.as_str())
        .bind(format_timestamp(&now))
        .bind(episode_id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(
            episode_id = %episode_id,
            attempt = attempt_count,
            next_retry_at = %next_retry_at,
            category = %category,
            "Retry rescheduled"
        );

        Ok(FailureOutcome::Rescheduled {
            attempt_count,
            next_retry_at,
        })
    }

    pub async fn len(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM retry_ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, FromRow)]
struct LedgerRow {
    episode_id: String,
    group_id: String,
    payload: String,
    attempt_count: i64,
    max_attempts: i64,
    next_retry_at: String,
    last_error_category: Option<String>,
    created_at: String,
}

impl LedgerRow {
    fn to_entry(&self) -> Result<RetryEntry> {
        let episode: Episode = serde_json::from_str(&self.payload)?;
        if episode.id.to_string() != self.episode_id {
            return Err(Error::Other(format!(
                "Retry ledger payload does not match episode {}",
                self.episode_id
            )));
        }

        Ok(RetryEntry {
            episode,
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            next_retry_at: parse_timestamp(&self.next_retry_at)
                .ok_or_else(|| Error::Other(format!("Invalid timestamp: {}", self.next_retry_at)))?,
            last_error_category: self.last_error_category.as_deref().and_then(ErrorCategory::parse),
            created_at: parse_timestamp(&self.created_at).unwrap_or_else(Utc::now),
        })
    }
}
