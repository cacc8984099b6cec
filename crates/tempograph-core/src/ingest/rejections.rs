//! Durable record of rejected episodes
//!
//! A rejected episode leaves nothing in the graph, so its disposition is kept
//! here to outlive the in-memory status cache and restarts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::{Episode, IngestionStatus};
use crate::error::{ErrorCategory, Result};
use crate::storage::format_timestamp;

#[derive(Debug, Clone)]
pub struct RejectionLog {
    pool: SqlitePool,
}

impl RejectionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the latest rejection of an episode
    pub async fn record(
        &self,
        episode: &Episode,
        category: ErrorCategory,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO episode_rejections (episode_id, group_id, category, retry_after_ms, rejected_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(episode_id) DO UPDATE SET
                category = excluded.category,
                retry_after_ms = excluded.retry_after_ms,
                rejected_at = excluded.rejected_at
            "#,
        )
        .bind(episode.id.to_string())
        .bind(&episode.group_id)
        .bind(category.as_str())
        .bind(retry_after.map(|d| d.as_millis() as i64))
        .bind(format_timestamp(&now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stored rejection status, if the episode was ever rejected
    pub async fn status(&self, episode_id: Uuid) -> Result<Option<IngestionStatus>> {
        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT category, retry_after_ms FROM episode_rejections WHERE episode_id = ?")
                .bind(episode_id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(category, retry_after_ms)| IngestionStatus::Rejected {
            category: ErrorCategory::parse(&category).unwrap_or(ErrorCategory::Internal),
            retry_after: retry_after_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewEpisode;
    use crate::storage::Database;

    fn episode() -> Episode {
        Episode::accept(NewEpisode::new("g1", "ep", "body", Utc::now()), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_rejection_round_trip_keeps_latest() {
        let db = Database::in_memory().await.unwrap();
        let log = RejectionLog::new(db.pool().clone());
        let ep = episode();

        assert_eq!(log.status(ep.id).await.unwrap(), None);

        log.record(&ep, ErrorCategory::ProviderNetwork, None, Utc::now())
            .await
            .unwrap();
        log.record(
            &ep,
            ErrorCategory::CircuitOpen,
            Some(Duration::from_secs(60)),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(
            log.status(ep.id).await.unwrap(),
            Some(IngestionStatus::Rejected {
                category: ErrorCategory::CircuitOpen,
                retry_after: Some(Duration::from_secs(60)),
            })
        );
    }
}
