//! Notifications for episodes that exhausted their retries

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::{Error, ErrorCategory, Result};

use super::ledger::RetryEntry;

/// An episode that stays raw because every retry attempt failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermanentFailure {
    pub episode_id: Uuid,
    pub group_id: String,
    pub episode_name: String,
    pub attempts: u32,
    pub last_error_category: ErrorCategory,
    pub first_queued_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl PermanentFailure {
    pub fn from_entry(
        entry: &RetryEntry,
        attempts: u32,
        category: ErrorCategory,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            episode_id: entry.episode.id,
            group_id: entry.episode.group_id.clone(),
            episode_name: entry.episode.name.clone(),
            attempts,
            last_error_category: category,
            first_queued_at: entry.created_at,
            failed_at,
        }
    }
}

/// Receiver of permanent-failure notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn permanent_failure(&self, failure: &PermanentFailure) -> Result<()>;
}

/// Writes permanent failures to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn permanent_failure(&self, failure: &PermanentFailure) -> Result<()> {
        error!(
            episode_id = %failure.episode_id,
            group_id = %failure.group_id,
            attempts = failure.attempts,
            category = %failure.last_error_category,
            "Episode permanently failed full processing; it remains stored raw"
        );
        Ok(())
    }
}

/// POSTs permanent failures as JSON to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http_client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build webhook client: {}", e)))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn permanent_failure(&self, failure: &PermanentFailure) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .json(failure)
            .send()
            .await
            .map_err(|e| Error::Other(format!("Webhook delivery failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(format!("Webhook returned {}", status)));
        }

        debug!(episode_id = %failure.episode_id, "Permanent failure delivered to webhook");
        Ok(())
    }
}
