//! Degradation controller
//!
//! Turns provider availability and the configured policy into an explicit
//! processing mode for each episode.

use std::sync::Arc;
use std::time::Duration;

use crate::config::DegradationPolicy;
use tracing::warn;

use crate::error::{Error, ErrorCategory};

use super::health::{Availability, HealthMonitor};

/// How to store an episode without derived data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegradedMode {
    /// Whether to hand the episode to the retry ledger after the raw commit
    pub schedule_retry: bool,
    pub category: ErrorCategory,
    pub retry_after: Option<Duration>,
}

/// Processing mode chosen for one episode
#[derive(Debug)]
pub enum ProcessingMode {
    Full,
    Degraded(DegradedMode),
    Rejected(Error),
}

#[derive(Debug, Clone)]
pub struct DegradationController {
    health: Arc<HealthMonitor>,
    policy: DegradationPolicy,
}

impl DegradationController {
    pub fn new(health: Arc<HealthMonitor>, policy: DegradationPolicy) -> Self {
        Self { health, policy }
    }

    pub fn policy(&self) -> DegradationPolicy {
        self.policy
    }

    /// Mode for an episode about to be processed
    pub fn decide(&self) -> ProcessingMode {
        match self.health.availability() {
            Availability::Available | Availability::Probing => ProcessingMode::Full,
            Availability::Unavailable { retry_after } => {
                match self.on_provider_failure(Error::CircuitOpen { retry_after }) {
                    Ok(degraded) => ProcessingMode::Degraded(degraded),
                    Err(err) => ProcessingMode::Rejected(err),
                }
            }
        }
    }

    /// Fallback once full processing has failed on the provider side.
    /// `Err` carries the error to reject the episode with.
    ///
    /// Unrecoverable failures (auth, quota) are stored raw but never scheduled.
    pub fn on_provider_failure(&self, err: Error) -> Result<DegradedMode, Error> {
        let schedule_retry = match self.policy {
            DegradationPolicy::Fail => return Err(err),
            DegradationPolicy::StoreRawOnly => false,
            DegradationPolicy::StoreRawAndRetry => err.is_recoverable(),
        };
        if !schedule_retry && self.policy == DegradationPolicy::StoreRawAndRetry {
            warn!(
                category = %err.category(),
                "Provider failure needs operator action, episode will not be retried"
            );
        }

        Ok(DegradedMode {
            schedule_retry,
            category: err.category(),
            retry_after: err.retry_after(),
        })
    }
}
