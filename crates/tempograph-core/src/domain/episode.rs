//! Episodes and their ingestion outcomes

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorCategory, Result};
use crate::storage::format_timestamp;

/// Namespace for content-derived episode ids
const EPISODE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_94b3_4d0a_8e55_1b2c_3d4e_5f60);

/// Kind of content carried by an episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Conversational turn(s), e.g. `user: ...`
    Message,
    /// Free-form prose
    #[default]
    Text,
    /// Structured JSON document
    Json,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An episode as submitted by a caller, before it is accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEpisode {
    pub group_id: String,
    pub name: String,
    pub body: String,
    pub source_kind: SourceKind,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
}

impl NewEpisode {
    pub fn new(
        group_id: impl Into<String>,
        name: impl Into<String>,
        body: impl Into<String>,
        reference_time: DateTime<Utc>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            name: name.into(),
            body: body.into(),
            source_kind: SourceKind::default(),
            source_description: String::new(),
            reference_time,
        }
    }

    pub fn with_source(mut self, kind: SourceKind, description: impl Into<String>) -> Self {
        self.source_kind = kind;
        self.source_description = description.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(Error::InvalidInput("group_id must not be empty".into()));
        }
        if self.body.trim().is_empty() {
            return Err(Error::InvalidInput("episode body must not be empty".into()));
        }
        Ok(())
    }

    /// Deterministic id: the same payload always maps to the same episode
    pub fn derive_id(&self) -> Uuid {
        let key = [
            self.group_id.as_str(),
            self.name.as_str(),
            self.body.as_str(),
            self.source_kind.as_str(),
            &format_timestamp(&self.reference_time),
        ]
        .join("\u{1f}");
        Uuid::new_v5(&EPISODE_NAMESPACE, key.as_bytes())
    }
}

/// An accepted episode. Immutable from here on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub group_id: String,
    pub name: String,
    pub body: String,
    pub source_kind: SourceKind,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl Episode {
    /// Accept a submission, validating it and assigning its id
    pub fn accept(new: NewEpisode, received_at: DateTime<Utc>) -> Result<Self> {
        new.validate()?;
        let id = new.derive_id();
        Ok(Self {
            id,
            group_id: new.group_id,
            name: new.name,
            body: new.body,
            source_kind: new.source_kind,
            source_description: new.source_description,
            reference_time: new.reference_time,
            received_at,
        })
    }
}

/// Terminal outcome of processing one episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// Episode, entities, facts and embeddings committed
    CommittedFull { entities: usize, facts: usize },
    /// Raw episode committed without derived data
    CommittedDegraded {
        category: ErrorCategory,
        retry_after: Option<Duration>,
        retry_scheduled: bool,
    },
    /// Nothing was committed
    Rejected {
        category: ErrorCategory,
        retry_after: Option<Duration>,
        message: String,
    },
}

impl Disposition {
    pub fn rejected(err: &Error) -> Self {
        Self::Rejected {
            category: err.category(),
            retry_after: err.retry_after(),
            message: err.to_string(),
        }
    }

    pub fn is_committed(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::CommittedFull { .. })
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::CommittedFull { .. } => None,
            Self::CommittedDegraded { category, .. } | Self::Rejected { category, .. } => {
                Some(*category)
            }
        }
    }
}

/// Observable state of an episode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    CommittedFull,
    CommittedDegraded {
        category: Option<ErrorCategory>,
        retry_after: Option<Duration>,
    },
    Rejected {
        category: ErrorCategory,
        retry_after: Option<Duration>,
    },
}

impl IngestionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl From<&Disposition> for IngestionStatus {
    fn from(disposition: &Disposition) -> Self {
        match disposition {
            Disposition::CommittedFull { .. } => Self::CommittedFull,
            Disposition::CommittedDegraded {
                category,
                retry_after,
                ..
            } => Self::CommittedDegraded {
                category: Some(*category),
                retry_after: *retry_after,
            },
            Disposition::Rejected {
                category,
                retry_after,
                ..
            } => Self::Rejected {
                category: *category,
                retry_after: *retry_after,
            },
        }
    }
}
