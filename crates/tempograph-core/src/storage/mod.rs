//! Storage layer - SQLite
//!
//! Provides database management and migrations for tempograph.
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use tempograph_core::storage::Database;
//!
//! // Create an in-memory database for testing
//! let db = Database::in_memory().await?;
//! ```

pub mod database;
pub mod migrations;

use chrono::{DateTime, SecondsFormat, Utc};

pub use database::{Database, DatabaseConfig};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};

/// Format a timestamp for storage.
///
/// Fixed precision and a `Z` suffix keep lexical order equal to time order,
/// which the `next_retry_at` and `received_at` range queries rely on.
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Encode an embedding as little-endian f32 bytes
pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_timestamp_order_is_lexical() {
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
        let late = early + Duration::milliseconds(1500);
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(parse_timestamp(&format_timestamp(&late)), Some(late));
    }

    #[test]
    fn test_embedding_bytes() {
        let vector = vec![0.25_f32, -1.5, 3.0];
        let bytes = encode_embedding(&vector);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_embedding(&bytes), vector);
    }
}
