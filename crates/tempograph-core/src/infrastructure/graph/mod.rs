//! Graph store implementations
//!
//! SQLite-backed implementation of the [`GraphStore`](crate::domain::GraphStore)
//! and [`GraphTransaction`](crate::domain::GraphTransaction) traits.

mod sqlite;

pub use sqlite::{SqliteGraphStore, SqliteGraphTransaction};
