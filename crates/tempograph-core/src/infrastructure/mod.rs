//! Infrastructure layer
//!
//! Concrete implementations of the storage driver traits.

pub mod graph;
