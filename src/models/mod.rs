//! Core data models for the object store and its enrichment pipeline.
//!
//! Buckets and objects map onto SQLite rows via `sqlx::FromRow`; embedding
//! records are decoded by hand because their vectors live in a BLOB column.

pub mod bucket;
pub mod embedding;
pub mod metadata;
pub mod object;
