//! Embedding records produced by the enrichment pipeline.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, str::FromStr};

/// Lifecycle of a single enrichment attempt for one object version.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Complete => "complete",
            EmbeddingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmbeddingStatus::Pending),
            "processing" => Ok(EmbeddingStatus::Processing),
            "complete" => Ok(EmbeddingStatus::Complete),
            "failed" => Ok(EmbeddingStatus::Failed),
            other => Err(format!("unknown embedding status `{}`", other)),
        }
    }
}

/// The embedding state for one (bucket, key).
///
/// A record is superseded, never merged, when its source object is
/// overwritten: `etag` and `version` always describe the newest write seen.
#[derive(Serialize, Clone, Debug)]
pub struct EmbeddingRecord {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub version: i64,
    pub status: EmbeddingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    pub dimensions: Option<i64>,
    pub model: Option<String>,
    pub attempts: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A similarity match returned by a vector query.
#[derive(Serialize, Clone, Debug)]
pub struct VectorMatch {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub score: f32,
}
