//! Represents a logical bucket — a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket in the S3-compatible namespace.
///
/// Bucket names are globally unique and DNS-safe. A bucket can only be
/// removed once it holds no objects.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Access key of the principal that created the bucket.
    pub owner: String,

    /// Region the bucket was created in (e.g. "us-east-1").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
