//! Represents an object (blob) stored in a bucket.

use crate::models::metadata::UserMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Content type recorded when a client does not send one.
pub const DEFAULT_CONTENT_TYPE: &str = "binary/octet-stream";

/// Metadata describing a single object within a bucket.
///
/// The body lives on disk; this struct only carries what is needed to serve
/// HEAD, listing and conditional logic.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing. Stable across overwrites of the same key.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (opaque, "/"-delimited by convention only).
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the body.
    pub etag: String,

    /// Storage class (always STANDARD for now).
    pub storage_class: String,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,

    /// Monotonic per-key write counter, used to order enrichment results.
    pub version: i64,

    /// User metadata. Loaded separately from `object_metadata`.
    #[sqlx(skip)]
    #[serde(default)]
    pub metadata: UserMetadata,
}

impl Object {
    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}
