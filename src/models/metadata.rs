//! User-defined metadata attached to objects (`x-amz-meta-*`).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header prefix carrying user metadata on the wire.
pub const USER_METADATA_PREFIX: &str = "x-amz-meta-";

/// Most entries a single object may carry.
pub const MAX_METADATA_ENTRIES: usize = 10;
pub const MAX_METADATA_KEY_LEN: usize = 128;
pub const MAX_METADATA_VALUE_LEN: usize = 256;

/// User metadata map. Keys are stored lower-cased, without the header prefix.
pub type UserMetadata = BTreeMap<String, String>;

/// A single metadata row as stored in `object_metadata`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    /// The object this entry belongs to.
    pub object_id: Uuid,

    /// Metadata key without the `x-amz-meta-` prefix (e.g. "author").
    pub key: String,

    /// Metadata value as plain text.
    pub value: String,
}
