//! Listing engine: ordered, paginated ListObjectsV2 views over a bucket.
//!
//! Keys are returned in ascending byte order. Continuation tokens are the
//! base64 of the last key consumed by a page, so resuming is a simple
//! `key > token` range scan and a full sweep over a static namespace never
//! skips or repeats a key.

use crate::{
    models::object::Object,
    services::storage_service::{
        OBJECT_COLUMNS, StorageError, StorageResult, StorageService,
    },
};
use base64::{Engine as _, engine::general_purpose};
use sqlx::{QueryBuilder, sqlite::Sqlite};
use uuid::Uuid;

pub const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Clone, Debug)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    /// Opaque token from a previous page, passed back verbatim.
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

impl Default for ListObjectsParams {
    fn default() -> Self {
        Self {
            prefix: None,
            delimiter: None,
            continuation_token: None,
            start_after: None,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<Object>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
    /// Effective page size after clamping.
    pub max_keys: usize,
}

impl StorageService {
    /// List objects following S3 ListObjectsV2 rules.
    ///
    /// Supports prefix filtering, delimiter grouping into common prefixes,
    /// continuation tokens and `start-after`. A common prefix counts as one
    /// entry towards `max_keys` and is never repeated on a later page.
    pub async fn list_objects_v2(
        &self,
        bucket: &str,
        params: ListObjectsParams,
    ) -> StorageResult<ListObjectsResult> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let max_keys = params.max_keys.clamp(1, DEFAULT_MAX_KEYS);
        let batch = max_keys + 1;
        let prefix = params.prefix.as_deref().filter(|p| !p.is_empty());
        let delimiter = params.delimiter.as_deref().filter(|d| !d.is_empty());

        let mut cursor = match &params.continuation_token {
            Some(token) => Some(decode_continuation_token(token)?),
            None => params.start_after.clone(),
        };
        // A page that ended inside a rolled-up prefix must not emit it again.
        let mut last_prefix = match (&params.continuation_token, &cursor, delimiter) {
            (Some(_), Some(key), Some(delim)) => compute_common_prefix(key, prefix, delim),
            _ => None,
        };

        let mut objects = Vec::new();
        let mut common_prefixes = Vec::new();
        let mut is_truncated = false;

        'scan: loop {
            let rows = self
                .fetch_key_range(bucket_rec.id, prefix, cursor.as_deref(), batch)
                .await?;
            let exhausted = rows.len() < batch;

            for obj in rows {
                if let Some(p) = prefix {
                    if !obj.key.starts_with(p) {
                        // Sorted scan has left the prefix range.
                        break 'scan;
                    }
                }

                let group = delimiter.and_then(|d| compute_common_prefix(&obj.key, prefix, d));
                let folds_into_last = group.is_some() && group == last_prefix;
                let entries = objects.len() + common_prefixes.len();
                if !folds_into_last && entries >= max_keys {
                    is_truncated = true;
                    break 'scan;
                }

                cursor = Some(obj.key.clone());
                match group {
                    Some(_) if folds_into_last => {}
                    Some(p) => {
                        common_prefixes.push(p.clone());
                        last_prefix = Some(p);
                    }
                    None => objects.push(obj),
                }
            }

            if exhausted {
                break;
            }
        }

        let next_continuation_token = if is_truncated {
            cursor.as_deref().map(encode_continuation_token)
        } else {
            None
        };

        Ok(ListObjectsResult {
            key_count: objects.len() + common_prefixes.len(),
            objects,
            common_prefixes,
            is_truncated,
            next_continuation_token,
            max_keys,
        })
    }

    /// One ordered batch of keys at or after `prefix` and strictly after
    /// `cursor`.
    async fn fetch_key_range(
        &self,
        bucket_id: Uuid,
        prefix: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Object>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket_id = "
        ));
        builder.push_bind(bucket_id);

        // Range comparisons instead of LIKE: LIKE is case-insensitive in
        // SQLite and treats `%`/`_` in keys as wildcards.
        if let Some(prefix) = prefix {
            builder.push(" AND key >= ");
            builder.push_bind(prefix.to_string());
        }
        if let Some(cursor) = cursor {
            builder.push(" AND key > ");
            builder.push_bind(cursor.to_string());
        }

        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(limit as i64);

        Ok(builder.build_query_as().fetch_all(&*self.db).await?)
    }
}

pub fn encode_continuation_token(key: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(key)
}

pub fn decode_continuation_token(token: &str) -> StorageResult<String> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(StorageError::InvalidContinuationToken)
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Used only when a delimiter is provided. Returns Some(prefix) if the key
/// belongs to a grouped prefix, otherwise None.
pub(crate) fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = match requested_prefix {
        Some(prefix) => key.strip_prefix(prefix)?,
        None => key,
    };

    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::new();
    if let Some(prefix) = requested_prefix {
        combined.push_str(prefix);
    }
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}
