//! src/services/storage_service.rs
//!
//! StorageService — core S3-like operations backed by SQLite for metadata
//! and local disk for object payloads. Payloads are sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{digest}-{version}` where `digest` is
//! the MD5 of `bucket/key`, so arbitrary keys never become filesystem paths.
//! Every write lands in a fresh file; the row decides which one is live.
//!
//! Bucket lifecycle lives in `buckets.rs` and listing in `listing.rs`; both are
//! further `impl StorageService` blocks over the same state.

use crate::models::{
    bucket::Bucket,
    metadata::{
        MAX_METADATA_ENTRIES, MAX_METADATA_KEY_LEN, MAX_METADATA_VALUE_LEN, ObjectMetadata,
        UserMetadata,
    },
    object::{DEFAULT_CONTENT_TYPE, Object},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, future::join_all, pin_mut};
use md5::Context;
use sqlx::{Row, SqlitePool};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::{Mutex, MutexGuard},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("invalid continuation token")]
    InvalidContinuationToken,
    #[error("too many keys in one request: {count} (max {max})")]
    TooManyKeys { count: usize, max: usize },
    #[error("object is {size} bytes, limit is {limit}")]
    ObjectTooLarge { size: u64, limit: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Failures caused by the backend rather than by the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, StorageError::Sqlx(_) | StorageError::Io(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Lazily produced, forward-only body of a stored object.
pub type ObjectBody = ReaderStream<File>;

/// Outcome of one key within a batch delete.
#[derive(Debug)]
pub struct DeleteOutcome {
    pub key: String,
    /// `Ok(Some(obj))` when an object was removed, `Ok(None)` when the key was
    /// already absent.
    pub result: StorageResult<Option<Object>>,
}

/// Totals across all buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageUsage {
    pub buckets: i64,
    pub objects: i64,
    pub bytes: i64,
}

/// StorageService provides the S3-like object operations:
/// - Upload an object (streams bytes to disk, upserts metadata in SQLite)
/// - Get object / head object
/// - Delete one object or a batch
///
/// Writes, reads and deletes of the same key are serialized through a set of
/// striped locks; different keys proceed independently.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    locks: Arc<[Mutex<()>]>,
}

pub(crate) const MAX_OBJECT_KEY_LEN: usize = 1024;
pub const MAX_DELETE_KEYS: usize = 1000;
const LOCK_STRIPES: usize = 256;
const READ_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) const OBJECT_COLUMNS: &str = "id, bucket_id, key, content_type, size_bytes, etag, \
     storage_class, last_modified, version";

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        let locks: Vec<Mutex<()>> = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            db,
            base_path: base_path.into(),
            locks: locks.into(),
        }
    }

    /// Keys are opaque: only empty or oversized keys and keys carrying
    /// control characters are rejected. Payload paths are derived from a
    /// digest, so no key can reach outside the bucket directory.
    pub(crate) fn ensure_key_valid(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.chars().any(char::is_control) {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    fn ensure_metadata_valid(metadata: &UserMetadata) -> StorageResult<()> {
        if metadata.len() > MAX_METADATA_ENTRIES {
            return Err(StorageError::InvalidMetadata(format!(
                "too many metadata entries (max {})",
                MAX_METADATA_ENTRIES
            )));
        }
        for (key, value) in metadata {
            if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
                return Err(StorageError::InvalidMetadata(format!(
                    "metadata key `{}` must be 1 to {} bytes",
                    key, MAX_METADATA_KEY_LEN
                )));
            }
            if value.len() > MAX_METADATA_VALUE_LEN {
                return Err(StorageError::InvalidMetadata(format!(
                    "metadata value for `{}` exceeds {} bytes",
                    key, MAX_METADATA_VALUE_LEN
                )));
            }
        }
        Ok(())
    }

    /// Compute the physical base folder path for a bucket.
    pub(crate) fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Payload location for one version of an object.
    ///
    /// Uses MD5(bucket/key): the first two bytes pick the shard directories
    /// (00-ff each) and the full hex digest plus the version names the file.
    fn object_path(&self, bucket_name: &str, key: &str, version: i64) -> PathBuf {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        let mut path = self.bucket_root(bucket_name);
        path.push(format!("{:02x}", digest[0]));
        path.push(format!("{:02x}", digest[1]));
        path.push(format!("{:x}-{}", digest, version));
        path
    }

    /// Serialize access to one (bucket, key).
    async fn lock_key(&self, bucket_name: &str, key: &str) -> MutexGuard<'_, ()> {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        let stripe = digest[0] as usize % self.locks.len();
        self.locks[stripe].lock().await
    }

    /// Fetch a non-deleted object metadata record, without user metadata.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StorageResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket_id = ? AND key = ?"
        ))
        .bind(bucket.id)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    async fn load_user_metadata(&self, object: &mut Object) -> StorageResult<()> {
        let rows = sqlx::query_as::<_, ObjectMetadata>(
            "SELECT object_id, key, value FROM object_metadata WHERE object_id = ? ORDER BY key",
        )
        .bind(object.id)
        .fetch_all(&*self.db)
        .await?;
        object.metadata = rows.into_iter().map(|row| (row.key, row.value)).collect();
        Ok(())
    }

    /// Stream-upload an object to disk and update metadata.
    ///
    /// - Writes bytes incrementally to a temporary file.
    /// - Computes MD5/etag and size while streaming.
    /// - Renames it to a path of its own, named after the new version.
    /// - Upserts the object row and replaces its user metadata in one
    ///   transaction (S3-like overwrite semantics).
    /// - Unlinks the previous version's payload only after the commit.
    ///
    /// Until the commit the previous row and payload stay untouched, so a
    /// failed write leaves the old object fully readable. Everything after
    /// spooling runs under the key's lock.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: UserMetadata,
        stream: S,
    ) -> StorageResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_valid(key)?;
        Self::ensure_metadata_valid(&metadata)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let shard_dir = self
            .object_path(&bucket_rec.name, key, 0)
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                StorageError::Io(io::Error::new(
                    ErrorKind::Other,
                    "object path missing parent directory",
                ))
            })?;
        fs::create_dir_all(&shard_dir).await?;
        let tmp_path = shard_dir.join(format!(".tmp-{}", Uuid::new_v4()));

        // The body is spooled before taking the lock; a slow client only
        // holds its own temp file.
        let (size_bytes, etag) = match spool_to_file(&tmp_path, stream).await {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        let _guard = self.lock_key(&bucket_rec.name, key).await;

        let previous = match sqlx::query_scalar::<_, i64>(
            "SELECT version FROM objects WHERE bucket_id = ? AND key = ?",
        )
        .bind(bucket_rec.id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await
        {
            Ok(previous) => previous,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let last_modified = Utc::now();
        let version = match previous {
            Some(prev) => last_modified.timestamp_micros().max(prev + 1),
            None => last_modified.timestamp_micros(),
        };
        let file_path = self.object_path(&bucket_rec.name, key, version);
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let row = NewObjectRow {
            bucket: &bucket_rec,
            key,
            content_type: &content_type,
            size_bytes,
            etag: &etag,
            last_modified,
            version,
        };
        let mut object = match self.commit_object_row(&row, &metadata).await {
            Ok(object) => object,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                if is_foreign_key_violation(&err) {
                    // Bucket was deleted while the body was being spooled.
                    return Err(StorageError::BucketNotFound(bucket_rec.name));
                }
                return Err(StorageError::Sqlx(err));
            }
        };

        if let Some(prev) = previous {
            let stale = self.object_path(&bucket_rec.name, key, prev);
            match fs::remove_file(&stale).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %stale.display(), error = %err, "failed to remove replaced payload")
                }
            }
        }

        object.metadata = metadata;
        debug!(
            bucket = %bucket_rec.name,
            key,
            size = object.size_bytes,
            etag = %object.etag,
            version = object.version,
            "stored object"
        );
        Ok(object)
    }

    /// Upsert the object row and its user metadata in one transaction.
    async fn commit_object_row(
        &self,
        row: &NewObjectRow<'_>,
        metadata: &UserMetadata,
    ) -> Result<Object, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        let object = sqlx::query_as::<_, Object>(&format!(
            r#"
            INSERT INTO objects (
                id, bucket_id, key, content_type, size_bytes,
                etag, storage_class, last_modified, version
            ) VALUES (?, ?, ?, ?, ?, ?, 'STANDARD', ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                storage_class = excluded.storage_class,
                last_modified = excluded.last_modified,
                version = excluded.version
            RETURNING {OBJECT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(row.bucket.id)
        .bind(row.key)
        .bind(row.content_type)
        .bind(row.size_bytes)
        .bind(row.etag)
        .bind(row.last_modified)
        .bind(row.version)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object.id)
            .execute(&mut *tx)
            .await?;
        for (meta_key, value) in metadata {
            sqlx::query("INSERT INTO object_metadata (object_id, key, value) VALUES (?, ?, ?)")
                .bind(object.id)
                .bind(meta_key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(object)
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and the body as a chunked stream. The file handle is
    /// opened under the key lock, so a concurrent overwrite or delete cannot
    /// tear the pair apart.
    pub async fn get_object_reader(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<(Object, ObjectBody)> {
        self.ensure_key_valid(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let (object, file) = {
            let _guard = self.lock_key(&bucket_rec.name, key).await;
            let object = self.fetch_object(&bucket_rec, key).await?;
            let file_path = self.object_path(&bucket_rec.name, key, object.version);
            let file = File::open(&file_path).await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::ObjectNotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::Io(err)
                }
            })?;
            let mut object = object;
            self.load_user_metadata(&mut object).await?;
            (object, file)
        };

        Ok((object, ReaderStream::with_capacity(file, READ_CHUNK_SIZE)))
    }

    /// Bucket count, object count and total payload bytes.
    pub async fn usage(&self) -> StorageResult<StorageUsage> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM buckets) AS buckets,
                    (SELECT COUNT(*) FROM objects) AS objects,
                    (SELECT COALESCE(SUM(size_bytes), 0) FROM objects) AS bytes",
        )
        .fetch_one(&*self.db)
        .await?;
        Ok(StorageUsage {
            buckets: row.try_get("buckets")?,
            objects: row.try_get("objects")?,
            bytes: row.try_get("bytes")?,
        })
    }

    /// Fetch only object metadata.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> StorageResult<Object> {
        self.ensure_key_valid(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let mut object = self.fetch_object(&bucket_rec, key).await?;
        self.load_user_metadata(&mut object).await?;
        Ok(object)
    }

    /// Read a whole object into memory, refusing bodies over `limit` bytes.
    pub async fn read_object_bytes(
        &self,
        bucket: &str,
        key: &str,
        limit: u64,
    ) -> StorageResult<(Object, Vec<u8>)> {
        let (object, mut body) = self.get_object_reader(bucket, key).await?;
        let size = object.size_bytes.max(0) as u64;
        if size > limit {
            return Err(StorageError::ObjectTooLarge { size, limit });
        }
        let mut buf = Vec::with_capacity(size as usize);
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            if buf.len() as u64 > limit {
                return Err(StorageError::ObjectTooLarge {
                    size: buf.len() as u64,
                    limit,
                });
            }
        }
        Ok((object, buf))
    }

    /// Delete an object and its payload.
    ///
    /// Idempotent: deleting an absent key returns `Ok(None)`. The bucket must
    /// exist. Empty shard directories are pruned afterwards.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<Option<Object>> {
        self.ensure_key_valid(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.delete_object_in(&bucket_rec, key).await
    }

    async fn delete_object_in(&self, bucket: &Bucket, key: &str) -> StorageResult<Option<Object>> {
        self.ensure_key_valid(key)?;
        let _guard = self.lock_key(&bucket.name, key).await;

        let deleted = sqlx::query_as::<_, Object>(&format!(
            "DELETE FROM objects WHERE bucket_id = ? AND key = ? RETURNING {OBJECT_COLUMNS}"
        ))
        .bind(bucket.id)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;

        let Some(object) = deleted else {
            debug!(bucket = %bucket.name, key, "delete of absent key");
            return Ok(None);
        };

        let file_path = self.object_path(&bucket.name, key, object.version);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }

        Ok(Some(object))
    }

    /// Delete many keys from one bucket.
    ///
    /// Each key is attempted independently and concurrently; the result holds
    /// one outcome per requested key, in request order.
    pub async fn delete_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> StorageResult<Vec<DeleteOutcome>> {
        if keys.len() > MAX_DELETE_KEYS {
            return Err(StorageError::TooManyKeys {
                count: keys.len(),
                max: MAX_DELETE_KEYS,
            });
        }
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let outcomes = join_all(keys.into_iter().map(|key| {
            let bucket_rec = &bucket_rec;
            async move {
                let result = self.delete_object_in(bucket_rec, &key).await;
                DeleteOutcome { key, result }
            }
        }))
        .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        info!(
            bucket = %bucket_rec.name,
            requested = outcomes.len(),
            failed,
            "batch delete finished"
        );
        Ok(outcomes)
    }

    /// Recursively remove empty directories up to bucket root.
    ///
    /// Stops when the directory is not empty, is missing, is the root, or an
    /// unexpected I/O error occurs.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Values of one object write, as committed to the `objects` table.
struct NewObjectRow<'a> {
    bucket: &'a Bucket,
    key: &'a str,
    content_type: &'a str,
    size_bytes: i64,
    etag: &'a str,
    last_modified: chrono::DateTime<Utc>,
    version: i64,
}

/// Write a body stream into `path`, returning its size and hex MD5.
///
/// The file is flushed and fsynced before returning.
async fn spool_to_file<S>(path: &Path, stream: S) -> io::Result<(i64, String)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let mut file = File::create(path).await?;
    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((size_bytes, format!("{:x}", digest.compute())))
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation())
}
