//! Vector index: embedding records keyed by (bucket, key).
//!
//! Every record carries the object `version` it describes. All transitions
//! after `mark_pending` are guarded on that version, so work for an
//! overwritten object can never clobber the record of its successor.

use crate::models::embedding::{EmbeddingRecord, EmbeddingStatus, VectorMatch};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::{cmp::Ordering, str::FromStr, sync::Arc};

pub const DEFAULT_TOP_K: usize = 10;
pub const MAX_TOP_K: usize = 100;

const RECORD_COLUMNS: &str = "bucket, key, etag, version, status, vector, dimensions, model, \
     attempts, error, created_at, updated_at";
/// Same shape, vector left out.
const SUMMARY_COLUMNS: &str = "bucket, key, etag, version, status, NULL AS vector, dimensions, \
     model, attempts, error, created_at, updated_at";

pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const MAX_LIST_LIMIT: usize = 100;

/// Which records [`VectorIndex::list`] returns. Unset fields match anything.
#[derive(Debug, Default, Clone)]
pub struct RecordFilter {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub status: Option<EmbeddingStatus>,
    /// Only keys sorting after this (bucket, key) pair.
    pub start_after: Option<(String, String)>,
}

/// Number of records in each status.
#[derive(Serialize, Default, Debug, Clone, PartialEq, Eq)]
pub struct IndexCounts {
    pub pending: i64,
    pub processing: i64,
    pub complete: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct VectorIndex {
    db: Arc<SqlitePool>,
}

impl VectorIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Start a fresh record for an object version, replacing whatever was
    /// there for an older (or the same) version.
    ///
    /// Returns false when a newer version already owns the record.
    pub async fn mark_pending(
        &self,
        bucket: &str,
        key: &str,
        etag: &str,
        version: i64,
    ) -> sqlx::Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO embeddings (
                bucket, key, etag, version, status, attempts, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                etag = excluded.etag,
                version = excluded.version,
                status = 'pending',
                vector = NULL,
                dimensions = NULL,
                model = NULL,
                attempts = 0,
                error = NULL,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            WHERE excluded.version >= embeddings.version
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(etag)
        .bind(version)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the record for a worker attempt and bump its attempt counter.
    pub async fn mark_processing(&self, bucket: &str, key: &str, version: i64) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE embeddings SET status = 'processing', attempts = attempts + 1, updated_at = ?
             WHERE bucket = ? AND key = ? AND version = ?",
        )
        .bind(Utc::now())
        .bind(bucket)
        .bind(key)
        .bind(version)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Put a record back to pending between attempts, keeping the last error.
    pub async fn mark_retrying(
        &self,
        bucket: &str,
        key: &str,
        version: i64,
        error: &str,
    ) -> sqlx::Result<bool> {
        self.set_status(bucket, key, version, EmbeddingStatus::Pending, Some(error))
            .await
    }

    pub async fn mark_failed(
        &self,
        bucket: &str,
        key: &str,
        version: i64,
        error: &str,
    ) -> sqlx::Result<bool> {
        self.set_status(bucket, key, version, EmbeddingStatus::Failed, Some(error))
            .await
    }

    async fn set_status(
        &self,
        bucket: &str,
        key: &str,
        version: i64,
        status: EmbeddingStatus,
        error: Option<&str>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE embeddings SET status = ?, error = ?, updated_at = ?
             WHERE bucket = ? AND key = ? AND version = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(bucket)
        .bind(key)
        .bind(version)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store the vector for an object version. Replaces any prior vector for
    /// the key; returns false if the record now belongs to another version.
    pub async fn store(
        &self,
        bucket: &str,
        key: &str,
        version: i64,
        vector: &[f32],
        model: &str,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE embeddings
             SET status = 'complete', vector = ?, dimensions = ?, model = ?, error = NULL,
                 updated_at = ?
             WHERE bucket = ? AND key = ? AND version = ?",
        )
        .bind(encode_vector(vector))
        .bind(vector.len() as i64)
        .bind(model)
        .bind(Utc::now())
        .bind(bucket)
        .bind(key)
        .bind(version)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, bucket: &str, key: &str) -> sqlx::Result<Option<EmbeddingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM embeddings WHERE bucket = ? AND key = ?"
        ))
        .bind(bucket)
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        row.map(|row| record_from_row(&row)).transpose()
    }

    /// Records matching `filter` ordered by bucket then key, without their
    /// vectors. Returns at most `limit` records plus whether more remain.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
    ) -> sqlx::Result<(Vec<EmbeddingRecord>, bool)> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let (after_bucket, after_key) = match &filter.start_after {
            Some((bucket, key)) => (Some(bucket.as_str()), Some(key.as_str())),
            None => (None, None),
        };
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM embeddings
             WHERE (?1 IS NULL OR bucket = ?1)
               AND (?2 IS NULL OR substr(key, 1, length(?2)) = ?2)
               AND (?3 IS NULL OR status = ?3)
               AND (?4 IS NULL OR bucket > ?4 OR (bucket = ?4 AND key > ?5))
             ORDER BY bucket, key
             LIMIT ?6"
        ))
        .bind(filter.bucket.as_deref())
        .bind(filter.prefix.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(after_bucket)
        .bind(after_key)
        .bind(limit as i64 + 1)
        .fetch_all(&*self.db)
        .await?;

        let truncated = rows.len() > limit;
        let records = rows
            .iter()
            .take(limit)
            .map(record_from_row)
            .collect::<sqlx::Result<Vec<_>>>()?;
        Ok((records, truncated))
    }

    /// Remove the record unless a write newer than `up_to_version` has
    /// already replaced it.
    pub async fn delete(&self, bucket: &str, key: &str, up_to_version: i64) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM embeddings WHERE bucket = ? AND key = ? AND version <= ?",
        )
        .bind(bucket)
        .bind(key)
        .bind(up_to_version)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn counts(&self) -> sqlx::Result<IndexCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM embeddings GROUP BY status")
            .fetch_all(&*self.db)
            .await?;
        let mut counts = IndexCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match EmbeddingStatus::from_str(&status) {
                Ok(EmbeddingStatus::Pending) => counts.pending = n,
                Ok(EmbeddingStatus::Processing) => counts.processing = n,
                Ok(EmbeddingStatus::Complete) => counts.complete = n,
                Ok(EmbeddingStatus::Failed) => counts.failed = n,
                Err(_) => {}
            }
        }
        Ok(counts)
    }

    /// Nearest complete records to `vector` by cosine similarity, best first.
    ///
    /// Exact scan. Records whose dimensions differ from the query are
    /// skipped.
    pub async fn query(&self, vector: &[f32], top_k: Option<usize>) -> sqlx::Result<Vec<VectorMatch>> {
        let top_k = top_k.unwrap_or(DEFAULT_TOP_K).clamp(1, MAX_TOP_K);
        if vector.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT bucket, key, etag, vector FROM embeddings
             WHERE status = 'complete' AND dimensions = ?",
        )
        .bind(vector.len() as i64)
        .fetch_all(&*self.db)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("vector")?;
            let Some(candidate) = decode_vector(&blob) else {
                continue;
            };
            if candidate.len() != vector.len() {
                continue;
            }
            matches.push(VectorMatch {
                bucket: row.try_get("bucket")?,
                key: row.try_get("key")?,
                etag: row.try_get("etag")?,
                score: cosine_similarity(vector, &candidate),
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.bucket.cmp(&b.bucket))
                .then_with(|| a.key.cmp(&b.key))
        });
        matches.truncate(top_k);
        Ok(matches)
    }
}

fn record_from_row(row: &SqliteRow) -> sqlx::Result<EmbeddingRecord> {
    let status: String = row.try_get("status")?;
    let status = EmbeddingStatus::from_str(&status).map_err(|err| sqlx::Error::ColumnDecode {
        index: "status".into(),
        source: err.into(),
    })?;
    let vector: Option<Vec<u8>> = row.try_get("vector")?;
    Ok(EmbeddingRecord {
        bucket: row.try_get("bucket")?,
        key: row.try_get("key")?,
        etag: row.try_get("etag")?,
        version: row.try_get("version")?,
        status,
        vector: vector.as_deref().and_then(decode_vector),
        dimensions: row.try_get("dimensions")?,
        model: row.try_get("model")?,
        attempts: row.try_get("attempts")?,
        error: row.try_get("error")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

/// f32 values, little-endian, back to back.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

/// Cosine similarity in [-1, 1]; 0.0 when either vector has no magnitude.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let mut dot: f32 = 0.0;
    let mut norm_a: f32 = 0.0;
    let mut norm_b: f32 = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    // Clamp to [-1, 1] to handle floating-point drift.
    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::test_storage;

    async fn index() -> (VectorIndex, tempfile::TempDir) {
        let (storage, dir) = test_storage().await;
        (VectorIndex::new(storage.db.clone()), dir)
    }

    #[tokio::test]
    async fn lifecycle_pending_processing_complete() {
        let (index, _dir) = index().await;
        assert!(index.mark_pending("b", "doc", "e1", 1).await.unwrap());
        assert!(index.mark_processing("b", "doc", 1).await.unwrap());
        assert!(index.store("b", "doc", 1, &[0.6, 0.8], "hash-2").await.unwrap());

        let record = index.get("b", "doc").await.unwrap().unwrap();
        assert_eq!(record.status, EmbeddingStatus::Complete);
        assert_eq!(record.vector, Some(vec![0.6, 0.8]));
        assert_eq!(record.dimensions, Some(2));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.model.as_deref(), Some("hash-2"));
    }

    #[tokio::test]
    async fn newer_version_supersedes_older_work() {
        let (index, _dir) = index().await;
        index.mark_pending("b", "doc", "old", 1).await.unwrap();
        index.mark_processing("b", "doc", 1).await.unwrap();
        index.mark_pending("b", "doc", "new", 2).await.unwrap();

        // The stale worker finishes late and must not win.
        assert!(!index.store("b", "doc", 1, &[1.0, 0.0], "m").await.unwrap());
        assert!(!index.mark_pending("b", "doc", "old", 1).await.unwrap());

        let record = index.get("b", "doc").await.unwrap().unwrap();
        assert_eq!(record.etag, "new");
        assert_eq!(record.status, EmbeddingStatus::Pending);
        assert!(record.vector.is_none());
    }

    #[tokio::test]
    async fn delete_respects_newer_writes() {
        let (index, _dir) = index().await;
        index.mark_pending("b", "doc", "e2", 5).await.unwrap();
        assert!(!index.delete("b", "doc", 4).await.unwrap());
        assert!(index.delete("b", "doc", 5).await.unwrap());
        assert!(index.get("b", "doc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_ranks_by_cosine_and_skips_other_dimensions() {
        let (index, _dir) = index().await;
        for (key, vector) in [
            ("east", vec![1.0, 0.0]),
            ("north", vec![0.0, 1.0]),
            ("north-east", vec![0.7, 0.7]),
        ] {
            index.mark_pending("geo", key, "e", 1).await.unwrap();
            index.store("geo", key, 1, &vector, "m").await.unwrap();
        }
        index.mark_pending("geo", "three-d", "e", 1).await.unwrap();
        index.store("geo", "three-d", 1, &[1.0, 0.0, 0.0], "m").await.unwrap();
        index.mark_pending("geo", "unfinished", "e", 1).await.unwrap();

        let hits = index.query(&[1.0, 0.1], Some(2)).await.unwrap();
        let keys: Vec<_> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["east", "north-east"]);
        assert!(hits[0].score >= hits[1].score);

        let all = index.query(&[1.0, 0.1], Some(1000)).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn counts_group_by_status() {
        let (index, _dir) = index().await;
        index.mark_pending("b", "a", "e", 1).await.unwrap();
        index.mark_pending("b", "b", "e", 1).await.unwrap();
        index.mark_failed("b", "b", 1, "boom").await.unwrap();
        let counts = index.counts().await.unwrap();
        assert_eq!(
            counts,
            IndexCounts {
                pending: 1,
                processing: 0,
                complete: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn list_filters_and_pages_without_vectors() {
        let (index, _dir) = index().await;
        for (bucket, key) in [
            ("alpha", "notes/a"),
            ("alpha", "notes/b"),
            ("alpha", "other"),
            ("beta", "notes/c"),
        ] {
            index.mark_pending(bucket, key, "e", 1).await.unwrap();
            index.store(bucket, key, 1, &[1.0, 0.0], "m").await.unwrap();
        }
        index.mark_failed("alpha", "notes/b", 1, "boom").await.unwrap();

        let (all, truncated) = index.list(&RecordFilter::default(), None).await.unwrap();
        assert!(!truncated);
        let keys: Vec<_> = all.iter().map(|r| (r.bucket.as_str(), r.key.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                ("alpha", "notes/a"),
                ("alpha", "notes/b"),
                ("alpha", "other"),
                ("beta", "notes/c")
            ]
        );
        assert!(all.iter().all(|r| r.vector.is_none()));
        assert_eq!(all[0].dimensions, Some(2));

        let filter = RecordFilter {
            bucket: Some("alpha".into()),
            prefix: Some("notes/".into()),
            ..Default::default()
        };
        let (page, truncated) = index.list(&filter, Some(1)).await.unwrap();
        assert!(truncated);
        assert_eq!(page[0].key, "notes/a");

        let next = RecordFilter {
            start_after: Some(("alpha".into(), "notes/a".into())),
            ..filter
        };
        let (page, truncated) = index.list(&next, Some(1)).await.unwrap();
        assert!(!truncated);
        assert_eq!(page[0].key, "notes/b");

        let failed = RecordFilter {
            status: Some(EmbeddingStatus::Failed),
            ..Default::default()
        };
        let (records, _) = index.list(&failed, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn blob_encoding_is_little_endian_f32() {
        let blob = encode_vector(&[1.0, -2.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_vector(&blob), Some(vec![1.0, -2.5]));
        assert_eq!(decode_vector(&[0, 1, 2]), None);
    }
}
