//! Bucket namespace: creation, deletion, lookup and listing of buckets.
//!
//! Deletion is a precondition check, never a cascade: the emptiness test and
//! the row removal happen in one SQL statement.

use crate::{
    models::bucket::Bucket,
    services::storage_service::{StorageError, StorageResult, StorageService, is_unique_violation},
};
use chrono::Utc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

impl StorageService {
    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    pub(crate) fn ensure_bucket_name_safe(&self, name: &str) -> StorageResult<()> {
        let invalid = |reason: &str| StorageError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.into(),
        };

        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    /// Validate region string against SUPPORTED_REGIONS (case-insensitive).
    fn ensure_region_valid(&self, region: &str) -> StorageResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StorageError::UnsupportedRegion(region.to_string()))
        }
    }

    /// Fetch bucket metadata from SQLite.
    ///
    /// Validates the name first; returns BucketNotFound if missing.
    pub async fn fetch_bucket(&self, bucket: &str) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, owner, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Create a bucket and initialize its directory.
    ///
    /// Returns BucketAlreadyExists if the name is taken.
    pub async fn create_bucket(
        &self,
        name: &str,
        region: &str,
        owner: &str,
    ) -> StorageResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let region = region.to_lowercase();
        self.ensure_region_valid(&region)?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner: owner.to_string(),
            region,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner, region, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(&bucket.owner)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StorageError::BucketAlreadyExists(name.to_string()));
            }
            Err(err) => return Err(StorageError::Sqlx(err)),
        }

        fs::create_dir_all(self.bucket_root(name)).await?;
        info!(bucket = name, region = %bucket.region, "bucket created");
        Ok(bucket)
    }

    /// Delete an empty bucket.
    ///
    /// Returns BucketNotEmpty while any object remains and BucketNotFound if
    /// the bucket does not exist. The on-disk directory is removed
    /// best-effort afterwards.
    pub async fn delete_bucket(&self, name: &str) -> StorageResult<()> {
        self.ensure_bucket_name_safe(name)?;
        let result = sqlx::query(
            "DELETE FROM buckets WHERE name = ?
             AND NOT EXISTS (SELECT 1 FROM objects WHERE objects.bucket_id = buckets.id)",
        )
        .bind(name)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Either missing or still holding objects.
            self.fetch_bucket(name).await?;
            return Err(StorageError::BucketNotEmpty(name.to_string()));
        }

        let bucket_path = self.bucket_root(name);
        if let Err(err) = fs::remove_dir_all(&bucket_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    "failed to remove bucket directory {} after delete: {}",
                    bucket_path.display(),
                    err
                );
            }
        }

        info!(bucket = name, "bucket deleted");
        Ok(())
    }

    /// All buckets, oldest first.
    pub async fn list_buckets(&self) -> StorageResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(
            "SELECT id, name, owner, region, created_at FROM buckets ORDER BY created_at, name",
        )
        .fetch_all(&*self.db)
        .await?;
        Ok(buckets)
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::metadata::UserMetadata,
        services::test_support::{body_stream, test_storage},
    };

    #[tokio::test]
    async fn created_bucket_is_listed_exactly_once() {
        let (storage, _dir) = test_storage().await;
        storage.create_bucket("alpha", "us-east-1", "tester").await.unwrap();
        storage.create_bucket("beta", "local", "tester").await.unwrap();

        let buckets = storage.list_buckets().await.unwrap();
        assert_eq!(buckets.iter().filter(|b| b.name == "alpha").count(), 1);
        assert_eq!(buckets.len(), 2);
        assert!(storage.bucket_root("alpha").is_dir());
    }

    #[tokio::test]
    async fn duplicate_bucket_is_rejected() {
        let (storage, _dir) = test_storage().await;
        storage.create_bucket("dupe", "local", "tester").await.unwrap();
        let err = storage.create_bucket("dupe", "local", "other").await.unwrap_err();
        assert!(matches!(err, StorageError::BucketAlreadyExists(name) if name == "dupe"));
    }

    #[tokio::test]
    async fn unsupported_region_is_rejected() {
        let (storage, _dir) = test_storage().await;
        assert!(matches!(
            storage.create_bucket("regional", "mars-north-1", "tester").await,
            Err(StorageError::UnsupportedRegion(_))
        ));
        assert!(storage.create_bucket("regional", "US-EAST-1", "tester").await.is_ok());
    }

    #[tokio::test]
    async fn non_empty_bucket_cannot_be_deleted_until_emptied() {
        let (storage, _dir) = test_storage().await;
        storage.create_bucket("full", "local", "tester").await.unwrap();
        storage
            .upload_object_stream(
                "full",
                "data/a",
                None,
                UserMetadata::new(),
                body_stream(b"payload".to_vec(), 4),
            )
            .await
            .unwrap();

        assert!(matches!(
            storage.delete_bucket("full").await,
            Err(StorageError::BucketNotEmpty(_))
        ));

        storage.delete_object("full", "data/a").await.unwrap();
        storage.delete_bucket("full").await.unwrap();
        assert!(storage.list_buckets().await.unwrap().is_empty());
        assert!(!storage.bucket_root("full").exists());
    }

    #[tokio::test]
    async fn deleting_missing_bucket_is_not_found() {
        let (storage, _dir) = test_storage().await;
        assert!(matches!(
            storage.delete_bucket("missing").await,
            Err(StorageError::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn bucket_name_rules() {
        let (storage, _dir) = test_storage().await;
        for good in ["abc", "my-bucket", "logs.2025", "a1b2c3"] {
            assert!(storage.ensure_bucket_name_safe(good).is_ok(), "{good}");
        }
        for bad in [
            "ab",
            "UPPER",
            "-lead",
            "trail.",
            "dou..ble",
            "dot-.hyphen",
            "192.168.1.10",
            "under_score",
            &"x".repeat(64),
        ] {
            assert!(storage.ensure_bucket_name_safe(bad).is_err(), "{bad}");
        }
    }
}
