use crate::{handlers::xml, services::storage_service::StorageError};
use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// How an error body is rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    /// S3 `<Error>` document.
    Xml,
    /// `{"error": ..., "status": ...}` for the JSON API.
    Json,
}

/// The single translation point from internal failures to HTTP responses.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// S3 error code, e.g. `NoSuchBucket`.
    pub code: &'static str,
    pub message: String,
    pub resource: Option<String>,
    pub format: ErrorFormat,
}

impl AppError {
    /// Create a new AppError with a specific status, code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            resource: None,
            format: ErrorFormat::Xml,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
    }

    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, msg)
    }

    pub fn not_found(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, msg)
    }

    pub fn unauthorized(code: &'static str, msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, msg)
    }

    pub fn malformed_xml(msg: impl Into<String>) -> Self {
        Self::bad_request("MalformedXML", msg)
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn into_json(mut self) -> Self {
        self.format = ErrorFormat::Json;
        self
    }

    /// Render with the format a request path expects.
    pub fn for_path(self, path: &str) -> Self {
        if path.starts_with("/api/") {
            self.into_json()
        } else {
            self.with_resource(path)
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.format {
            ErrorFormat::Json => {
                let body = Json(json!({
                    "error": self.message,
                    "code": self.code,
                    "status": self.status.as_u16()
                }));
                (self.status, body).into_response()
            }
            ErrorFormat::Xml => {
                let body = xml::error_xml(self.code, &self.message, self.resource.as_deref());
                (self.status, [(header::CONTENT_TYPE, "application/xml")], body).into_response()
            }
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err {
            StorageError::BucketNotFound(_) => Self::not_found("NoSuchBucket", message),
            StorageError::ObjectNotFound { .. } => Self::not_found("NoSuchKey", message),
            StorageError::BucketAlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "BucketAlreadyExists", message)
            }
            StorageError::BucketNotEmpty(_) => {
                Self::new(StatusCode::CONFLICT, "BucketNotEmpty", message)
            }
            StorageError::InvalidBucketName { .. } => {
                Self::bad_request("InvalidBucketName", message)
            }
            StorageError::UnsupportedRegion(_) => {
                Self::bad_request("InvalidLocationConstraint", message)
            }
            StorageError::InvalidObjectKey
            | StorageError::InvalidMetadata(_)
            | StorageError::InvalidContinuationToken => {
                Self::bad_request("InvalidArgument", message)
            }
            StorageError::TooManyKeys { .. } => Self::malformed_xml(message),
            StorageError::ObjectTooLarge { .. } => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, "EntityTooLarge", message)
            }
            StorageError::Sqlx(_) | StorageError::Io(_) => {
                // Backend details stay in the log.
                error!(error = %message, "storage backend failure");
                Self::internal("We encountered an internal error. Please try again.")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "internal failure");
        AppError::internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Sqlx(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_s3_codes() {
        let cases = [
            (StorageError::BucketNotFound("b".into()), 404, "NoSuchBucket"),
            (
                StorageError::ObjectNotFound {
                    bucket: "b".into(),
                    key: "k".into(),
                },
                404,
                "NoSuchKey",
            ),
            (StorageError::BucketAlreadyExists("b".into()), 409, "BucketAlreadyExists"),
            (StorageError::BucketNotEmpty("b".into()), 409, "BucketNotEmpty"),
            (StorageError::InvalidMetadata("x".into()), 400, "InvalidArgument"),
            (StorageError::TooManyKeys { count: 2, max: 1 }, 400, "MalformedXML"),
            (
                StorageError::Io(std::io::Error::other("disk gone")),
                500,
                "InternalError",
            ),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status.as_u16(), status);
            assert_eq!(app.code, code);
        }
    }

    #[test]
    fn internal_details_are_not_leaked() {
        let app: AppError = StorageError::Io(std::io::Error::other("/secret/path")).into();
        assert!(!app.message.contains("/secret/path"));
    }

    #[test]
    fn api_paths_render_json() {
        let err = AppError::not_found("NoSuchKey", "gone").for_path("/api/v1/vectors/search");
        assert_eq!(err.format, ErrorFormat::Json);
        let err = AppError::not_found("NoSuchKey", "gone").for_path("/bucket/key");
        assert_eq!(err.format, ErrorFormat::Xml);
        assert_eq!(err.resource.as_deref(), Some("/bucket/key"));
    }
}
