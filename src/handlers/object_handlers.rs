//! HTTP handlers for object operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`. Successful writes of textual objects are
//! handed to the enrichment dispatcher after the store has committed.

use crate::{
    errors::AppError,
    models::{
        metadata::{USER_METADATA_PREFIX, UserMetadata},
        object::Object,
    },
    services::{enrichment::EnrichmentJob, storage_service::StorageError},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tracing::debug;

/// Content types that are worth embedding.
pub const TEXT_CONTENT_TYPES: [&str; 7] = [
    "text/plain",
    "text/markdown",
    "text/html",
    "text/csv",
    "text/xml",
    "application/json",
    "application/xml",
];

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Whether an object of this content type is eligible for enrichment.
///
/// Parameters such as `; charset=utf-8` are ignored, as is case.
pub fn is_text_content(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    TEXT_CONTENT_TYPES.contains(&essence.as_str())
}

/// Collect `x-amz-meta-*` request headers into a metadata map.
pub fn user_metadata_from_headers(headers: &HeaderMap) -> Result<UserMetadata, AppError> {
    let mut metadata = UserMetadata::new();
    for (name, value) in headers {
        // Header names are already lower-case.
        let Some(meta_key) = name.as_str().strip_prefix(USER_METADATA_PREFIX) else {
            continue;
        };
        let value = value.to_str().map_err(|_| {
            AppError::bad_request(
                "InvalidArgument",
                format!("metadata `{}` must be printable ASCII", meta_key),
            )
        })?;
        metadata.insert(meta_key.to_string(), value.to_string());
    }
    Ok(metadata)
}

fn object_resource(bucket: &str, key: &str) -> impl FnOnce(StorageError) -> AppError {
    let resource = format!("/{}/{}", bucket, key);
    move |err| AppError::from(err).with_resource(resource)
}

/// Upload an object to `/{bucket}/{*key}`.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let metadata = user_metadata_from_headers(&headers)
        .map_err(|err| err.with_resource(format!("/{}/{}", bucket, key)))?;

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let object = state
        .storage
        .upload_object_stream(&bucket, &key, content_type, metadata, stream)
        .await
        .map_err(object_resource(&bucket, &key))?;

    // The write has committed; enrichment can no longer affect this response.
    if is_text_content(object.content_type_or_default()) {
        state.enrichment.submit(EnrichmentJob {
            bucket: bucket.clone(),
            key: key.clone(),
            etag: object.etag.clone(),
            version: object.version,
        });
    } else {
        debug!(bucket = %bucket, key = %key, content_type = object.content_type_or_default(), "not eligible for enrichment");
        state.enrichment.forget(&bucket, &key, object.version);
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// Download an object `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (meta, stream) = state
        .storage
        .get_object_reader(&bucket, &key)
        .await
        .map_err(object_resource(&bucket, &key))?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let meta = state
        .storage
        .get_object_metadata(&bucket, &key)
        .await
        .map_err(object_resource(&bucket, &key))?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// DELETE `/{bucket}/{*key}`; 204 whether or not the key existed.
pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    if let Some(removed) = state
        .storage
        .delete_object(&bucket, &key)
        .await
        .map_err(object_resource(&bucket, &key))?
    {
        state.enrichment.forget(&bucket, &key, removed.version);
    }
    Ok(StatusCode::NO_CONTENT)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta.content_type_or_default();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("binary/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes.max(0)));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.format(HTTP_DATE).to_string()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    for (meta_key, value) in &meta.metadata {
        let name = HeaderName::from_bytes(format!("{}{}", USER_METADATA_PREFIX, meta_key).as_bytes());
        if let (Ok(name), Ok(value)) = (name, HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_eligibility_ignores_parameters_and_case() {
        assert!(is_text_content("text/plain"));
        assert!(is_text_content("Text/Markdown; charset=UTF-8"));
        assert!(is_text_content("application/json"));
        assert!(!is_text_content("image/png"));
        assert!(!is_text_content("binary/octet-stream"));
        assert!(!is_text_content("text/plainish"));
        assert!(!is_text_content(""));
    }

    #[test]
    fn metadata_headers_are_collected_without_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-meta-author", HeaderValue::from_static("ada"));
        headers.insert("x-amz-meta-project", HeaderValue::from_static("engine"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let metadata = user_metadata_from_headers(&headers).unwrap();
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["author"], "ada");
        assert_eq!(metadata["project"], "engine");
    }

    #[test]
    fn non_ascii_metadata_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amz-meta-name",
            HeaderValue::from_bytes(&[0xc3, 0xa9]).unwrap(),
        );
        let err = user_metadata_from_headers(&headers).unwrap_err();
        assert_eq!(err.code, "InvalidArgument");
    }
}
