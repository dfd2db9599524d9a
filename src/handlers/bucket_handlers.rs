//! HTTP handlers for the service root and bucket-level operations.

use crate::{
    errors::AppError,
    handlers::xml::{
        self, DeleteEntry, ListRequestEcho, delete_error_code, parse_delete_request,
        parse_location_constraint,
    },
    middleware::auth::Principal,
    services::listing::ListObjectsParams,
    state::AppState,
};
use axum::{
    Extension,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::info;

/// Region used when a CreateBucket request names none.
const DEFAULT_REGION: &str = "local";

/// Query params accepted by ListObjectsV2.
#[derive(Debug, Deserialize)]
pub struct ListObjectsV2Query {
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
}

fn xml_response(status: StatusCode, body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}

/// GET `/`: list all buckets.
pub async fn list_buckets(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Response, AppError> {
    let buckets = state.storage.list_buckets().await?;
    Ok(xml_response(
        StatusCode::OK,
        xml::list_buckets_xml(&principal.access_key, &buckets),
    ))
}

/// PUT `/{bucket}`: create bucket, optionally with a LocationConstraint body.
pub async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Extension(principal): Extension<Principal>,
    body: Bytes,
) -> Result<Response, AppError> {
    let resource = format!("/{}", bucket);
    let region = parse_location_constraint(&body)
        .map_err(|err| AppError::malformed_xml(err.to_string()).with_resource(&resource))?
        .unwrap_or_else(|| DEFAULT_REGION.into());

    state
        .storage
        .create_bucket(&bucket, &region, &principal.access_key)
        .await
        .map_err(|err| AppError::from(err).with_resource(&resource))?;

    let mut response = xml_response(StatusCode::OK, xml::create_bucket_xml(&bucket));
    if let Ok(location) = HeaderValue::from_str(&resource) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// HEAD `/{bucket}`: 200 if the bucket exists.
pub async fn head_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<Response, AppError> {
    let found = state
        .storage
        .fetch_bucket(&bucket)
        .await
        .map_err(|err| AppError::from(err).with_resource(format!("/{}", bucket)))?;
    let mut response = Response::new(Body::empty());
    if let Ok(region) = HeaderValue::from_str(&found.region) {
        response.headers_mut().insert("x-amz-bucket-region", region);
    }
    Ok(response)
}

/// DELETE `/{bucket}`: delete an empty bucket.
pub async fn delete_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state
        .storage
        .delete_bucket(&bucket)
        .await
        .map_err(|err| AppError::from(err).with_resource(format!("/{}", bucket)))?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/{bucket}`: ListObjectsV2, supports ?prefix=&delimiter=&max-keys=
/// &continuation-token=&start-after=
pub async fn list_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(q): Query<ListObjectsV2Query>,
) -> Result<Response, AppError> {
    let resource = format!("/{}", bucket);
    if !matches!(q.list_type, None | Some(2)) {
        return Err(
            AppError::bad_request("InvalidArgument", "Only list-type=2 is supported")
                .with_resource(resource),
        );
    }

    let params = ListObjectsParams {
        prefix: q.prefix.clone(),
        delimiter: q.delimiter.clone(),
        continuation_token: q.continuation_token.clone(),
        start_after: q.start_after.clone(),
        max_keys: q.max_keys.unwrap_or(1000),
    };

    let result = state
        .storage
        .list_objects_v2(&bucket, params)
        .await
        .map_err(|err| AppError::from(err).with_resource(&resource))?;
    let echo = ListRequestEcho {
        bucket: &bucket,
        prefix: q.prefix.as_deref(),
        delimiter: q.delimiter.as_deref(),
        continuation_token: q.continuation_token.as_deref(),
        start_after: q.start_after.as_deref(),
    };
    Ok(xml_response(
        StatusCode::OK,
        xml::list_objects_v2_xml(&echo, &result),
    ))
}

/// POST `/{bucket}?delete`: DeleteObjects with per-key results.
pub async fn delete_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response, AppError> {
    let resource = format!("/{}", bucket);
    if !params.contains_key("delete") {
        return Err(AppError::bad_request(
            "InvalidRequest",
            "POST on a bucket requires the ?delete subresource",
        )
        .with_resource(resource));
    }

    let request = parse_delete_request(&body)
        .map_err(|err| AppError::malformed_xml(err.to_string()).with_resource(&resource))?;
    let outcomes = state
        .storage
        .delete_objects(&bucket, request.keys)
        .await
        .map_err(|err| AppError::from(err).with_resource(&resource))?;

    let mut entries = Vec::with_capacity(outcomes.len());
    for outcome in &outcomes {
        match &outcome.result {
            Ok(removed) => {
                if let Some(object) = removed {
                    state.enrichment.forget(&bucket, &outcome.key, object.version);
                }
                entries.push(DeleteEntry::Deleted { key: &outcome.key });
            }
            Err(err) => entries.push(DeleteEntry::Failed {
                key: &outcome.key,
                code: delete_error_code(err),
                message: err.to_string(),
            }),
        }
    }

    info!(bucket = %bucket, keys = outcomes.len(), quiet = request.quiet, "delete objects");
    Ok(xml_response(
        StatusCode::OK,
        xml::delete_result_xml(&entries, request.quiet),
    ))
}
