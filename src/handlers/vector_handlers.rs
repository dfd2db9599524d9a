//! JSON API over the vector index.
//!
//! - POST   /api/v1/vectors/search                     -> nearest objects to a raw vector
//! - POST   /api/v1/vectors/search/text                -> nearest objects to a text query
//! - GET    /api/v1/vectors/embeddings                 -> page through embedding records
//! - GET    /api/v1/vectors/embeddings/{bucket}/{*key} -> embedding record for one object
//! - DELETE /api/v1/vectors/embeddings/{bucket}/{*key} -> drop one embedding record
//! - GET    /api/v1/indexing/jobs?bucket=&key=         -> enrichment state of one object
//! - GET    /api/v1/indexing/stats                     -> dispatcher and index counters
//! - GET    /api/v1/indexing/health                    -> are the workers alive

use crate::{
    errors::AppError,
    models::embedding::{EmbeddingRecord, EmbeddingStatus, VectorMatch},
    services::{
        enrichment::DispatcherStats,
        vector_index::{IndexCounts, RecordFilter},
    },
    state::AppState,
    telemetry,
};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct VectorSearchRequest {
    pub vector: Vec<f32>,
    pub top_k: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TextSearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<VectorMatch>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingQuery {
    #[serde(default)]
    pub include_vector: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListEmbeddingsQuery {
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    /// `bucket/key` of the last record of the previous page.
    pub start_after: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListEmbeddingsResponse {
    pub embeddings: Vec<EmbeddingRecord>,
    pub count: usize,
    pub is_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_start_after: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectJobsQuery {
    pub bucket: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ObjectJobsResponse {
    pub bucket: String,
    pub key: String,
    pub jobs: Vec<EmbeddingRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct IndexingStats {
    pub model: String,
    pub dimensions: usize,
    pub dispatcher: DispatcherStats,
    pub records: IndexCounts,
}

fn invalid(msg: impl Into<String>) -> AppError {
    AppError::bad_request("InvalidRequest", msg).into_json()
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| invalid(rejection.body_text()))
}

fn no_such_embedding(bucket: &str, key: &str) -> AppError {
    AppError::not_found(
        "NoSuchEmbedding",
        format!("no embedding for `{}` in bucket `{}`", key, bucket),
    )
    .into_json()
}

async fn search(
    state: &AppState,
    kind: &'static str,
    vector: &[f32],
    top_k: Option<usize>,
) -> Result<Json<SearchResponse>, AppError> {
    let results = state
        .index
        .query(vector, top_k)
        .await
        .map_err(|err| AppError::from(err).into_json())?;
    telemetry::record_search(kind, results.len());
    Ok(Json(SearchResponse {
        count: results.len(),
        results,
    }))
}

/// `POST /api/v1/vectors/search`
pub async fn search_by_vector(
    State(state): State<AppState>,
    payload: Result<Json<VectorSearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let request = json_body(payload)?;
    if request.vector.is_empty() {
        return Err(invalid("vector must not be empty"));
    }
    if request.vector.iter().any(|v| !v.is_finite()) {
        return Err(invalid("vector components must be finite"));
    }
    search(&state, "vector", &request.vector, request.top_k).await
}

/// `POST /api/v1/vectors/search/text`
///
/// Embeds the query with the same provider the workers use.
pub async fn search_by_text(
    State(state): State<AppState>,
    payload: Result<Json<TextSearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let request = json_body(payload)?;
    if !request.query.chars().any(char::is_alphanumeric) {
        return Err(invalid("query must contain a letter or digit"));
    }
    let vector = state.embedder.embed(&request.query).await.map_err(|err| {
        warn!(error = %format!("{err:#}"), "query embedding failed");
        AppError::new(
            StatusCode::BAD_GATEWAY,
            "EmbeddingUnavailable",
            "embedding backend unavailable",
        )
        .into_json()
    })?;
    search(&state, "text", &vector, request.top_k).await
}

/// `GET /api/v1/vectors/embeddings/{bucket}/{*key}`
pub async fn get_embedding(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<EmbeddingQuery>,
) -> Result<Json<EmbeddingRecord>, AppError> {
    let mut record = state
        .index
        .get(&bucket, &key)
        .await
        .map_err(|err| AppError::from(err).into_json())?
        .ok_or_else(|| no_such_embedding(&bucket, &key))?;
    if !query.include_vector {
        record.vector = None;
    }
    Ok(Json(record))
}

/// `GET /api/v1/vectors/embeddings`
pub async fn list_embeddings(
    State(state): State<AppState>,
    Query(query): Query<ListEmbeddingsQuery>,
) -> Result<Json<ListEmbeddingsResponse>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(EmbeddingStatus::from_str)
        .transpose()
        .map_err(invalid)?;
    let start_after = query
        .start_after
        .as_deref()
        .map(|cursor| {
            cursor
                .split_once('/')
                .map(|(bucket, key)| (bucket.to_string(), key.to_string()))
                .ok_or_else(|| invalid("start_after must be `bucket/key`"))
        })
        .transpose()?;
    let filter = RecordFilter {
        bucket: query.bucket,
        prefix: query.prefix,
        status,
        start_after,
    };

    let (embeddings, is_truncated) = state
        .index
        .list(&filter, query.limit)
        .await
        .map_err(|err| AppError::from(err).into_json())?;
    let next_start_after = is_truncated
        .then(|| embeddings.last())
        .flatten()
        .map(|last| format!("{}/{}", last.bucket, last.key));
    Ok(Json(ListEmbeddingsResponse {
        count: embeddings.len(),
        embeddings,
        is_truncated,
        next_start_after,
    }))
}

/// `DELETE /api/v1/vectors/embeddings/{bucket}/{*key}`
///
/// Drops the record whatever its state. The object is untouched; it is
/// embedded again on its next write.
pub async fn delete_embedding(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    let removed = state
        .index
        .delete(&bucket, &key, i64::MAX)
        .await
        .map_err(|err| AppError::from(err).into_json())?;
    if !removed {
        return Err(no_such_embedding(&bucket, &key));
    }
    info!(bucket = %bucket, key = %key, "embedding deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/indexing/jobs?bucket=&key=`
///
/// One key has at most one live job: the record of its newest version.
pub async fn object_jobs(
    State(state): State<AppState>,
    Query(query): Query<ObjectJobsQuery>,
) -> Result<Json<ObjectJobsResponse>, AppError> {
    let (Some(bucket), Some(key)) = (query.bucket, query.key) else {
        return Err(invalid("bucket and key query parameters are required"));
    };
    let jobs: Vec<EmbeddingRecord> = state
        .index
        .get(&bucket, &key)
        .await
        .map_err(|err| AppError::from(err).into_json())?
        .into_iter()
        .map(|mut record| {
            record.vector = None;
            record
        })
        .collect();
    Ok(Json(ObjectJobsResponse {
        bucket,
        key,
        count: jobs.len(),
        jobs,
    }))
}

/// `GET /api/v1/indexing/health`
pub async fn indexing_health(State(state): State<AppState>) -> Response {
    let stats = state.enrichment.stats();
    if state.enrichment.is_running() {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "workers": stats.workers, "queue_depth": stats.queue_depth })),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": "enrichment dispatcher stopped" })),
        )
            .into_response()
    }
}

/// `GET /api/v1/indexing/stats`
pub async fn indexing_stats(State(state): State<AppState>) -> Result<Json<IndexingStats>, AppError> {
    let records = state
        .index
        .counts()
        .await
        .map_err(|err| AppError::from(err).into_json())?;
    Ok(Json(IndexingStats {
        model: state.embedder.model_name().to_string(),
        dimensions: state.embedder.dimensions(),
        dispatcher: state.enrichment.stats(),
        records,
    }))
}
