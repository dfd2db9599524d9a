//! Defines routes for all S3-like bucket and object operations, plus the
//! vector API.
//!
//! ## Structure
//! - **Service endpoint**
//!   - `GET    /` — list buckets
//!
//! - **Bucket-level endpoints**
//!   - `GET    /{bucket}` — list objects (ListObjectsV2)
//!   - `PUT    /{bucket}` — create bucket
//!   - `HEAD   /{bucket}` — bucket exists?
//!   - `DELETE /{bucket}` — delete empty bucket
//!   - `POST   /{bucket}?delete` — delete many objects
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` — upload object
//!   - `GET    /{bucket}/{*key}` — download object
//!   - `HEAD   /{bucket}/{*key}` — retrieve metadata only
//!   - `DELETE /{bucket}/{*key}` — delete object
//!
//! - **Vector API** under `/api/v1`, JSON in and out.
//!
//! - **Operations**: `/healthz`, `/readyz` and Prometheus `/metrics`, all
//!   without credentials.
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{
            create_bucket, delete_bucket, delete_objects, head_bucket, list_buckets, list_objects,
        },
        health_handlers::{healthz, prometheus_metrics, readyz},
        object_handlers::{delete_object, get_object, head_object, upload_object},
        vector_handlers::{
            delete_embedding, get_embedding, indexing_health, indexing_stats, list_embeddings,
            object_jobs, search_by_text, search_by_vector,
        },
    },
    middleware::{auth::require_auth, metrics::track_requests, request_id::request_id},
    state::AppState,
};
use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build and return the router for all routes.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(prometheus_metrics))
        // vector API
        .route("/api/v1/vectors/search", post(search_by_vector))
        .route("/api/v1/vectors/search/text", post(search_by_text))
        .route("/api/v1/vectors/embeddings", get(list_embeddings))
        .route(
            "/api/v1/vectors/embeddings/{bucket}/{*key}",
            get(get_embedding).delete(delete_embedding),
        )
        .route("/api/v1/indexing/jobs", get(object_jobs))
        .route("/api/v1/indexing/stats", get(indexing_stats))
        .route("/api/v1/indexing/health", get(indexing_health))
        // service root
        .route("/", get(list_buckets))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(upload_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_objects)
                .put(create_bucket)
                .head(head_bucket)
                .delete(delete_bucket)
                .post(delete_objects),
        )
}

/// The full application: routes, request metrics, auth, request ids and
/// HTTP tracing.
pub fn app(state: AppState) -> Router {
    routes()
        .route_layer(middleware::from_fn(track_requests))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
