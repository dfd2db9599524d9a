//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: database, disk I/O and enrichment workers
//! - GET /metrics  -> Prometheus text exposition

use crate::{state::AppState, telemetry};
use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

/// `GET /healthz`
///
/// Cheap liveness check; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /metrics`
///
/// Refreshes the storage and index gauges, then renders every metric.
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.usage().await {
        Ok(usage) => telemetry::set_storage_gauges(&usage),
        Err(err) => warn!(error = %err, "failed to read storage usage"),
    }
    match state.index.counts().await {
        Ok(counts) => telemetry::set_index_gauges(&counts, &state.enrichment.stats()),
        Err(err) => warn!(error = %err, "failed to read embedding counts"),
    }
    state.metrics.run_upkeep();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// `GET /readyz`
///
/// HTTP 200 when every check passes, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.storage.db)
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };
    checks.insert("sqlite", sqlite);
    checks.insert("disk", disk_check(&state).await);
    checks.insert(
        "enrichment",
        if state.enrichment.is_running() {
            CheckStatus::ok()
        } else {
            CheckStatus::failed("enrichment workers are not running".into())
        },
    );

    let overall_ok = checks.values().all(|c| c.ok);
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadyResponse {
            status: if overall_ok { "ok" } else { "error" },
            checks,
        }),
    )
}

/// Write, read back and remove a scratch file under the storage root.
async fn disk_check(state: &AppState) -> CheckStatus {
    let tmp_path = state
        .storage
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let result = match fs::write(&tmp_path, b"readyz").await {
        Ok(()) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
            Ok(_) => CheckStatus::failed("file content mismatch".into()),
            Err(e) => CheckStatus::failed(format!("could not read tmp file: {}", e)),
        },
        Err(e) => return CheckStatus::failed(format!("could not write tmp file: {}", e)),
    };
    // best-effort cleanup
    let _ = fs::remove_file(&tmp_path).await;
    result
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
