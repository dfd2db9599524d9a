//! Shared handler state and its construction from configuration.

use crate::{
    config::AppConfig,
    middleware::auth::{CredentialVerifier, StaticCredentials},
    services::{
        db,
        embedding::{EmbeddingProvider, create_provider},
        enrichment::{EnrichmentConfig, EnrichmentDispatcher},
        storage_service::StorageService,
        vector_index::VectorIndex,
    },
    telemetry,
};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub index: VectorIndex,
    pub enrichment: EnrichmentDispatcher,
    /// Used for text queries; the same provider the workers embed with.
    pub embedder: Arc<dyn EmbeddingProvider>,
    /// `None` disables credential checks.
    pub auth: Option<Arc<dyn CredentialVerifier>>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    /// Connect storage, migrate, and start the enrichment workers.
    pub async fn build(cfg: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&cfg.storage_dir)
            .await
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;

        let pool = db::connect(&cfg.database_url).await?;
        db::run_migrations(&pool).await?;
        let storage = StorageService::new(Arc::new(pool), cfg.storage_dir.clone());

        let provider = create_provider(&cfg.provider_config()?)?;
        info!(
            provider = %cfg.embedding_provider,
            model = provider.model_name(),
            dimensions = provider.dimensions(),
            "embedding provider ready"
        );

        let auth: Option<Arc<dyn CredentialVerifier>> = if cfg.auth_enabled {
            Some(Arc::new(StaticCredentials::new([cfg.access_key.clone()])))
        } else {
            None
        };

        Ok(Self::from_parts(storage, provider, cfg.enrichment_config(), auth))
    }

    /// Wire the pieces together; spawns the dispatcher's workers and installs
    /// the metrics recorder if this process has none yet.
    pub fn from_parts(
        storage: StorageService,
        embedder: Arc<dyn EmbeddingProvider>,
        enrichment: EnrichmentConfig,
        auth: Option<Arc<dyn CredentialVerifier>>,
    ) -> Self {
        let index = VectorIndex::new(storage.db.clone());
        let enrichment =
            EnrichmentDispatcher::start(enrichment, storage.clone(), index.clone(), embedder.clone());
        Self {
            storage,
            index,
            enrichment,
            embedder,
            auth,
            metrics: telemetry::install_recorder(),
        }
    }
}
