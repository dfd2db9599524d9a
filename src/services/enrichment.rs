//! Enrichment dispatcher: turns stored text objects into vectors off the
//! request path.
//!
//! A PUT hands the dispatcher an [`EnrichmentJob`] for the version it just
//! wrote. Submission is a non-blocking send on a bounded channel; a fixed
//! pool of worker tasks drains the channel, records the job as `pending` in
//! the vector index, reads the object, embeds it and stores the result.
//! Nothing here ever reports back to the writer: failures end up in the
//! record, in the logs and in the `ragstore_enrichment_jobs_total` counter.

use crate::{
    services::{
        embedding::{EmbeddingProvider, chunk_words, mean_pool},
        storage_service::{StorageError, StorageService},
        vector_index::VectorIndex,
    },
    telemetry,
};
use serde::Serialize;
use std::{
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub workers: usize,
    pub queue_size: usize,
    /// Attempts per job, including the first.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^(n-1)` before retrying.
    pub retry_delay: Duration,
    pub max_document_bytes: u64,
    pub chunk_words: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_size: 1000,
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            max_document_bytes: 1024 * 1024,
            chunk_words: 500,
        }
    }
}

/// One object version awaiting enrichment.
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub version: i64,
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("document is {size} bytes, limit is {limit}")]
    Oversized { size: u64, limit: u64 },
    #[error("empty document")]
    EmptyDocument,
    #[error("reading object: {0}")]
    Storage(StorageError),
    #[error("embedding backend: {0:#}")]
    Provider(anyhow::Error),
    #[error("vector index: {0}")]
    Index(#[from] sqlx::Error),
}

impl EnrichError {
    /// Permanent failures are properties of the document itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnrichError::Oversized { .. } | EnrichError::EmptyDocument => false,
            EnrichError::Storage(err) => err.is_internal(),
            EnrichError::Provider(_) | EnrichError::Index(_) => true,
        }
    }
}

enum Outcome {
    Completed { dimensions: usize },
    /// The object changed or disappeared; a later job (or a delete) owns the
    /// record now.
    Superseded,
}

/// Job lifecycle events, counted both locally and as Prometheus counters.
#[derive(Clone, Copy)]
enum JobEvent {
    Submitted,
    Completed,
    Failed,
    Superseded,
    Rejected,
    Retried,
}

impl JobEvent {
    fn as_str(self) -> &'static str {
        match self {
            JobEvent::Submitted => "submitted",
            JobEvent::Completed => "completed",
            JobEvent::Failed => "failed",
            JobEvent::Superseded => "superseded",
            JobEvent::Rejected => "rejected",
            JobEvent::Retried => "retried",
        }
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    superseded: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn record(&self, event: JobEvent) {
        let counter = match event {
            JobEvent::Submitted => &self.submitted,
            JobEvent::Completed => &self.completed,
            JobEvent::Failed => &self.failed,
            JobEvent::Superseded => &self.superseded,
            JobEvent::Rejected => &self.rejected,
            JobEvent::Retried => &self.retried,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        telemetry::record_job(event.as_str());
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub superseded: u64,
    pub rejected: u64,
    pub retried: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub workers: usize,
}

/// Everything a worker needs to process a job.
struct Pipeline {
    storage: StorageService,
    index: VectorIndex,
    provider: Arc<dyn EmbeddingProvider>,
    config: EnrichmentConfig,
    counters: Counters,
}

type JobReceiver = Arc<Mutex<mpsc::Receiver<EnrichmentJob>>>;

struct Inner {
    pipeline: Arc<Pipeline>,
    sender: StdMutex<Option<mpsc::Sender<EnrichmentJob>>>,
    /// Held here as well as by the workers so the queue stays open with an
    /// empty pool.
    receiver: JobReceiver,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

/// Handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct EnrichmentDispatcher {
    inner: Arc<Inner>,
}

impl EnrichmentDispatcher {
    /// Spawn `config.workers` workers on the current runtime.
    pub fn start(
        config: EnrichmentConfig,
        storage: StorageService,
        index: VectorIndex,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let receiver: JobReceiver = Arc::new(Mutex::new(receiver));
        let worker_count = config.workers;
        let pipeline = Arc::new(Pipeline {
            storage,
            index,
            provider,
            config,
            counters: Counters::default(),
        });

        let workers = (0..worker_count)
            .map(|id| {
                let pipeline = pipeline.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "enrichment worker started");
                    loop {
                        // Hold the receiver only while waiting, not while working.
                        let job = receiver.lock().await.recv().await;
                        match job {
                            Some(job) => pipeline.run(job).await,
                            None => break,
                        }
                    }
                    debug!(worker = id, "enrichment worker stopped");
                })
            })
            .collect();

        info!(
            workers = worker_count,
            queue_size = pipeline.config.queue_size,
            model = pipeline.provider.model_name(),
            "enrichment dispatcher started"
        );

        Self {
            inner: Arc::new(Inner {
                pipeline,
                sender: StdMutex::new(Some(sender)),
                receiver,
                workers: StdMutex::new(workers),
                worker_count,
            }),
        }
    }

    /// Queue a job without waiting on anything.
    ///
    /// The pending record is written by the worker that picks the job up. A
    /// job that cannot be queued is logged and recorded as failed from a
    /// background task.
    pub fn submit(&self, job: EnrichmentJob) {
        let pipeline = &self.inner.pipeline;
        pipeline.counters.record(JobEvent::Submitted);

        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (job, reason) = match sender {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => (job, "enrichment queue full"),
                Err(TrySendError::Closed(job)) => (job, "enrichment dispatcher stopped"),
            },
            None => (job, "enrichment dispatcher stopped"),
        };

        pipeline.counters.record(JobEvent::Rejected);
        warn!(bucket = %job.bucket, key = %job.key, "{}", reason);
        let index = pipeline.index.clone();
        tokio::spawn(async move {
            let recorded = match index
                .mark_pending(&job.bucket, &job.key, &job.etag, job.version)
                .await
            {
                Ok(true) => index
                    .mark_failed(&job.bucket, &job.key, job.version, reason)
                    .await
                    .map(|_| ()),
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = recorded {
                error!(bucket = %job.bucket, key = %job.key, error = %err, "failed to record rejected job");
            }
        });
    }

    /// Drop the embedding of a key whose object was deleted or replaced by an
    /// ineligible version. Runs in the background.
    pub fn forget(&self, bucket: &str, key: &str, up_to_version: i64) {
        let index = self.inner.pipeline.index.clone();
        let bucket = bucket.to_string();
        let key = key.to_string();
        tokio::spawn(async move {
            match index.delete(&bucket, &key, up_to_version).await {
                Ok(removed) => debug!(bucket = %bucket, key = %key, removed, "embedding forgotten"),
                Err(err) => {
                    warn!(bucket = %bucket, key = %key, error = %err, "failed to drop embedding")
                }
            }
        });
    }

    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.inner.pipeline.counters;
        let (queue_depth, queue_capacity) = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| (s.max_capacity() - s.capacity(), s.max_capacity()))
            .unwrap_or((0, 0));
        DispatcherStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            superseded: counters.superseded.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            queue_depth,
            queue_capacity,
            workers: self.inner.worker_count,
        }
    }

    /// True while the queue is open and no worker has died.
    pub fn is_running(&self) -> bool {
        let open = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        open && self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|handle| !handle.is_finished())
    }

    /// Close the queue and wait for workers to finish what was queued.
    ///
    /// Jobs still queued when there are no workers are dropped; their
    /// objects simply stay unindexed.
    pub async fn shutdown(&self) {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(error = %err, "enrichment worker panicked");
            }
        }
        let mut receiver = self.inner.receiver.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "enrichment jobs left unprocessed");
        }
        info!("enrichment dispatcher stopped");
    }
}

impl Pipeline {
    /// Drive one job to a terminal state, retrying transient failures.
    async fn run(&self, job: EnrichmentJob) {
        match self
            .index
            .mark_pending(&job.bucket, &job.key, &job.etag, job.version)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.counters.record(JobEvent::Superseded);
                debug!(bucket = %job.bucket, key = %job.key, "newer version already recorded");
                return;
            }
            Err(err) => {
                self.counters.record(JobEvent::Failed);
                error!(bucket = %job.bucket, key = %job.key, error = %err, "failed to record pending embedding");
                return;
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .index
                .mark_processing(&job.bucket, &job.key, job.version)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    self.counters.record(JobEvent::Superseded);
                    debug!(bucket = %job.bucket, key = %job.key, "job superseded before start");
                    return;
                }
                Err(err) => {
                    self.counters.record(JobEvent::Failed);
                    error!(bucket = %job.bucket, key = %job.key, error = %err, "cannot claim embedding record");
                    let message = format!("claiming record: {err}");
                    self.record_failure(&job, &message).await;
                    return;
                }
            }

            let err = match self.enrich(&job).await {
                Ok(Outcome::Completed { dimensions }) => {
                    self.counters.record(JobEvent::Completed);
                    info!(bucket = %job.bucket, key = %job.key, dimensions, attempt, "object embedded");
                    return;
                }
                Ok(Outcome::Superseded) => {
                    self.counters.record(JobEvent::Superseded);
                    debug!(bucket = %job.bucket, key = %job.key, "job superseded");
                    // Only removes the record if it still describes this job.
                    if let Err(err) = self.index.delete(&job.bucket, &job.key, job.version).await {
                        warn!(bucket = %job.bucket, key = %job.key, error = %err, "failed to drop superseded record");
                    }
                    return;
                }
                Err(err) => err,
            };

            let message = err.to_string();
            if err.is_retryable() && attempt < max_attempts {
                let delay = self.config.retry_delay * 2u32.pow((attempt - 1).min(16));
                warn!(
                    bucket = %job.bucket,
                    key = %job.key,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %message,
                    "enrichment attempt failed"
                );
                self.counters.record(JobEvent::Retried);
                if let Err(err) = self
                    .index
                    .mark_retrying(&job.bucket, &job.key, job.version, &message)
                    .await
                {
                    error!(error = %err, "failed to record retry");
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            self.counters.record(JobEvent::Failed);
            warn!(bucket = %job.bucket, key = %job.key, attempt, error = %message, "enrichment failed");
            self.record_failure(&job, &message).await;
            return;
        }
    }

    async fn record_failure(&self, job: &EnrichmentJob, message: &str) {
        if let Err(err) = self
            .index
            .mark_failed(&job.bucket, &job.key, job.version, message)
            .await
        {
            error!(bucket = %job.bucket, key = %job.key, error = %err, "failed to record enrichment failure");
        }
    }

    async fn enrich(&self, job: &EnrichmentJob) -> Result<Outcome, EnrichError> {
        let limit = self.config.max_document_bytes;
        let (object, bytes) = match self
            .storage
            .read_object_bytes(&job.bucket, &job.key, limit)
            .await
        {
            Ok(found) => found,
            Err(StorageError::ObjectNotFound { .. } | StorageError::BucketNotFound(_)) => {
                return Ok(Outcome::Superseded);
            }
            Err(StorageError::ObjectTooLarge { size, limit }) => {
                return Err(EnrichError::Oversized { size, limit });
            }
            Err(err) => return Err(EnrichError::Storage(err)),
        };
        if object.version != job.version || object.etag != job.etag {
            return Ok(Outcome::Superseded);
        }

        let text = String::from_utf8_lossy(&bytes);
        let chunks = chunk_words(&text, self.config.chunk_words);
        if chunks.is_empty() {
            return Err(EnrichError::EmptyDocument);
        }
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let vectors = self
            .provider
            .embed_batch(&refs)
            .await
            .map_err(EnrichError::Provider)?;
        let vector = mean_pool(&vectors).map_err(EnrichError::Provider)?;

        let stored = self
            .index
            .store(
                &job.bucket,
                &job.key,
                job.version,
                &vector,
                self.provider.model_name(),
            )
            .await?;
        if stored {
            Ok(Outcome::Completed {
                dimensions: vector.len(),
            })
        } else {
            Ok(Outcome::Superseded)
        }
    }
}
