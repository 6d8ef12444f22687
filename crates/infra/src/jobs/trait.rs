use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use workflows_core::{DomainError, Job};

use super::stream::JobStream;

/// Job store operation error.
///
/// These are per-operation failures: they are returned to the caller of that
/// operation and never tear down the store or any running stream.
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("invalid job: {0}")]
    Invalid(#[from] DomainError),

    /// The backing store rejected or failed the operation (driver error, unmodified).
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    #[error("store assigned an unexpected identity: {0}")]
    Identity(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only job store with a live feed of its contents.
///
/// ## Insert Semantics
///
/// `insert_job()`:
/// - Validates the job (non-empty `workflow_name`)
/// - Persists only `workflow_name` and a normalized copy of `input_parameters`
/// - Returns the same job with `id` set to the store-assigned identity
/// - Does not retry
///
/// ## Stream Semantics
///
/// `stream_jobs()` spawns one background task that follows the store in
/// insertion order and yields each record as `Ok(job)`. The stream completes:
/// - after `shutdown()`, once the jobs available without waiting are handed over
/// - at once when `scope` is cancelled or the stream is closed or dropped
/// - after a terminal `Err(StreamError)` item
///
/// Must be called from within a tokio runtime.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a job and return it with its assigned identity.
    async fn insert_job(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Follow the store, yielding jobs in insertion order.
    fn stream_jobs(&self, scope: CancellationToken) -> JobStream;

    /// End every stream opened from this store after it drains (idempotent, race-free).
    fn shutdown(&self);
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert_job(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).insert_job(job).await
    }

    fn stream_jobs(&self, scope: CancellationToken) -> JobStream {
        (**self).stream_jobs(scope)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}
