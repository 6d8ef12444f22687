use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{Bson, Document};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use workflows_core::{Job, JobId};

use super::r#trait::{JobStore, JobStoreError};
use super::stream::{FollowCursor, FollowSource, JobStream, StreamOptions};
use crate::codec::{encode_job, DecodePolicy};

/// In-memory append-only job store.
///
/// Intended for tests/dev. Records are kept as BSON documents with fresh
/// ObjectIds and decoded through the configured [`DecodePolicy`], so streams
/// behave like the MongoDB backend's.
#[derive(Debug)]
pub struct InMemoryJobStore {
    log: Arc<RecordLog>,
    policy: DecodePolicy,
    options: StreamOptions,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct RecordLog {
    records: RwLock<Vec<Document>>,
    /// Number of records, bumped after every append.
    appended: watch::Sender<usize>,
}

impl RecordLog {
    fn append(&self, mut record: Document) -> Result<ObjectId, JobStoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;

        // Allocated under the lock so ids increase with position.
        let oid = ObjectId::new();
        record.insert("_id", oid);
        records.push(record);
        let len = records.len();
        drop(records);

        self.appended.send_replace(len);
        Ok(oid)
    }

    fn read<T>(&self, f: impl FnOnce(&[Document]) -> T) -> Result<T, JobStoreError> {
        let records = self
            .records
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))?;
        Ok(f(&records))
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            log: Arc::new(RecordLog {
                records: RwLock::new(Vec::new()),
                appended,
            }),
            policy: DecodePolicy::default(),
            options: StreamOptions::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Append a raw record as-is, as another producer sharing the collection would.
    pub fn append_record(&self, record: Document) -> Result<String, JobStoreError> {
        self.log.append(record).map(|oid| oid.to_hex())
    }

    pub fn len(&self) -> Result<usize, JobStoreError> {
        self.log.read(|records| records.len())
    }

    pub fn is_empty(&self) -> Result<bool, JobStoreError> {
        self.len().map(|len| len == 0)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, mut job: Job) -> Result<Job, JobStoreError> {
        job.validate()?;

        let oid = self.log.append(encode_job(&job))?;
        job.assign_id(JobId::new(oid.to_hex())?);
        debug!(job_id = ?job.id, workflow_name = %job.workflow_name, "job inserted");
        Ok(job)
    }

    fn stream_jobs(&self, scope: CancellationToken) -> JobStream {
        let source = Arc::new(InMemoryFollowSource {
            log: self.log.clone(),
        });
        JobStream::spawn(source, self.policy, self.options.clone(), &self.shutdown, scope)
    }

    fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("job store shutting down");
        }
        self.shutdown.cancel();
    }
}

struct InMemoryFollowSource {
    log: Arc<RecordLog>,
}

#[async_trait]
impl FollowSource for InMemoryFollowSource {
    async fn latest_id(&self) -> Result<Option<Bson>, JobStoreError> {
        self.log
            .read(|records| records.last().and_then(|r| r.get("_id").cloned()))
    }

    async fn open(
        &self,
        after: Option<&Bson>,
        options: &StreamOptions,
    ) -> Result<Box<dyn FollowCursor>, JobStoreError> {
        let position = match after {
            None => 0,
            Some(id) => self.log.read(|records| {
                records
                    .iter()
                    .position(|r| r.get("_id") == Some(id))
                    .map_or(records.len(), |idx| idx + 1)
            })?,
        };

        Ok(Box::new(InMemoryFollowCursor {
            log: self.log.clone(),
            appended: self.log.appended.subscribe(),
            position,
            batch: VecDeque::new(),
            batch_size: options.batch_size.max(1) as usize,
            max_await: options.max_await,
        }))
    }
}

struct InMemoryFollowCursor {
    log: Arc<RecordLog>,
    appended: watch::Receiver<usize>,
    position: usize,
    batch: VecDeque<Document>,
    batch_size: usize,
    max_await: Duration,
}

impl InMemoryFollowCursor {
    /// Pop a buffered record, fetching the next batch from the log if needed.
    fn take_available(&mut self) -> Result<Option<Document>, JobStoreError> {
        if self.batch.is_empty() {
            let start = self.position;
            let batch_size = self.batch_size;
            let fetched = self.log.read(|records| {
                let end = (start + batch_size).min(records.len());
                records[start.min(end)..end].to_vec()
            })?;
            self.position += fetched.len();
            self.batch.extend(fetched);
        }
        Ok(self.batch.pop_front())
    }
}

#[async_trait]
impl FollowCursor for InMemoryFollowCursor {
    async fn next_record(&mut self) -> Result<Option<Document>, JobStoreError> {
        loop {
            // Mark the current length as seen before reading, so an append
            // racing with the read still wakes the wait below.
            self.appended.borrow_and_update();

            if let Some(record) = self.take_available()? {
                return Ok(Some(record));
            }

            // One wait cycle; on timeout just look again.
            match tokio::time::timeout(self.max_await, self.appended.changed()).await {
                Ok(Ok(())) | Err(_) => continue,
                Ok(Err(_)) => return Ok(None),
            }
        }
    }

    async fn next_available(&mut self) -> Result<Option<Document>, JobStoreError> {
        self.take_available()
    }
}
