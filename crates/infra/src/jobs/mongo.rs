//! MongoDB-backed job store.
//!
//! Jobs live in the `jobs` collection of the configured database. The
//! collection must be **capped**: tailable cursors are only available on capped
//! collections, and capped collections preserve insertion order.
//! [`MongoJobStore::ensure_collection`] creates it when missing.
//!
//! ## Error Mapping
//!
//! | Failure | JobStoreError |
//! |---------|---------------|
//! | Empty `workflow_name` | `Invalid` |
//! | Driver error (network, auth, write concern, duplicate key) | `Mongo` (unmodified) |
//! | `insert_one` returned a non-ObjectId `_id` | `Identity` |
//!
//! ## Resuming
//!
//! ObjectIds only sort by insertion within a single producer process, so a
//! follow query is never filtered with `_id > watermark`. A re-opened cursor
//! reads the collection in natural (insertion) order and skips up to and
//! including the watermark record. If the watermark has already been evicted
//! from the capped collection, the `$gt` filter is the best remaining guess.
//!
//! ## Thread Safety
//!
//! `MongoJobStore` is `Clone + Send + Sync`. Clones share the driver's
//! connection pool and the shutdown token, so `shutdown()` on any clone stops
//! streams opened from every clone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::CursorType;
use mongodb::{Client, Collection, Cursor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use workflows_core::{Job, JobId};

use super::r#trait::{JobStore, JobStoreError};
use super::stream::{FollowCursor, FollowSource, JobStream, StreamOptions};
use crate::codec::{encode_job, DecodePolicy};
use crate::config::StoreSettings;

/// Name of the jobs collection.
pub const JOBS_COLLECTION: &str = "jobs";

/// Server error code for "collection already exists".
const NAMESPACE_EXISTS: i32 = 48;

/// Bound on one `getMore` while draining after shutdown. A `getMore` that has
/// records returns at once.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MongoJobStore {
    client: Client,
    database: String,
    policy: DecodePolicy,
    options: StreamOptions,
    shutdown: CancellationToken,
}

impl MongoJobStore {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            policy: DecodePolicy::default(),
            options: StreamOptions::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_settings(client: Client, settings: &StoreSettings) -> Self {
        Self::new(client, settings.database.clone()).with_stream_options(settings.stream.clone())
    }

    pub fn with_decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    fn collection(&self) -> Collection<Document> {
        self.client
            .database(&self.database)
            .collection::<Document>(JOBS_COLLECTION)
    }

    /// Create the capped jobs collection if it does not exist yet.
    ///
    /// Returns `true` when this call created it. Safe to run concurrently from
    /// several processes.
    #[instrument(skip(self), fields(database = %self.database), err)]
    pub async fn ensure_collection(&self, size_bytes: u64) -> Result<bool, JobStoreError> {
        let db = self.client.database(&self.database);

        let existing = db.list_collection_names().await?;
        if existing.iter().any(|name| name == JOBS_COLLECTION) {
            return Ok(false);
        }

        match db
            .create_collection(JOBS_COLLECTION)
            .capped(true)
            .size(size_bytes)
            .await
        {
            Ok(()) => {
                info!(collection = JOBS_COLLECTION, size_bytes, "created capped jobs collection");
                Ok(true)
            }
            Err(err) if is_namespace_exists(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

fn is_namespace_exists(err: &mongodb::error::Error) -> bool {
    matches!(&*err.kind, ErrorKind::Command(cmd) if cmd.code == NAMESPACE_EXISTS)
}

#[async_trait]
impl JobStore for MongoJobStore {
    #[instrument(skip(self, job), fields(workflow_name = %job.workflow_name), err)]
    async fn insert_job(&self, mut job: Job) -> Result<Job, JobStoreError> {
        job.validate()?;

        let result = self.collection().insert_one(encode_job(&job)).await?;
        let id = match result.inserted_id {
            Bson::ObjectId(oid) => oid.to_hex(),
            other => return Err(JobStoreError::Identity(format!("{other:?}"))),
        };

        job.assign_id(JobId::new(id)?);
        debug!(job_id = ?job.id, "job inserted");
        Ok(job)
    }

    fn stream_jobs(&self, scope: CancellationToken) -> JobStream {
        let source = Arc::new(MongoFollowSource {
            collection: self.collection(),
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

struct MongoFollowSource {
    collection: Collection<Document>,
}

#[async_trait]
impl FollowSource for MongoFollowSource {
    async fn latest_id(&self) -> Result<Option<Bson>, JobStoreError> {
        let latest = self
            .collection
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(latest.and_then(|record| record.get("_id").cloned()))
    }

    async fn open(
        &self,
        after: Option<&Bson>,
        options: &StreamOptions,
    ) -> Result<Box<dyn FollowCursor>, JobStoreError> {
        let (filter, resume) = match after {
            None => (doc! {}, ResumeAfter::default()),
            Some(id) => {
                if self.contains(id).await? {
                    (doc! {}, ResumeAfter(Some(id.clone())))
                } else {
                    warn!(watermark = %id, "watermark evicted from capped collection, resuming by _id");
                    (doc! { "_id": { "$gt": id.clone() } }, ResumeAfter::default())
                }
            }
        };

        let cursor = self
            .collection
            .find(filter)
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(options.max_await)
            .batch_size(options.batch_size)
            .await?;

        Ok(Box::new(MongoFollowCursor { cursor, resume }))
    }
}

impl MongoFollowSource {
    async fn contains(&self, id: &Bson) -> Result<bool, JobStoreError> {
        let found = self
            .collection
            .find_one(doc! { "_id": id.clone() })
            .projection(doc! { "_id": 1 })
            .await?;
        Ok(found.is_some())
    }
}

/// Skips records up to and including the watermark `_id`.
#[derive(Debug, Default)]
struct ResumeAfter(Option<Bson>);

impl ResumeAfter {
    /// `true` once `record` comes after the watermark.
    fn admit(&mut self, record: &Document) -> bool {
        let reached = match &self.0 {
            None => return true,
            Some(id) => record.get("_id") == Some(id),
        };
        if reached {
            self.0 = None;
        }
        false
    }
}

struct MongoFollowCursor {
    cursor: Cursor<Document>,
    resume: ResumeAfter,
}

impl MongoFollowCursor {
    /// Next admitted record. With `wait`, gives up (`Ok(None)`) when a
    /// `getMore` does not return within it.
    async fn fetch(&mut self, wait: Option<Duration>) -> Result<Option<Document>, JobStoreError> {
        loop {
            let advanced = match wait {
                None => self.cursor.advance().await?,
                Some(wait) => match tokio::time::timeout(wait, self.cursor.advance()).await {
                    Ok(advanced) => advanced?,
                    Err(_) => return Ok(None),
                },
            };
            if !advanced {
                return Ok(None);
            }

            let record: Document = self.cursor.deserialize_current()?;
            if self.resume.admit(&record) {
                return Ok(Some(record));
            }
        }
    }
}

#[async_trait]
impl FollowCursor for MongoFollowCursor {
    async fn next_record(&mut self) -> Result<Option<Document>, JobStoreError> {
        self.fetch(None).await
    }

    async fn next_available(&mut self) -> Result<Option<Document>, JobStoreError> {
        self.fetch(Some(DRAIN_WAIT)).await
    }
}
