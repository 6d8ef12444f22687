//! The follow loop behind [`JobStore::stream_jobs`](super::JobStore::stream_jobs).
//!
//! Each stream owns one tokio task. The task opens a follow query (tailable,
//! await-data cursor) and forwards decoded records through a channel of
//! capacity one, so a slow consumer holds back the next fetch.
//!
//! The task remembers the `_id` of the last record it saw. When a cursor dies
//! (tailable cursors opened on an empty collection do) it waits
//! `reopen_interval` and re-opens the query strictly after that watermark.
//!
//! Two ways to stop:
//!
//! - store shutdown ends the *waiting*: records already fetched or available
//!   without a wait are still handed over, then the stream completes
//! - the consumer opting out (`scope`, [`JobStream::close`], drop) ends the
//!   task at once and discards anything not yet received

use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use workflows_core::Job;

use super::r#trait::JobStoreError;
use crate::codec::DecodePolicy;

/// Records fetched per round-trip.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Upper bound of one wait cycle on the follow cursor.
pub const DEFAULT_MAX_AWAIT: Duration = Duration::from_secs(10);

/// Pause before re-opening a cursor the store closed.
pub const DEFAULT_REOPEN_INTERVAL: Duration = Duration::from_secs(1);

/// Where a new stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStart {
    /// Every job already stored, then new ones.
    #[default]
    Beginning,
    /// Only jobs appended after the stream started.
    Latest,
}

impl FromStr for StreamStart {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginning" | "all" => Ok(Self::Beginning),
            "latest" | "new" => Ok(Self::Latest),
            other => Err(format!("unknown stream start: {other}")),
        }
    }
}

impl core::fmt::Display for StreamStart {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Beginning => f.write_str("beginning"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// Follow query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub start: StreamStart,
    pub batch_size: u32,
    pub max_await: Duration,
    pub reopen_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            start: StreamStart::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_await: DEFAULT_MAX_AWAIT,
            reopen_interval: DEFAULT_REOPEN_INTERVAL,
        }
    }
}

impl StreamOptions {
    pub fn with_start(mut self, start: StreamStart) -> Self {
        self.start = start;
        self
    }

    pub fn with_max_await(mut self, max_await: Duration) -> Self {
        self.max_await = max_await;
        self
    }

    pub fn with_reopen_interval(mut self, interval: Duration) -> Self {
        self.reopen_interval = interval;
        self
    }
}

/// Terminal stream failure. The stream completes right after yielding one.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open job stream: {0}")]
    Setup(#[source] JobStoreError),

    #[error("job stream cursor failed: {0}")]
    Cursor(#[source] JobStoreError),
}

/// Backend side of a stream: opens follow cursors.
#[async_trait]
pub(crate) trait FollowSource: Send + Sync + 'static {
    /// `_id` of the most recently appended record.
    async fn latest_id(&self) -> Result<Option<Bson>, JobStoreError>;

    /// Open a follow cursor over records strictly after `after` (all records when `None`).
    async fn open(
        &self,
        after: Option<&Bson>,
        options: &StreamOptions,
    ) -> Result<Box<dyn FollowCursor>, JobStoreError>;
}

#[async_trait]
pub(crate) trait FollowCursor: Send {
    /// Next record in insertion order, waiting for one to be appended.
    /// `Ok(None)` means the cursor is dead and must be re-opened.
    async fn next_record(&mut self) -> Result<Option<Document>, JobStoreError>;

    /// Next record that is available without waiting for new appends.
    /// `Ok(None)` when there is none.
    async fn next_available(&mut self) -> Result<Option<Document>, JobStoreError>;
}

/// Live feed of jobs from a store.
///
/// Yields `Ok(job)` per record, at most one terminal `Err(StreamError)`, then
/// completes. Dropping the stream stops its task.
#[derive(Debug)]
pub struct JobStream {
    rx: mpsc::Receiver<Result<Job, StreamError>>,
    stop: CancellationToken,
    skipped: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl JobStream {
    pub(crate) fn spawn(
        source: Arc<dyn FollowSource>,
        policy: DecodePolicy,
        options: StreamOptions,
        store_shutdown: &CancellationToken,
        scope: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let skipped = Arc::new(AtomicU64::new(0));

        let follower = Follower {
            source,
            policy,
            options,
            tx,
            shutdown: store_shutdown.clone(),
            stop: stop.clone(),
            scope,
            skipped: skipped.clone(),
        };
        let task = tokio::spawn(follower.run());

        Self {
            rx,
            stop,
            skipped,
            task: Some(task),
        }
    }

    /// Next item, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<Job, StreamError>> {
        self.rx.recv().await
    }

    /// Records skipped because they could not be decoded.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Stop this stream only and wait for its task to exit.
    ///
    /// Jobs not yet received are discarded.
    pub async fn close(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "job stream task did not exit cleanly");
            }
        }
    }
}

impl Stream for JobStream {
    type Item = Result<Job, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for JobStream {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

struct Follower {
    source: Arc<dyn FollowSource>,
    policy: DecodePolicy,
    options: StreamOptions,
    tx: mpsc::Sender<Result<Job, StreamError>>,
    /// Store-wide: stop waiting, drain what is available.
    shutdown: CancellationToken,
    /// Per-stream (close/drop): stop now.
    stop: CancellationToken,
    scope: CancellationToken,
    skipped: Arc<AtomicU64>,
}

impl Follower {
    async fn run(self) {
        let mut delivered: u64 = 0;

        let mut watermark = match self.options.start {
            StreamStart::Beginning => None,
            StreamStart::Latest => {
                let latest = tokio::select! {
                    biased;
                    _ = self.stopped() => return,
                    latest = self.source.latest_id() => latest,
                };
                match latest {
                    Ok(id) => id,
                    Err(err) => {
                        error!(error = %err, "failed to read job stream watermark");
                        self.deliver(Err(StreamError::Setup(err))).await;
                        return;
                    }
                }
            }
        };

        'follow: loop {
            let opened = tokio::select! {
                biased;
                _ = self.stopped() => break 'follow,
                opened = self.source.open(watermark.as_ref(), &self.options) => opened,
            };
            let mut cursor = match opened {
                Ok(cursor) => cursor,
                Err(err) => {
                    error!(error = %err, "failed to open job stream");
                    self.deliver(Err(StreamError::Setup(err))).await;
                    break 'follow;
                }
            };
            debug!(after = ?watermark, "follow query opened");

            loop {
                let draining = self.shutdown.is_cancelled();
                let next = if draining {
                    tokio::select! {
                        biased;
                        _ = self.stopped() => break 'follow,
                        next = cursor.next_available() => next,
                    }
                } else {
                    tokio::select! {
                        biased;
                        _ = self.stopped() => break 'follow,
                        _ = self.shutdown.cancelled() => continue,
                        next = cursor.next_record() => next,
                    }
                };

                match next {
                    Ok(Some(record)) => {
                        if let Some(id) = record.get("_id") {
                            watermark = Some(id.clone());
                        }
                        match self.policy.decode_job(&record) {
                            Ok(job) => {
                                if !self.deliver(Ok(job)).await {
                                    break 'follow;
                                }
                                delivered += 1;
                            }
                            Err(err) => {
                                let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
                                warn!(error = %err, skipped, "skipping undecodable job record");
                            }
                        }
                    }
                    Ok(None) if draining => break 'follow,
                    Ok(None) => {
                        debug!("follow cursor closed by store, reopening");
                        // On shutdown, re-open once more to drain.
                        tokio::select! {
                            biased;
                            _ = self.stopped() => break 'follow,
                            _ = self.shutdown.cancelled() => {}
                            _ = tokio::time::sleep(self.options.reopen_interval) => {}
                        }
                        continue 'follow;
                    }
                    Err(err) => {
                        error!(error = %err, "job stream cursor failed");
                        self.deliver(Err(StreamError::Cursor(err))).await;
                        break 'follow;
                    }
                }
            }
        }

        debug!(
            delivered,
            skipped = self.skipped.load(Ordering::Relaxed),
            "job stream finished"
        );
    }

    /// Resolves once the consumer opted out: stream closed/dropped or scope cancelled.
    async fn stopped(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.scope.cancelled() => {}
        }
    }

    /// Hand one item to the consumer. `false` when the stream must end.
    /// Store shutdown does not interrupt a hand-off.
    async fn deliver(&self, item: Result<Job, StreamError>) -> bool {
        tokio::select! {
            biased;
            _ = self.stopped() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}
