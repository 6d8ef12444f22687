//! End-to-end tests for the insert path and the live job feed.
//!
//! Tests: insert_job → store → follow loop → JobStream
//!
//! Verifies:
//! - Inserted jobs stream back verbatim, in insertion order
//! - Identities are unique
//! - Shutdown and scope cancellation end streams promptly and idempotently
//! - Shutdown still hands over jobs that are already available
//! - Jobs inserted while a stream is active are delivered

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use bson::doc;
    use futures::StreamExt;
    use proptest::prelude::*;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use workflows_core::{InputParameter, Job};

    use crate::codec::DecodePolicy;
    use crate::jobs::{InMemoryJobStore, JobStore, JobStream, StreamOptions, StreamStart};

    /// One wait-cycle bound.
    const WAIT_CYCLE: Duration = Duration::from_secs(10);

    fn fast_options() -> StreamOptions {
        StreamOptions::default()
            .with_max_await(Duration::from_millis(200))
            .with_reopen_interval(Duration::from_millis(20))
    }

    fn store() -> Arc<InMemoryJobStore> {
        Arc::new(InMemoryJobStore::new().with_stream_options(fast_options()))
    }

    async fn next_job(stream: &mut JobStream) -> Job {
        timeout(WAIT_CYCLE, stream.recv())
            .await
            .expect("timed out waiting for a job")
            .expect("stream ended early")
            .expect("stream yielded an error")
    }

    async fn assert_ends(stream: &mut JobStream) {
        let item = timeout(WAIT_CYCLE, stream.recv())
            .await
            .expect("stream did not end within one wait cycle");
        assert!(item.is_none(), "expected end of stream, got {item:?}");
    }

    #[tokio::test]
    async fn deploy_job_round_trips_through_the_stream() {
        let store = store();

        let inserted = store
            .insert_job(Job::new("deploy").with_parameter("version", "1.2.3"))
            .await
            .unwrap();
        let id = inserted.id.clone().unwrap();
        assert!(!id.as_str().is_empty());
        assert_eq!(inserted.workflow_name, "deploy");
        assert_eq!(
            inserted.input_parameters,
            vec![InputParameter::new("version", "1.2.3")]
        );

        let mut stream = store.stream_jobs(CancellationToken::new());
        assert_eq!(next_job(&mut stream).await, inserted);

        store.shutdown();
        assert_ends(&mut stream).await;
        assert_eq!(stream.skipped(), 0);
    }

    #[tokio::test]
    async fn insert_ignores_caller_supplied_id() {
        let store = store();
        let mut job = Job::new("deploy");
        job.assign_id("caller-chosen".parse().unwrap());

        let inserted = store.insert_job(job).await.unwrap();
        assert_ne!(inserted.id.as_ref().unwrap().as_str(), "caller-chosen");
    }

    #[tokio::test]
    async fn insert_rejects_empty_workflow_name() {
        let store = store();
        let err = store.insert_job(Job::new("")).await.unwrap_err();
        assert!(matches!(err, crate::jobs::JobStoreError::Invalid(_)));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn stream_preserves_insertion_order() {
        let store = store();
        let mut ids = Vec::new();
        for name in ["j1", "j2", "j3"] {
            ids.push(store.insert_job(Job::new(name)).await.unwrap().id);
        }

        let mut stream = store.stream_jobs(CancellationToken::new());
        for (name, id) in ["j1", "j2", "j3"].into_iter().zip(ids) {
            let job = next_job(&mut stream).await;
            assert_eq!(job.workflow_name, name);
            assert_eq!(job.id, id);
        }
        stream.close().await;
    }

    #[tokio::test]
    async fn identities_are_unique() {
        let store = store();
        let mut seen = HashSet::new();
        for i in 0..50 {
            let job = store
                .insert_job(Job::new("bulk").with_parameter("i", i.to_string()))
                .await
                .unwrap();
            let id = job.id.unwrap();
            assert!(!id.as_str().is_empty());
            assert!(seen.insert(id));
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(store.len().unwrap(), 50);
    }

    #[tokio::test]
    async fn shutdown_ends_an_idle_stream_within_one_wait_cycle() {
        // Default options: the follow cursor waits up to 10s per cycle.
        let store = Arc::new(InMemoryJobStore::new());
        let mut stream = store.stream_jobs(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.shutdown();
        assert_ends(&mut stream).await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let store = store();
        let mut first = store.stream_jobs(CancellationToken::new());
        let mut second = store.stream_jobs(CancellationToken::new());

        store.shutdown();
        store.shutdown();
        store.shutdown();

        assert_ends(&mut first).await;
        assert_ends(&mut second).await;

        // Streams requested after shutdown end straight away.
        let mut late = store.stream_jobs(CancellationToken::new());
        assert_ends(&mut late).await;

        // Inserts keep working; shutdown only affects streams.
        let after = store.insert_job(Job::new("after")).await.unwrap();

        // A stream opened now drains what is stored, then ends.
        let mut later = store.stream_jobs(CancellationToken::new());
        assert_eq!(next_job(&mut later).await, after);
        assert_ends(&mut later).await;
    }

    #[tokio::test]
    async fn shutdown_delivers_jobs_already_available_then_ends() {
        let store = store();
        for i in 0..5 {
            store.insert_job(Job::new(format!("j{i}"))).await.unwrap();
        }

        let mut stream = store.stream_jobs(CancellationToken::new());
        assert_eq!(next_job(&mut stream).await.workflow_name, "j0");

        store.shutdown();
        let mut rest = Vec::new();
        while let Some(item) = timeout(WAIT_CYCLE, stream.recv())
            .await
            .expect("stream did not end within one wait cycle")
        {
            rest.push(item.unwrap().workflow_name);
        }
        assert_eq!(rest, ["j1", "j2", "j3", "j4"]);
    }

    #[tokio::test]
    async fn shutdown_delivers_jobs_appended_while_the_stream_waited() {
        let store = store();
        let mut stream = store.stream_jobs(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Appended and shut down before the follow task wakes up.
        let job = store.insert_job(Job::new("last-call")).await.unwrap();
        store.shutdown();

        assert_eq!(next_job(&mut stream).await, job);
        assert_ends(&mut stream).await;
    }

    #[tokio::test]
    async fn jobs_inserted_while_streaming_are_delivered() {
        let store = store();
        let mut stream = store.stream_jobs(CancellationToken::new());

        let producer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                store.insert_job(Job::new("late")).await.unwrap()
            })
        };

        let job = next_job(&mut stream).await;
        let inserted = producer.await.unwrap();
        assert_eq!(job, inserted);
        stream.close().await;
    }

    #[tokio::test]
    async fn beginning_redelivers_history_on_every_stream_start() {
        let store = store();
        let inserted = store.insert_job(Job::new("old")).await.unwrap();

        for _ in 0..2 {
            let mut stream = store.stream_jobs(CancellationToken::new());
            assert_eq!(next_job(&mut stream).await, inserted);
            stream.close().await;
        }
    }

    #[tokio::test]
    async fn latest_start_only_delivers_new_jobs() {
        let store = Arc::new(
            InMemoryJobStore::new()
                .with_stream_options(fast_options().with_start(StreamStart::Latest)),
        );
        store.insert_job(Job::new("old")).await.unwrap();

        let mut stream = store.stream_jobs(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = store.insert_job(Job::new("new")).await.unwrap();

        assert_eq!(next_job(&mut stream).await, fresh);
        stream.close().await;
    }

    #[tokio::test]
    async fn latest_start_on_empty_store_delivers_everything() {
        let store = Arc::new(
            InMemoryJobStore::new()
                .with_stream_options(fast_options().with_start(StreamStart::Latest)),
        );
        let mut stream = store.stream_jobs(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = store.insert_job(Job::new("first")).await.unwrap();
        assert_eq!(next_job(&mut stream).await, first);
        stream.close().await;
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped_and_counted() {
        let store = store();
        store
            .append_record(doc! { "input_parameters": "not-a-list" })
            .unwrap();
        let good = store.insert_job(Job::new("good")).await.unwrap();

        let mut stream = store.stream_jobs(CancellationToken::new());
        assert_eq!(next_job(&mut stream).await, good);
        assert_eq!(stream.skipped(), 1);
        stream.close().await;
    }

    #[tokio::test]
    async fn scope_cancellation_stops_only_that_stream() {
        let store = store();
        let scope = CancellationToken::new();
        let mut scoped = store.stream_jobs(scope.clone());
        let mut other = store.stream_jobs(CancellationToken::new());

        scope.cancel();
        assert_ends(&mut scoped).await;

        let job = store.insert_job(Job::new("still-flowing")).await.unwrap();
        assert_eq!(next_job(&mut other).await, job);
        other.close().await;
    }

    #[tokio::test]
    async fn close_waits_for_the_follow_task() {
        let store = store();
        store.insert_job(Job::new("unread")).await.unwrap();
        store.insert_job(Job::new("unread")).await.unwrap();

        // The task is blocked handing off records nobody reads.
        let stream = store.stream_jobs(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        timeout(WAIT_CYCLE, stream.close())
            .await
            .expect("close did not return");
    }

    #[tokio::test]
    async fn stream_trait_yields_items_then_completes() {
        let store = store();
        store.insert_job(Job::new("a")).await.unwrap();
        store.insert_job(Job::new("b")).await.unwrap();

        let stream = store.stream_jobs(CancellationToken::new());
        let names: Vec<String> = stream
            .take(2)
            .map(|item| item.unwrap().workflow_name)
            .collect()
            .await;
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn relaxed_policy_decodes_the_same_jobs() {
        let store = Arc::new(
            InMemoryJobStore::new()
                .with_decode_policy(DecodePolicy::Relaxed)
                .with_stream_options(fast_options()),
        );
        let inserted = store
            .insert_job(Job::new("deploy").with_parameter("version", "1.2.3"))
            .await
            .unwrap();

        let mut stream = store.stream_jobs(CancellationToken::new());
        assert_eq!(next_job(&mut stream).await, inserted);
        stream.close().await;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn streamed_jobs_match_inserted_jobs(
            jobs in proptest::collection::vec(
                ("[a-z]{1,8}", proptest::collection::vec(("[a-z]{0,4}", "[ -~]{0,8}"), 0..4)),
                1..8,
            )
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (inserted, streamed) = runtime.block_on(async {
                let store = store();
                let mut inserted = Vec::new();
                for (name, params) in &jobs {
                    let job = Job::new(name.as_str()).with_parameters(
                        params.iter().map(|(n, v)| InputParameter::new(n.as_str(), v.as_str())),
                    );
                    inserted.push(store.insert_job(job).await.unwrap());
                }

                let mut stream = store.stream_jobs(CancellationToken::new());
                let mut streamed = Vec::new();
                for _ in 0..inserted.len() {
                    streamed.push(next_job(&mut stream).await);
                }
                stream.close().await;
                (inserted, streamed)
            });

            prop_assert_eq!(inserted, streamed);
        }
    }
}
