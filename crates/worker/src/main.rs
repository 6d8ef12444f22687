use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use workflows_infra::{connect, EnvConfig, JobStore, MongoJobStore, StoreSettings};
use workflows_worker::{consume, shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    workflows_observability::init();

    let settings =
        StoreSettings::from_reader(&EnvConfig::default()).context("invalid configuration")?;
    tracing::info!(
        database = %settings.database,
        stream_start = %settings.stream.start,
        "starting workflows worker"
    );

    let client = connect(&settings.mongo)
        .await
        .context("failed to connect to the job store")?;
    let store = Arc::new(MongoJobStore::from_settings(client, &settings));
    store
        .ensure_collection(settings.jobs_collection_size)
        .await
        .context("failed to prepare the jobs collection")?;

    let shutdown = shutdown::install_shutdown_handler();
    // Stopped via store shutdown, so jobs already fetched are still consumed.
    let mut consumer = tokio::spawn(consume(store.stream_jobs(CancellationToken::new())));

    let outcome = tokio::select! {
        _ = shutdown.cancelled() => {
            store.shutdown();
            (&mut consumer).await
        }
        outcome = &mut consumer => outcome,
    };

    let received = outcome
        .context("job consumer panicked")?
        .context("job stream failed")?;
    tracing::info!(received, "worker stopped");
    Ok(())
}
