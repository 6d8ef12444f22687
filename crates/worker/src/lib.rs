//! Worker-side wiring: consume the job feed until shutdown.

pub mod shutdown;

use tokio_stream::StreamExt;
use tracing::info;

use workflows_infra::{JobStream, StreamError};

/// Consume a job stream until it ends, logging every job.
///
/// Returns the number of jobs received, or the terminal stream error.
pub async fn consume(mut stream: JobStream) -> Result<u64, StreamError> {
    let mut received = 0;

    while let Some(item) = stream.next().await {
        let job = item?;
        received += 1;
        info!(
            job_id = ?job.id,
            workflow_name = %job.workflow_name,
            input_parameters = job.input_parameters.len(),
            "job received"
        );
    }

    info!(received, skipped = stream.skipped(), "job stream ended");
    Ok(received)
}
