//! The worker side of the job dispatch protocol.

use std::io::{BufReader, BufWriter, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::time::Duration;

use crate::error::{RPolarsErr, RResult, Rctx, WithRctx};
use crate::handle::panic_message;
use crate::host::HostEvaluator;
use crate::transfer::{ColumnPayload, discard_column, stage_column, unstage_column};

use super::protocol::{
    Handshake, Job, JobOutcome, JobOutput, JobResponse, JobRequest, try_read_message,
    write_message,
};
use super::rendezvous::{OneShotListener, connect};

/// How long a worker waits for the pool to connect to its job channel.
const JOB_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker entry point: announce on `rendezvous`, then serve jobs until the
/// pool closes the job channel.
pub fn run_worker(rendezvous: &Path, host: &dyn HostEvaluator) -> RResult<()> {
    let dir = rendezvous.parent().unwrap_or_else(|| Path::new("."));
    let jobs = OneShotListener::bind(dir, "job")?;

    let mut rdv = connect(rendezvous)?;
    write_message(
        &mut rdv,
        &Handshake {
            pid: std::process::id(),
            job_channel: jobs.path().to_string_lossy().into_owned(),
        },
    )
    .when("announcing to the pool")?;
    drop(rdv);

    let stream = jobs.accept_within(JOB_CHANNEL_TIMEOUT, || Ok(()))?;
    drop(jobs);
    tracing::info!("Worker {} ready", std::process::id());

    let writer = stream.try_clone()?;
    serve(BufReader::new(stream), BufWriter::new(writer), host)
}

/// Answer requests one at a time until the channel reaches a clean EOF.
pub fn serve<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    host: &dyn HostEvaluator,
) -> RResult<()> {
    while let Some(request) = try_read_message::<_, JobRequest>(&mut reader)? {
        let JobRequest { job_id, job } = request;
        tracing::debug!("Job {} ({})", job_id, job.name());

        let outcome = execute_job(host, job);
        if let Err(err) = &outcome {
            tracing::debug!("Job {} failed:\n{}", job_id, err);
        }
        let response = JobResponse {
            job_id,
            outcome: JobOutcome::from(outcome),
        };
        if let Err(err) = write_message(&mut writer, &response) {
            // The reply never left, so its segment has no reader.
            if let JobOutcome::Ok(JobOutput::Column(payload)) = &response.outcome {
                discard_column(payload);
            }
            return Err(err);
        }
    }
    tracing::info!("Job channel closed, worker {} exiting", std::process::id());
    Ok(())
}

/// Run one job against `host`.
///
/// Column output travels the way the input did: a column that arrived in
/// shared memory is answered through a new segment owned by the reader of
/// the response.
pub fn execute_job(host: &dyn HostEvaluator, job: Job) -> RResult<JobOutput> {
    match &job {
        Job::MapColumn { callable, column } => {
            let input = unstage_column(column, false)?;
            let output = guarded(|| host.call_column(callable, &input)).with_ctx(|| Rctx::EvalError {
                expr: callable.describe(),
                arg: input.to_string(),
            })?;

            let threshold = match column {
                ColumnPayload::Shared(_) => 0,
                ColumnPayload::Inline(_) => usize::MAX,
            };
            let (payload, segment) = stage_column(&output, threshold)?;
            if let Some(segment) = segment {
                segment.hand_off();
            }
            Ok(JobOutput::Column(payload))
        }
        Job::CallScalar { callable, arg } => guarded(|| host.call_scalar(callable, arg))
            .with_ctx(|| Rctx::EvalError {
                expr: callable.describe(),
                arg: arg.to_string(),
            })
            .map(JobOutput::Scalar),
    }
}

/// Run a host callback, turning a panic into a root `Panic` frame.
fn guarded<T>(call: impl FnOnce() -> RResult<T>) -> RResult<T> {
    catch_unwind(AssertUnwindSafe(call))
        .unwrap_or_else(|payload| Err(RPolarsErr::new(Rctx::Panic(panic_message(&*payload)))))
}
