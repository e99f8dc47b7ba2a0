//! Per-job worker: drives one admitted job from `Running` to a terminal state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use imagine_types::{
    ArtifactMetadata, ErrorKind, GenerationRequest, JobError, JobId, JobStatus, ModelDescriptor,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::providers::{
    GenerationOutput, ImageProvider, PollStatus, ProviderError, ProviderHandle, ProviderRequest,
    SubmitOutcome,
};
use crate::runtime::storage::{JobTable, Outcome};
use crate::sink::ResultSink;

/// Upper bound for the best-effort provider-side cancel.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// A job handed from the scheduler to a worker.
#[derive(Clone)]
pub struct QueuedJob {
    pub id: JobId,
    pub adapter: Arc<dyn ImageProvider>,
    pub model: ModelDescriptor,
    pub request: Arc<GenerationRequest>,
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("provider", &self.adapter.provider_id())
            .field("model", &self.model.model_id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Expired,
}

enum Stop {
    Interrupted(Interrupt),
    Failed(ProviderError),
}

/// Everything a worker needs besides the job itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub table: JobTable,
    pub sink: Arc<dyn ResultSink>,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WorkerContext {
    pub async fn run(self, job: QueuedJob) {
        let id = job.id;
        let Some(mut cancel_rx) = self.table.cancel_rx(id).await else {
            return;
        };
        if !self.table.transition(id, JobStatus::Running).await {
            debug!(job_id = %id, "job left Admitted before its worker started");
            return;
        }
        // The deadline counts from Running; queueing time is free.
        let deadline = Instant::now() + self.timeout;
        info!(
            job_id = %id,
            provider = %job.request.provider_id,
            model = %job.request.model_id,
            "job running"
        );

        let outcome = self.drive(&job, &mut cancel_rx, deadline).await;
        let status = outcome.status;
        if self.table.finish(id, outcome).await {
            info!(job_id = %id, %status, "job finished");
        } else {
            debug!(job_id = %id, %status, "job already terminal; late outcome discarded");
        }
    }

    async fn drive(
        &self,
        job: &QueuedJob,
        cancel_rx: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Outcome {
        let request = ProviderRequest {
            job_id: job.id,
            request: &job.request,
            model: &job.model,
        };
        let submitted = match guard(job.adapter.submit(request), cancel_rx, deadline).await {
            Ok(Ok(submitted)) => submitted,
            Ok(Err(err)) => return Outcome::failed(err.into()),
            Err(interrupt) => return self.interrupted(job, None, interrupt).await,
        };

        let output = match submitted {
            SubmitOutcome::Immediate(output) => output,
            SubmitOutcome::Handle(handle) => {
                debug!(job_id = %job.id, request_id = %handle.request_id, "provider accepted job");
                self.table.set_provider_handle(job.id, handle.clone()).await;
                match self.poll_until_done(job, &handle, cancel_rx, deadline).await {
                    Ok(output) => output,
                    Err(Stop::Failed(err)) => return Outcome::failed(err.into()),
                    Err(Stop::Interrupted(interrupt)) => {
                        return self.interrupted(job, Some(&handle), interrupt).await;
                    }
                }
            }
        };

        // Generation is over, so an interrupt here has nothing to cancel upstream.
        match guard(self.store_results(job, output), cancel_rx, deadline).await {
            Ok(outcome) => outcome,
            Err(interrupt) => self.interrupted(job, None, interrupt).await,
        }
    }

    async fn poll_until_done(
        &self,
        job: &QueuedJob,
        handle: &ProviderHandle,
        cancel_rx: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<GenerationOutput, Stop> {
        let mut polls = 0u32;
        loop {
            guard(tokio::time::sleep(self.poll_interval), cancel_rx, deadline)
                .await
                .map_err(Stop::Interrupted)?;
            let status = guard(job.adapter.poll(handle), cancel_rx, deadline)
                .await
                .map_err(Stop::Interrupted)?
                .map_err(Stop::Failed)?;
            polls += 1;
            debug!(job_id = %job.id, request_id = %handle.request_id, polls, "polled provider");
            match status {
                PollStatus::Pending => continue,
                PollStatus::Ready(output) | PollStatus::Partial(output) => return Ok(output),
                PollStatus::Failed(err) => return Err(Stop::Failed(err)),
            }
        }
    }

    async fn interrupted(
        &self,
        job: &QueuedJob,
        handle: Option<&ProviderHandle>,
        interrupt: Interrupt,
    ) -> Outcome {
        if let Some(handle) = handle {
            if tokio::time::timeout(CANCEL_GRACE, job.adapter.cancel(handle))
                .await
                .is_err()
            {
                warn!(job_id = %job.id, request_id = %handle.request_id, "provider cancel timed out");
            }
        }
        match interrupt {
            Interrupt::Cancelled => Outcome::cancelled(),
            Interrupt::Expired => Outcome::timed_out(JobError::new(
                ErrorKind::TimeoutExceeded,
                format!("job exceeded its {}s deadline", self.timeout.as_secs()),
            )),
        }
    }

    async fn store_results(&self, job: &QueuedJob, output: GenerationOutput) -> Outcome {
        let request = &job.request;
        let requested = request.batch_size;
        let produced = output.images.len() as u32;
        if produced == 0 {
            return Outcome::failed(JobError::new(
                ErrorKind::ProviderFault,
                "provider returned no images",
            ));
        }

        let mut results = Vec::with_capacity(output.images.len());
        for (index, image) in output.images.into_iter().enumerate() {
            let metadata = ArtifactMetadata {
                job_id: job.id,
                index: index as u32,
                provider_id: request.provider_id.clone(),
                model_id: request.model_id.clone(),
                prompt: request.prompt.clone(),
                negative_prompt: request.negative_prompt.clone(),
                width: request.width,
                height: request.height,
                seed: image
                    .seed
                    .or_else(|| (!request.wants_random_seed()).then_some(request.seed)),
                nsfw: image.nsfw,
            };
            match self.sink.store(job.id, &image.data, &metadata).await {
                Ok(stored) => results.push(stored),
                Err(err) => {
                    error!(job_id = %job.id, index, error = %err, "failed to store artifact");
                    return Outcome::failed(JobError::new(ErrorKind::StorageError, err.to_string()));
                }
            }
        }

        let missing = output.failed.max(requested.saturating_sub(produced));
        let note = (missing > 0).then(|| {
            JobError::new(
                ErrorKind::PartialFailure,
                format!(
                    "{produced} of {} images generated; {missing} failed",
                    produced + missing
                ),
            )
        });
        Outcome::completed(results, note)
    }
}

/// Race `fut` against the cancel flag and the deadline, preferring the
/// cancel flag, then the deadline.
async fn guard<F: Future>(
    fut: F,
    cancel_rx: &mut watch::Receiver<bool>,
    deadline: Instant,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancelled(cancel_rx) => Err(Interrupt::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupt::Expired),
        out = fut => Ok(out),
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    if cancel_rx.wait_for(|flag| *flag).await.is_err() {
        // Sender gone: the job was evicted, so no cancel can arrive.
        std::future::pending::<()>().await;
    }
}
