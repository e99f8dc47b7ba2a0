use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use imagine_types::{
    CancelOutcome, ErrorKind, GenerationRequest, JobError, JobEvent, JobId, JobSnapshot, JobStatus,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::ProviderRegistry;
use crate::runtime::admission::{ConcurrencyGate, Permit};
use crate::runtime::storage::{JobTable, Outcome};
use crate::runtime::worker::{QueuedJob, WorkerContext};
use crate::sink::ResultSink;

/// Commands sent to the scheduler loop.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Append a validated job to the FIFO queue.
    Enqueue(QueuedJob),
}

/// The job manager.
///
/// Accepts generation requests, queues them FIFO behind a global
/// [`ConcurrencyGate`], runs one worker task per admitted job and records
/// every job's lifecycle in a [`JobTable`].
///
/// # Usage
///
/// ```rust,ignore
/// let manager = JobManager::start(EngineConfig::default(), registry, sink)?;
/// let job_id = manager.submit(request).await?;
/// let snapshot = manager.wait(job_id, Duration::from_secs(300)).await?;
/// ```
#[derive(Clone, Debug)]
pub struct JobManager {
    table: JobTable,
    registry: ProviderRegistry,
    command_tx: mpsc::Sender<SchedulerCommand>,
    gate: ConcurrencyGate,
    config: EngineConfig,
}

impl JobManager {
    /// Start the job manager.
    ///
    /// Validates `config`, spawns the scheduler loop and returns a cloneable
    /// handle.  Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        registry: ProviderRegistry,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(config.queue_capacity);
        let table = JobTable::new(config.queue_capacity.max(config.max_concurrent) * 2);
        let gate = ConcurrencyGate::new(config.max_concurrent);
        let ctx = WorkerContext {
            table: table.clone(),
            sink,
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        };

        tokio::spawn(Self::run_loop(command_rx, gate.clone(), ctx));
        info!(
            max_concurrent = config.max_concurrent,
            timeout_seconds = config.timeout_seconds,
            queue_capacity = config.queue_capacity,
            "job manager started"
        );

        Ok(Self {
            table,
            registry,
            command_tx,
            gate,
            config,
        })
    }

    /// Scheduler loop: the only owner of the FIFO queue.
    ///
    /// With an empty queue it waits for submissions only; otherwise it waits
    /// for whichever comes first, a free slot or another submission.
    async fn run_loop(
        mut rx: mpsc::Receiver<SchedulerCommand>,
        gate: ConcurrencyGate,
        ctx: WorkerContext,
    ) {
        let mut queue: VecDeque<QueuedJob> = VecDeque::new();
        loop {
            if queue.is_empty() {
                match rx.recv().await {
                    Some(SchedulerCommand::Enqueue(job)) => queue.push_back(job),
                    None => break,
                }
                continue;
            }

            tokio::select! {
                biased;
                permit = gate.acquire() => {
                    let Ok(permit) = permit else { break };
                    if let Some(job) = queue.pop_front() {
                        Self::dispatch(job, permit, &ctx).await;
                    }
                }
                cmd = rx.recv() => match cmd {
                    Some(SchedulerCommand::Enqueue(job)) => queue.push_back(job),
                    None => break,
                },
            }
        }

        for job in queue {
            ctx.table.finish(job.id, Outcome::cancelled()).await;
        }
        debug!("scheduler loop stopped");
    }

    /// Admit the dequeued job and hand it, with its slot, to a supervised
    /// worker.  A job that was cancelled while queued just returns the slot.
    async fn dispatch(job: QueuedJob, permit: Permit, ctx: &WorkerContext) {
        let id = job.id;
        if !ctx.table.transition(id, JobStatus::Admitted).await {
            debug!(job_id = %id, "dequeued job is no longer pending; slot released");
            return;
        }
        info!(
            job_id = %id,
            provider = %job.request.provider_id,
            model = %job.request.model_id,
            "job admitted"
        );

        let worker = tokio::spawn(ctx.clone().run(job));
        let table = ctx.table.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.await {
                let message = if err.is_panic() {
                    "worker panicked"
                } else {
                    "worker aborted"
                };
                error!(job_id = %id, error = %err, "{message}");
                table
                    .finish(
                        id,
                        Outcome::failed(JobError::new(ErrorKind::ProviderFault, message)),
                    )
                    .await;
            }
            // The slot is released only after the terminal write.
            drop(permit);
        });
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Validate and enqueue a request.
    ///
    /// Returns the new [`JobId`] before any provider work starts.  Malformed
    /// requests, unknown providers/models and capability violations are
    /// rejected here and no job is created.
    pub async fn submit(&self, request: GenerationRequest) -> Result<JobId, EngineError> {
        let resolved = self.registry.validate(&request)?;
        let request = Arc::new(request);
        let capacity = self.config.queue_capacity;
        let id = self
            .table
            .insert(Arc::clone(&request), capacity)
            .await
            .ok_or(EngineError::QueueFull { capacity })?;

        let job = QueuedJob {
            id,
            adapter: resolved.adapter,
            model: resolved.model,
            request: Arc::clone(&request),
        };
        if let Err(e) = self.command_tx.try_send(SchedulerCommand::Enqueue(job)) {
            self.table.remove(id).await;
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => EngineError::QueueFull { capacity },
                mpsc::error::TrySendError::Closed(_) => EngineError::Shutdown,
            });
        }

        info!(
            job_id = %id,
            provider = %request.provider_id,
            model = %request.model_id,
            batch_size = request.batch_size,
            "job submitted"
        );
        Ok(id)
    }

    pub async fn get_status(&self, id: JobId) -> Result<JobSnapshot, EngineError> {
        self.table
            .snapshot(id)
            .await
            .ok_or(EngineError::JobNotFound { job_id: id })
    }

    /// Request cancellation.  Idempotent; cancelling a terminal job reports
    /// its current state and changes nothing.
    pub async fn cancel(&self, id: JobId) -> Result<CancelOutcome, EngineError> {
        match self.table.cancel(id).await {
            Some(outcome) => {
                info!(
                    job_id = %id,
                    previous = %outcome.previous,
                    status = %outcome.current,
                    "cancellation requested"
                );
                Ok(outcome)
            }
            None => {
                warn!(job_id = %id, "cancel: job not found");
                Err(EngineError::JobNotFound { job_id: id })
            }
        }
    }

    /// Terminal notifications for every job.
    ///
    /// Each terminal state is broadcast once, but the channel is bounded: a
    /// receiver that falls behind gets `RecvError::Lagged` and misses the
    /// overwritten events.  [`Self::wait`] and [`Self::get_status`] read the
    /// job table and never lose a terminal state.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.table.subscribe()
    }

    /// Wait until the job is terminal and return its final snapshot.
    pub async fn wait(&self, id: JobId, timeout: Duration) -> Result<JobSnapshot, EngineError> {
        let mut status_rx = self
            .table
            .status_rx(id)
            .await
            .ok_or(EngineError::JobNotFound { job_id: id })?;

        let terminal = status_rx.wait_for(JobStatus::is_terminal);
        let reached = match tokio::time::timeout(timeout, terminal).await {
            Ok(result) => result.is_ok(),
            Err(_) => return Err(EngineError::WaitTimeout { job_id: id }),
        };
        if !reached {
            // Status feed closed: the record was evicted meanwhile.
            return Err(EngineError::JobNotFound { job_id: id });
        }
        self.get_status(id).await
    }

    /// Evict a terminal job, returning its final snapshot.
    ///
    /// Returns `Ok(None)` while the job is still in flight; it is not evicted.
    pub async fn acknowledge(&self, id: JobId) -> Result<Option<JobSnapshot>, EngineError> {
        match self.table.acknowledge(id).await {
            Some(Ok(snapshot)) => Ok(Some(snapshot)),
            Some(Err(status)) => {
                debug!(job_id = %id, %status, "acknowledge ignored for in-flight job");
                Ok(None)
            }
            None => Err(EngineError::JobNotFound { job_id: id }),
        }
    }

    /// All tracked jobs in submission order.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        self.table.list().await
    }

    pub async fn running_count(&self) -> usize {
        self.table.running_count().await
    }

    /// Free concurrency slots right now.
    pub fn available_slots(&self) -> usize {
        self.gate.available()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
