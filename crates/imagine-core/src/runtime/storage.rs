use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use imagine_types::{
    ArtifactRef, CancelOutcome, GenerationRequest, JobError, JobEvent, JobId, JobSnapshot,
    JobStatus,
};
use tokio::sync::{RwLock, broadcast, watch};

use crate::providers::ProviderHandle;

/// The mutable state of one submitted job.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: JobId,
    pub request: Arc<GenerationRequest>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once an asynchronous provider has accepted the work.
    pub provider_handle: Option<ProviderHandle>,
    pub results: Vec<ArtifactRef>,
    pub error: Option<JobError>,
}

impl GenerationJob {
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            provider_id: self.request.provider_id.clone(),
            model_id: self.request.model_id.clone(),
            status: self.status,
            results: self.results.clone(),
            error: self.error.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            provider_request_id: self.provider_handle.as_ref().map(|h| h.request_id.clone()),
        }
    }
}

/// The terminal write for a job.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: JobStatus,
    pub results: Vec<ArtifactRef>,
    pub error: Option<JobError>,
}

impl Outcome {
    /// `note` carries a non-fatal `PartialFailure`, if any.
    pub fn completed(results: Vec<ArtifactRef>, note: Option<JobError>) -> Self {
        Self {
            status: JobStatus::Completed,
            results,
            error: note,
        }
    }

    pub fn failed(error: JobError) -> Self {
        Self {
            status: JobStatus::Failed,
            results: Vec::new(),
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: JobStatus::Cancelled,
            results: Vec::new(),
            error: None,
        }
    }

    pub fn timed_out(error: JobError) -> Self {
        Self {
            status: JobStatus::TimedOut,
            results: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug)]
struct JobRecord {
    job: GenerationJob,
    /// Submission order.
    seq: u64,
    cancel_tx: watch::Sender<bool>,
    status_tx: watch::Sender<JobStatus>,
}

/// Centralized, thread-safe job table.
///
/// A single `RwLock<HashMap>` guards every record so that status checks and
/// transitions are atomic with respect to each other.  All status writes are
/// validated against [`JobStatus::can_transition_to`]; once a job is terminal
/// nothing about it changes again.
#[derive(Debug, Clone)]
pub struct JobTable {
    inner: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    next_seq: Arc<AtomicU64>,
    events: broadcast::Sender<JobEvent>,
}

impl JobTable {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Insert a `Pending` record unless `max_pending` jobs are already queued.
    ///
    /// Returns `None` when the queue is full.
    pub async fn insert(&self, request: Arc<GenerationRequest>, max_pending: usize) -> Option<JobId> {
        let mut guard = self.inner.write().await;
        let pending = guard
            .values()
            .filter(|r| r.job.status == JobStatus::Pending)
            .count();
        if pending >= max_pending {
            return None;
        }

        let id = JobId::new();
        let (cancel_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(JobStatus::Pending);
        let record = JobRecord {
            job: GenerationJob {
                id,
                request,
                status: JobStatus::Pending,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
                provider_handle: None,
                results: Vec::new(),
                error: None,
            },
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            cancel_tx,
            status_tx,
        };
        guard.insert(id, record);
        Some(id)
    }

    /// Drop a record that never reached the scheduler.
    pub async fn remove(&self, id: JobId) {
        self.inner.write().await.remove(&id);
    }

    pub async fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        self.inner.read().await.get(&id).map(|r| r.job.snapshot())
    }

    /// All tracked jobs in submission order.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let guard = self.inner.read().await;
        let mut records: Vec<&JobRecord> = guard.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.job.snapshot()).collect()
    }

    /// Apply a non-terminal transition.  Returns `false` if the edge is not
    /// allowed from the job's current state.
    pub async fn transition(&self, id: JobId, to: JobStatus) -> bool {
        debug_assert!(!to.is_terminal(), "terminal writes go through finish");
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(&id) else {
            return false;
        };
        if !record.job.status.can_transition_to(to) {
            return false;
        }
        record.job.status = to;
        if to == JobStatus::Running {
            record.job.started_at = Some(Utc::now());
        }
        record.status_tx.send_replace(to);
        true
    }

    pub async fn set_provider_handle(&self, id: JobId, handle: ProviderHandle) {
        if let Some(record) = self.inner.write().await.get_mut(&id) {
            record.job.provider_handle = Some(handle);
        }
    }

    /// Write the terminal state.  Exactly one caller wins; later calls
    /// return `false` and leave the record untouched.
    ///
    /// The winner also publishes the [`JobEvent::Terminal`] notification.
    pub async fn finish(&self, id: JobId, outcome: Outcome) -> bool {
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(&id) else {
            return false;
        };
        Self::apply_terminal(record, outcome, &self.events)
    }

    fn apply_terminal(
        record: &mut JobRecord,
        outcome: Outcome,
        events: &broadcast::Sender<JobEvent>,
    ) -> bool {
        debug_assert!(outcome.status.is_terminal());
        if !record.job.status.can_transition_to(outcome.status) {
            return false;
        }
        record.job.status = outcome.status;
        record.job.results = outcome.results;
        record.job.error = outcome.error;
        record.job.finished_at = Some(Utc::now());
        record.status_tx.send_replace(outcome.status);
        // No subscribers is fine.
        let _ = events.send(JobEvent::Terminal(record.job.snapshot()));
        true
    }

    /// Request cancellation.
    ///
    /// Queued jobs are cancelled on the spot.  A running job only has its
    /// cancel flag raised; its worker performs the transition.  Terminal
    /// jobs are left alone.
    pub async fn cancel(&self, id: JobId) -> Option<CancelOutcome> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(&id)?;
        let previous = record.job.status;
        match previous {
            JobStatus::Pending | JobStatus::Admitted => {
                Self::apply_terminal(record, Outcome::cancelled(), &self.events);
            }
            JobStatus::Running => {
                record.cancel_tx.send_replace(true);
            }
            _ => {}
        }
        Some(CancelOutcome {
            previous,
            current: record.job.status,
        })
    }

    pub async fn cancel_rx(&self, id: JobId) -> Option<watch::Receiver<bool>> {
        self.inner
            .read()
            .await
            .get(&id)
            .map(|r| r.cancel_tx.subscribe())
    }

    pub async fn status_rx(&self, id: JobId) -> Option<watch::Receiver<JobStatus>> {
        self.inner
            .read()
            .await
            .get(&id)
            .map(|r| r.status_tx.subscribe())
    }

    /// Evict a terminal job and return its final snapshot.
    ///
    /// `Some(Err(status))` means the job exists but is not terminal yet.
    pub async fn acknowledge(&self, id: JobId) -> Option<Result<JobSnapshot, JobStatus>> {
        let mut guard = self.inner.write().await;
        let status = guard.get(&id)?.job.status;
        if !status.is_terminal() {
            return Some(Err(status));
        }
        guard.remove(&id).map(|r| Ok(r.job.snapshot()))
    }

    pub async fn running_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .filter(|r| r.job.status == JobStatus::Running)
            .count()
    }

    /// Bounded feed of terminal events; lagging receivers lose the oldest.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
