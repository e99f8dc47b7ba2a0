use imagine_types::{JobError, JobId};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned synchronously by the [`JobManager`] API.
///
/// Failures that happen after a job was accepted are never returned here;
/// they are recorded on the job itself and surfaced through its snapshot.
///
/// [`JobManager`]: crate::runtime::orchestrator::JobManager
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed request or capability violation detected before admission.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown provider: {provider_id}")]
    UnknownProvider { provider_id: String },

    #[error("unknown model '{model_id}' for provider '{provider_id}'")]
    UnknownModel {
        provider_id: String,
        model_id: String,
    },

    /// The referenced job does not exist (or was acknowledged and evicted).
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    /// The scheduler's command channel is saturated.
    #[error("submission queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The scheduler loop has stopped.
    #[error("job manager shut down")]
    Shutdown,

    /// A timed wait exceeded its deadline.
    #[error("wait for job {job_id} timed out")]
    WaitTimeout { job_id: JobId },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<JobError> for EngineError {
    fn from(err: JobError) -> Self {
        EngineError::InvalidRequest(err.message)
    }
}
