use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Normalized failure categories surfaced on `Failed` / `TimedOut` jobs.
///
/// Provider-specific error shapes never leave the adapter; every failure is
/// mapped onto one of these kinds first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request or capability violation. Never retried.
    InvalidRequest,
    /// Missing or rejected credential. Never retried.
    AuthError,
    /// Provider throttling.
    RateLimited,
    /// Network or transport-level timeout.
    Transient,
    /// Generic provider-side failure.
    ProviderFault,
    /// Non-fatal: attached to a `Completed` job with fewer results than requested.
    PartialFailure,
    /// Wall-clock deadline elapsed while running.
    TimeoutExceeded,
    /// The result sink failed to persist a finished artifact.
    StorageError,
}

impl ErrorKind {
    /// Returns `true` for kinds an adapter may retry internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Transient | ErrorKind::ProviderFault
        )
    }
}

/// Structured `{kind, message}` pair reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }
}
