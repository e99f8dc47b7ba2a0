//! Provider adapters.
//!
//! Each adapter translates the engine's [`GenerationRequest`] into one
//! backing service's API and maps everything that comes back (images,
//! progress, failures) onto the engine's vocabulary.  The job manager only
//! ever talks to the [`ImageProvider`] contract.

pub mod fal;
pub mod http;
pub mod openai;
pub mod openrouter;
pub mod replicate;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imagine_types::{
    ArtifactData, ErrorKind, GenerationRequest, JobError, JobId, ModelDescriptor,
    ProviderDescriptor, ProviderKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::http::HttpClient;
use crate::providers::retry::RetryPolicy;
use crate::secrets::{SecretError, SecretStore};

/// What an adapter receives for a single job.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub job_id: JobId,
    pub request: &'a GenerationRequest,
    pub model: &'a ModelDescriptor,
}

impl ProviderRequest<'_> {
    /// Structural and capability checks every adapter runs before touching
    /// credentials or the network.
    pub fn preflight(&self) -> Result<(), ProviderError> {
        self.request.validate()?;
        self.model.check(self.request)?;
        Ok(())
    }
}

/// Opaque token identifying in-flight work at a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub provider_id: String,
    /// Provider-assigned request / prediction id.
    pub request_id: String,
    /// Adapter-defined routing information (e.g. the app path on Fal).
    pub route: String,
    /// Images asked for at submit time, so a short result polls as `Partial`.
    #[serde(default = "one")]
    pub requested: u32,
}

fn one() -> u32 {
    1
}

/// One rendered image as reported by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub data: ArtifactData,
    pub seed: Option<i64>,
    pub nsfw: Option<bool>,
}

impl GeneratedImage {
    pub fn new(data: ArtifactData) -> Self {
        Self {
            data,
            seed: None,
            nsfw: None,
        }
    }

    /// Inline `data:` URIs become bytes; anything else stays a hosted URL.
    pub fn from_url(url: &str) -> Self {
        let data = match http::decode_data_uri(url) {
            Some((data, mime)) => ArtifactData::Bytes { data, mime },
            None => ArtifactData::Url {
                url: url.to_owned(),
            },
        };
        Self::new(data)
    }
}

/// Images produced for a request, plus how many tiles the provider reported
/// as failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub images: Vec<GeneratedImage>,
    pub failed: u32,
}

impl GenerationOutput {
    /// Map a finished output onto a poll status for a request of `requested`
    /// images.
    pub fn into_status(self, requested: u32) -> PollStatus {
        if self.images.is_empty() {
            PollStatus::Failed(ProviderError::fault("provider returned no images"))
        } else if self.failed > 0 || (self.images.len() as u32) < requested {
            PollStatus::Partial(self)
        } else {
            PollStatus::Ready(self)
        }
    }
}

/// Result of [`ImageProvider::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Work was queued at the provider and must be polled.
    Handle(ProviderHandle),
    /// The provider answered in one round trip.
    Immediate(GenerationOutput),
}

/// Result of [`ImageProvider::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending,
    /// Finished, but with fewer images than requested.
    Partial(GenerationOutput),
    Ready(GenerationOutput),
    /// The provider reports that generation itself failed.
    Failed(ProviderError),
}

/// The contract every provider adapter satisfies.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Start generation.  Capability violations fail with
    /// [`ErrorKind::InvalidRequest`] before any network call.
    async fn submit(&self, request: ProviderRequest<'_>) -> Result<SubmitOutcome, ProviderError>;

    /// Non-blocking status check for work started with [`Self::submit`].
    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, ProviderError>;

    /// Best-effort request to stop work.  Idempotent; ignored once the
    /// provider has finished.
    async fn cancel(&self, handle: &ProviderHandle);

    /// Cheap connectivity and credential probe.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Normalized adapter failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-provided backoff hint (`Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimited, message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderFault, message)
    }
}

impl From<JobError> for ProviderError {
    fn from(err: JobError) -> Self {
        Self::new(err.kind, err.message)
    }
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        JobError::new(err.kind, err.message)
    }
}

impl From<SecretError> for ProviderError {
    fn from(err: SecretError) -> Self {
        ProviderError::auth(err.to_string())
    }
}

/// Construct the adapter for `descriptor.kind`.
pub fn build(
    descriptor: &ProviderDescriptor,
    secrets: Arc<dyn SecretStore>,
    http: HttpClient,
    retry: RetryPolicy,
) -> Arc<dyn ImageProvider> {
    let id = descriptor.provider_id.clone();
    let base_url = descriptor.base_url.clone();
    match descriptor.kind {
        ProviderKind::Fal => Arc::new(fal::FalAdapter::new(id, base_url, http, secrets, retry)),
        ProviderKind::Replicate => Arc::new(replicate::ReplicateAdapter::new(
            id, base_url, http, secrets, retry,
        )),
        ProviderKind::OpenAi => Arc::new(openai::OpenAiAdapter::new(
            id, base_url, http, secrets, retry,
        )),
        ProviderKind::OpenRouter => Arc::new(openrouter::OpenRouterAdapter::new(
            id, base_url, http, secrets, retry,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> GeneratedImage {
        GeneratedImage::new(ArtifactData::Url {
            url: "https://cdn.example/1.png".into(),
        })
    }

    #[test]
    fn empty_output_is_a_provider_fault() {
        let status = GenerationOutput::default().into_status(1);
        assert!(matches!(
            status,
            PollStatus::Failed(ProviderError {
                kind: ErrorKind::ProviderFault,
                ..
            })
        ));
    }

    #[test]
    fn short_output_is_partial() {
        let output = GenerationOutput {
            images: vec![image(), image(), image()],
            failed: 1,
        };
        assert!(matches!(output.into_status(4), PollStatus::Partial(_)));
    }

    #[test]
    fn full_output_is_ready() {
        let output = GenerationOutput {
            images: vec![image()],
            failed: 0,
        };
        assert!(matches!(output.into_status(1), PollStatus::Ready(_)));
    }

    #[test]
    fn missing_secret_maps_to_auth_error() {
        let err: ProviderError = SecretError::MissingCredential {
            provider_id: "fal".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::AuthError);
    }
}
