//! Shared vocabulary for the imagine generation engine.
//!
//! Everything here is plain data: requests, job snapshots, provider
//! capability descriptors and the error taxonomy surfaced to callers.
//! Runtime behaviour lives in `imagine-core`.

pub mod artifact;
pub mod error;
pub mod job;
pub mod provider;
pub mod request;

pub use artifact::{Artifact, ArtifactData, ArtifactMetadata, ArtifactRef};
pub use error::{ErrorKind, JobError};
pub use job::{CancelOutcome, JobEvent, JobId, JobSnapshot, JobStatus};
pub use provider::{ModelDescriptor, ProviderDescriptor, ProviderKind};
pub use request::GenerationRequest;
