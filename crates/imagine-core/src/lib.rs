//! Generation orchestration engine.
//!
//! A [`JobManager`] accepts image generation requests, admits them through a
//! global concurrency gate, drives each one against a remote provider
//! through an [`ImageProvider`] adapter and hands finished artifacts to a
//! [`ResultSink`].

pub mod config;
pub mod error;
pub mod providers;
pub mod registry;
pub mod runtime;
pub mod secrets;
pub mod sink;

pub use config::{ConfigError, EngineConfig};
pub use error::EngineError;
pub use providers::http::HttpClient;
pub use providers::retry::RetryPolicy;
pub use providers::{ImageProvider, ProviderError};
pub use registry::{Catalog, CatalogError, ProviderRegistry};
pub use runtime::orchestrator::JobManager;
pub use secrets::{EnvSecretStore, SecretError, SecretStore, StaticSecretStore};
pub use sink::{FsResultSink, ResultSink, SinkError};
