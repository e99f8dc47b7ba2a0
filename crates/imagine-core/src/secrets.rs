//! Per-provider credentials, fetched on demand.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("missing credential for provider '{provider_id}'")]
    MissingCredential { provider_id: String },

    #[error("secret store failure for provider '{provider_id}': {message}")]
    Backend {
        provider_id: String,
        message: String,
    },
}

/// Source of API tokens.  Adapters ask for a credential on every submit so
/// that rotated keys are picked up without a restart.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn credential(&self, provider_id: &str) -> Result<String, SecretError>;
}

/// Reads tokens from the process environment.
///
/// `IMAGINE_<PROVIDER>_KEY` wins when set; otherwise the provider's
/// conventional variable (`FAL_API_KEY`, `REPLICATE_API_TOKEN`, ...) is used.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    overrides: HashMap<String, String>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `provider_id`'s token from `var` instead of the default names.
    pub fn with_var(mut self, provider_id: impl Into<String>, var: impl Into<String>) -> Self {
        self.overrides.insert(provider_id.into(), var.into());
        self
    }

    fn candidates(&self, provider_id: &str) -> Vec<String> {
        if let Some(var) = self.overrides.get(provider_id) {
            return vec![var.clone()];
        }
        let mut vars = vec![format!(
            "IMAGINE_{}_KEY",
            provider_id.to_ascii_uppercase().replace(['-', '.'], "_")
        )];
        let conventional = match provider_id {
            "fal" => Some("FAL_API_KEY"),
            "replicate" => Some("REPLICATE_API_TOKEN"),
            "openai" => Some("OPENAI_API_KEY"),
            "openrouter" => Some("OPENROUTER_API_KEY"),
            _ => None,
        };
        vars.extend(conventional.map(str::to_owned));
        vars
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn credential(&self, provider_id: &str) -> Result<String, SecretError> {
        self.candidates(provider_id)
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|value| value.trim().to_owned())
            .find(|value| !value.is_empty())
            .ok_or_else(|| SecretError::MissingCredential {
                provider_id: provider_id.to_owned(),
            })
    }
}

/// Fixed in-memory tokens, for embedders that manage secrets themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    tokens: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(provider_id.into(), token.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn credential(&self, provider_id: &str) -> Result<String, SecretError> {
        self.tokens
            .get(provider_id)
            .filter(|token| !token.is_empty())
            .cloned()
            .ok_or_else(|| SecretError::MissingCredential {
                provider_id: provider_id.to_owned(),
            })
    }
}
