//! Provider registry: provider/model id → adapter + declared capabilities.
//!
//! Loaded once at startup from a TOML catalog and immutable afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use imagine_types::{GenerationRequest, ModelDescriptor, ProviderDescriptor};
use serde::Deserialize;
use thiserror::Error;

use crate::error::EngineError;
use crate::providers::http::HttpClient;
use crate::providers::retry::RetryPolicy;
use crate::providers::{self, ImageProvider};
use crate::secrets::SecretStore;

const BUILTIN_CATALOG: &str = include_str!("catalog.toml");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to parse catalog: {0}")]
    Parse(String),

    #[error("provider '{0}' is declared more than once")]
    DuplicateProvider(String),

    #[error("model '{model_id}' is declared more than once for provider '{provider_id}'")]
    DuplicateModel {
        provider_id: String,
        model_id: String,
    },
}

/// The declarative half of the registry: descriptors only, no adapters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub providers: Vec<ProviderDescriptor>,
}

impl Catalog {
    /// The catalog shipped with the crate.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog =
            toml::from_str(source).map_err(|e| CatalogError::Parse(e.to_string()))?;
        catalog.check_unique()?;
        Ok(catalog)
    }

    fn check_unique(&self) -> Result<(), CatalogError> {
        let mut providers = HashSet::new();
        for provider in &self.providers {
            if !providers.insert(provider.provider_id.as_str()) {
                return Err(CatalogError::DuplicateProvider(provider.provider_id.clone()));
            }
            let mut models = HashSet::new();
            for model in &provider.models {
                if !models.insert(model.model_id.as_str()) {
                    return Err(CatalogError::DuplicateModel {
                        provider_id: provider.provider_id.clone(),
                        model_id: model.model_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A registry entry: the descriptor plus its adapter.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub descriptor: ProviderDescriptor,
    pub adapter: Arc<dyn ImageProvider>,
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// A request resolved against the registry and cleared for admission.
#[derive(Clone)]
pub struct ResolvedModel {
    pub adapter: Arc<dyn ImageProvider>,
    pub model: ModelDescriptor,
}

/// Maps provider ids to registered adapters.
///
/// Providers must be registered before the registry is cloned (e.g. handed
/// to a [`JobManager`]); after that the map is shared read-only.
///
/// [`JobManager`]: crate::runtime::orchestrator::JobManager
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<HashMap<String, RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per catalog entry.
    pub fn from_catalog(
        catalog: Catalog,
        secrets: Arc<dyn SecretStore>,
        http: HttpClient,
        retry: RetryPolicy,
    ) -> Self {
        let mut registry = Self::new();
        for descriptor in catalog.providers {
            let adapter = providers::build(&descriptor, Arc::clone(&secrets), http.clone(), retry);
            registry.register(descriptor, adapter);
        }
        registry
    }

    /// Register (or replace) a provider.
    ///
    /// # Panics (debug builds)
    ///
    /// Panics if this registry has already been cloned, which would leave the
    /// other clones without the new provider.
    pub fn register(&mut self, descriptor: ProviderDescriptor, adapter: Arc<dyn ImageProvider>) {
        debug_assert!(
            Arc::strong_count(&self.providers) == 1,
            "register called after ProviderRegistry was cloned"
        );
        let key = descriptor.provider_id.clone();
        Arc::make_mut(&mut self.providers).insert(
            key,
            RegisteredProvider {
                descriptor,
                adapter,
            },
        );
    }

    pub fn get(&self, provider_id: &str) -> Option<&RegisteredProvider> {
        self.providers.get(provider_id)
    }

    /// Descriptors sorted by provider id.
    pub fn descriptors(&self) -> Vec<&ProviderDescriptor> {
        let mut descriptors: Vec<_> = self.providers.values().map(|p| &p.descriptor).collect();
        descriptors.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        descriptors
    }

    pub fn resolve(&self, provider_id: &str, model_id: &str) -> Result<ResolvedModel, EngineError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| EngineError::UnknownProvider {
                provider_id: provider_id.to_owned(),
            })?;
        let model = provider
            .descriptor
            .model(model_id)
            .ok_or_else(|| EngineError::UnknownModel {
                provider_id: provider_id.to_owned(),
                model_id: model_id.to_owned(),
            })?;
        Ok(ResolvedModel {
            adapter: Arc::clone(&provider.adapter),
            model: model.clone(),
        })
    }

    /// Pre-submission validation: request shape, then provider/model lookup,
    /// then the model's declared capabilities.
    pub fn validate(&self, request: &GenerationRequest) -> Result<ResolvedModel, EngineError> {
        request.validate()?;
        let resolved = self.resolve(&request.provider_id, &request.model_id)?;
        resolved.model.check(request)?;
        Ok(resolved)
    }
}
