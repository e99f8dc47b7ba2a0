use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::JobError;
use crate::request::GenerationRequest;

/// The closed set of adapter implementations the engine knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum ProviderKind {
    #[strum(serialize = "fal")]
    #[serde(rename = "fal")]
    Fal,
    #[strum(serialize = "replicate")]
    #[serde(rename = "replicate")]
    Replicate,
    #[strum(serialize = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    #[strum(serialize = "openrouter")]
    #[serde(rename = "openrouter")]
    OpenRouter,
}

/// Registry entry describing one provider and the models it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub kind: ProviderKind,
    /// Overrides the adapter's default API root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

impl ProviderDescriptor {
    pub fn model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.model_id == model_id)
    }
}

/// Capability flags for a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    #[serde(default)]
    pub display_name: String,
    /// Provider-side model path, e.g. `fal-ai/flux/schnell`.
    pub endpoint: String,
    pub max_width: u32,
    pub max_height: u32,
    #[serde(default)]
    pub supports_img2img: bool,
    #[serde(default)]
    pub supports_inpainting: bool,
    #[serde(default)]
    pub supports_batch: bool,
    #[serde(default = "default_max_batch")]
    pub max_batch_size: u32,
    /// Results arrive in one round trip; no polling.
    #[serde(default)]
    pub is_synchronous: bool,
    /// USD per 1024x1024 image.
    #[serde(default)]
    pub cost_per_megapixel: f64,
}

fn default_max_batch() -> u32 {
    4
}

impl ModelDescriptor {
    /// Reject requests this model cannot serve.  Runs before any network call.
    pub fn check(&self, request: &GenerationRequest) -> Result<(), JobError> {
        if request.width > self.max_width || request.height > self.max_height {
            return Err(JobError::invalid(format!(
                "{}x{} exceeds the {}x{} maximum of model '{}'",
                request.width, request.height, self.max_width, self.max_height, self.model_id
            )));
        }
        if request.source_image.is_some() && !self.supports_img2img {
            return Err(JobError::invalid(format!(
                "model '{}' does not support img2img",
                self.model_id
            )));
        }
        if request.mask.is_some() && !self.supports_inpainting {
            return Err(JobError::invalid(format!(
                "model '{}' does not support inpainting",
                self.model_id
            )));
        }
        if request.batch_size > 1 && !self.supports_batch {
            return Err(JobError::invalid(format!(
                "model '{}' does not support batch generation",
                self.model_id
            )));
        }
        if request.batch_size > self.max_batch_size {
            return Err(JobError::invalid(format!(
                "batch_size {} exceeds the limit of {} for model '{}'",
                request.batch_size, self.max_batch_size, self.model_id
            )));
        }
        Ok(())
    }

    /// Rough USD estimate, scaled by pixel count relative to 1024x1024.
    pub fn estimate_cost(&self, request: &GenerationRequest) -> f64 {
        let megapixels = f64::from(request.width) * f64::from(request.height) / (1024.0 * 1024.0);
        self.cost_per_megapixel * megapixels * f64::from(request.batch_size)
    }
}
