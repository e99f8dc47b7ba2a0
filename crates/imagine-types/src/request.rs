use serde::{Deserialize, Serialize};

use crate::error::JobError;

pub const DEFAULT_DIMENSION: u32 = 1024;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_CFG_SCALE: f32 = 7.5;
pub const DEFAULT_DENOISING_STRENGTH: f32 = 0.75;

/// Immutable input describing one generation.
///
/// Ownership moves into the job at submission; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub provider_id: String,
    pub model_id: String,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    /// Negative means "let the provider pick".
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Source image for img2img, base64 on the wire.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub source_image: Option<Vec<u8>>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<u8>>,
    #[serde(default = "default_denoising_strength")]
    pub denoising_strength: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
}

impl GenerationRequest {
    /// Create a text-to-image request with default parameters.
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            seed: -1,
            batch_size: 1,
            source_image: None,
            mask: None,
            denoising_strength: DEFAULT_DENOISING_STRENGTH,
            sampler: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_negative_prompt(mut self, negative: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative.into());
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cfg_scale(mut self, cfg_scale: f32) -> Self {
        self.cfg_scale = cfg_scale;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = Some(sampler.into());
        self
    }

    /// Attach a source image (and optional inpainting mask) for img2img.
    pub fn with_source_image(mut self, image: Vec<u8>, mask: Option<Vec<u8>>) -> Self {
        self.source_image = Some(image);
        self.mask = mask;
        self
    }

    pub fn with_denoising_strength(mut self, strength: f32) -> Self {
        self.denoising_strength = strength;
        self
    }

    pub fn wants_random_seed(&self) -> bool {
        self.seed < 0
    }

    pub fn is_img2img(&self) -> bool {
        self.source_image.is_some()
    }

    /// Structural validation independent of any provider's capabilities.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.prompt.trim().is_empty() {
            return Err(JobError::invalid("prompt must not be empty"));
        }
        if self.provider_id.is_empty() || self.model_id.is_empty() {
            return Err(JobError::invalid("provider_id and model_id are required"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(JobError::invalid(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(JobError::invalid("steps must be positive"));
        }
        if !self.cfg_scale.is_finite() || self.cfg_scale <= 0.0 {
            return Err(JobError::invalid(format!(
                "cfg_scale must be a positive number, got {}",
                self.cfg_scale
            )));
        }
        if self.batch_size == 0 {
            return Err(JobError::invalid("batch_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.denoising_strength) {
            return Err(JobError::invalid(format!(
                "denoising_strength must be within [0, 1], got {}",
                self.denoising_strength
            )));
        }
        if self.mask.is_some() && self.source_image.is_none() {
            return Err(JobError::invalid("mask supplied without a source image"));
        }
        Ok(())
    }
}

fn default_dimension() -> u32 {
    DEFAULT_DIMENSION
}

fn default_steps() -> u32 {
    DEFAULT_STEPS
}

fn default_cfg_scale() -> f32 {
    DEFAULT_CFG_SCALE
}

fn default_seed() -> i64 {
    -1
}

fn default_batch_size() -> u32 {
    1
}

fn default_denoising_strength() -> f32 {
    DEFAULT_DENOISING_STRENGTH
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn fox() -> GenerationRequest {
        GenerationRequest::new("fal", "flux-schnell", "a red fox").with_size(512, 512)
    }

    #[test]
    fn defaults_match_engine_settings() {
        let req = fox();
        assert_eq!(req.steps, 20);
        assert_eq!(req.cfg_scale, 7.5);
        assert_eq!(req.batch_size, 1);
        assert!(req.wants_random_seed());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn blank_prompt_is_invalid() {
        let mut req = fox();
        req.prompt = "   ".into();
        let err = req.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn out_of_range_denoising_is_invalid() {
        let err = fox().with_denoising_strength(1.5).validate().unwrap_err();
        assert!(err.message.contains("denoising_strength"));
    }

    #[test]
    fn mask_requires_source_image() {
        let mut req = fox();
        req.mask = Some(vec![0u8; 4]);
        assert!(req.validate().is_err());

        let req = fox().with_source_image(vec![1, 2, 3], Some(vec![0u8; 4]));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn zero_batch_is_invalid() {
        assert!(fox().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn image_bytes_travel_as_base64() {
        let req = fox().with_source_image(vec![0xde, 0xad, 0xbe, 0xef], None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["source_image"], "3q2+7w==");
        assert!(json.get("mask").is_none());

        let back: GenerationRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.source_image.as_deref(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
    }

    #[test]
    fn missing_fields_take_defaults_when_deserialized() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"prompt":"a lighthouse","provider_id":"openai","model_id":"dall-e-3"}"#,
        )
        .unwrap();
        assert_eq!(req.width, 1024);
        assert_eq!(req.seed, -1);
        assert_eq!(req.denoising_strength, 0.75);
    }
}
