//! OpenAI Images API adapter.  Synchronous: one request, one answer.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use imagine_types::{ArtifactData, GenerationRequest, ModelDescriptor};
use serde_json::{Value, json};
use tracing::debug;

use crate::providers::http::HttpClient;
use crate::providers::retry::{RetryPolicy, with_retry};
use crate::providers::{
    GeneratedImage, GenerationOutput, ImageProvider, PollStatus, ProviderError, ProviderHandle,
    ProviderRequest, SubmitOutcome,
};
use crate::secrets::SecretStore;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    provider_id: String,
    base_url: String,
    http: HttpClient,
    secrets: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl OpenAiAdapter {
    pub fn new(
        provider_id: String,
        base_url: Option<String>,
        http: HttpClient,
        secrets: Arc<dyn SecretStore>,
        retry: RetryPolicy,
    ) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        Self {
            provider_id,
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
            secrets,
            retry,
        }
    }
}

#[async_trait]
impl ImageProvider for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn submit(&self, req: ProviderRequest<'_>) -> Result<SubmitOutcome, ProviderError> {
        req.preflight()?;
        if req.request.is_img2img() {
            return Err(ProviderError::invalid(
                "image edits are not supported by this adapter",
            ));
        }
        let key = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/images/generations", self.base_url);
        let body = payload(req.request, req.model);
        if req.request.negative_prompt.is_some() {
            debug!(job_id = %req.job_id, "openai ignores negative prompts");
        }

        let response = with_retry(&self.retry, "openai.generate", || {
            self.http
                .send_json(self.http.client().post(&url).bearer_auth(&key).json(&body))
        })
        .await?;

        Ok(SubmitOutcome::Immediate(parse_output(
            &response,
            req.request.batch_size,
        )))
    }

    async fn poll(&self, _handle: &ProviderHandle) -> Result<PollStatus, ProviderError> {
        Err(ProviderError::invalid(
            "openai generations are synchronous and cannot be polled",
        ))
    }

    async fn cancel(&self, _handle: &ProviderHandle) {}

    async fn health_check(&self) -> Result<(), ProviderError> {
        let key = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/models", self.base_url);
        self.http
            .probe(self.http.client().get(&url).bearer_auth(key))
            .await
    }
}

fn payload(request: &GenerationRequest, model: &ModelDescriptor) -> Value {
    let mut body = json!({
        "model": model.endpoint,
        "prompt": request.prompt,
        "n": request.batch_size,
        "size": format!("{}x{}", request.width, request.height),
    });
    // gpt-image models always answer in base64 and reject the field.
    if model.endpoint.starts_with("dall-e") {
        body["response_format"] = json!("b64_json");
    }
    body
}

fn parse_output(body: &Value, requested: u32) -> GenerationOutput {
    let images: Vec<GeneratedImage> = body
        .get("data")
        .and_then(Value::as_array)
        .map(|entries| entries.iter().filter_map(decode_entry).collect())
        .unwrap_or_default();
    GenerationOutput {
        failed: requested.saturating_sub(images.len() as u32),
        images,
    }
}

fn decode_entry(entry: &Value) -> Option<GeneratedImage> {
    if let Some(encoded) = entry.get("b64_json").and_then(Value::as_str) {
        let data = STANDARD.decode(encoded).ok()?;
        return Some(GeneratedImage::new(ArtifactData::Bytes {
            data: Bytes::from(data),
            mime: Some("image/png".to_owned()),
        }));
    }
    entry
        .get("url")
        .and_then(Value::as_str)
        .map(GeneratedImage::from_url)
}
