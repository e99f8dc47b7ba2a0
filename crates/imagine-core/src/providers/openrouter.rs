//! OpenRouter adapter for image-capable chat models.
//!
//! Images come back as `data:` URIs under `choices[0].message.images`.

use std::sync::Arc;

use async_trait::async_trait;
use imagine_types::{GenerationRequest, ModelDescriptor};
use serde_json::{Value, json};

use crate::providers::http::{HttpClient, data_uri};
use crate::providers::retry::{RetryPolicy, with_retry};
use crate::providers::{
    GeneratedImage, GenerationOutput, ImageProvider, PollStatus, ProviderError, ProviderHandle,
    ProviderRequest, SubmitOutcome,
};
use crate::secrets::SecretStore;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterAdapter {
    provider_id: String,
    base_url: String,
    http: HttpClient,
    secrets: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl OpenRouterAdapter {
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
impl ImageProvider for OpenRouterAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn submit(&self, req: ProviderRequest<'_>) -> Result<SubmitOutcome, ProviderError> {
        req.preflight()?;
        let key = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = payload(req.request, req.model);

        let response = with_retry(&self.retry, "openrouter.generate", || {
            self.http.send_json(
                self.http
                    .client()
                    .post(&url)
                    .bearer_auth(&key)
                    .header("X-Title", "imagine")
                    .json(&body),
            )
        })
        .await?;

        // Some upstreams report failures inside a 200 body.
        if let Some(message) = response.pointer("/error/message").and_then(Value::as_str) {
            return Err(ProviderError::fault(message.to_owned()));
        }
        Ok(SubmitOutcome::Immediate(parse_output(
            &response,
            req.request.batch_size,
        )))
    }

    async fn poll(&self, _handle: &ProviderHandle) -> Result<PollStatus, ProviderError> {
        Err(ProviderError::invalid(
            "openrouter completions are synchronous and cannot be polled",
        ))
    }

    async fn cancel(&self, _handle: &ProviderHandle) {}

    async fn health_check(&self) -> Result<(), ProviderError> {
        let key = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/key", self.base_url);
        self.http
            .probe(self.http.client().get(&url).bearer_auth(key))
            .await
    }
}

fn payload(request: &GenerationRequest, model: &ModelDescriptor) -> Value {
    let mut text = format!(
        "{}\n\nOutput size: {}x{} pixels.",
        request.prompt, request.width, request.height
    );
    if let Some(negative) = &request.negative_prompt {
        text.push_str(&format!("\nAvoid: {negative}."));
    }

    let mut content = vec![json!({ "type": "text", "text": text })];
    if let Some(image) = &request.source_image {
        content.push(json!({
            "type": "image_url",
            "image_url": { "url": data_uri(image) }
        }));
    }

    let mut body = json!({
        "model": model.endpoint,
        "modalities": ["image", "text"],
        "messages": [{ "role": "user", "content": content }],
    });
    if !request.wants_random_seed() {
        body["seed"] = json!(request.seed);
    }
    body
}

fn parse_output(body: &Value, requested: u32) -> GenerationOutput {
    let images: Vec<GeneratedImage> = body
        .pointer("/choices/0/message/images")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.pointer("/image_url/url").and_then(Value::as_str))
                .map(GeneratedImage::from_url)
                .collect()
        })
        .unwrap_or_default();
    GenerationOutput {
        failed: requested.saturating_sub(images.len() as u32),
        images,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use imagine_types::{ArtifactData, JobId};

    use super::*;
    use crate::secrets::StaticSecretStore;

    fn gemini() -> ModelDescriptor {
        ModelDescriptor {
            model_id: "gemini-flash-image".into(),
            display_name: "Gemini 2.5 Flash Image".into(),
            endpoint: "google/gemini-2.5-flash-image-preview".into(),
            max_width: 1024,
            max_height: 1024,
            supports_img2img: true,
            supports_inpainting: false,
            supports_batch: false,
            max_batch_size: 1,
            is_synchronous: true,
            cost_per_megapixel: 0.039,
        }
    }

    #[test]
    fn img2img_attaches_the_source_as_image_part() {
        let request = GenerationRequest::new("openrouter", "gemini-flash-image", "make it winter")
            .with_source_image(vec![9, 9, 9], None)
            .with_negative_prompt("people");
        let body = payload(&request, &gemini());
        let content = body.pointer("/messages/0/content").unwrap().as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert!(content[0]["text"].as_str().unwrap().contains("Avoid: people."));
        assert_eq!(content[1]["type"], "image_url");
    }

    #[test]
    fn missing_images_count_as_failed() {
        let body = json!({ "choices": [{ "message": { "content": "I cannot draw that." } }] });
        let output = parse_output(&body, 1);
        assert!(output.images.is_empty());
        assert_eq!(output.failed, 1);
    }

    #[tokio::test]
    async fn data_uri_images_become_bytes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer or-key");
                then.status(200).json_body(json!({
                    "choices": [{ "message": {
                        "role": "assistant",
                        "images": [{ "type": "image_url", "image_url": { "url": "data:image/png;base64,AAEC" } }]
                    }}]
                }));
            })
            .await;

        let adapter = OpenRouterAdapter::new(
            "openrouter".into(),
            Some(server.base_url()),
            HttpClient::new(Duration::from_secs(2), Duration::from_secs(5)),
            Arc::new(StaticSecretStore::new().with("openrouter", "or-key")),
            RetryPolicy::default(),
        );
        let request = GenerationRequest::new("openrouter", "gemini-flash-image", "a red fox")
            .with_size(1024, 1024);
        let model = gemini();
        let outcome = adapter
            .submit(ProviderRequest {
                job_id: JobId::new(),
                request: &request,
                model: &model,
            })
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Immediate(output) => {
                assert_eq!(output.images.len(), 1);
                assert!(matches!(
                    &output.images[0].data,
                    ArtifactData::Bytes { mime: Some(mime), .. } if mime == "image/png"
                ));
            }
            other => panic!("expected immediate result, got {other:?}"),
        }
    }
}
