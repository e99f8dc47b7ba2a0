//! Replicate predictions API adapter.

use std::sync::Arc;

use async_trait::async_trait;
use imagine_types::GenerationRequest;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::providers::http::{HttpClient, data_uri};
use crate::providers::retry::{RetryPolicy, with_retry};
use crate::providers::{
    GeneratedImage, GenerationOutput, ImageProvider, PollStatus, ProviderError, ProviderHandle,
    ProviderRequest, SubmitOutcome,
};
use crate::secrets::SecretStore;

pub const DEFAULT_BASE_URL: &str = "https://api.replicate.com/v1";

pub struct ReplicateAdapter {
    provider_id: String,
    base_url: String,
    http: HttpClient,
    secrets: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl ReplicateAdapter {
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
impl ImageProvider for ReplicateAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn submit(&self, req: ProviderRequest<'_>) -> Result<SubmitOutcome, ProviderError> {
        req.preflight()?;
        let token = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/models/{}/predictions", self.base_url, req.model.endpoint);
        let body = json!({ "input": input(req.request) });

        let prediction = with_retry(&self.retry, "replicate.submit", || {
            self.http
                .send_json(self.http.client().post(&url).bearer_auth(&token).json(&body))
        })
        .await?;

        let requested = req.request.batch_size;
        match interpret(&prediction, requested)? {
            PollStatus::Pending => {
                let id = prediction
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::fault("prediction response without an id"))?;
                debug!(job_id = %req.job_id, prediction = id, "replicate prediction created");
                Ok(SubmitOutcome::Handle(ProviderHandle {
                    provider_id: self.provider_id.clone(),
                    request_id: id.to_owned(),
                    route: String::new(),
                    requested,
                }))
            }
            PollStatus::Ready(output) | PollStatus::Partial(output) => {
                Ok(SubmitOutcome::Immediate(output))
            }
            PollStatus::Failed(err) => Err(err),
        }
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, ProviderError> {
        let token = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/predictions/{}", self.base_url, handle.request_id);

        let prediction = with_retry(&self.retry, "replicate.poll", || {
            self.http
                .send_json(self.http.client().get(&url).bearer_auth(&token))
        })
        .await?;

        interpret(&prediction, handle.requested)
    }

    async fn cancel(&self, handle: &ProviderHandle) {
        let Ok(token) = self.secrets.credential(&self.provider_id).await else {
            return;
        };
        let url = format!("{}/predictions/{}/cancel", self.base_url, handle.request_id);
        if let Err(err) = self
            .http
            .send_unit(self.http.client().post(&url).bearer_auth(token))
            .await
        {
            debug!(prediction = %handle.request_id, error = %err, "replicate cancel not acknowledged");
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let token = self.secrets.credential(&self.provider_id).await?;
        let url = format!("{}/account", self.base_url);
        self.http
            .probe(self.http.client().get(&url).bearer_auth(token))
            .await
    }
}

fn input(request: &GenerationRequest) -> Value {
    let mut input = Map::new();
    input.insert("prompt".into(), json!(request.prompt));
    input.insert("width".into(), json!(request.width));
    input.insert("height".into(), json!(request.height));
    input.insert("num_outputs".into(), json!(request.batch_size));
    input.insert("num_inference_steps".into(), json!(request.steps));
    input.insert("guidance_scale".into(), json!(request.cfg_scale));

    if let Some(negative) = &request.negative_prompt {
        input.insert("negative_prompt".into(), json!(negative));
    }
    if !request.wants_random_seed() {
        input.insert("seed".into(), json!(request.seed));
    }
    if let Some(sampler) = &request.sampler {
        input.insert("scheduler".into(), json!(sampler));
    }
    if let Some(image) = &request.source_image {
        input.insert("image".into(), json!(data_uri(image)));
        input.insert("prompt_strength".into(), json!(request.denoising_strength));
    }
    if let Some(mask) = &request.mask {
        input.insert("mask".into(), json!(data_uri(mask)));
    }
    Value::Object(input)
}

/// Map a prediction object onto a poll status.
fn interpret(prediction: &Value, requested: u32) -> Result<PollStatus, ProviderError> {
    let status = prediction
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::fault("prediction response without a status"))?;

    match status {
        "starting" | "processing" => Ok(PollStatus::Pending),
        "succeeded" => {
            let urls: Vec<&str> = match prediction.get("output") {
                Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
                Some(Value::String(url)) => vec![url.as_str()],
                _ => Vec::new(),
            };
            let images: Vec<GeneratedImage> =
                urls.into_iter().map(GeneratedImage::from_url).collect();
            let output = GenerationOutput {
                failed: requested.saturating_sub(images.len() as u32),
                images,
            };
            Ok(output.into_status(requested))
        }
        "canceled" => Ok(PollStatus::Failed(ProviderError::fault(
            "prediction was canceled at the provider",
        ))),
        _ => {
            let message = prediction
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("prediction failed");
            Ok(PollStatus::Failed(ProviderError::fault(message)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use imagine_types::{ErrorKind, JobId, ModelDescriptor};

    use super::*;
    use crate::secrets::StaticSecretStore;

    fn adapter(base_url: String) -> ReplicateAdapter {
        ReplicateAdapter::new(
            "replicate".into(),
            Some(base_url),
            HttpClient::new(Duration::from_secs(2), Duration::from_secs(5)),
            Arc::new(StaticSecretStore::new().with("replicate", "r8_token")),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                factor: 2,
                max_delay: Duration::from_millis(5),
            },
        )
    }

    fn model() -> ModelDescriptor {
        ModelDescriptor {
            model_id: "flux-schnell".into(),
            display_name: "FLUX.1 [schnell]".into(),
            endpoint: "black-forest-labs/flux-schnell".into(),
            max_width: 1440,
            max_height: 1440,
            supports_img2img: false,
            supports_inpainting: false,
            supports_batch: true,
            max_batch_size: 4,
            is_synchronous: false,
            cost_per_megapixel: 0.003,
        }
    }

    #[test]
    fn succeeded_prediction_with_missing_outputs_is_partial() {
        let prediction = json!({
            "status": "succeeded",
            "output": ["https://r.example/0.webp", "https://r.example/1.webp", "https://r.example/2.webp"]
        });
        match interpret(&prediction, 4).unwrap() {
            PollStatus::Partial(output) => {
                assert_eq!(output.images.len(), 3);
                assert_eq!(output.failed, 1);
            }
            other => panic!("expected partial, got {other:?}"),
        }
    }

    #[test]
    fn failed_prediction_surfaces_provider_message() {
        let prediction = json!({ "status": "failed", "error": "NSFW content detected" });
        match interpret(&prediction, 1).unwrap() {
            PollStatus::Failed(err) => {
                assert_eq!(err.kind, ErrorKind::ProviderFault);
                assert_eq!(err.message, "NSFW content detected");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn input_omits_random_seed_and_absent_images() {
        let request = GenerationRequest::new("replicate", "flux-schnell", "x").with_batch_size(2);
        let input = input(&request);
        assert_eq!(input["num_outputs"], 2);
        assert!(input.get("seed").is_none());
        assert!(input.get("image").is_none());
    }

    #[tokio::test]
    async fn submit_then_poll_round_trip() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/models/black-forest-labs/flux-schnell/predictions")
                    .header("authorization", "Bearer r8_token");
                then.status(201)
                    .json_body(json!({ "id": "p-42", "status": "starting" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/predictions/p-42");
                then.status(200).json_body(json!({
                    "id": "p-42",
                    "status": "succeeded",
                    "output": ["https://r.example/a.png", "https://r.example/b.png"]
                }));
            })
            .await;

        let replicate = adapter(server.base_url());
        let request =
            GenerationRequest::new("replicate", "flux-schnell", "a red fox").with_batch_size(2);
        let model = model();
        let handle = match replicate
            .submit(ProviderRequest {
                job_id: JobId::new(),
                request: &request,
                model: &model,
            })
            .await
            .unwrap()
        {
            SubmitOutcome::Handle(handle) => handle,
            other => panic!("expected handle, got {other:?}"),
        };
        create.assert_async().await;
        assert_eq!(handle.request_id, "p-42");
        assert_eq!(handle.requested, 2);

        match replicate.poll(&handle).await.unwrap() {
            PollStatus::Ready(output) => assert_eq!(output.images.len(), 2),
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn throttled_poll_is_retried() {
        let server = MockServer::start_async().await;
        let throttled = server
            .mock_async(|when, then| {
                when.method(GET).path("/predictions/p-1");
                then.status(429).json_body(json!({ "detail": "Request was throttled." }));
            })
            .await;

        let replicate = adapter(server.base_url());
        let handle = ProviderHandle {
            provider_id: "replicate".into(),
            request_id: "p-1".into(),
            route: String::new(),
            requested: 1,
        };
        let err = replicate.poll(&handle).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(throttled.hits_async().await, 3);
    }

    #[tokio::test]
    async fn cancel_posts_to_the_prediction() {
        let server = MockServer::start_async().await;
        let cancel = server
            .mock_async(|when, then| {
                when.method(POST).path("/predictions/p-9/cancel");
                then.status(200).json_body(json!({ "id": "p-9", "status": "canceled" }));
            })
            .await;

        let replicate = adapter(server.base_url());
        let handle = ProviderHandle {
            provider_id: "replicate".into(),
            request_id: "p-9".into(),
            route: String::new(),
            requested: 1,
        };
        replicate.cancel(&handle).await;
        replicate.cancel(&handle).await;
        assert_eq!(cancel.hits_async().await, 2);
    }
}
