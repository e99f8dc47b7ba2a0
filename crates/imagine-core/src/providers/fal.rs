//! fal.ai queue API adapter.
//!
//! Submissions go to `POST {base}/{endpoint}`; the queue answers with a
//! `request_id` that is polled under the model's app path
//! (`{base}/{owner}/{app}/requests/{id}/status`).  A response that already
//! carries images is treated as a synchronous result.

use std::sync::Arc;

use async_trait::async_trait;
use imagine_types::GenerationRequest;
use reqwest::header::AUTHORIZATION;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::providers::http::{HttpClient, data_uri};
use crate::providers::retry::{RetryPolicy, with_retry};
use crate::providers::{
    GeneratedImage, GenerationOutput, ImageProvider, PollStatus, ProviderError, ProviderHandle,
    ProviderRequest, SubmitOutcome,
};
use crate::secrets::SecretStore;

pub const DEFAULT_BASE_URL: &str = "https://queue.fal.run";

pub struct FalAdapter {
    provider_id: String,
    base_url: String,
    http: HttpClient,
    secrets: Arc<dyn SecretStore>,
    retry: RetryPolicy,
}

impl FalAdapter {
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

    async fn authorization(&self) -> Result<String, ProviderError> {
        let key = self.secrets.credential(&self.provider_id).await?;
        Ok(format!("Key {key}"))
    }

    fn request_url(&self, handle: &ProviderHandle) -> String {
        format!(
            "{}/{}/requests/{}",
            self.base_url, handle.route, handle.request_id
        )
    }
}

#[async_trait]
impl ImageProvider for FalAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn submit(&self, req: ProviderRequest<'_>) -> Result<SubmitOutcome, ProviderError> {
        req.preflight()?;
        let auth = self.authorization().await?;
        let url = format!("{}/{}", self.base_url, req.model.endpoint);
        let body = payload(req.request);

        let response = with_retry(&self.retry, "fal.submit", || {
            self.http.send_json(
                self.http
                    .client()
                    .post(&url)
                    .header(AUTHORIZATION, &auth)
                    .json(&body),
            )
        })
        .await?;

        match response.get("request_id").and_then(Value::as_str) {
            Some(request_id) => {
                debug!(job_id = %req.job_id, request_id, "fal request queued");
                Ok(SubmitOutcome::Handle(ProviderHandle {
                    provider_id: self.provider_id.clone(),
                    request_id: request_id.to_owned(),
                    route: app_path(&req.model.endpoint),
                    requested: req.request.batch_size,
                }))
            }
            None => Ok(SubmitOutcome::Immediate(parse_output(
                &response,
                req.request.batch_size,
            ))),
        }
    }

    async fn poll(&self, handle: &ProviderHandle) -> Result<PollStatus, ProviderError> {
        let auth = self.authorization().await?;
        let status_url = format!("{}/status", self.request_url(handle));

        let status = with_retry(&self.retry, "fal.status", || {
            self.http.send_json(
                self.http
                    .client()
                    .get(&status_url)
                    .header(AUTHORIZATION, &auth),
            )
        })
        .await?;

        match status.get("status").and_then(Value::as_str) {
            Some("IN_QUEUE") | Some("IN_PROGRESS") => Ok(PollStatus::Pending),
            Some("COMPLETED") => {
                let result_url = self.request_url(handle);
                let result = with_retry(&self.retry, "fal.result", || {
                    self.http.send_json(
                        self.http
                            .client()
                            .get(&result_url)
                            .header(AUTHORIZATION, &auth),
                    )
                })
                .await?;
                Ok(parse_output(&result, handle.requested).into_status(handle.requested))
            }
            other => Ok(PollStatus::Failed(ProviderError::fault(format!(
                "fal request {} ended with status {}",
                handle.request_id,
                other.unwrap_or("<missing>")
            )))),
        }
    }

    async fn cancel(&self, handle: &ProviderHandle) {
        let auth = match self.authorization().await {
            Ok(auth) => auth,
            Err(err) => {
                debug!(request_id = %handle.request_id, error = %err, "fal cancel skipped");
                return;
            }
        };
        let url = format!("{}/cancel", self.request_url(handle));
        let result = self
            .http
            .send_unit(self.http.client().put(&url).header(AUTHORIZATION, auth))
            .await;
        if let Err(err) = result {
            debug!(request_id = %handle.request_id, error = %err, "fal cancel not acknowledged");
        }
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let auth = self.authorization().await?;
        let url = format!("{}/health", self.base_url);
        self.http
            .probe(self.http.client().get(&url).header(AUTHORIZATION, auth))
            .await
    }
}

/// Queue routes use the app path (`owner/app`) without any model sub-path.
fn app_path(endpoint: &str) -> String {
    endpoint.split('/').take(2).collect::<Vec<_>>().join("/")
}

fn scheduler_for(sampler: Option<&str>) -> &'static str {
    match sampler {
        Some("Euler a") => "EulerAncestralDiscrete",
        Some("Euler") => "EulerDiscrete",
        Some("DDIM") => "DDIM",
        Some("LMS") => "LMSDiscrete",
        Some("PNDM") => "PNDM",
        Some("DDPM") => "DDPM",
        _ => "DPMSolverMultistep",
    }
}

fn payload(request: &GenerationRequest) -> Value {
    let mut body = Map::new();
    body.insert("prompt".into(), json!(request.prompt));
    body.insert(
        "image_size".into(),
        json!({ "width": request.width, "height": request.height }),
    );
    body.insert("num_inference_steps".into(), json!(request.steps));
    body.insert("guidance_scale".into(), json!(request.cfg_scale));
    body.insert("num_images".into(), json!(request.batch_size));
    body.insert(
        "scheduler".into(),
        json!(scheduler_for(request.sampler.as_deref())),
    );
    body.insert("enable_safety_checker".into(), json!(true));

    if let Some(negative) = &request.negative_prompt {
        body.insert("negative_prompt".into(), json!(negative));
    }
    if !request.wants_random_seed() {
        body.insert("seed".into(), json!(request.seed));
    }
    if let Some(image) = &request.source_image {
        body.insert("image_url".into(), json!(data_uri(image)));
        body.insert("strength".into(), json!(request.denoising_strength));
    }
    if let Some(mask) = &request.mask {
        body.insert("mask_url".into(), json!(data_uri(mask)));
    }
    Value::Object(body)
}

fn parse_output(body: &Value, requested: u32) -> GenerationOutput {
    let entries: Vec<&Value> = match body.get("images").and_then(Value::as_array) {
        Some(images) => images.iter().collect(),
        None => body.get("image").into_iter().collect(),
    };
    let seed = body.get("seed").and_then(Value::as_i64);
    let nsfw = body.get("has_nsfw_concepts").and_then(Value::as_array);

    let images: Vec<GeneratedImage> = entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let url = entry.get("url")?.as_str()?;
            let mut image = GeneratedImage::from_url(url);
            image.seed = seed;
            image.nsfw = nsfw
                .and_then(|flags| flags.get(index))
                .and_then(Value::as_bool);
            Some(image)
        })
        .collect();

    GenerationOutput {
        failed: requested.saturating_sub(images.len() as u32),
        images,
    }
}
