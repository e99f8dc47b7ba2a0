//! Shared HTTP plumbing and error classification for the adapters.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::providers::ProviderError;

/// Longest slice of a raw error body carried into a message.
const MAX_BODY_SNIPPET: usize = 200;

/// Thin wrapper around a shared `reqwest::Client`.
///
/// Cloning is cheap; all adapters built from one registry share the same
/// connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("imagine/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request` and decode a JSON body, classifying any failure.
    pub async fn send_json(&self, request: RequestBuilder) -> Result<Value, ProviderError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::fault(format!("malformed provider response: {e}")))
    }

    /// Send `request` and discard the body.  Used for cancel calls.
    pub async fn send_unit(&self, request: RequestBuilder) -> Result<(), ProviderError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &headers, &body))
    }

    /// Download a hosted artifact, returning its bytes and content type.
    pub async fn fetch_bytes(&self, url: &str) -> Result<(Bytes, Option<String>), ProviderError> {
        if let Some(decoded) = decode_data_uri(url) {
            return Ok(decoded);
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body));
        }
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let data = response.bytes().await.map_err(|e| classify_transport(&e))?;
        Ok((data, mime))
    }

    /// Connectivity probe: any answer other than an auth rejection or a
    /// transport failure counts as reachable.
    pub async fn probe(&self, request: RequestBuilder) -> Result<(), ProviderError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ProviderError::auth("credential rejected by provider"))
            }
            status if status.is_server_error() => {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                Err(classify_status(status, &headers, &body))
            }
            status => {
                debug!(%status, "provider probe answered");
                Ok(())
            }
        }
    }
}

/// Map a non-success HTTP status onto the engine's error kinds.
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let message = format!("HTTP {}: {}", status.as_u16(), error_message(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::auth(message),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::rate_limited(message, retry_after(headers)),
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ProviderError::transient(message),
        s if s.is_server_error() => ProviderError::fault(message),
        s if s.is_client_error() => ProviderError::invalid(message),
        _ => ProviderError::fault(message),
    }
}

/// Map a reqwest transport error onto the engine's error kinds.
pub fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ProviderError::transient(format!("transport error: {err}"))
    } else if err.is_decode() {
        ProviderError::fault(format!("undecodable provider response: {err}"))
    } else {
        ProviderError::transient(err.to_string())
    }
}

/// Pull a human-readable message out of a provider error body.
pub fn error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let candidates = ["/detail", "/error/message", "/error", "/message", "/detail/0/msg"];
        for pointer in candidates {
            if let Some(text) = json.pointer(pointer).and_then(Value::as_str) {
                return text.to_owned();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no error body".to_owned();
    }
    trimmed.chars().take(MAX_BODY_SNIPPET).collect()
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Encode bytes as a `data:` URI, the form every provider accepts for
/// inline source images.
pub fn data_uri(bytes: &[u8]) -> String {
    let mime = sniff_mime(bytes).unwrap_or("application/octet-stream");
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Decode a base64 `data:` URI.  Returns `None` for anything else.
pub fn decode_data_uri(uri: &str) -> Option<(Bytes, Option<String>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    let data = STANDARD.decode(payload).ok()?;
    let mime = (!mime.is_empty()).then(|| mime.to_owned());
    Some((Bytes::from(data), mime))
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagine_types::ErrorKind;
    use reqwest::header::HeaderValue;

    fn kind(status: u16) -> ErrorKind {
        classify_status(
            StatusCode::from_u16(status).unwrap(),
            &HeaderMap::new(),
            "",
        )
        .kind
    }

    #[test]
    fn statuses_map_onto_error_kinds() {
        assert_eq!(kind(400), ErrorKind::InvalidRequest);
        assert_eq!(kind(422), ErrorKind::InvalidRequest);
        assert_eq!(kind(401), ErrorKind::AuthError);
        assert_eq!(kind(403), ErrorKind::AuthError);
        assert_eq!(kind(429), ErrorKind::RateLimited);
        assert_eq!(kind(503), ErrorKind::Transient);
        assert_eq!(kind(504), ErrorKind::Transient);
        assert_eq!(kind(500), ErrorKind::ProviderFault);
    }

    #[test]
    fn rate_limit_carries_retry_after_hint() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
    }

    #[test]
    fn error_message_prefers_structured_fields() {
        assert_eq!(error_message(r#"{"detail":"bad size"}"#), "bad size");
        assert_eq!(
            error_message(r#"{"error":{"message":"quota exhausted","type":"x"}}"#),
            "quota exhausted"
        );
        assert_eq!(error_message("  upstream exploded  "), "upstream exploded");
        assert_eq!(error_message(""), "no error body");
    }

    #[test]
    fn data_uris_decode_to_bytes() {
        let (bytes, mime) = decode_data_uri("data:image/png;base64,AAEC").unwrap();
        assert_eq!(&bytes[..], &[0u8, 1, 2]);
        assert_eq!(mime.as_deref(), Some("image/png"));
        assert!(decode_data_uri("https://cdn.example/x.png").is_none());
    }

    #[test]
    fn data_uri_sniffs_png_signature() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0];
        assert!(data_uri(&png).starts_with("data:image/png;base64,"));
        assert!(data_uri(b"plain").starts_with("data:application/octet-stream;base64,"));
    }
}
