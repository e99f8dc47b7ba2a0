use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Raw output of a provider before it is handed to the result sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactData {
    /// Image bytes returned inline (base64 payloads, data URIs).
    Bytes { data: Bytes, mime: Option<String> },
    /// Image hosted by the provider; the sink fetches it.
    Url { url: String },
}

/// Descriptive metadata stored next to each artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub job_id: JobId,
    /// Position within the batch.
    pub index: u32,
    pub provider_id: String,
    pub model_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Seed reported by the provider, or the requested one if it was fixed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub data: ArtifactData,
    pub metadata: ArtifactMetadata,
}

/// Durable reference returned by the result sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_uri: Option<String>,
}

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            thumbnail_uri: None,
        }
    }
}
