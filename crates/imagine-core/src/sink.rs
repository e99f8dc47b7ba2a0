//! Result sinks: durable storage for finished artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use image::ImageFormat;
use imagine_types::{ArtifactData, ArtifactMetadata, ArtifactRef, JobId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::providers::http::HttpClient;

/// Edge length of generated thumbnails.
const THUMBNAIL_SIZE: u32 = 256;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch artifact from {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("failed to encode artifact metadata: {0}")]
    Metadata(String),
}

/// Destination for finished artifacts.  Once `store` returns the artifact is
/// assumed durable.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn store(
        &self,
        job_id: JobId,
        data: &ArtifactData,
        metadata: &ArtifactMetadata,
    ) -> Result<ArtifactRef, SinkError>;
}

/// Writes artifacts under `<root>/<job_id>/`.
///
/// Each artifact produces `<index>.<ext>`, a `<index>.json` metadata sidecar
/// and, when the image decodes, a `thumb_<index>.png` thumbnail.
#[derive(Debug, Clone)]
pub struct FsResultSink {
    root: PathBuf,
    http: HttpClient,
}

impl FsResultSink {
    pub fn new(root: impl Into<PathBuf>, http: HttpClient) -> Self {
        Self {
            root: root.into(),
            http,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn materialize(&self, data: &ArtifactData) -> Result<Bytes, SinkError> {
        match data {
            ArtifactData::Bytes { data, .. } => Ok(data.clone()),
            ArtifactData::Url { url } => {
                let (bytes, _mime) =
                    self.http
                        .fetch_bytes(url)
                        .await
                        .map_err(|e| SinkError::Fetch {
                            url: url.clone(),
                            message: e.message,
                        })?;
                Ok(bytes)
            }
        }
    }
}

#[async_trait]
impl ResultSink for FsResultSink {
    async fn store(
        &self,
        job_id: JobId,
        data: &ArtifactData,
        metadata: &ArtifactMetadata,
    ) -> Result<ArtifactRef, SinkError> {
        let bytes = self.materialize(data).await?;
        let dir = self.root.join(job_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| io_error(&dir, source))?;

        let format = image::guess_format(&bytes).ok();
        let extension = format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("bin");
        let image_path = dir.join(format!("{}.{extension}", metadata.index));
        tokio::fs::write(&image_path, &bytes)
            .await
            .map_err(|source| io_error(&image_path, source))?;

        let sidecar = serde_json::to_vec_pretty(metadata)
            .map_err(|e| SinkError::Metadata(e.to_string()))?;
        let sidecar_path = dir.join(format!("{}.json", metadata.index));
        tokio::fs::write(&sidecar_path, sidecar)
            .await
            .map_err(|source| io_error(&sidecar_path, source))?;

        let thumb_path = dir.join(format!("thumb_{}.png", metadata.index));
        let thumbnail_uri = match write_thumbnail(bytes, format, thumb_path.clone()).await {
            Ok(()) => Some(thumb_path.display().to_string()),
            Err(reason) => {
                warn!(%job_id, index = metadata.index, %reason, "thumbnail skipped");
                None
            }
        };

        debug!(%job_id, path = %image_path.display(), "artifact stored");
        Ok(ArtifactRef {
            uri: image_path.display().to_string(),
            thumbnail_uri,
        })
    }
}

async fn write_thumbnail(
    bytes: Bytes,
    format: Option<ImageFormat>,
    path: PathBuf,
) -> Result<(), String> {
    tokio::task::spawn_blocking(move || {
        let decoded = match format {
            Some(format) => image::load_from_memory_with_format(&bytes, format),
            None => image::load_from_memory(&bytes),
        }
        .map_err(|e| e.to_string())?;
        decoded
            .thumbnail(THUMBNAIL_SIZE, THUMBNAIL_SIZE)
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| format!("thumbnail task panicked: {e}"))?
}

fn io_error(path: &Path, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.display().to_string(),
        source,
    }
}
