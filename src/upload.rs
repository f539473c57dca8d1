//! Model upload boundary: single-shot transfer to the collection server.
//!
//! The live implementation posts the model file as `multipart/form-data`
//! and decodes the server's structured JSON verdict. The orchestrator never
//! retries on its own; a failed upload stays failed until the user asks
//! again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upload transfer timeout. Models can be tens of megabytes on slow links.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Structured verdict returned by the collection server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Whether the server accepted the file.
    pub success: bool,
    /// Human-readable status, surfaced verbatim in pipeline state.
    pub message: String,
    /// Server-assigned id for the stored file, when accepted.
    #[serde(rename = "fileId")]
    pub file_id: Option<String>,
}

/// Upload transport errors.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    ServerStatus(reqwest::StatusCode),
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),
}

/// One-shot model uploader.
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    /// Transfer `file` and return the server's structured verdict.
    ///
    /// A transport-level failure is an `Err`; a server-side rejection is an
    /// `Ok` response with `success: false`.
    async fn upload(&self, file: &Path) -> Result<UploadResponse, UploadError>;
}

/// HTTP uploader for the collection server's `/upload-model` endpoint.
#[derive(Clone)]
pub struct HttpUploader {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpUploader {
    /// Build an uploader for `endpoint` (full URL of the upload route).
    pub fn new(endpoint: &str) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, file: &Path) -> Result<UploadResponse, UploadError> {
        let file_name = file
            .file_name()
            .map_or_else(|| "model.usdz".to_string(), |n| n.to_string_lossy().into_owned());
        let bytes = tokio::fs::read(file).await?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("model/vnd.usdz+zip")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self.http.post(&self.endpoint).multipart(form).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::ServerStatus(status));
        }

        Ok(resp.json::<UploadResponse>().await?)
    }
}
