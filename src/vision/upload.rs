//! Video Upload
//!
//! One-shot multipart upload of a video file over HTTP. The server answers
//! with a remote identifier that the subsequent start command refers to.

use async_trait::async_trait;
use log::{info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;

/// Status text used when the server gives no reason for a failed upload
pub const DEFAULT_UPLOAD_ERROR: &str = "Error uploading video";

/// Outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Success {
        /// Server-assigned identifier, opaque to the client
        remote_id: String,
    },
    Failure {
        message: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Body returned by the upload endpoint
#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Anything that can turn a local file into a remote identifier
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &Path) -> UploadResult;
}

/// Uploads over HTTP multipart to the vision upload endpoint
pub struct HttpUploader {
    client: Client,
    url: String,
    field: String,
}

impl HttpUploader {
    pub fn new(url: &str, field: &str) -> Self {
        Self::with_client(Client::new(), url, field)
    }

    pub fn with_client(client: Client, url: &str, field: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
            field: field.to_string(),
        }
    }

    async fn try_upload(&self, file: &Path) -> Result<UploadResult, UploadError> {
        let data = tokio::fs::read(file).await.map_err(|source| UploadError::Read {
            path: file.display().to_string(),
            source,
        })?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        info!(
            "Uploading {} ({} bytes) to {}",
            file_name,
            data.len(),
            self.url
        );

        let part = Part::bytes(data).file_name(file_name);
        let form = Form::new().part(self.field.clone(), part);

        let response = self.client.post(&self.url).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!("Upload endpoint returned {}: {}", status, body);
        }

        Ok(interpret_response(&body))
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, file: &Path) -> UploadResult {
        match self.try_upload(file).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Upload failed: {}", e);
                UploadResult::Failure {
                    message: format!("{}: {}", DEFAULT_UPLOAD_ERROR, e),
                }
            }
        }
    }
}

/// Map an upload response body to a result. Only `status: "success"` with a
/// filename counts as success; the HTTP status code is not consulted.
pub fn interpret_response(body: &str) -> UploadResult {
    match serde_json::from_str::<UploadResponse>(body) {
        Ok(response) if response.status.as_deref() == Some("success") => match response.filename
        {
            Some(remote_id) if !remote_id.is_empty() => UploadResult::Success { remote_id },
            _ => UploadResult::Failure {
                message: "Upload response missing filename".to_string(),
            },
        },
        Ok(response) => UploadResult::Failure {
            message: response
                .message
                .unwrap_or_else(|| DEFAULT_UPLOAD_ERROR.to_string()),
        },
        Err(e) => {
            warn!("Unreadable upload response: {}", e);
            UploadResult::Failure {
                message: DEFAULT_UPLOAD_ERROR.to_string(),
            }
        }
    }
}
