//! Vision REST Client
//!
//! Request/response fallback for the streaming commands: fetch stats, start
//! and stop processing without holding a WebSocket open.

use log::{error, info};
use reqwest::Client;
use serde_json::Value;

use super::protocol::StartSource;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Status { status: u16, body: String },
}

pub struct VisionApiClient {
    client: Client,
    base_url: String,
}

impl VisionApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/vision/{}", self.base_url, path)
    }

    /// GET stats
    pub async fn fetch_stats(&self) -> Result<Value, ApiError> {
        let url = self.endpoint("stats");
        info!("Fetching vision stats from {}", url);
        let response = self.client.get(&url).send().await?;
        Self::json_body(response).await
    }

    /// POST start with `{source_type, video_path?}`
    pub async fn start_processing(&self, source: &StartSource) -> Result<Value, ApiError> {
        let url = self.endpoint("start");
        info!("Starting processing via {}: {:?}", url, source);
        let response = self.client.post(&url).json(source).send().await?;
        Self::json_body(response).await
    }

    /// POST stop
    pub async fn stop_processing(&self) -> Result<Value, ApiError> {
        let url = self.endpoint("stop");
        info!("Stopping processing via {}", url);
        let response = self.client.post(&url).send().await?;
        Self::json_body(response).await
    }

    async fn json_body(response: reqwest::Response) -> Result<Value, ApiError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Vision API request failed: {} - {}", status, body);
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}
