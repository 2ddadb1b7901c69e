//! Application Configuration
//!
//! Persistent settings for the vision streamer.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // === Server ===
    /// REST base URL (upload, stats, start, stop live under `/vision/`)
    pub api_base_url: String,

    /// Explicit WebSocket URL; derived from `api_base_url` when unset
    pub ws_url: Option<String>,

    /// Delay before reconnecting after the stream closes
    pub reconnect_delay_ms: u64,

    // === Sources ===
    /// Whether the server has a camera attached
    pub webcam_enabled: bool,

    /// Multipart field name for video uploads
    pub upload_field: String,

    // === Display ===
    /// How frames are handed to the renderer
    pub frame_policy: FramePolicy,

    /// Write the displayed frame to this PNG file
    pub snapshot_path: Option<PathBuf>,

    /// Frames between snapshot writes
    pub snapshot_interval: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Server
            api_base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            ws_url: None,
            reconnect_delay_ms: 3000,

            // Sources
            webcam_enabled: false,
            upload_field: "video".to_string(),

            // Display
            frame_policy: FramePolicy::Sequential,
            snapshot_path: None,
            snapshot_interval: 30,
        }
    }
}

impl Settings {
    /// Get settings file path
    pub fn file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("vision-streamer").join("settings.json"))
    }

    /// Load settings from the default location
    pub fn load() -> Result<Self> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("No config directory"))?;
        Self::load_from(&path)
    }

    /// Load settings from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    fn base(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }

    /// WebSocket endpoint of the streaming channel
    pub fn ws_url(&self) -> String {
        if let Some(url) = self.ws_url.as_ref() {
            return url.clone();
        }

        let base = self.base();
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/vision/ws", base)
    }

    /// HTTP endpoint for multipart video uploads
    pub fn upload_url(&self) -> String {
        format!("{}/vision/upload", self.base())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Frame delivery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramePolicy {
    /// Decode and draw each frame before handling the next unit
    #[default]
    Sequential,
    /// Render in the background; a newer frame replaces one still waiting
    LatestWins,
}
