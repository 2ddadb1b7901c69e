//! Application Types
//!
//! Common types used across the application.

use std::path::PathBuf;

/// Label shown for a live session whose source the server did not name
pub const DEFAULT_SOURCE_LABEL: &str = "Camera";

/// Label shown for a server error without a message
pub const DEFAULT_ERROR_LABEL: &str = "Error";

/// Lifecycle of a processing session as understood by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// No open streaming connection
    Disconnected,
    /// Connected, nothing running
    Ready,
    /// Start requested, not yet acknowledged
    Starting(StartPhase),
    /// Server confirmed processing of the named source
    Live(String),
    /// Stop sent, waiting for the server to confirm
    Stopping,
    /// Server confirmed the session stopped
    Stopped,
    /// Server or upload error; the message is shown verbatim
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPhase {
    /// Video file is being uploaded
    Uploading,
    /// Start command sent, waiting for `status: started`
    AwaitingAck,
}

impl SessionStatus {
    /// Human-readable status text
    pub fn label(&self) -> String {
        match self {
            SessionStatus::Disconnected => "Disconnected".to_string(),
            SessionStatus::Ready => "System ready".to_string(),
            SessionStatus::Starting(StartPhase::Uploading) => "Uploading video...".to_string(),
            SessionStatus::Starting(StartPhase::AwaitingAck) => "Starting...".to_string(),
            SessionStatus::Live(source) => format!("LIVE - {}", source),
            SessionStatus::Stopping => "Stopping...".to_string(),
            SessionStatus::Stopped => "Stopped".to_string(),
            SessionStatus::Error(message) => message.clone(),
        }
    }

    /// Connected with nothing running: Ready, Stopped or Error
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::Stopped | SessionStatus::Error(_)
        )
    }

    /// Server-confirmed processing flag
    pub fn is_processing(&self) -> bool {
        matches!(self, SessionStatus::Live(_) | SessionStatus::Stopping)
    }

    /// A session is starting, live or stopping
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting(_) | SessionStatus::Live(_) | SessionStatus::Stopping
        )
    }
}

/// Kind of video source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Camera attached to the server. Only usable when enabled in settings.
    Webcam,
    /// Video file uploaded from this machine
    #[default]
    VideoFile,
}

/// Currently selected source
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceSelection {
    pub kind: SourceKind,
    pub file: Option<PathBuf>,
}

impl SourceSelection {
    pub fn file_name(&self) -> Option<String> {
        self.file
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// User actions fed to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiAction {
    /// Choose the source kind
    SelectSource(SourceKind),
    /// Choose the video file to upload
    SelectFile(PathBuf),
    /// Start processing the selected source
    Start,
    /// Stop the live session
    Stop,
    /// Ask the server for fresh stats
    RefreshStats,
    /// Reconnect now, superseding any scheduled attempt
    Reconnect,
    /// Log the current status and stats
    ShowStatus,
    /// Tear down and exit
    Quit,
}

impl UiAction {
    /// Parse one console line, e.g. `file ./clip.mp4` or `source webcam`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let command = parts.next()?.to_ascii_lowercase();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        match (command.as_str(), arg) {
            ("start", None) => Some(UiAction::Start),
            ("stop", None) => Some(UiAction::Stop),
            ("stats", None) => Some(UiAction::RefreshStats),
            ("reconnect", None) => Some(UiAction::Reconnect),
            ("status", None) => Some(UiAction::ShowStatus),
            ("quit" | "exit", None) => Some(UiAction::Quit),
            ("source", Some("webcam")) => Some(UiAction::SelectSource(SourceKind::Webcam)),
            ("source", Some("video")) => Some(UiAction::SelectSource(SourceKind::VideoFile)),
            ("file", Some(path)) => Some(UiAction::SelectFile(PathBuf::from(path))),
            _ => None,
        }
    }
}
