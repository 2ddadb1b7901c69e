//! Application State Management
//!
//! Streaming session state machine. All session state is mutated from one
//! dispatch loop, in reaction to connection events, upload completions and
//! user actions.

pub mod config;
pub mod types;

pub use config::{FramePolicy, Settings};
pub use types::{
    SessionStatus, SourceKind, SourceSelection, StartPhase, UiAction, DEFAULT_ERROR_LABEL,
    DEFAULT_SOURCE_LABEL,
};

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::media::{FrameRenderer, FrameSink, FrameSurface, RenderStats};
use crate::vision::{
    classify, Command, ConnectionEvent, ConnectionManager, ControlMessage, HttpUploader,
    InboundUnit, ProcessingStatus, RawUnit, StartSource, StatsSnapshot, StatusUpdate, StreamLink,
    UploadResult, Uploader,
};

const NOT_CONNECTED: &str = "WebSocket not connected";

/// Completion of a spawned upload
#[derive(Debug)]
pub struct UploadFinished {
    seq: u64,
    file: PathBuf,
    result: UploadResult,
}

/// One viewing session against the inference server
pub struct VisionSession<L: StreamLink, U: Uploader + 'static> {
    link: L,
    uploader: Arc<U>,
    frames: FrameSink,
    webcam_enabled: bool,

    status: SessionStatus,
    /// Transient text shown instead of the status label until the next change
    notice: Option<String>,
    stats: StatsSnapshot,
    source: SourceSelection,

    /// Identifies the upload whose result may still start a session
    upload_seq: u64,
    upload_tx: mpsc::Sender<UploadFinished>,
    upload_rx: mpsc::Receiver<UploadFinished>,

    malformed_messages: u64,
    /// Start the selected source on the next transition to Ready
    start_when_ready: bool,
}

impl<L: StreamLink, U: Uploader + 'static> VisionSession<L, U> {
    pub fn new(link: L, uploader: U, frames: FrameSink, webcam_enabled: bool) -> Self {
        let (upload_tx, upload_rx) = mpsc::channel(4);
        Self {
            link,
            uploader: Arc::new(uploader),
            frames,
            webcam_enabled,
            status: SessionStatus::Disconnected,
            notice: None,
            stats: StatsSnapshot::default(),
            source: SourceSelection::default(),
            upload_seq: 0,
            upload_tx,
            upload_rx,
            malformed_messages: 0,
            start_when_ready: false,
        }
    }

    /// Start the selected source as soon as the connection is ready
    pub fn start_when_ready(&mut self) {
        self.start_when_ready = true;
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Text for the status indicator
    pub fn status_text(&self) -> String {
        self.notice
            .clone()
            .unwrap_or_else(|| self.status.label())
    }

    pub fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }

    pub fn source(&self) -> &SourceSelection {
        &self.source
    }

    pub fn render_stats(&self) -> RenderStats {
        self.frames.stats()
    }

    pub fn malformed_messages(&self) -> u64 {
        self.malformed_messages
    }

    /// Start is actionable: link open, nothing running, source usable
    pub fn can_start(&self) -> bool {
        self.link.is_open()
            && self.status.is_idle()
            && match self.source.kind {
                SourceKind::Webcam => self.webcam_enabled,
                SourceKind::VideoFile => self.source.file.is_some(),
            }
    }

    pub fn can_stop(&self) -> bool {
        self.link.is_open() && matches!(self.status, SessionStatus::Live(_))
    }

    fn set_status(&mut self, status: SessionStatus) {
        if status != self.status {
            info!("Status: {}", status.label());
        }
        self.status = status;
        self.notice = None;
    }

    fn set_notice(&mut self, notice: impl Into<String>) {
        let notice = notice.into();
        info!("{}", notice);
        self.notice = Some(notice);
    }

    pub async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                self.set_status(SessionStatus::Ready);
                if self.start_when_ready && self.can_start() {
                    self.start_when_ready = false;
                    self.start();
                }
            }
            ConnectionEvent::Message(raw) => self.dispatch(raw).await,
            ConnectionEvent::Error(e) => {
                warn!("Vision connection error: {}", e);
                self.set_notice("Connection error");
            }
            ConnectionEvent::Closed => self.set_status(SessionStatus::Disconnected),
        }
    }

    /// Route one inbound unit. Units are handled strictly in arrival order.
    async fn dispatch(&mut self, raw: RawUnit) {
        match classify(raw) {
            Ok(InboundUnit::Frame(data)) => self.frames.submit(data).await,
            Ok(InboundUnit::Control(message)) => self.apply_control(message),
            Err(e) => {
                self.malformed_messages += 1;
                warn!("Failed to parse vision message: {}", e);
            }
        }
    }

    /// Control/stats handler
    pub fn apply_control(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Stats(stats) => {
                debug!("Stats: {:?}", stats);
                self.stats = stats;
            }
            ControlMessage::Status(update) => self.apply_status(update),
            ControlMessage::Unknown => debug!("Ignoring control message of unknown type"),
        }
    }

    fn apply_status(&mut self, update: StatusUpdate) {
        match update.status {
            ProcessingStatus::Started => {
                let source = update
                    .source
                    .unwrap_or_else(|| DEFAULT_SOURCE_LABEL.to_string());
                self.set_status(SessionStatus::Live(source));
            }
            ProcessingStatus::Stopped => self.set_status(SessionStatus::Stopped),
            ProcessingStatus::Error => {
                let message = update
                    .message
                    .unwrap_or_else(|| DEFAULT_ERROR_LABEL.to_string());
                warn!("Server reported processing error: {}", message);
                self.set_status(SessionStatus::Error(message));
            }
            ProcessingStatus::Unknown => debug!("Ignoring unknown processing status"),
        }
    }

    /// Handle a user action. `Quit` is handled by the dispatch loop.
    pub fn handle_action(&mut self, action: UiAction) {
        match action {
            UiAction::SelectSource(kind) => self.select_source(kind),
            UiAction::SelectFile(path) => self.select_file(path),
            UiAction::Start => self.start(),
            UiAction::Stop => self.stop(),
            UiAction::RefreshStats => self.refresh_stats(),
            UiAction::Reconnect => {
                if !self.link.connect() {
                    debug!("Reconnect ignored: connection already open or connecting");
                }
            }
            UiAction::ShowStatus => {
                let render = self.render_stats();
                info!("Status: {}", self.status_text());
                info!(
                    "Zones {}/{} occupied, {} vehicles in zone, {} parked, {} frontal, {} reversing",
                    self.stats.zones_occupied,
                    self.stats.zones_total,
                    self.stats.vehicles_in_zone,
                    self.stats.parked,
                    self.stats.frontal,
                    self.stats.reversa
                );
                info!(
                    "Frames drawn {}, dropped {}, undecodable {}, malformed messages {}",
                    render.frames_drawn,
                    render.frames_dropped,
                    render.decode_failures,
                    self.malformed_messages
                );
            }
            UiAction::Quit => {}
        }
    }

    fn select_source(&mut self, kind: SourceKind) {
        if self.status.is_busy() {
            debug!("Source change ignored while {:?}", self.status);
            return;
        }
        if kind == SourceKind::Webcam && !self.webcam_enabled {
            self.set_notice("Webcam not available on server");
            return;
        }
        self.source.kind = kind;
    }

    fn select_file(&mut self, path: PathBuf) {
        if self.status.is_busy() {
            debug!("File change ignored while {:?}", self.status);
            return;
        }
        self.source.kind = SourceKind::VideoFile;
        self.source.file = Some(path);
        if let Some(name) = self.source.file_name() {
            self.set_notice(format!("Selected file: {}", name));
        }
    }

    fn start(&mut self) {
        if !self.link.is_open() {
            self.set_notice(NOT_CONNECTED);
            return;
        }
        if !self.can_start() {
            debug!(
                "Start ignored: status {:?}, source {:?}",
                self.status, self.source
            );
            return;
        }

        match self.source.kind {
            SourceKind::Webcam => self.send_start(StartSource::Webcam),
            SourceKind::VideoFile => {
                let Some(file) = self.source.file.clone() else {
                    return;
                };
                self.begin_upload(file);
            }
        }
    }

    fn begin_upload(&mut self, file: PathBuf) {
        self.set_status(SessionStatus::Starting(StartPhase::Uploading));
        self.upload_seq += 1;

        let seq = self.upload_seq;
        let uploader = Arc::clone(&self.uploader);
        let upload_tx = self.upload_tx.clone();
        tokio::spawn(async move {
            let result = uploader.upload(&file).await;
            let _ = upload_tx.send(UploadFinished { seq, file, result }).await;
        });
    }

    /// Second half of a video start: only a successful upload for the current
    /// selection, while still uploading, produces a start command.
    pub fn handle_upload_finished(&mut self, finished: UploadFinished) {
        let current = finished.seq == self.upload_seq
            && self.status == SessionStatus::Starting(StartPhase::Uploading)
            && self.source.file.as_deref() == Some(finished.file.as_path());
        if !current {
            info!(
                "Discarding upload result for {:?} (status {:?})",
                finished.file, self.status
            );
            return;
        }

        match finished.result {
            UploadResult::Success { remote_id } => {
                info!("Upload complete: {}", remote_id);
                self.send_start(StartSource::Video {
                    video_path: remote_id,
                });
            }
            UploadResult::Failure { message } => {
                warn!("Upload failed: {}", message);
                self.set_status(SessionStatus::Error(message));
            }
        }
    }

    fn send_start(&mut self, source: StartSource) {
        match self.link.send(&Command::Start { source }) {
            Ok(()) => self.set_status(SessionStatus::Starting(StartPhase::AwaitingAck)),
            Err(e) => {
                warn!("Failed to send start command: {}", e);
                self.set_status(SessionStatus::Error(e.to_string()));
            }
        }
    }

    fn stop(&mut self) {
        if !self.link.is_open() {
            self.set_notice(NOT_CONNECTED);
            return;
        }
        if !self.can_stop() {
            debug!("Stop ignored while {:?}", self.status);
            return;
        }

        match self.link.send(&Command::Stop) {
            Ok(()) => self.set_status(SessionStatus::Stopping),
            Err(e) => self.set_notice(e.to_string()),
        }
    }

    fn refresh_stats(&mut self) {
        if !self.link.is_open() {
            self.set_notice(NOT_CONNECTED);
            return;
        }
        if let Err(e) = self.link.send(&Command::Stats) {
            self.set_notice(e.to_string());
        }
    }

    /// Close the link, cancel reconnection and stop drawing
    pub fn shutdown(&mut self) {
        self.link.shutdown();
        self.frames.dispose();
        info!("Vision session closed");
    }
}

/// Build a session against the configured server, drawing to `surface`.
///
/// Must be called from within a Tokio runtime.
pub fn build_session(
    settings: &Settings,
    surface: impl FrameSurface,
) -> (
    VisionSession<ConnectionManager, HttpUploader>,
    mpsc::Receiver<ConnectionEvent>,
) {
    let (link, events) = ConnectionManager::new(settings.ws_url(), settings.reconnect_delay());
    let uploader = HttpUploader::new(&settings.upload_url(), &settings.upload_field);
    let frames = FrameSink::new(FrameRenderer::new(surface), settings.frame_policy);
    let session = VisionSession::new(link, uploader, frames, settings.webcam_enabled);
    (session, events)
}

/// Dispatch loop: connects, then processes user actions, upload completions
/// and connection events one at a time until `Quit` (or the action
/// channel closes). Tears the session down before returning it.
pub async fn run<L: StreamLink, U: Uploader + 'static>(
    mut session: VisionSession<L, U>,
    mut connection_events: mpsc::Receiver<ConnectionEvent>,
    mut actions: mpsc::Receiver<UiAction>,
) -> VisionSession<L, U> {
    session.link.connect();

    loop {
        tokio::select! {
            biased;
            // Low-volume sources first, so a saturated frame stream cannot
            // starve user actions or upload completions
            action = actions.recv() => match action {
                Some(UiAction::Quit) | None => break,
                Some(action) => session.handle_action(action),
            },
            Some(finished) = session.upload_rx.recv() => session.handle_upload_finished(finished),
            event = connection_events.recv() => match event {
                Some(event) => session.handle_connection_event(event).await,
                None => {
                    warn!("Connection event channel closed");
                    break;
                }
            },
        }
    }

    session.shutdown();
    session
}
