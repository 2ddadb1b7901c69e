//! Vision Module
//!
//! Client side of the inference server: the persistent WebSocket carrying
//! frames and control messages, the HTTP video upload, and the REST fallback.

pub mod api;
pub mod connection;
pub mod protocol;
pub mod upload;

pub use api::VisionApiClient;
pub use connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, StreamLink,
};
pub use protocol::{
    classify, Command, ControlMessage, InboundUnit, ProcessingStatus, RawUnit, StartSource,
    StatsSnapshot, StatusUpdate,
};
pub use upload::{HttpUploader, UploadResult, Uploader};
