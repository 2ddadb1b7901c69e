//! Vision Streaming Protocol
//!
//! Wire types for the streaming channel: JSON commands sent to the inference
//! server, and the interleaved binary frames / JSON control messages it sends
//! back.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

/// Commands sent to the server (JSON text messages)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    /// Start processing the given source
    Start {
        #[serde(flatten)]
        source: StartSource,
    },
    /// Stop the running processing session
    Stop,
    /// Ask the server to push a fresh stats message
    Stats,
}

impl Command {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Source referenced by a start command.
///
/// Also used as the body of the REST `start` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source_type", rename_all = "lowercase")]
pub enum StartSource {
    Webcam,
    Video {
        /// Remote identifier returned by the upload endpoint
        video_path: String,
    },
}

/// Raw unit as delivered by the transport, before classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawUnit {
    Binary(Bytes),
    Text(String),
}

/// Classified inbound unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUnit {
    /// One encoded image
    Frame(Bytes),
    /// Decoded JSON control/stats message
    Control(ControlMessage),
}

/// JSON messages received from the server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Stats(StatsSnapshot),
    Status(StatusUpdate),
    #[serde(other)]
    Unknown,
}

/// Payload of a `type: "status"` message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusUpdate {
    pub status: ProcessingStatus,
    /// Absent, empty or non-string values read as `None`
    #[serde(default, deserialize_with = "lenient_label")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "lenient_label")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Started,
    Stopped,
    Error,
    #[serde(other)]
    Unknown,
}

/// Latest known detection-zone occupancy counters.
///
/// Every counter defaults to 0 when it is absent, null, negative or not a
/// number in the incoming payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default, deserialize_with = "lenient_count")]
    pub zones_total: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub zones_occupied: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub vehicles_in_zone: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub parked: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub frontal: u64,
    #[serde(default, deserialize_with = "lenient_count")]
    pub reversa: u64,
}

fn lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let count = match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
            .unwrap_or(0),
        _ => 0,
    };
    Ok(count)
}

fn lenient_label<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    })
}

/// Route a raw unit to its variant.
///
/// Binary payloads are frames; everything else is parsed as JSON. The caller
/// decides what to do with a parse failure.
pub fn classify(raw: RawUnit) -> Result<InboundUnit, serde_json::Error> {
    match raw {
        RawUnit::Binary(bytes) => Ok(InboundUnit::Frame(bytes)),
        RawUnit::Text(text) => serde_json::from_str(&text).map(InboundUnit::Control),
    }
}
