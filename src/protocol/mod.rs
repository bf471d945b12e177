//! Wire protocol for the streaming WebSocket
//!
//! All frames are JSON text messages with a tagged envelope:
//!
//! ```json
//! { "type": "streaming_update", "data": { ... } }
//! ```
//!
//! Inbound system tags drive the session state machine; everything else
//! (including tags this crate does not know about) is forwarded verbatim
//! to registered subscribers. Malformed frames are isolated as errors and
//! never reach the transport loop as panics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{PlatewatchError, Result};

// ============================================================================
// Envelope
// ============================================================================

/// Tagged message envelope exchanged over the streaming connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag (e.g. "streaming_update")
    #[serde(rename = "type")]
    pub tag: String,
    /// Structured payload, opaque to the transport layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message, set on error-bearing frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decode a raw text frame into an envelope
pub fn decode_envelope(raw: &str) -> Result<Envelope> {
    serde_json::from_str(raw)
        .map_err(|e| PlatewatchError::Protocol(format!("undecodable frame: {}", e)))
}

// ============================================================================
// Outbound commands
// ============================================================================

/// Commands sent to the processing service over the streaming connection
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    PauseProcessing,
    ResumeProcessing,
    StopProcessing,
    GetStatus,
}

impl Command {
    /// Serialize the command to its wire representation
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| PlatewatchError::Protocol(format!("failed to encode command: {}", e)))
    }
}

// ============================================================================
// Inbound system messages
// ============================================================================

/// System messages the session state machine branches on.
///
/// Tags outside this set map to `Unknown`, a state no-op that still
/// reaches registered subscribers.
#[derive(Debug, Clone)]
pub enum SystemMessage {
    ConnectionEstablished,
    StreamingStarted,
    StreamingUpdate(StreamingUpdate),
    StreamingCompleted,
    StreamingError { message: String },
    ProcessingPaused,
    ProcessingResumed,
    ProcessingStopped,
    Unknown,
}

impl SystemMessage {
    /// Map a decoded envelope onto the closed system tag set.
    ///
    /// A `streaming_update` with an undecodable payload degrades to an
    /// empty update rather than failing the whole frame.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        match envelope.tag.as_str() {
            "connection_established" => Self::ConnectionEstablished,
            "streaming_started" => Self::StreamingStarted,
            "streaming_update" => {
                let update = envelope
                    .data
                    .as_ref()
                    .and_then(|d| serde_json::from_value(d.clone()).ok())
                    .unwrap_or_default();
                Self::StreamingUpdate(update)
            }
            "streaming_completed" => Self::StreamingCompleted,
            "streaming_error" => Self::StreamingError {
                message: envelope
                    .error
                    .clone()
                    .or_else(|| {
                        envelope
                            .data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "unknown streaming error".to_string()),
            },
            "processing_paused" => Self::ProcessingPaused,
            "processing_resumed" => Self::ProcessingResumed,
            "processing_stopped" => Self::ProcessingStopped,
            _ => Self::Unknown,
        }
    }
}

// ============================================================================
// Payload records
// ============================================================================

/// Latest processed frame snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSnapshot {
    /// Base64-encoded annotated frame image
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub frame_number: u64,
    /// Source timestamp in seconds
    #[serde(default)]
    pub timestamp: f64,
    /// Engine processing time for this frame, in milliseconds
    #[serde(default)]
    pub processing_time: f64,
}

/// Single plate detection, forwarded verbatim.
///
/// Only the fields used for local bookkeeping are typed; everything else
/// rides along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub plate_text: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Best observed reading of one distinct plate across the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniquePlate {
    #[serde(default)]
    pub plate_text: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Number of frames this plate was seen in
    #[serde(default)]
    pub seen_count: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Processing progress snapshot, always replaced wholesale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub percent: f64,
}

/// Rolling summary carried by `streaming_update` frames
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSummary {
    /// Best reading per distinct plate so far
    #[serde(default)]
    pub best_plates: Vec<UniquePlate>,
    #[serde(default)]
    pub total_detections: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Payload of a `streaming_update` frame.
///
/// Every field is optional on the wire; absent fields leave the
/// corresponding state untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingUpdate {
    #[serde(default)]
    pub progress: Option<Progress>,
    #[serde(default)]
    pub processing_speed: Option<f64>,
    #[serde(default)]
    pub frame: Option<FrameSnapshot>,
    #[serde(default)]
    pub detections: Option<Vec<Detection>>,
    #[serde(default)]
    pub summary: Option<UpdateSummary>,
}
