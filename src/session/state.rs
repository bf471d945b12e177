//! Session state record and transition function
//!
//! `StreamingState` is the single externally observable record for one
//! streaming session. It is owned by the coordinator task and mutated only
//! through the transition functions below, driven by inbound system
//! messages and explicit local commands. Every transition is a pure
//! function of (current state, message) so each is unit-testable on its
//! own.

use serde::Serialize;

use crate::protocol::{Detection, FrameSnapshot, Progress, SystemMessage, UniquePlate};

/// Externally visible phase of the streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingStatus {
    Disconnected,
    Connected,
    Uploading,
    Initializing,
    Processing,
    Paused,
    Completed,
    Stopped,
    Error,
}

/// Local commands that mutate the session record without a round trip
/// to the processing service
#[derive(Debug, Clone)]
pub enum LocalEvent {
    /// Upload call is in flight
    UploadStarted,
    /// Upload accepted; job start will arrive as `streaming_started`
    UploadAccepted,
    /// Upload call failed
    UploadFailed(String),
    /// Caller-invoked error reset, no other side effects
    ErrorCleared,
}

/// Observable session record
#[derive(Debug, Clone, Serialize)]
pub struct StreamingState {
    pub status: StreamingStatus,
    pub is_connected: bool,
    pub is_streaming: bool,
    pub is_paused: bool,
    /// Empty while disconnected
    pub session_id: String,
    pub error: Option<String>,
    pub current_frame: Option<FrameSnapshot>,
    /// Replaced wholesale on each update, never merged
    pub detections: Vec<Detection>,
    /// Replaced wholesale on each update, never merged
    pub unique_plates: Vec<UniquePlate>,
    pub progress: Progress,
    /// Frames per second reported by the engine
    pub processing_speed: f64,
}

impl Default for StreamingState {
    fn default() -> Self {
        Self {
            status: StreamingStatus::Disconnected,
            is_connected: false,
            is_streaming: false,
            is_paused: false,
            session_id: String::new(),
            error: None,
            current_frame: None,
            detections: Vec::new(),
            unique_plates: Vec::new(),
            progress: Progress::default(),
            processing_speed: 0.0,
        }
    }
}

impl StreamingState {
    /// Apply an inbound system message.
    ///
    /// Unknown tags are a no-op here; they still reach subscribers through
    /// the registry.
    pub fn apply(&mut self, msg: &SystemMessage) {
        match msg {
            SystemMessage::ConnectionEstablished | SystemMessage::Unknown => {}
            SystemMessage::StreamingStarted => {
                self.is_streaming = true;
                self.status = StreamingStatus::Processing;
                self.error = None;
            }
            SystemMessage::StreamingUpdate(update) => {
                if let Some(progress) = &update.progress {
                    self.progress = progress.clone();
                }
                if let Some(speed) = update.processing_speed {
                    self.processing_speed = speed;
                }
                if let Some(frame) = &update.frame {
                    self.current_frame = Some(frame.clone());
                }
                if let Some(detections) = &update.detections {
                    self.detections = detections.clone();
                }
                if let Some(summary) = &update.summary {
                    self.unique_plates = summary.best_plates.clone();
                }
            }
            SystemMessage::StreamingCompleted => {
                self.is_streaming = false;
                self.status = StreamingStatus::Completed;
            }
            SystemMessage::StreamingError { message } => {
                self.is_streaming = false;
                self.status = StreamingStatus::Error;
                self.error = Some(message.clone());
            }
            SystemMessage::ProcessingPaused => {
                self.is_paused = true;
                self.status = StreamingStatus::Paused;
            }
            SystemMessage::ProcessingResumed => {
                self.is_paused = false;
                self.status = StreamingStatus::Processing;
            }
            SystemMessage::ProcessingStopped => {
                self.is_streaming = false;
                self.is_paused = false;
                self.status = StreamingStatus::Stopped;
            }
        }
    }

    /// Apply a local command
    pub fn apply_local(&mut self, event: &LocalEvent) {
        match event {
            LocalEvent::UploadStarted => {
                self.status = StreamingStatus::Uploading;
            }
            LocalEvent::UploadAccepted => {
                self.status = StreamingStatus::Initializing;
            }
            LocalEvent::UploadFailed(message) => {
                self.is_streaming = false;
                self.status = StreamingStatus::Error;
                self.error = Some(message.clone());
            }
            LocalEvent::ErrorCleared => {
                self.error = None;
            }
        }
    }

    /// Transition to the connected shape after a successful open
    pub fn mark_connected(&mut self, session_id: &str) {
        self.is_connected = true;
        self.status = StreamingStatus::Connected;
        self.session_id = session_id.to_string();
    }

    /// Transition to the disconnected shape after the transport closed.
    ///
    /// Keeps the last frame, detections and error so observers can still
    /// read them while reconnection is in progress; only `reset` clears
    /// them.
    pub fn mark_disconnected(&mut self) {
        self.is_connected = false;
        self.is_streaming = false;
        self.is_paused = false;
        self.status = StreamingStatus::Disconnected;
        self.session_id.clear();
    }

    /// Record a transport-level error
    pub fn mark_error(&mut self, message: &str) {
        self.status = StreamingStatus::Error;
        self.error = Some(message.to_string());
    }

    /// Record an error without changing the phase (retry exhaustion keeps
    /// the status the close transition set)
    pub fn record_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }

    /// Hard reset to the fully disconnected shape.
    ///
    /// An explicit disconnect clears everything, not just connectivity
    /// flags.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
