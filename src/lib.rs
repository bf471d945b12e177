//! Platewatch - streaming client for license plate recognition
//!
//! Platewatch uploads a source video to the recognition service and
//! follows the processing job over a long-lived WebSocket connection:
//! typed messages are multiplexed to registered subscribers, the session
//! status is derived from the event stream, and unintended disconnects
//! are retried on a fixed interval.
//!
//! ## Components
//!
//! - **Session**: coordinator task owning the connection, the reconnect
//!   timer and the observable session record
//! - **Protocol**: tagged JSON envelope codec and typed payload records
//! - **Api**: out-of-band REST calls (multipart upload, result download)
//! - **Config**: CLI arguments and environment variables for the binary

pub mod api;
pub mod config;
pub mod protocol;
pub mod session;
pub mod types;

pub use api::{ApiClient, ProcessingOptions, ResultFormat};
pub use config::Args;
pub use protocol::{Command, Envelope};
pub use session::{SessionConfig, StreamingSession, StreamingState, StreamingStatus};
pub use types::{PlatewatchError, Result};
