//! Configuration for the Platewatch CLI
//!
//! CLI arguments and environment variable handling using clap. The library
//! itself takes plain config structs (`SessionConfig`,
//! `ProcessingOptions`); this module only exists for the binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::api::{ProcessingOptions, ResultFormat};
use crate::session::SessionConfig;
use crate::types::{PlatewatchError, Result};

/// Platewatch - streaming client for license plate recognition
#[derive(Parser, Debug, Clone)]
#[command(name = "platewatch")]
#[command(about = "Upload a video and follow its plate recognition job")]
pub struct Args {
    /// Video file to process
    pub file: PathBuf,

    /// Base URL of the Platewatch REST API
    #[arg(long, env = "PLATEWATCH_API_URL", default_value = "http://localhost:8000")]
    pub api_url: String,

    /// Base URL of the streaming WebSocket endpoint
    /// (derived from the API URL when unset)
    #[arg(long, env = "PLATEWATCH_WS_URL")]
    pub ws_url: Option<String>,

    /// Minimum detection confidence (0.0 - 1.0)
    #[arg(long, env = "CONFIDENCE_THRESHOLD", default_value = "0.5")]
    pub confidence_threshold: f64,

    /// Process every Nth frame
    #[arg(long, env = "FRAME_SKIP", default_value = "1")]
    pub frame_skip: u32,

    /// Stop processing after this many seconds of video
    #[arg(long, env = "MAX_DURATION")]
    pub max_duration: Option<u64>,

    /// Run the engine's high quality (slower) pipeline
    #[arg(long, env = "HIGH_QUALITY", default_value = "false")]
    pub high_quality: bool,

    /// Skip annotated frame images in streaming updates
    #[arg(long, env = "NO_ANNOTATED_FRAMES", default_value = "false")]
    pub no_annotated_frames: bool,

    /// Delay between reconnection attempts in milliseconds
    #[arg(long, env = "RECONNECT_INTERVAL_MS", default_value = "3000")]
    pub reconnect_interval_ms: u64,

    /// Maximum consecutive reconnection attempts
    #[arg(long, env = "MAX_RECONNECT_ATTEMPTS", default_value = "5")]
    pub max_reconnect_attempts: u32,

    /// Seconds to wait for the initial connection
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Result format to download on completion (json or csv)
    #[arg(long, env = "RESULT_FORMAT", default_value = "json")]
    pub result_format: String,

    /// Skip downloading results on completion
    #[arg(long, default_value = "false")]
    pub no_download: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate cross-field constraints clap cannot express
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(PlatewatchError::Config(format!(
                "confidence threshold {} out of range 0.0-1.0",
                self.confidence_threshold
            )));
        }
        if self.frame_skip == 0 {
            return Err(PlatewatchError::Config(
                "frame skip must be at least 1".into(),
            ));
        }
        self.result_format.parse::<ResultFormat>()?;
        Ok(())
    }

    /// WebSocket base URL, derived from the API URL when not given
    pub fn ws_base(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None => {
                if let Some(rest) = self.api_url.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = self.api_url.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    self.api_url.clone()
                }
            }
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ws_base: self.ws_base(),
            api_base: self.api_url.clone(),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn processing_options(&self) -> ProcessingOptions {
        ProcessingOptions {
            confidence_threshold: self.confidence_threshold,
            frame_skip: self.frame_skip,
            max_duration_secs: self.max_duration,
            high_quality: self.high_quality,
            annotate_frames: !self.no_annotated_frames,
        }
    }

    pub fn result_format(&self) -> ResultFormat {
        // Validated in validate()
        self.result_format.parse().unwrap_or(ResultFormat::Json)
    }
}
