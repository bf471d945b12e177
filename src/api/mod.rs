//! REST API client for out-of-band operations
//!
//! The streaming connection carries only events and commands; the source
//! file travels up as a multipart upload tagged with the session id, and
//! finished results come back down as a downloadable artifact. Both are
//! plain request/response calls with no state machine of their own.

use std::path::Path;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use tracing::{debug, info};

use crate::types::{PlatewatchError, Result};

/// Flat set of named processing options carried with an upload
#[derive(Debug, Clone)]
pub struct ProcessingOptions {
    /// Minimum detection confidence, 0.0..=1.0
    pub confidence_threshold: f64,
    /// Process every Nth frame (1 = every frame)
    pub frame_skip: u32,
    /// Stop processing after this many seconds of video
    pub max_duration_secs: Option<u64>,
    /// Run the engine's high quality (slower) pipeline
    pub high_quality: bool,
    /// Return annotated frame images in streaming updates
    pub annotate_frames: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            frame_skip: 1,
            max_duration_secs: None,
            high_quality: false,
            annotate_frames: true,
        }
    }
}

/// Output format selector for result retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFormat {
    Json,
    Csv,
}

impl ResultFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

impl std::str::FromStr for ResultFormat {
    type Err = PlatewatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(PlatewatchError::Config(format!(
                "unknown result format '{}' (expected json or csv)",
                other
            ))),
        }
    }
}

/// HTTP client for the Platewatch REST API
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client targeting the given API base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Upload a source video for the given session.
    ///
    /// The backend acknowledges the upload synchronously; the job start is
    /// announced later over the streaming connection.
    pub async fn upload_video(
        &self,
        session_id: &str,
        path: &Path,
        options: &ProcessingOptions,
    ) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let body = tokio::fs::read(path).await?;

        info!(
            session_id = %session_id,
            file = %file_name,
            size = body.len(),
            "Uploading source video"
        );

        let mut form = Form::new()
            .text("session_id", session_id.to_string())
            .text(
                "confidence_threshold",
                options.confidence_threshold.to_string(),
            )
            .text("frame_skip", options.frame_skip.to_string())
            .text("high_quality", options.high_quality.to_string())
            .text("annotate_frames", options.annotate_frames.to_string())
            .part(
                "file",
                Part::bytes(body)
                    .file_name(file_name)
                    .mime_str("application/octet-stream")
                    .map_err(|e| PlatewatchError::Api(format!("invalid upload part: {}", e)))?,
            );
        if let Some(max) = options.max_duration_secs {
            form = form.text("max_duration", max.to_string());
        }

        let url = format!("{}/api/v1/streaming/upload", self.base_url);
        let response = self.http.post(&url).multipart(form).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(PlatewatchError::Api(format!(
                "upload failed with status {}: {}",
                status, detail
            )));
        }

        debug!(session_id = %session_id, "Upload accepted");
        Ok(())
    }

    /// Download the results artifact for a finished session
    pub async fn download_results(&self, session_id: &str, format: ResultFormat) -> Result<Bytes> {
        let url = format!(
            "{}/api/v1/streaming/results/{}?format={}",
            self.base_url,
            session_id,
            format.as_str()
        );
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(PlatewatchError::Api(format!(
                "result download failed with status {}: {}",
                status, detail
            )));
        }

        Ok(response.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8000/");
        assert_eq!(client.base_url, "http://localhost:8000");
    }

    #[test]
    fn test_result_format_parsing() {
        assert_eq!("json".parse::<ResultFormat>().unwrap(), ResultFormat::Json);
        assert_eq!("csv".parse::<ResultFormat>().unwrap(), ResultFormat::Csv);
        assert!("xml".parse::<ResultFormat>().is_err());
    }

    #[test]
    fn test_default_options() {
        let options = ProcessingOptions::default();
        assert_eq!(options.confidence_threshold, 0.5);
        assert_eq!(options.frame_skip, 1);
        assert!(options.max_duration_secs.is_none());
    }
}
