//! Platewatch - streaming client for license plate recognition

use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use platewatch::{
    config::Args,
    session::{StreamingSession, StreamingStatus},
    StreamingState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("platewatch={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    if !args.file.is_file() {
        error!("Source file not found: {}", args.file.display());
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Platewatch streaming client");
    info!(
        "  build {} ({})",
        env!("GIT_COMMIT_SHORT"),
        env!("BUILD_TIMESTAMP")
    );
    info!("======================================");
    info!("Source: {}", args.file.display());
    info!("API: {}", args.api_url);
    info!("Streaming: {}", args.ws_base());
    info!(
        "Reconnect: every {}ms, up to {} attempts",
        args.reconnect_interval_ms, args.max_reconnect_attempts
    );
    info!("======================================");

    let session = StreamingSession::new(args.session_config());

    session.connect().await;
    session
        .wait_connected(Duration::from_secs(args.connect_timeout_secs))
        .await?;
    let session_id = session.state().await.session_id;
    info!("Session {} established", session_id);

    // Progress lines as updates stream in
    let _updates = session.subscribe("streaming_update", |data| {
        let processed = data
            .pointer("/progress/processed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = data
            .pointer("/progress/total")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let percent = data
            .pointer("/progress/percent")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let plates = data
            .pointer("/summary/best_plates")
            .and_then(|v| v.as_array())
            .map_or(0, |a| a.len());
        info!(
            "Progress: {}/{} frames ({:.1}%), {} unique plates",
            processed, total, percent, plates
        );
    });

    session
        .start_streaming(&args.file, &args.processing_options())
        .await?;
    info!("Upload accepted, waiting for processing to start");

    let outcome = follow_job(&session).await;

    match outcome {
        JobOutcome::Completed => {
            info!("Processing completed");
            if !args.no_download {
                let format = args.result_format();
                match session.download_results(format).await {
                    Ok(body) => {
                        let path = format!(
                            "platewatch_results_{}.{}",
                            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
                            format.as_str()
                        );
                        tokio::fs::write(&path, &body).await?;
                        info!("Results written to {}", path);
                    }
                    Err(e) => warn!("Result download failed: {}", e),
                }
            }
            session.disconnect().await;
            Ok(())
        }
        JobOutcome::Stopped => {
            info!("Processing stopped");
            session.disconnect().await;
            Ok(())
        }
        JobOutcome::Failed(message) => {
            session.disconnect().await;
            anyhow::bail!("processing failed: {}", message)
        }
    }
}

enum JobOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Poll the session record until the job reaches a terminal state
async fn follow_job(session: &StreamingSession) -> JobOutcome {
    loop {
        let state: StreamingState = session.state().await;
        match state.status {
            StreamingStatus::Completed => return JobOutcome::Completed,
            StreamingStatus::Stopped => return JobOutcome::Stopped,
            StreamingStatus::Error => {
                return JobOutcome::Failed(
                    state.error.unwrap_or_else(|| "unknown error".to_string()),
                )
            }
            StreamingStatus::Disconnected => {
                // A disconnect with no pending retry is terminal: either
                // attempts are exhausted or the peer closed the session
                if !session.retry_pending() {
                    return JobOutcome::Failed(
                        state
                            .error
                            .unwrap_or_else(|| "connection closed".to_string()),
                    );
                }
            }
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
