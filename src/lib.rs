//! Cutlery defect inspection pipeline
//!
//! Images uploaded through the ingestion API are stored in an S3-compatible
//! artifact store and queued in Redis. The worker consumes the queue, grades
//! each image with a hosted vision model (Azure OpenAI or Amazon Bedrock) and
//! writes one processed JSON result per image.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;

/// Resolves on SIGTERM or SIGINT (Ctrl-C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot register SIGTERM handler, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
