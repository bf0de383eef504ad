//! # nzb-dl
//!
//! Multi-connection Usenet binary download engine.
//!
//! Give it NZB manifests and a set of news servers; it fans segment fetches
//! out across every configured connection, decodes yEnc/UUencoded article
//! bodies as they land, and reassembles the original files on disk. Servers
//! act as ordered fallbacks: a segment that one server is missing is retried
//! on the others before being given up on.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nzb_dl::{Config, NzbDownloader, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig {
//!             name: "primary".to_string(),
//!             host: "news.example.com".to_string(),
//!             port: 119,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             connections: 8,
//!             ..Default::default()
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let downloader = NzbDownloader::new(config)?;
//!     downloader.start().await?;
//!
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {event:?}");
//!         }
//!     });
//!
//!     downloader.add_nzb_file("some.nzb").await?;
//!     run_with_shutdown(downloader).await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// File assembly from decoded segments
pub mod assembler;
/// Configuration types
pub mod config;
/// yEnc and UUencode article decoding
pub mod decoder;
/// The download coordinator
pub mod downloader;
/// Error types
pub mod error;
/// Archive, file, and segment domain models
pub mod model;
/// NNTP protocol client and connection pools
pub mod nntp;
/// NZB manifest parsing
pub mod nzb;
/// The shared segment queue
pub mod queue;
/// Retry classification and backoff
pub mod retry;
/// Speed limiting with token bucket
pub mod speed_limiter;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, DownloadConfig, RetryConfig, ServerConfig};
pub use downloader::NzbDownloader;
pub use error::{AssembleError, DecodeError, Error, NntpError, QueueError, Result};
pub use types::{
    ArchiveId, ArchiveState, ArchiveStatus, Event, PoolId, PoolStatus, SegmentKey, StatusSnapshot,
};

/// Run until a termination signal arrives, then shut the downloader down.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(downloader: NzbDownloader) {
    wait_for_signal().await;
    downloader.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("received SIGINT");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("received SIGTERM");
            } else {
                tracing::error!("could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
        }
    }
}
