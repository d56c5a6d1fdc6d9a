//! Listend - Always-On Listening Daemon Library
//!
//! A local daemon that:
//! - Captures microphone and system-loopback audio and segments speech
//! - Snapshots the screen with perceptual-hash gating in front of OCR
//! - Streams transcripts, auto-answers, and voice-activity telemetry to UI
//!   clients over WebSocket
//! - Answers chat queries that fuse live transcript + latest screen text
//! - Talks to an external inference service through a circuit-broken,
//!   retrying, trace-propagating client
//!
//! # Example
//!
//! ```ignore
//! use listend::config::Config;
//! use listend::inference::{ClientOptions, HttpInference, InferenceClient};
//! use listend::manager::{Manager, ManagerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let options = ClientOptions::default();
//!     let service = HttpInference::connect(&config.inference_addr, &options)?;
//!     let client = Arc::new(InferenceClient::new(Arc::new(service), options));
//!     let (manager, channels) = Manager::new(client, None, ManagerConfig::from_config(&config));
//!     manager.start()?;
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod trace;
pub mod resilience;
pub mod inference;

// Pipelines
pub mod audio;
pub mod screen;
pub mod transcript;
pub mod memory;
pub mod answer;

// Coordinator and surface
pub mod manager;
pub mod server;

// Re-export commonly used types for convenience
pub use config::Config;
pub use inference::{ClientOptions, HttpInference, InferenceClient, InferenceService};
pub use manager::{Manager, ManagerConfig};
pub use trace::TraceContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
