//! Audio ingestion pipeline
//!
//! ```text
//! cpal devices → per-device reader threads → bounded chunk channel
//!                                                 ↓ (audio loop)
//!                                          VAD segmenter → speech segments
//! ```
//!
//! Device readers never block: a full channel drops the chunk. Segmentation
//! is per device, so a microphone and a loopback device can talk over each
//! other without corrupting each other's state.

pub mod capture;
pub mod vad;

pub use capture::{AudioCapturer, CaptureConfig, Chunk};
pub use vad::{Segmenter, SpeechSegment, VadConfig, VadEvent};
