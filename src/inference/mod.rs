//! Inference backend contract
//!
//! The daemon never runs models in-process; everything model-shaped lives
//! behind [`InferenceService`], an async trait mirroring the upstream
//! surface (speech detection, transcription, OCR, question classification,
//! streaming analysis, vector memory). [`client::InferenceClient`] wraps any
//! implementation with the resilience stack (circuit breaker, retries,
//! health monitoring, trace propagation); [`http::HttpInference`] is the
//! shipped transport.

pub mod client;
pub mod http;
pub mod stub;

pub use client::{ClientOptions, InferenceClient};
pub use http::HttpInference;
pub use stub::StubInference;

use crate::resilience::{CircuitOpen, Retryable};
use crate::trace::TraceContext;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============ Error Model ============

/// Wire-level error codes shared with the inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unspecified,
    Unknown,
    Internal,
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Unavailable,
    Timeout,
    Cancelled,
    ResourceExhausted,
    Aborted,
    AudioCapture,
    AudioFormat,
    LlmRateLimited,
    LlmFailed,
    MemoryStoreFailed,
    OcrFailed,
    ConfigInvalid,
}

impl ErrorCode {
    /// Transient errors are fed through the breaker and retried; everything
    /// else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable
                | ErrorCode::Timeout
                | ErrorCode::ResourceExhausted
                | ErrorCode::Aborted
                | ErrorCode::Internal
                | ErrorCode::LlmRateLimited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unspecified => "UNSPECIFIED",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::AudioCapture => "AUDIO_CAPTURE",
            ErrorCode::AudioFormat => "AUDIO_FORMAT",
            ErrorCode::LlmRateLimited => "LLM_RATE_LIMITED",
            ErrorCode::LlmFailed => "LLM_FAILED",
            ErrorCode::MemoryStoreFailed => "MEMORY_STORE_FAILED",
            ErrorCode::OcrFailed => "OCR_FAILED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error crossing the inference boundary: a code from the enumerated set,
/// a message, and optional metadata preserved across the wire.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct InferenceError {
    pub code: ErrorCode,
    pub message: String,
    pub metadata: Option<HashMap<String, String>>,
    synthetic_open: bool,
}

impl InferenceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: None,
            synthetic_open: false,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The synthetic error produced when the circuit breaker rejects a call
    /// before it reaches the wire.
    pub fn circuit_open() -> Self {
        Self {
            code: ErrorCode::Unavailable,
            message: "circuit breaker open".to_string(),
            metadata: None,
            synthetic_open: true,
        }
    }

    /// True for breaker rejections; expected during outages, so background
    /// producers (VAD, OCR) silence these instead of logging errors.
    pub fn is_circuit_open(&self) -> bool {
        self.synthetic_open
    }

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

impl From<CircuitOpen> for InferenceError {
    fn from(_: CircuitOpen) -> Self {
        InferenceError::circuit_open()
    }
}

impl Retryable for InferenceError {
    /// Breaker rejections are not retried; the breaker is already the gate.
    fn is_transient(&self) -> bool {
        self.code.is_transient() && !self.synthetic_open
    }
}

// ============ Request / Response Types ============

/// Backend serving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizedSegment {
    pub speaker: String,
    pub start_ns: i64,
    pub end_ns: i64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpeechDetection {
    pub probability: f32,
    pub is_speech: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    #[serde(default)]
    pub boxes: Vec<TextBox>,
}

/// Prompt for the streaming analysis verb: the user's query fused with
/// recent transcript, latest screen text, and optionally the raw frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub user_query: String,
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub context_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeChunk {
    pub content: String,
    #[serde(default)]
    pub is_final: bool,
}

/// Where a memory item originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Audio,
    Screen,
}

impl MemorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemorySource::Audio => "audio",
            MemorySource::Screen => "screen",
        }
    }
}

/// One pending vector-memory write, owned by the batcher until flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub text: String,
    pub source: MemorySource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub document: String,
    pub score: f32,
}

/// Server-streamed analysis chunks.
pub type ChunkStream = BoxStream<'static, Result<AnalyzeChunk, InferenceError>>;

// ============ Service Trait ============

/// The upstream inference surface the daemon consumes.
///
/// Implementations inject the trace context into their wire metadata; the
/// shipped HTTP transport sends it as request headers.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn check_health(&self, ctx: &TraceContext) -> Result<HealthStatus, InferenceError>;

    async fn transcribe(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Transcription, InferenceError>;

    async fn diarize(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
        min_speakers: u32,
        max_speakers: u32,
    ) -> Result<Vec<DiarizedSegment>, InferenceError>;

    /// Classify one fixed-size window (exactly 512 samples at the configured
    /// rate) as speech or not.
    async fn detect_speech(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<SpeechDetection, InferenceError>;

    /// Drop any streaming VAD state held on the backend.
    async fn reset_vad(&self, ctx: &TraceContext) -> Result<(), InferenceError>;

    async fn extract_text(
        &self,
        ctx: &TraceContext,
        image: &[u8],
        format: &str,
    ) -> Result<OcrResult, InferenceError>;

    /// Server-streaming LLM analysis.
    async fn analyze(
        &self,
        ctx: &TraceContext,
        request: AnalyzeRequest,
    ) -> Result<ChunkStream, InferenceError>;

    async fn is_question(&self, ctx: &TraceContext, text: &str) -> Result<bool, InferenceError>;

    async fn summarize(
        &self,
        ctx: &TraceContext,
        transcript: &str,
        max_length: u32,
    ) -> Result<String, InferenceError>;

    /// Store a single memory item; returns the backend id.
    async fn store_memory(
        &self,
        ctx: &TraceContext,
        text: &str,
        source: MemorySource,
    ) -> Result<String, InferenceError>;

    /// Store a batch of items; returns the stored count.
    async fn batch_store(
        &self,
        ctx: &TraceContext,
        items: &[MemoryItem],
    ) -> Result<u32, InferenceError>;

    async fn query_memory(
        &self,
        ctx: &TraceContext,
        query: &str,
        n_results: u32,
    ) -> Result<Vec<MemoryHit>, InferenceError>;
}
