//! `StubInference` — scriptable in-process backend without real inference.
//!
//! Used by the test suite and for running the daemon against nothing at all:
//! every verb returns a scripted (or neutral default) response and records
//! the call, so pipelines can be exercised end-to-end and assertions made
//! about what reached the wire.

use super::{
    AnalyzeChunk, AnalyzeRequest, ChunkStream, DiarizedSegment, HealthStatus, InferenceError,
    InferenceService, MemoryHit, MemoryItem, MemorySource, OcrResult, SpeechDetection,
    Transcription,
};
use crate::trace::TraceContext;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One recorded verb invocation, oldest first in [`StubInference::calls`].
#[derive(Debug, Clone)]
pub enum Call {
    CheckHealth,
    Transcribe {
        samples: usize,
        sample_rate: u32,
        trace_id: String,
    },
    Diarize {
        samples: usize,
    },
    DetectSpeech {
        samples: usize,
        trace_id: String,
    },
    ResetVad,
    ExtractText {
        format: String,
    },
    Analyze {
        request: AnalyzeRequest,
        trace_id: String,
    },
    IsQuestion {
        text: String,
    },
    Summarize {
        transcript: String,
        max_length: u32,
    },
    StoreMemory {
        text: String,
        source: MemorySource,
    },
    BatchStore {
        items: Vec<MemoryItem>,
    },
    QueryMemory {
        query: String,
    },
}

#[derive(Debug)]
struct StubState {
    health: HealthStatus,
    /// Consumed one per `detect_speech` call; empty falls back to silence.
    detections: VecDeque<SpeechDetection>,
    transcription: Transcription,
    transcribe_errors: VecDeque<InferenceError>,
    analyze_chunks: Vec<String>,
    analyze_errors: VecDeque<InferenceError>,
    is_question: bool,
    summary: String,
    ocr_text: String,
    calls: Vec<Call>,
}

/// Scriptable [`InferenceService`].
#[derive(Debug)]
pub struct StubInference {
    state: Mutex<StubState>,
}

impl Default for StubInference {
    fn default() -> Self {
        Self::new()
    }
}

impl StubInference {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                health: HealthStatus::Serving,
                detections: VecDeque::new(),
                transcription: Transcription {
                    text: String::new(),
                    confidence: 1.0,
                    duration_ms: 0,
                },
                transcribe_errors: VecDeque::new(),
                analyze_chunks: Vec::new(),
                analyze_errors: VecDeque::new(),
                is_question: false,
                summary: String::new(),
                ocr_text: String::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_health(&self, health: HealthStatus) {
        self.state.lock().unwrap().health = health;
    }

    /// Queue `count` copies of a detection result for upcoming windows.
    pub fn push_detections(&self, probability: f32, is_speech: bool, count: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.detections.push_back(SpeechDetection {
                probability,
                is_speech,
            });
        }
    }

    pub fn set_transcription(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        state.transcription = Transcription {
            text: text.to_string(),
            confidence: 0.9,
            duration_ms: 100,
        };
    }

    /// Queue errors returned by upcoming `transcribe` calls before the
    /// scripted transcription resumes.
    pub fn push_transcribe_error(&self, err: InferenceError) {
        self.state.lock().unwrap().transcribe_errors.push_back(err);
    }

    pub fn set_analyze_chunks(&self, chunks: &[&str]) {
        self.state.lock().unwrap().analyze_chunks =
            chunks.iter().map(|c| c.to_string()).collect();
    }

    /// Queue errors that fail upcoming `analyze` attempts mid-stream.
    pub fn push_analyze_error(&self, err: InferenceError) {
        self.state.lock().unwrap().analyze_errors.push_back(err);
    }

    pub fn set_is_question(&self, is_question: bool) {
        self.state.lock().unwrap().is_question = is_question;
    }

    pub fn set_summary(&self, summary: &str) {
        self.state.lock().unwrap().summary = summary.to_string();
    }

    pub fn set_ocr_text(&self, text: &str) {
        self.state.lock().unwrap().ocr_text = text.to_string();
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn transcribe_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Transcribe { .. }))
    }

    pub fn reset_vad_count(&self) -> usize {
        self.count(|c| matches!(c, Call::ResetVad))
    }

    pub fn analyze_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Analyze { .. }))
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl InferenceService for StubInference {
    async fn check_health(&self, _ctx: &TraceContext) -> Result<HealthStatus, InferenceError> {
        self.record(Call::CheckHealth);
        Ok(self.state.lock().unwrap().health)
    }

    async fn transcribe(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Transcription, InferenceError> {
        self.record(Call::Transcribe {
            samples: samples.len(),
            sample_rate,
            trace_id: ctx.trace_id.clone(),
        });
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.transcribe_errors.pop_front() {
            return Err(err);
        }
        Ok(state.transcription.clone())
    }

    async fn diarize(
        &self,
        _ctx: &TraceContext,
        samples: &[f32],
        _sample_rate: u32,
        _min_speakers: u32,
        _max_speakers: u32,
    ) -> Result<Vec<DiarizedSegment>, InferenceError> {
        self.record(Call::Diarize {
            samples: samples.len(),
        });
        Ok(Vec::new())
    }

    async fn detect_speech(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        _sample_rate: u32,
    ) -> Result<SpeechDetection, InferenceError> {
        self.record(Call::DetectSpeech {
            samples: samples.len(),
            trace_id: ctx.trace_id.clone(),
        });
        let mut state = self.state.lock().unwrap();
        Ok(state.detections.pop_front().unwrap_or(SpeechDetection {
            probability: 0.0,
            is_speech: false,
        }))
    }

    async fn reset_vad(&self, _ctx: &TraceContext) -> Result<(), InferenceError> {
        self.record(Call::ResetVad);
        Ok(())
    }

    async fn extract_text(
        &self,
        _ctx: &TraceContext,
        _image: &[u8],
        format: &str,
    ) -> Result<OcrResult, InferenceError> {
        self.record(Call::ExtractText {
            format: format.to_string(),
        });
        Ok(OcrResult {
            text: self.state.lock().unwrap().ocr_text.clone(),
            boxes: Vec::new(),
        })
    }

    async fn analyze(
        &self,
        ctx: &TraceContext,
        request: AnalyzeRequest,
    ) -> Result<ChunkStream, InferenceError> {
        self.record(Call::Analyze {
            request,
            trace_id: ctx.trace_id.clone(),
        });
        let mut state = self.state.lock().unwrap();
        let mut items: Vec<Result<AnalyzeChunk, InferenceError>> = Vec::new();
        if let Some(err) = state.analyze_errors.pop_front() {
            // Half the chunks arrive, then the stream dies: exercises the
            // buffer-then-commit replay path.
            let half = state.analyze_chunks.len() / 2;
            for content in state.analyze_chunks.iter().take(half) {
                items.push(Ok(AnalyzeChunk {
                    content: content.clone(),
                    is_final: false,
                }));
            }
            items.push(Err(err));
        } else {
            let last = state.analyze_chunks.len().saturating_sub(1);
            for (i, content) in state.analyze_chunks.iter().enumerate() {
                items.push(Ok(AnalyzeChunk {
                    content: content.clone(),
                    is_final: i == last,
                }));
            }
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn is_question(&self, _ctx: &TraceContext, text: &str) -> Result<bool, InferenceError> {
        self.record(Call::IsQuestion {
            text: text.to_string(),
        });
        Ok(self.state.lock().unwrap().is_question)
    }

    async fn summarize(
        &self,
        _ctx: &TraceContext,
        transcript: &str,
        max_length: u32,
    ) -> Result<String, InferenceError> {
        self.record(Call::Summarize {
            transcript: transcript.to_string(),
            max_length,
        });
        Ok(self.state.lock().unwrap().summary.clone())
    }

    async fn store_memory(
        &self,
        _ctx: &TraceContext,
        text: &str,
        source: MemorySource,
    ) -> Result<String, InferenceError> {
        self.record(Call::StoreMemory {
            text: text.to_string(),
            source,
        });
        Ok("stub-id".to_string())
    }

    async fn batch_store(
        &self,
        _ctx: &TraceContext,
        items: &[MemoryItem],
    ) -> Result<u32, InferenceError> {
        self.record(Call::BatchStore {
            items: items.to_vec(),
        });
        Ok(items.len() as u32)
    }

    async fn query_memory(
        &self,
        _ctx: &TraceContext,
        query: &str,
        _n_results: u32,
    ) -> Result<Vec<MemoryHit>, InferenceError> {
        self.record(Call::QueryMemory {
            query: query.to_string(),
        });
        Ok(Vec::new())
    }
}
