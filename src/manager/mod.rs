//! Platform orchestrator
//!
//! The Manager owns every pipeline and collaborator:
//!
//! ```text
//! audio capturer → chunk channel → audio loop → VAD segmenter
//!                                                  ↓ per segment
//!                                   transcribe → transcript store → events
//!                                                  ↓                 ↓
//!                                          memory batcher      auto-answer
//! screen loop → phash gate → OCR → stability → memory batcher
//! summarizer loop → SummarizeTranscript → summary ring
//! stale-VAD cleanup loop
//! ```
//!
//! All loops stop on the shared watch signal; `stop()` drains the batcher
//! and joins the device readers.

pub mod screen;
pub mod summarizer;

pub use screen::{ScreenConfig, ScreenProcessor};
pub use summarizer::SummarizerConfig;

use crate::answer::{AutoAnswerDetector, DetectorConfig};
use crate::audio::capture::CaptureConfig;
use crate::audio::vad::VadConfig;
use crate::audio::{AudioCapturer, Chunk, Segmenter, SpeechSegment, VadEvent};
use crate::config::Config;
use crate::inference::{AnalyzeRequest, InferenceClient, MemorySource};
use crate::memory::{BatcherConfig, MemoryBatcher};
use crate::screen::{FrameSource, ScreenCapturer};
use crate::trace::TraceContext;
use crate::transcript::{TranscriptEvent, TranscriptStore};
use crate::types::{word_count, AudioSource, DropCounters, DropSnapshot};
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the auto-answer event channel.
pub const AUTO_ANSWER_EVENT_CAPACITY: usize = 10;

/// Transcript window fused into an auto-answer prompt.
pub const AUTO_ANSWER_TRANSCRIPT_WINDOW: Duration = Duration::from_secs(60);

/// Transcript window fused into a chat prompt.
pub const ANALYZE_TRANSCRIPT_WINDOW: Duration = Duration::from_secs(300);

/// Shortest utterance (in words) worth writing to memory.
pub const MIN_WORDS_FOR_MEMORY: usize = 4;

/// Event published on the auto-answer channel.
#[derive(Debug, Clone)]
pub enum AutoAnswerEvent {
    Start { question: String },
    Chunk { content: String },
    Done,
}

/// Everything the Manager needs to know, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub sample_rate: u32,
    pub capture: CaptureConfig,
    pub vad: VadConfig,
    pub screen: ScreenConfig,
    pub detector: DetectorConfig,
    pub batcher: BatcherConfig,
    pub summarizer: SummarizerConfig,
    pub auto_answer_transcript_window: Duration,
    pub analyze_transcript_window: Duration,
    pub min_words_for_memory: usize,
}

impl ManagerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            capture: CaptureConfig {
                sample_rate: cfg.sample_rate,
                channel_capacity: 100,
                capture_system_audio: cfg.capture_system_audio,
                excluded_devices: cfg.excluded_audio_devices.clone(),
            },
            vad: VadConfig {
                threshold: cfg.vad_threshold,
                max_silence_windows: cfg.max_silence_chunks,
                min_speech_samples: cfg.min_speech_samples(),
                ..VadConfig::default()
            },
            screen: ScreenConfig {
                capture_rate: cfg.screen_capture_rate,
                stable_count_threshold: cfg.screen_stable_count_threshold,
                min_text_length: cfg.screen_min_text_length,
                max_phash_distance: cfg.max_phash_distance(),
            },
            detector: DetectorConfig {
                enabled: cfg.auto_answer_enabled,
                cooldown: cfg.auto_answer_cooldown,
                min_question_length: cfg.min_question_length,
            },
            batcher: BatcherConfig {
                max_size: cfg.memory_batch_max_size,
                flush_delay: cfg.memory_batch_flush_delay,
            },
            summarizer: SummarizerConfig::default(),
            auto_answer_transcript_window: AUTO_ANSWER_TRANSCRIPT_WINDOW,
            analyze_transcript_window: ANALYZE_TRANSCRIPT_WINDOW,
            min_words_for_memory: MIN_WORDS_FOR_MEMORY,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Event receivers handed to the server's broadcaster tasks.
pub struct ManagerChannels {
    pub transcripts: mpsc::Receiver<TranscriptEvent>,
    pub auto_answers: mpsc::Receiver<AutoAnswerEvent>,
    pub vad: mpsc::Receiver<VadEvent>,
}

/// The concurrent coordinator at the heart of the daemon.
pub struct Manager {
    client: Arc<InferenceClient>,
    config: ManagerConfig,
    segmenter: Arc<Segmenter>,
    transcripts: Arc<TranscriptStore>,
    batcher: Arc<MemoryBatcher>,
    detector: Arc<AutoAnswerDetector>,
    screen: Option<Arc<ScreenProcessor>>,
    drops: Arc<DropCounters>,
    recording: AtomicBool,
    auto_tx: mpsc::Sender<AutoAnswerEvent>,
    stop_tx: watch::Sender<bool>,
    capturer: Mutex<Option<AudioCapturer>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Wire the collaborators. `screen_source` is `None` when the build or
    /// platform has no frame grabber; the screen pipeline is then disabled.
    pub fn new(
        client: Arc<InferenceClient>,
        screen_source: Option<Box<dyn FrameSource>>,
        config: ManagerConfig,
    ) -> (Arc<Self>, ManagerChannels) {
        let drops = Arc::new(DropCounters::default());
        let (transcripts, transcript_rx) = TranscriptStore::new(drops.clone());
        let (segmenter, vad_rx) = Segmenter::new(
            config.vad.clone(),
            config.sample_rate,
            client.clone(),
            drops.clone(),
        );
        let batcher = Arc::new(MemoryBatcher::new(client.clone(), config.batcher.clone()));
        let detector = Arc::new(AutoAnswerDetector::new(
            client.clone(),
            config.detector.clone(),
        ));
        let screen = screen_source.map(|source| {
            Arc::new(ScreenProcessor::new(
                ScreenCapturer::new(source),
                config.screen.clone(),
            ))
        });
        let (auto_tx, auto_rx) = mpsc::channel(AUTO_ANSWER_EVENT_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            client,
            config,
            segmenter: Arc::new(segmenter),
            transcripts: Arc::new(transcripts),
            batcher,
            detector,
            screen,
            drops,
            recording: AtomicBool::new(false),
            auto_tx,
            stop_tx,
            capturer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        (
            manager,
            ManagerChannels {
                transcripts: transcript_rx,
                auto_answers: auto_rx,
                vad: vad_rx,
            },
        )
    }

    /// Start audio capture and every background loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut capturer = AudioCapturer::new(self.config.capture.clone(), self.drops.clone());
        let chunk_rx = capturer.start()?;
        *self.capturer.lock().unwrap() = Some(capturer);
        self.start_with_audio(chunk_rx);
        Ok(())
    }

    /// Start the loops against an externally supplied chunk stream. The
    /// test suite injects audio here without touching real devices.
    pub fn start_with_audio(self: &Arc<Self>, chunk_rx: mpsc::Receiver<Chunk>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(self.clone().audio_loop(chunk_rx)));
        tasks.push(tokio::spawn(self.clone().stale_cleanup_loop()));
        tasks.push(tokio::spawn(self.clone().summarizer_loop()));
        if self.screen.is_some() {
            tasks.push(tokio::spawn(self.clone().screen_loop()));
        } else {
            info!("screen pipeline disabled (no frame source)");
        }
        info!("orchestrator started");
    }

    /// Stop every loop, drain the batcher, and release audio devices.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(mut capturer) = self.capturer.lock().unwrap().take() {
            capturer.stop();
        }
        let ctx = TraceContext::new();
        if let Err(err) = self.client.reset_vad(&ctx).await {
            if !err.is_circuit_open() {
                debug!(error = %err, "backend VAD reset on shutdown failed");
            }
        }
        self.batcher.stop().await;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("orchestrator stopped");
    }

    // ===== Recording & status =====

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
        info!(recording, "recording flag changed");
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub fn set_auto_answer_enabled(&self, enabled: bool) {
        self.detector.set_enabled(enabled);
    }

    pub fn breaker_state(&self) -> crate::resilience::BreakerState {
        self.client.breaker_state()
    }

    pub fn dropped(&self) -> DropSnapshot {
        self.drops.snapshot()
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    // ===== Chat =====

    /// Fuse the query with recent transcript and the latest screen state
    /// and run the streaming analysis verb. Chunks arrive buffered, after
    /// the stream has completed successfully.
    pub async fn chat(
        &self,
        ctx: &TraceContext,
        query: &str,
    ) -> Result<Vec<String>, crate::inference::InferenceError> {
        let request = AnalyzeRequest {
            user_query: query.to_string(),
            transcript: self
                .transcripts
                .get_recent(self.config.analyze_transcript_window),
            context_text: self.latest_screen_text(),
            image_data: self.latest_screen_bytes(),
        };
        self.client.analyze(ctx, &request).await
    }

    /// Unconditional capture + OCR for `GET /api/capture`.
    pub async fn capture_screen_now(&self) -> Result<String> {
        match &self.screen {
            Some(screen) => screen.capture_now(&self.client).await,
            None => bail!("screen capture unavailable"),
        }
    }

    pub fn latest_screen_text(&self) -> String {
        self.screen
            .as_ref()
            .map(|s| s.latest_text())
            .unwrap_or_default()
    }

    fn latest_screen_bytes(&self) -> Option<Vec<u8>> {
        self.screen.as_ref().and_then(|s| s.latest_bytes())
    }

    // ===== Pipelines =====

    async fn audio_loop(self: Arc<Self>, mut chunk_rx: mpsc::Receiver<Chunk>) {
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                chunk = chunk_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    let segments = self.segmenter.process_chunk(chunk).await;
                    for segment in segments {
                        let manager = self.clone();
                        tokio::spawn(async move { manager.handle_segment(segment).await });
                    }
                }
            }
        }
        debug!("audio loop stopped");
    }

    /// Per completed speech segment: transcribe, store, and fan out.
    async fn handle_segment(self: Arc<Self>, segment: SpeechSegment) {
        let ctx = TraceContext::new();
        let source = segment.source;
        let transcription = match self
            .client
            .transcribe(&ctx, &segment.samples, self.config.sample_rate)
            .await
        {
            Ok(t) => t,
            Err(err) => {
                if !err.is_circuit_open() {
                    warn!(error = %err, "transcription failed, segment dropped");
                }
                return;
            }
        };

        let text = transcription.text.trim().to_string();
        if text.is_empty() {
            return;
        }

        let speaker = source.speaker_label();
        self.transcripts.add(&text, source, speaker);
        self.transcripts.emit(TranscriptEvent {
            text: text.clone(),
            source,
            speaker: speaker.to_string(),
        });

        if self.is_recording() && word_count(&text) >= self.config.min_words_for_memory {
            self.batcher
                .add(&format!("{source}: {text}"), MemorySource::Audio);
        }

        if source == AudioSource::System && self.detector.check(&ctx, &text).await {
            let manager = self.clone();
            let question = text;
            tokio::spawn(async move { manager.auto_answer_stream(ctx, question).await });
        }
    }

    /// Emit the auto-answer event sequence for one detected question.
    async fn auto_answer_stream(self: Arc<Self>, ctx: TraceContext, question: String) {
        self.send_auto(AutoAnswerEvent::Start {
            question: question.clone(),
        });

        let request = AnalyzeRequest {
            user_query: format!("Answer this question concisely: {question}"),
            transcript: self
                .transcripts
                .get_recent(self.config.auto_answer_transcript_window),
            context_text: self.latest_screen_text(),
            image_data: None,
        };
        match self.client.analyze(&ctx, &request).await {
            Ok(chunks) => {
                for content in chunks {
                    self.send_auto(AutoAnswerEvent::Chunk { content });
                }
            }
            Err(err) => {
                self.send_auto(AutoAnswerEvent::Chunk {
                    content: format!("Error: {err}"),
                });
            }
        }
        self.send_auto(AutoAnswerEvent::Done);
    }

    fn send_auto(&self, event: AutoAnswerEvent) {
        if self.auto_tx.try_send(event).is_err() {
            self.drops.auto_answer_events.fetch_add(1, Ordering::Relaxed);
            debug!("auto-answer channel full, dropping event");
        }
    }

    async fn screen_loop(self: Arc<Self>) {
        let Some(screen) = self.screen.clone() else {
            return;
        };
        let period = Duration::from_secs_f64(1.0 / self.config.screen.capture_rate);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = screen
                        .tick(&self.client, &self.batcher, self.is_recording())
                        .await
                    {
                        debug!(error = %err, "screen tick skipped");
                    }
                }
            }
        }
        debug!("screen loop stopped");
    }

    async fn stale_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.vad.stale_timeout);
        let mut stop = self.stop_tx.subscribe();
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => { self.segmenter.cleanup_stale(); }
            }
        }
    }

    async fn summarizer_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.summarizer.interval);
        let mut stop = self.stop_tx.subscribe();
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.summarize_once().await {
                        warn!(error = %err, "transcript summarization failed, entries retained");
                    }
                }
            }
        }
    }
}
