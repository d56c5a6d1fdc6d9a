//! Per-device voice-activity segmentation
//!
//! Converts the capture chunk stream into complete speech segments. Each
//! device gets its own state machine:
//!
//! ```text
//! chunk → pending buffer → 512-sample windows → VAD verdict
//!            speech: buffer window, reset silence count
//!            silence while speaking: buffer window (trailing grace),
//!              count; past the limit → emit segment, reset backend VAD
//! ```
//!
//! Windows are non-overlapping and in order; a segment is emitted at most
//! once per silence transition. Devices not heard from in five minutes are
//! dropped by the stale-cleanup pass.

use super::capture::Chunk;
use crate::inference::InferenceClient;
use crate::trace::TraceContext;
use crate::types::{AudioSource, DropCounters};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Samples per VAD window; the backend model requires exactly this many.
pub const VAD_WINDOW_SAMPLES: usize = 512;

/// Segmenter configuration.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Probability above which a window counts as speech
    pub threshold: f32,
    /// Trailing silent windows tolerated before the segment ends
    pub max_silence_windows: u32,
    /// Shortest speech buffer worth emitting
    pub min_speech_samples: usize,
    /// Device states idle longer than this are dropped
    pub stale_timeout: Duration,
    /// Capacity of the telemetry channel
    pub event_capacity: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            max_silence_windows: 15,
            min_speech_samples: 8000,
            stale_timeout: Duration::from_secs(300),
            event_capacity: 50,
        }
    }
}

/// Voice-activity telemetry published per evaluated window (best effort).
#[derive(Debug, Clone, Copy)]
pub struct VadEvent {
    pub probability: f32,
    pub is_speech: bool,
    pub source: AudioSource,
}

/// A completed speech burst ready for transcription.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    pub samples: Vec<f32>,
    pub source: AudioSource,
}

/// Per-device segmentation state. Only `process_chunk` touches the fields;
/// the map lock is held just to check the state in and out.
#[derive(Debug, Default)]
struct DeviceState {
    pending: Vec<f32>,
    speech: Vec<f32>,
    speaking: bool,
    silent_windows: u32,
    last_seen: Option<Instant>,
}

/// Per-device VAD state machine over the inference backend.
pub struct Segmenter {
    config: VadConfig,
    sample_rate: u32,
    client: Arc<InferenceClient>,
    states: Mutex<HashMap<String, DeviceState>>,
    events: mpsc::Sender<VadEvent>,
    drops: Arc<DropCounters>,
}

impl Segmenter {
    /// Build a segmenter; the returned receiver carries the telemetry.
    pub fn new(
        config: VadConfig,
        sample_rate: u32,
        client: Arc<InferenceClient>,
        drops: Arc<DropCounters>,
    ) -> (Self, mpsc::Receiver<VadEvent>) {
        let (events, rx) = mpsc::channel(config.event_capacity);
        (
            Self {
                config,
                sample_rate,
                client,
                states: Mutex::new(HashMap::new()),
                events,
                drops,
            },
            rx,
        )
    }

    /// Feed one capture chunk; returns any segments completed by it.
    ///
    /// The audio loop is the sole caller, so per-device processing is
    /// naturally serialized and chunk order is preserved.
    pub async fn process_chunk(&self, chunk: Chunk) -> Vec<SpeechSegment> {
        let mut state = self.check_out(&chunk.device_id);
        state.last_seen = Some(Instant::now());
        state.pending.extend_from_slice(&chunk.samples);

        let mut segments = Vec::new();
        while state.pending.len() >= VAD_WINDOW_SAMPLES {
            let window: Vec<f32> = state.pending.drain(..VAD_WINDOW_SAMPLES).collect();
            if let Some(segment) = self.process_window(&mut state, window, chunk.source).await {
                segments.push(segment);
            }
        }

        self.check_in(&chunk.device_id, state);
        segments
    }

    async fn process_window(
        &self,
        state: &mut DeviceState,
        window: Vec<f32>,
        source: AudioSource,
    ) -> Option<SpeechSegment> {
        let ctx = TraceContext::new();
        let detection = match self.client.detect_speech(&ctx, &window, self.sample_rate).await {
            Ok(d) => d,
            Err(err) => {
                // Breaker rejections are routine during outages.
                if !err.is_circuit_open() {
                    debug!(error = %err, "speech detection failed, skipping window");
                }
                return None;
            }
        };

        if self
            .events
            .try_send(VadEvent {
                probability: detection.probability,
                is_speech: detection.is_speech,
                source,
            })
            .is_err()
        {
            self.drops.vad_events.fetch_add(1, Ordering::Relaxed);
        }

        if detection.is_speech || detection.probability > self.config.threshold {
            state.speaking = true;
            state.silent_windows = 0;
            state.speech.extend_from_slice(&window);
            return None;
        }

        if !state.speaking {
            return None;
        }

        // Trailing context: buffer the silence too until the grace runs out.
        state.speech.extend_from_slice(&window);
        state.silent_windows += 1;
        if state.silent_windows <= self.config.max_silence_windows {
            return None;
        }

        state.speaking = false;
        state.silent_windows = 0;
        let speech = std::mem::take(&mut state.speech);

        let ctx = TraceContext::new();
        if let Err(err) = self.client.reset_vad(&ctx).await {
            if !err.is_circuit_open() {
                debug!(error = %err, "backend VAD reset failed");
            }
        }

        if speech.len() > self.config.min_speech_samples {
            debug!(samples = speech.len(), %source, "speech segment complete");
            Some(SpeechSegment {
                samples: speech,
                source,
            })
        } else {
            debug!(samples = speech.len(), "speech burst too short, discarded");
            None
        }
    }

    /// Drop device states not seen within the stale window.
    pub fn cleanup_stale(&self) -> usize {
        let mut states = self.states.lock().unwrap();
        let before = states.len();
        states.retain(|_device, state| {
            state
                .last_seen
                .map(|seen| seen.elapsed() <= self.config.stale_timeout)
                .unwrap_or(false)
        });
        let removed = before - states.len();
        if removed > 0 {
            info!(removed, "cleaned up stale VAD device states");
        }
        removed
    }

    /// True if the device is currently inside a speech burst.
    pub fn is_speaking(&self, device_id: &str) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(device_id)
            .map(|s| s.speaking)
            .unwrap_or(false)
    }

    /// Number of tracked device states.
    pub fn device_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    fn check_out(&self, device_id: &str) -> DeviceState {
        self.states
            .lock()
            .unwrap()
            .remove(device_id)
            .unwrap_or_default()
    }

    fn check_in(&self, device_id: &str, state: DeviceState) {
        self.states
            .lock()
            .unwrap()
            .insert(device_id.to_string(), state);
    }
}
