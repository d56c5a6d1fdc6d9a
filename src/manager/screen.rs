//! Screen processor
//!
//! Drives the change-gated capturer each tick, applies the perceptual-hash
//! gate so visually equivalent frames never pay for OCR, and feeds stable,
//! novel screen text into the memory batcher while recording.

use crate::inference::{InferenceClient, MemorySource};
use crate::memory::MemoryBatcher;
use crate::screen::{hamming_distance, perceptual_hash, ScreenCapturer};
use crate::trace::TraceContext;
use anyhow::Result;
use std::sync::Mutex;
use tracing::debug;

/// Screen pipeline configuration.
#[derive(Debug, Clone)]
pub struct ScreenConfig {
    /// Ticks per second
    pub capture_rate: f64,
    /// Identical-OCR ticks required before text is stored
    pub stable_count_threshold: u32,
    /// Minimum text length worth storing
    pub min_text_length: usize,
    /// pHash Hamming distance at or under which OCR is skipped
    pub max_phash_distance: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            capture_rate: 1.0,
            stable_count_threshold: 2,
            min_text_length: 10,
            max_phash_distance: 3,
        }
    }
}

#[derive(Debug, Default)]
struct ScreenState {
    latest_bytes: Option<Vec<u8>>,
    latest_text: String,
    last_phash: Option<u64>,
    stable_count: u32,
    last_stored_text: String,
}

/// Perceptual-hash-gated OCR pipeline over one [`ScreenCapturer`].
pub struct ScreenProcessor {
    capturer: Mutex<ScreenCapturer>,
    state: Mutex<ScreenState>,
    config: ScreenConfig,
}

impl ScreenProcessor {
    pub fn new(capturer: ScreenCapturer, config: ScreenConfig) -> Self {
        Self {
            capturer: Mutex::new(capturer),
            state: Mutex::new(ScreenState::default()),
            config,
        }
    }

    /// One tick of the screen pipeline. Capture failures and OCR errors
    /// skip the tick; the loop carries on.
    pub async fn tick(
        &self,
        client: &InferenceClient,
        batcher: &MemoryBatcher,
        recording: bool,
    ) -> Result<()> {
        let (frame, format) = {
            let mut capturer = self.capturer.lock().unwrap();
            (capturer.capture()?, capturer.format())
        };
        let Some(bytes) = frame else {
            return Ok(()); // unchanged screen
        };
        self.process_frame(bytes, format, client, Some(batcher), recording, true)
            .await?;
        Ok(())
    }

    /// Unconditional capture + OCR for the capture endpoint; bypasses the
    /// perceptual-hash gate and returns the extracted text.
    pub async fn capture_now(&self, client: &InferenceClient) -> Result<String> {
        let (bytes, format) = {
            let mut capturer = self.capturer.lock().unwrap();
            (capturer.capture_always()?, capturer.format())
        };
        self.process_frame(bytes, format, client, None, false, false)
            .await
    }

    pub fn latest_text(&self) -> String {
        self.state.lock().unwrap().latest_text.clone()
    }

    pub fn latest_bytes(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().latest_bytes.clone()
    }

    async fn process_frame(
        &self,
        bytes: Vec<u8>,
        format: &'static str,
        client: &InferenceClient,
        batcher: Option<&MemoryBatcher>,
        recording: bool,
        gate_on_phash: bool,
    ) -> Result<String> {
        let hash = perceptual_hash(&bytes)?;
        {
            let mut state = self.state.lock().unwrap();
            state.latest_bytes = Some(bytes.clone());
            if gate_on_phash {
                if let Some(prev) = state.last_phash {
                    if hamming_distance(prev, hash) <= self.config.max_phash_distance {
                        debug!("frame visually equivalent, skipping OCR");
                        return Ok(state.latest_text.clone());
                    }
                }
            }
            state.last_phash = Some(hash);
        }

        let ctx = TraceContext::new();
        let ocr = client.extract_text(&ctx, &bytes, format).await?;
        let text = ocr.text.trim().to_string();

        let mut state = self.state.lock().unwrap();
        if text != state.latest_text {
            state.latest_text = text.clone();
            state.stable_count = 0;
        } else {
            state.stable_count += 1;
        }

        if let Some(batcher) = batcher {
            if recording
                && state.stable_count >= self.config.stable_count_threshold
                && text != state.last_stored_text
                && text.len() > self.config.min_text_length
            {
                batcher.add(&text, MemorySource::Screen);
                state.last_stored_text = text.clone();
                state.stable_count = 0;
                debug!("stable screen text stored to memory");
            }
        }
        Ok(text)
    }
}
