//! Auto-answer detection
//!
//! Decides whether a system-audio utterance should trigger an unsolicited
//! answer: the feature must be enabled, the cooldown elapsed, the text long
//! enough to plausibly be a question, and the classifier must agree.

use crate::inference::InferenceClient;
use crate::trace::TraceContext;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub enabled: bool,
    pub cooldown: Duration,
    /// Texts shorter than this never reach the classifier
    pub min_question_length: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: Duration::from_secs(10),
            min_question_length: 10,
        }
    }
}

/// Question gate with cooldown.
pub struct AutoAnswerDetector {
    client: Arc<InferenceClient>,
    enabled: AtomicBool,
    cooldown: Duration,
    min_question_length: usize,
    last_fired: Mutex<Option<Instant>>,
}

impl AutoAnswerDetector {
    pub fn new(client: Arc<InferenceClient>, config: DetectorConfig) -> Self {
        Self {
            client,
            enabled: AtomicBool::new(config.enabled),
            cooldown: config.cooldown,
            min_question_length: config.min_question_length,
            last_fired: Mutex::new(None),
        }
    }

    /// True iff this text should fire an auto-answer right now. A `true`
    /// result consumes the cooldown.
    pub async fn check(&self, ctx: &TraceContext, text: &str) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        if text.trim().len() < self.min_question_length {
            return false;
        }
        if !self.cooldown_elapsed() {
            return false;
        }

        match self.client.is_question(ctx, text).await {
            Ok(true) => self.try_fire(),
            Ok(false) => false,
            Err(err) => {
                if !err.is_circuit_open() {
                    debug!(error = %err, "question classification failed");
                }
                false
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn cooldown_elapsed(&self) -> bool {
        let last = self.last_fired.lock().unwrap();
        match *last {
            Some(at) => at.elapsed() >= self.cooldown,
            None => true,
        }
    }

    /// Re-check the cooldown at commit time so two concurrent checks cannot
    /// both fire within one cooldown window.
    fn try_fire(&self) -> bool {
        let mut last = self.last_fired.lock().unwrap();
        match *last {
            Some(at) if at.elapsed() < self.cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}
