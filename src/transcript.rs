//! Transcript store
//!
//! Bounded FIFO of transcript entries plus a small ring of rolled-up
//! summaries. Writers never block on the event channel: UI notifications
//! are best effort and a slow client costs a dropped event, not a stalled
//! speech pipeline.

use crate::types::{AudioSource, DropCounters};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Raw entries kept before the oldest are evicted.
pub const TRANSCRIPT_MAX_ENTRIES: usize = 1000;

/// Summaries kept before the oldest is evicted.
pub const SUMMARY_MAX_COUNT: usize = 5;

/// Capacity of the transcript event channel.
pub const EVENT_CAPACITY: usize = 100;

/// One transcribed utterance.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub source: AudioSource,
    pub speaker: String,
    pub text: String,
}

/// A rolled-up span of pruned entries.
#[derive(Debug, Clone)]
pub struct TranscriptSummary {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub text: String,
}

/// Event published to UI clients when an entry lands.
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    pub source: AudioSource,
    pub speaker: String,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<TranscriptEntry>,
    summaries: VecDeque<TranscriptSummary>,
}

/// Concurrent transcript + summary store.
pub struct TranscriptStore {
    inner: RwLock<Inner>,
    events: mpsc::Sender<TranscriptEvent>,
    drops: Arc<DropCounters>,
    max_entries: usize,
}

impl TranscriptStore {
    pub fn new(drops: Arc<DropCounters>) -> (Self, mpsc::Receiver<TranscriptEvent>) {
        Self::with_capacity(TRANSCRIPT_MAX_ENTRIES, drops)
    }

    pub fn with_capacity(
        max_entries: usize,
        drops: Arc<DropCounters>,
    ) -> (Self, mpsc::Receiver<TranscriptEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Self {
                inner: RwLock::new(Inner::default()),
                events,
                drops,
                max_entries,
            },
            rx,
        )
    }

    /// Append an entry, evicting the oldest past the cap.
    pub fn add(&self, text: &str, source: AudioSource, speaker: &str) {
        let entry = TranscriptEntry {
            timestamp: Utc::now(),
            source,
            speaker: speaker.to_string(),
            text: text.to_string(),
        };
        let mut inner = self.inner.write().unwrap();
        inner.entries.push_back(entry);
        while inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
    }

    /// Non-blocking event emission; a full channel drops the event.
    pub fn emit(&self, event: TranscriptEvent) {
        if self.events.try_send(event).is_err() {
            self.drops.transcript_events.fetch_add(1, Ordering::Relaxed);
            debug!("transcript event channel full, dropping event");
        }
    }

    /// Render summaries (oldest first) and raw entries within the trailing
    /// window, one line each, for prompt assembly.
    pub fn get_recent(&self, window: Duration) -> String {
        let cutoff = Utc::now() - ChronoDuration::from_std(window).unwrap_or_default();
        let inner = self.inner.read().unwrap();
        let mut lines: Vec<String> = inner
            .summaries
            .iter()
            .map(|s| format!("[Summary] {}", s.text))
            .collect();
        lines.extend(
            inner
                .entries
                .iter()
                .filter(|e| e.timestamp >= cutoff)
                .map(|e| format!("{}: {}", e.source, e.text)),
        );
        lines.join("\n")
    }

    /// Entries older than `age`, plus their timestamp range.
    pub fn get_unsummarized(
        &self,
        age: Duration,
    ) -> (Vec<TranscriptEntry>, Option<(DateTime<Utc>, DateTime<Utc>)>) {
        let cutoff = Utc::now() - ChronoDuration::from_std(age).unwrap_or_default();
        let inner = self.inner.read().unwrap();
        let old: Vec<TranscriptEntry> = inner
            .entries
            .iter()
            .filter(|e| e.timestamp < cutoff)
            .cloned()
            .collect();
        let range = match (old.first(), old.last()) {
            (Some(first), Some(last)) => Some((first.timestamp, last.timestamp)),
            _ => None,
        };
        (old, range)
    }

    /// Append a summary covering `[start, end]` and prune the raw entries it
    /// replaced. Summaries are capped FIFO.
    pub fn store_summary(&self, start: DateTime<Utc>, end: DateTime<Utc>, text: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.summaries.push_back(TranscriptSummary {
            start,
            end,
            text: text.to_string(),
        });
        while inner.summaries.len() > SUMMARY_MAX_COUNT {
            inner.summaries.pop_front();
        }
        inner.entries.retain(|e| e.timestamp >= end);
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn summary_count(&self) -> usize {
        self.inner.read().unwrap().summaries.len()
    }

    #[cfg(test)]
    fn add_backdated(&self, text: &str, source: AudioSource, age: Duration) {
        let entry = TranscriptEntry {
            timestamp: Utc::now() - ChronoDuration::from_std(age).unwrap(),
            source,
            speaker: source.speaker_label().to_string(),
            text: text.to_string(),
        };
        let mut inner = self.inner.write().unwrap();
        inner.entries.push_back(entry);
    }
}
