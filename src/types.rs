//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};

/// Where a piece of captured audio came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    /// The operator's own microphone
    User,
    /// A loopback / virtual device carrying system output
    System,
}

impl AudioSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioSource::User => "user",
            AudioSource::System => "system",
        }
    }

    /// Speaker label shown in the transcript when no diarisation is available.
    pub fn speaker_label(&self) -> &'static str {
        match self {
            AudioSource::User => "You",
            AudioSource::System => "Speaker",
        }
    }
}

impl std::fmt::Display for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count whitespace-separated words; used by the memory-worthiness gate.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Overflow counters for the bounded try-send channels.
///
/// Producers never block on slow consumers; a full channel drops the message
/// and bumps the matching counter, surfaced via `/api/status`.
#[derive(Debug, Default)]
pub struct DropCounters {
    pub audio: std::sync::atomic::AtomicU64,
    pub transcript_events: std::sync::atomic::AtomicU64,
    pub auto_answer_events: std::sync::atomic::AtomicU64,
    pub vad_events: std::sync::atomic::AtomicU64,
}

/// Point-in-time snapshot of [`DropCounters`] for the status endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DropSnapshot {
    pub audio: u64,
    pub transcript_events: u64,
    pub auto_answer_events: u64,
    pub vad_events: u64,
}

impl DropCounters {
    pub fn snapshot(&self) -> DropSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        DropSnapshot {
            audio: self.audio.load(Relaxed),
            transcript_events: self.transcript_events.load(Relaxed),
            auto_answer_events: self.auto_answer_events.load(Relaxed),
            vad_events: self.vad_events.load(Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speaker_labels() {
        assert_eq!(AudioSource::User.speaker_label(), "You");
        assert_eq!(AudioSource::System.speaker_label(), "Speaker");
    }

    #[test]
    fn test_serde_rename() {
        assert_eq!(
            serde_json::to_string(&AudioSource::System).unwrap(),
            "\"system\""
        );
    }

    #[test]
    fn test_word_count() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("  what   time is it  "), 4);
    }
}
