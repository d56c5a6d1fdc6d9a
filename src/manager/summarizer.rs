//! Periodic transcript summarization
//!
//! While recording, entries older than the summarization threshold are
//! rolled up into a summary and pruned from the raw FIFO, keeping the
//! prompt-assembly window small without losing older context entirely.

use super::Manager;
use crate::trace::TraceContext;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::{debug, info};

/// Summarizer configuration.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// How often the loop looks for summarizable entries
    pub interval: Duration,
    /// Entries must be older than this to be rolled up
    pub threshold: Duration,
    /// Fewer old entries than this are left for the next tick
    pub min_entries: usize,
    /// Maximum summary length forwarded to the backend (words)
    pub max_length: u32,
    /// Budget for one SummarizeTranscript call
    pub timeout: Duration,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: Duration::from_secs(120),
            min_entries: 10,
            max_length: 256,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Manager {
    /// One summarization pass. Returns `Ok(true)` when a summary was stored.
    ///
    /// On any failure the candidate entries are retained untouched; the next
    /// tick simply tries again.
    pub async fn summarize_once(&self) -> Result<bool> {
        if !self.is_recording() {
            return Ok(false);
        }
        let cfg = &self.config.summarizer;
        let (entries, range) = self.transcripts.get_unsummarized(cfg.threshold);
        if entries.len() < cfg.min_entries {
            return Ok(false);
        }
        let Some((start, end)) = range else {
            return Ok(false);
        };

        let text: String = entries
            .iter()
            .map(|e| format!("{}: {}", e.source, e.text))
            .collect::<Vec<_>>()
            .join("\n");

        debug!(entries = entries.len(), "summarizing old transcript entries");
        let ctx = TraceContext::new();
        let summary = tokio::time::timeout(
            cfg.timeout,
            self.client.summarize(&ctx, &text, cfg.max_length),
        )
        .await
        .map_err(|_| anyhow!("summarization timed out after {:?}", cfg.timeout))?
        .map_err(|err| anyhow!("summarization failed: {err}"))?;

        self.transcripts.store_summary(start, end, &summary);
        info!(
            pruned = entries.len(),
            summaries = self.transcripts.summary_count(),
            "transcript span summarized"
        );
        Ok(true)
    }
}
