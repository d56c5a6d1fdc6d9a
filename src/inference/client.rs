//! Resilient inference client
//!
//! Wraps any [`InferenceService`] with the full resilience stack:
//!
//! ```text
//! caller → breaker gate → child span → service call → success/failure record
//!                            ↑ retry (streaming verbs only, buffered replay)
//! health monitor task ───────┘ (periodic Health.Check feeding the breaker)
//! ```
//!
//! Streaming verbs buffer chunks per attempt and surface them only after a
//! fully successful stream, so a retry can never double-deliver tokens.

use super::{
    AnalyzeRequest, DiarizedSegment, HealthStatus, InferenceError, InferenceService, MemoryHit,
    MemoryItem, MemorySource, OcrResult, SpeechDetection, Transcription,
};
use crate::resilience::{retry, BreakerConfig, BreakerState, CircuitBreaker, Retryable, RetryConfig};
use crate::trace::TraceContext;
use anyhow::{bail, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Construction options for [`InferenceClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// HTTP/2 keepalive ping interval applied by the transport
    pub keepalive_interval: Duration,
    /// Keepalive ping timeout before the connection is considered dead
    pub keepalive_timeout: Duration,
    /// Period of the background health-check task
    pub health_check_period: Duration,
    /// Per-check timeout for Health.Check
    pub health_check_timeout: Duration,
    /// Poll interval used by [`InferenceClient::wait_ready`]
    pub startup_poll_interval: Duration,
    pub breaker: BreakerConfig,
    /// Policy for the streaming LLM verbs
    pub llm_retry: RetryConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(3),
            health_check_period: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(2),
            startup_poll_interval: Duration::from_millis(500),
            breaker: BreakerConfig::default(),
            llm_retry: RetryConfig::llm(),
        }
    }
}

/// Thread-safe handle to the inference backend with resilience applied.
pub struct InferenceClient {
    service: Arc<dyn InferenceService>,
    breaker: Arc<CircuitBreaker>,
    options: ClientOptions,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceClient {
    /// Wrap `service` and start the background health monitor.
    pub fn new(service: Arc<dyn InferenceService>, options: ClientOptions) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(options.breaker.clone()));
        let health_task = spawn_health_monitor(
            service.clone(),
            breaker.clone(),
            options.health_check_period,
            options.health_check_timeout,
        );
        Self {
            service,
            breaker,
            options,
            health_task: Mutex::new(Some(health_task)),
        }
    }

    /// Poll health until the backend reports SERVING or `timeout` elapses.
    /// On success the breaker is reset so startup flakiness is forgotten.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let ctx = TraceContext::new();
            let check = tokio::time::timeout(
                self.options.health_check_timeout,
                self.service.check_health(&ctx),
            )
            .await;
            if let Ok(Ok(HealthStatus::Serving)) = check {
                self.breaker.reset();
                debug!("inference backend ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("inference backend not ready within {timeout:?}");
            }
            tokio::time::sleep(self.options.startup_poll_interval).await;
        }
    }

    /// Stop the health monitor. Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    // ===== Unary verbs: breaker gate + child span + transient recording =====

    pub async fn transcribe(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Transcription, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.transcribe(&call, samples, sample_rate).await;
        self.record(&res);
        res
    }

    pub async fn diarize(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
        min_speakers: u32,
        max_speakers: u32,
    ) -> Result<Vec<DiarizedSegment>, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self
            .service
            .diarize(&call, samples, sample_rate, min_speakers, max_speakers)
            .await;
        self.record(&res);
        res
    }

    pub async fn detect_speech(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<SpeechDetection, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.detect_speech(&call, samples, sample_rate).await;
        self.record(&res);
        res
    }

    pub async fn reset_vad(&self, ctx: &TraceContext) -> Result<(), InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.reset_vad(&call).await;
        self.record(&res);
        res
    }

    pub async fn extract_text(
        &self,
        ctx: &TraceContext,
        image: &[u8],
        format: &str,
    ) -> Result<OcrResult, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.extract_text(&call, image, format).await;
        self.record(&res);
        res
    }

    pub async fn is_question(
        &self,
        ctx: &TraceContext,
        text: &str,
    ) -> Result<bool, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.is_question(&call, text).await;
        self.record(&res);
        res
    }

    pub async fn store_memory(
        &self,
        ctx: &TraceContext,
        text: &str,
        source: MemorySource,
    ) -> Result<String, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.store_memory(&call, text, source).await;
        self.record(&res);
        res
    }

    pub async fn batch_store(
        &self,
        ctx: &TraceContext,
        items: &[MemoryItem],
    ) -> Result<u32, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.batch_store(&call, items).await;
        self.record(&res);
        res
    }

    pub async fn query_memory(
        &self,
        ctx: &TraceContext,
        query: &str,
        n_results: u32,
    ) -> Result<Vec<MemoryHit>, InferenceError> {
        self.breaker.allow()?;
        let call = ctx.child();
        let res = self.service.query_memory(&call, query, n_results).await;
        self.record(&res);
        res
    }

    // ===== Streaming verbs: additionally retried with the LLM policy =====

    /// Run the streaming analysis verb and return the buffered chunks.
    ///
    /// Chunks are accumulated per attempt and returned only once the stream
    /// finishes cleanly; a mid-stream failure discards the partial buffer
    /// and the retry starts over.
    pub async fn analyze(
        &self,
        ctx: &TraceContext,
        request: &AnalyzeRequest,
    ) -> Result<Vec<String>, InferenceError> {
        retry(&self.options.llm_retry, || async {
            self.breaker.allow()?;
            let call = ctx.child();
            let res = self.drain_stream(&call, request.clone()).await;
            self.record(&res);
            res
        })
        .await
    }

    /// Summarize a transcript span, retried with the LLM policy.
    pub async fn summarize(
        &self,
        ctx: &TraceContext,
        transcript: &str,
        max_length: u32,
    ) -> Result<String, InferenceError> {
        retry(&self.options.llm_retry, || async {
            self.breaker.allow()?;
            let call = ctx.child();
            let res = self.service.summarize(&call, transcript, max_length).await;
            self.record(&res);
            res
        })
        .await
    }

    async fn drain_stream(
        &self,
        call: &TraceContext,
        request: AnalyzeRequest,
    ) -> Result<Vec<String>, InferenceError> {
        let mut stream = self.service.analyze(call, request).await?;
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            if !chunk.content.is_empty() {
                chunks.push(chunk.content);
            }
            if chunk.is_final {
                break;
            }
        }
        Ok(chunks)
    }

    /// Feed the breaker: success on Ok, failure on transient errors only.
    /// Permanent errors say nothing about backend health.
    fn record<T>(&self, res: &Result<T, InferenceError>) {
        match res {
            Ok(_) => self.breaker.success(),
            Err(err) if Retryable::is_transient(err) => self.breaker.failure(),
            Err(_) => {}
        }
    }
}

fn spawn_health_monitor(
    service: Arc<dyn InferenceService>,
    breaker: Arc<CircuitBreaker>,
    period: Duration,
    check_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut healthy = true;
        loop {
            ticker.tick().await;
            let ctx = TraceContext::new();
            let check = tokio::time::timeout(check_timeout, service.check_health(&ctx)).await;
            match check {
                Ok(Ok(HealthStatus::Serving)) => {
                    breaker.success();
                    if !healthy {
                        healthy = true;
                        debug!("inference health restored");
                    }
                }
                other => {
                    breaker.failure();
                    if healthy {
                        healthy = false;
                        match other {
                            Ok(Ok(status)) => warn!(?status, "inference health check not serving"),
                            Ok(Err(err)) => warn!(error = %err, "inference health check failed"),
                            Err(_) => warn!("inference health check timed out"),
                        }
                    }
                }
            }
        }
    })
}
