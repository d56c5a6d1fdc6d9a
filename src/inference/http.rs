//! HTTP transport for the inference backend
//!
//! Maps every verb to `POST {base}/v1/<verb>` with a JSON body (health is a
//! GET). Audio rides as base64 little-endian f32 mono; images as base64
//! JPEG. The streaming analyze verb is newline-delimited JSON, one chunk
//! object per line. Trace ids travel as the `x-trace-id` / `x-span-id` /
//! `x-parent-span-id` request headers.

use super::{
    AnalyzeChunk, AnalyzeRequest, ChunkStream, DiarizedSegment, ErrorCode, HealthStatus,
    InferenceError, InferenceService, MemoryHit, MemoryItem, MemorySource, OcrResult,
    SpeechDetection, Transcription,
};
use crate::inference::ClientOptions;
use crate::trace::TraceContext;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// reqwest-backed [`InferenceService`] with HTTP/2 keepalive.
pub struct HttpInference {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInference {
    /// Dial `addr` ("host:port" or a full URL) with keepalive enabled.
    pub fn connect(addr: &str, options: &ClientOptions) -> Result<Self> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        let client = reqwest::Client::builder()
            .http2_keep_alive_interval(options.keepalive_interval)
            .http2_keep_alive_timeout(options.keepalive_timeout)
            .http2_keep_alive_while_idle(true)
            .build()
            .context("failed to build inference HTTP client")?;
        Ok(Self { client, base_url })
    }

    fn url(&self, verb: &str) -> String {
        format!("{}/v1/{}", self.base_url, verb)
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        ctx: &TraceContext,
        verb: &str,
        body: &Req,
    ) -> Result<Resp, InferenceError> {
        let response = self
            .request(ctx, verb, body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| InferenceError::new(ErrorCode::Internal, format!("malformed {verb} response: {e}")))
    }

    fn request<Req: Serialize>(
        &self,
        ctx: &TraceContext,
        verb: &str,
        body: &Req,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.url(verb)).json(body);
        for (key, value) in ctx.metadata() {
            req = req.header(key, value);
        }
        req
    }
}

/// Encode mono f32 samples as base64 over little-endian IEEE-754 bytes.
fn encode_samples(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64.encode(bytes)
}

fn transport_error(err: reqwest::Error) -> InferenceError {
    let code = if err.is_timeout() {
        ErrorCode::Timeout
    } else if err.is_connect() {
        ErrorCode::Unavailable
    } else {
        ErrorCode::Internal
    };
    InferenceError::new(code, format!("inference transport: {err}"))
}

/// Error body shared with the backend: `{code, message, metadata?}`.
#[derive(Debug, Deserialize)]
struct WireError {
    code: ErrorCode,
    message: String,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

async fn decode_error(response: reqwest::Response) -> InferenceError {
    let status = response.status();
    let body = response.bytes().await.unwrap_or_default();
    if let Ok(wire) = serde_json::from_slice::<WireError>(&body) {
        let err = InferenceError::new(wire.code, wire.message);
        return match wire.metadata {
            Some(meta) => err.with_metadata(meta),
            None => err,
        };
    }
    let code = match status.as_u16() {
        503 => ErrorCode::Unavailable,
        408 | 504 => ErrorCode::Timeout,
        429 => ErrorCode::ResourceExhausted,
        400..=499 => ErrorCode::InvalidArgument,
        _ => ErrorCode::Internal,
    };
    InferenceError::new(code, format!("inference returned HTTP {status}"))
}

// ============ Wire Bodies ============

#[derive(Serialize)]
struct AudioBody {
    audio: String,
    sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_speakers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_speakers: Option<u32>,
}

#[derive(Serialize)]
struct OcrBody<'a> {
    image: String,
    format: &'a str,
}

#[derive(Serialize)]
struct TextBody<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct SummarizeBody<'a> {
    transcript: &'a str,
    max_length: u32,
}

#[derive(Serialize)]
struct StoreBody<'a> {
    text: &'a str,
    source: MemorySource,
}

#[derive(Serialize)]
struct BatchStoreBody<'a> {
    items: &'a [MemoryItem],
}

#[derive(Serialize)]
struct QueryBody<'a> {
    query: &'a str,
    n_results: u32,
}

#[derive(Serialize)]
struct AnalyzeBody<'a> {
    user_query: &'a str,
    transcript: &'a str,
    context_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_data: Option<String>,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: HealthStatus,
}

#[derive(Deserialize)]
struct DiarizeResponse {
    segments: Vec<DiarizedSegment>,
}

#[derive(Deserialize)]
struct IsQuestionResponse {
    is_question: bool,
}

#[derive(Deserialize)]
struct SummarizeResponse {
    summary: String,
}

#[derive(Deserialize)]
struct StoreResponse {
    id: String,
    #[allow(dead_code)]
    #[serde(default)]
    success: bool,
}

#[derive(Deserialize)]
struct BatchStoreResponse {
    stored_count: u32,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<String>,
    #[serde(default)]
    scores: Vec<f32>,
}

#[async_trait]
impl InferenceService for HttpInference {
    async fn check_health(&self, ctx: &TraceContext) -> Result<HealthStatus, InferenceError> {
        let mut req = self.client.get(self.url("health"));
        for (key, value) in ctx.metadata() {
            req = req.header(key, value);
        }
        let response = req.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::new(ErrorCode::Internal, format!("malformed health response: {e}")))?;
        Ok(health.status)
    }

    async fn transcribe(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Transcription, InferenceError> {
        self.post(
            ctx,
            "transcribe",
            &AudioBody {
                audio: encode_samples(samples),
                sample_rate,
                min_speakers: None,
                max_speakers: None,
            },
        )
        .await
    }

    async fn diarize(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
        min_speakers: u32,
        max_speakers: u32,
    ) -> Result<Vec<DiarizedSegment>, InferenceError> {
        let response: DiarizeResponse = self
            .post(
                ctx,
                "diarize",
                &AudioBody {
                    audio: encode_samples(samples),
                    sample_rate,
                    min_speakers: Some(min_speakers),
                    max_speakers: Some(max_speakers),
                },
            )
            .await?;
        Ok(response.segments)
    }

    async fn detect_speech(
        &self,
        ctx: &TraceContext,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<SpeechDetection, InferenceError> {
        self.post(
            ctx,
            "vad/detect",
            &AudioBody {
                audio: encode_samples(samples),
                sample_rate,
                min_speakers: None,
                max_speakers: None,
            },
        )
        .await
    }

    async fn reset_vad(&self, ctx: &TraceContext) -> Result<(), InferenceError> {
        let _: serde_json::Value = self.post(ctx, "vad/reset", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn extract_text(
        &self,
        ctx: &TraceContext,
        image: &[u8],
        format: &str,
    ) -> Result<OcrResult, InferenceError> {
        self.post(
            ctx,
            "ocr/extract",
            &OcrBody {
                image: BASE64.encode(image),
                format,
            },
        )
        .await
    }

    async fn analyze(
        &self,
        ctx: &TraceContext,
        request: AnalyzeRequest,
    ) -> Result<ChunkStream, InferenceError> {
        let body = AnalyzeBody {
            user_query: &request.user_query,
            transcript: &request.transcript,
            context_text: &request.context_text,
            image_data: request.image_data.as_deref().map(|b| BASE64.encode(b)),
        };
        let response = self
            .request(ctx, "analyze", &body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }

        // NDJSON: buffer bytes, cut on newlines, parse one chunk per line.
        let bytes = response.bytes_stream().boxed();
        let state = (bytes, String::new(), VecDeque::new(), false);
        let stream = futures::stream::unfold(state, |(mut bytes, mut buffer, mut pending, mut done)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, buffer, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(data)) => {
                        buffer.push_str(&String::from_utf8_lossy(&data));
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            push_chunk_line(line.trim(), &mut pending);
                        }
                    }
                    Some(Err(err)) => {
                        pending.push_back(Err(transport_error(err)));
                        done = true;
                    }
                    None => {
                        let rest = std::mem::take(&mut buffer);
                        push_chunk_line(rest.trim(), &mut pending);
                        done = true;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn is_question(&self, ctx: &TraceContext, text: &str) -> Result<bool, InferenceError> {
        let response: IsQuestionResponse =
            self.post(ctx, "llm/is_question", &TextBody { text }).await?;
        Ok(response.is_question)
    }

    async fn summarize(
        &self,
        ctx: &TraceContext,
        transcript: &str,
        max_length: u32,
    ) -> Result<String, InferenceError> {
        let response: SummarizeResponse = self
            .post(
                ctx,
                "llm/summarize",
                &SummarizeBody {
                    transcript,
                    max_length,
                },
            )
            .await?;
        Ok(response.summary)
    }

    async fn store_memory(
        &self,
        ctx: &TraceContext,
        text: &str,
        source: MemorySource,
    ) -> Result<String, InferenceError> {
        let response: StoreResponse = self
            .post(ctx, "memory/store", &StoreBody { text, source })
            .await?;
        Ok(response.id)
    }

    async fn batch_store(
        &self,
        ctx: &TraceContext,
        items: &[MemoryItem],
    ) -> Result<u32, InferenceError> {
        let response: BatchStoreResponse = self
            .post(ctx, "memory/batch_store", &BatchStoreBody { items })
            .await?;
        Ok(response.stored_count)
    }

    async fn query_memory(
        &self,
        ctx: &TraceContext,
        query: &str,
        n_results: u32,
    ) -> Result<Vec<MemoryHit>, InferenceError> {
        let response: QueryResponse = self
            .post(ctx, "memory/query", &QueryBody { query, n_results })
            .await?;
        Ok(response
            .documents
            .into_iter()
            .zip(response.scores.into_iter().chain(std::iter::repeat(0.0)))
            .map(|(document, score)| MemoryHit { document, score })
            .collect())
    }
}

fn push_chunk_line(line: &str, pending: &mut VecDeque<Result<AnalyzeChunk, InferenceError>>) {
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<AnalyzeChunk>(line) {
        Ok(chunk) => pending.push_back(Ok(chunk)),
        Err(err) => pending.push_back(Err(InferenceError::new(
            ErrorCode::Internal,
            format!("malformed stream chunk: {err}"),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_samples_little_endian() {
        let encoded = encode_samples(&[1.0, -0.5]);
        let bytes = BASE64.decode(encoded).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-0.5f32).to_le_bytes());
    }

    #[test]
    fn test_chunk_line_parsing() {
        let mut pending = VecDeque::new();
        push_chunk_line(r#"{"content":"hi","is_final":false}"#, &mut pending);
        push_chunk_line("", &mut pending);
        push_chunk_line("not json", &mut pending);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.pop_front().unwrap().unwrap().content, "hi");
        assert!(pending.pop_front().unwrap().is_err());
    }

    #[test]
    fn test_base_url_normalization() {
        let options = ClientOptions::default();
        let svc = HttpInference::connect("localhost:50051", &options).unwrap();
        assert_eq!(svc.url("health"), "http://localhost:50051/v1/health");
        let svc = HttpInference::connect("https://infer.local/", &options).unwrap();
        assert_eq!(svc.url("transcribe"), "https://infer.local/v1/transcribe");
    }
}
