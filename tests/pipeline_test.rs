//! End-to-end pipeline scenarios against the scriptable stub backend:
//! silence, a single utterance, auto-answer with cooldown, breaker trip and
//! recovery, and streaming replay after a mid-stream failure.

use listend::audio::Chunk;
use listend::inference::stub::Call;
use listend::inference::{
    ClientOptions, ErrorCode, InferenceClient, InferenceError, MemorySource, StubInference,
};
use listend::manager::{AutoAnswerEvent, Manager, ManagerChannels, ManagerConfig};
use listend::resilience::{BreakerConfig, BreakerState, RetryConfig};
use listend::trace::TraceContext;
use listend::types::AudioSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Client options that keep the background health monitor out of the way
/// and make retries fast.
fn quiet_options() -> ClientOptions {
    ClientOptions {
        health_check_period: Duration::from_secs(3600),
        llm_retry: RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            jitter: 0.2,
        },
        ..ClientOptions::default()
    }
}

fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.batcher.flush_delay = Duration::from_millis(30);
    config.detector.cooldown = Duration::from_millis(1000);
    config
}

fn build_manager(
    stub: Arc<StubInference>,
    config: ManagerConfig,
) -> (Arc<Manager>, ManagerChannels, mpsc::Sender<Chunk>) {
    let client = Arc::new(InferenceClient::new(stub, quiet_options()));
    let (manager, channels) = Manager::new(client, None, config);
    let (tx, rx) = mpsc::channel(100);
    manager.start_with_audio(rx);
    (manager, channels, tx)
}

fn chunk(device: &str, source: AudioSource) -> Chunk {
    Chunk {
        samples: vec![0.0; 512],
        device_id: device.to_string(),
        source,
        timestamp_ns: 0,
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_silence_path() {
    let stub = Arc::new(StubInference::new());
    let (manager, mut channels, tx) = build_manager(stub.clone(), test_config());

    for _ in 0..20 {
        tx.send(chunk("mic", AudioSource::User)).await.unwrap();
    }
    // Let the audio loop drain everything.
    wait_until("20 VAD windows evaluated", || {
        stub.count(|c| matches!(c, Call::DetectSpeech { .. })) == 20
    })
    .await;

    assert_eq!(stub.transcribe_count(), 0);
    assert!(channels.transcripts.try_recv().is_err());
    manager.stop().await;
}

#[tokio::test]
async fn test_single_utterance() {
    let stub = Arc::new(StubInference::new());
    stub.set_transcription("this is the mocked transcript");
    stub.push_detections(0.0, false, 5);
    stub.push_detections(0.9, true, 40);

    let (manager, mut channels, tx) = build_manager(stub.clone(), test_config());
    manager.set_recording(true);

    for _ in 0..65 {
        tx.send(chunk("mic", AudioSource::User)).await.unwrap();
    }

    wait_until("one transcription", || stub.transcribe_count() == 1).await;

    // Exactly one transcribe call, with the full speech buffer.
    let samples = stub
        .calls()
        .iter()
        .find_map(|c| match c {
            Call::Transcribe { samples, .. } => Some(*samples),
            _ => None,
        })
        .unwrap();
    assert!(samples >= 40 * 512, "expected a full segment, got {samples}");
    assert_eq!(stub.reset_vad_count(), 1);

    let event = channels.transcripts.recv().await.unwrap();
    assert_eq!(event.source, AudioSource::User);
    assert_eq!(event.speaker, "You");
    assert_eq!(event.text, "this is the mocked transcript");

    // Recording + 5 words: the utterance lands in a memory batch.
    wait_until("memory batch stored", || {
        stub.count(|c| matches!(c, Call::BatchStore { .. })) == 1
    })
    .await;
    let batched = stub
        .calls()
        .iter()
        .find_map(|c| match c {
            Call::BatchStore { items } => Some(items.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(batched.len(), 1);
    assert_eq!(batched[0].text, "user: this is the mocked transcript");
    assert_eq!(batched[0].source, MemorySource::Audio);

    manager.stop().await;
}

#[tokio::test]
async fn test_auto_answer_with_cooldown() {
    let stub = Arc::new(StubInference::new());
    stub.set_transcription("What time is it?");
    stub.set_is_question(true);
    stub.set_analyze_chunks(&["It is ", "noon."]);

    let (manager, mut channels, tx) = build_manager(stub.clone(), test_config());

    let speak = |stub: &StubInference| {
        stub.push_detections(0.9, true, 20);
    };

    // First system-audio question fires the stream.
    speak(&stub);
    for _ in 0..40 {
        tx.send(chunk("loopback", AudioSource::System)).await.unwrap();
    }
    wait_until("first analyze", || stub.analyze_count() == 1).await;

    match channels.auto_answers.recv().await.unwrap() {
        AutoAnswerEvent::Start { question } => assert_eq!(question, "What time is it?"),
        other => panic!("expected start, got {other:?}"),
    }
    match channels.auto_answers.recv().await.unwrap() {
        AutoAnswerEvent::Chunk { content } => assert_eq!(content, "It is "),
        other => panic!("expected chunk, got {other:?}"),
    }
    match channels.auto_answers.recv().await.unwrap() {
        AutoAnswerEvent::Chunk { content } => assert_eq!(content, "noon."),
        other => panic!("expected chunk, got {other:?}"),
    }
    assert!(matches!(
        channels.auto_answers.recv().await.unwrap(),
        AutoAnswerEvent::Done
    ));

    // The analyze prompt carries the concise-answer preamble.
    let request = stub
        .calls()
        .iter()
        .find_map(|c| match c {
            Call::Analyze { request, .. } => Some(request.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        request.user_query,
        "Answer this question concisely: What time is it?"
    );

    // Same question inside the cooldown: no second stream.
    speak(&stub);
    for _ in 0..40 {
        tx.send(chunk("loopback", AudioSource::System)).await.unwrap();
    }
    wait_until("second transcription", || stub.transcribe_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stub.analyze_count(), 1);

    // After the cooldown it fires again.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    speak(&stub);
    for _ in 0..40 {
        tx.send(chunk("loopback", AudioSource::System)).await.unwrap();
    }
    wait_until("second analyze", || stub.analyze_count() == 2).await;

    manager.stop().await;
}

#[tokio::test]
async fn test_user_audio_never_auto_answers() {
    let stub = Arc::new(StubInference::new());
    stub.set_transcription("What time is it?");
    stub.set_is_question(true);
    stub.set_analyze_chunks(&["nope"]);
    stub.push_detections(0.9, true, 20);

    let (manager, _channels, tx) = build_manager(stub.clone(), test_config());

    for _ in 0..40 {
        tx.send(chunk("mic", AudioSource::User)).await.unwrap();
    }
    wait_until("transcription", || stub.transcribe_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(stub.analyze_count(), 0);
    assert_eq!(stub.count(|c| matches!(c, Call::IsQuestion { .. })), 0);
    manager.stop().await;
}

#[tokio::test]
async fn test_breaker_trip_and_recovery() {
    let stub = Arc::new(StubInference::new());
    stub.set_transcription("ok");
    let options = ClientOptions {
        health_check_period: Duration::from_secs(3600),
        breaker: BreakerConfig {
            threshold: 5,
            failure_window: Duration::from_secs(30),
            reset_timeout: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
            half_open_successes: 2,
        },
        ..ClientOptions::default()
    };
    let client = InferenceClient::new(stub.clone(), options);
    let ctx = TraceContext::new();
    let samples = vec![0.0f32; 512];

    for _ in 0..5 {
        stub.push_transcribe_error(InferenceError::new(ErrorCode::Unavailable, "backend down"));
    }
    for _ in 0..5 {
        assert!(client.transcribe(&ctx, &samples, 16000).await.is_err());
    }
    assert_eq!(client.breaker_state(), BreakerState::Open);
    assert_eq!(stub.transcribe_count(), 5);

    // The sixth call is rejected without touching the backend.
    let err = client.transcribe(&ctx, &samples, 16000).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(stub.transcribe_count(), 5);

    // After the reset timeout a probe is allowed; two successes close it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(client.transcribe(&ctx, &samples, 16000).await.is_ok());
    assert_eq!(client.breaker_state(), BreakerState::HalfOpen);
    assert!(client.transcribe(&ctx, &samples, 16000).await.is_ok());
    assert_eq!(client.breaker_state(), BreakerState::Closed);

    client.stop().await;
}

#[tokio::test]
async fn test_streaming_replay_after_midstream_failure() {
    let stub = Arc::new(StubInference::new());
    stub.set_analyze_chunks(&["alpha", "beta", "gamma", "delta"]);
    stub.push_analyze_error(InferenceError::new(ErrorCode::Unavailable, "stream cut"));

    let client = InferenceClient::new(stub.clone(), quiet_options());
    let ctx = TraceContext::new();
    let request = listend::inference::AnalyzeRequest {
        user_query: "summarize".to_string(),
        ..Default::default()
    };

    let chunks = client.analyze(&ctx, &request).await.unwrap();

    // Two attempts, but chunks are delivered exactly once, from the
    // successful attempt only.
    assert_eq!(stub.analyze_count(), 2);
    assert_eq!(chunks, vec!["alpha", "beta", "gamma", "delta"]);

    client.stop().await;
}

#[tokio::test]
async fn test_permanent_error_fails_fast() {
    let stub = Arc::new(StubInference::new());
    stub.set_analyze_chunks(&["unused"]);
    stub.push_analyze_error(InferenceError::new(
        ErrorCode::InvalidArgument,
        "bad request",
    ));

    let client = InferenceClient::new(stub.clone(), quiet_options());
    let ctx = TraceContext::new();
    let request = listend::inference::AnalyzeRequest::default();

    let err = client.analyze(&ctx, &request).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert_eq!(stub.analyze_count(), 1);
    // A permanent error is not a breaker failure.
    assert_eq!(client.breaker_state(), BreakerState::Closed);

    client.stop().await;
}

#[tokio::test]
async fn test_summarization_rolls_up_old_entries() {
    let stub = Arc::new(StubInference::new());
    stub.set_summary("they argued about lunch");

    let mut config = test_config();
    config.summarizer.threshold = Duration::ZERO;
    config.summarizer.min_entries = 5;

    let client = Arc::new(InferenceClient::new(stub.clone(), quiet_options()));
    let (manager, _channels) = Manager::new(client, None, config);

    for i in 0..6 {
        manager
            .transcripts()
            .add(&format!("line {i}"), AudioSource::User, "You");
    }

    // Not recording: nothing happens.
    assert!(!manager.summarize_once().await.unwrap());
    assert_eq!(manager.transcripts().summary_count(), 0);

    manager.set_recording(true);
    assert!(manager.summarize_once().await.unwrap());
    assert_eq!(manager.transcripts().summary_count(), 1);
    // Entries strictly before the summarized span's end are pruned.
    assert!(manager.transcripts().entry_count() <= 1);

    let rendered = manager.transcripts().get_recent(Duration::from_secs(60));
    assert!(rendered.starts_with("[Summary] they argued about lunch"));

    // The summarize call saw the old entries rendered one per line.
    let transcript = stub
        .calls()
        .iter()
        .find_map(|c| match c {
            Call::Summarize { transcript, .. } => Some(transcript.clone()),
            _ => None,
        })
        .unwrap();
    assert!(transcript.contains("user: line 0"));
}

/// Scripted frame sources for the screen pipeline tests.
struct Frames {
    frames: Vec<Vec<u8>>,
    next: usize,
}

impl listend::screen::FrameSource for Frames {
    fn grab(&mut self) -> anyhow::Result<Vec<u8>> {
        let frame = self.frames[self.next.min(self.frames.len() - 1)].clone();
        self.next += 1;
        Ok(frame)
    }
}

fn encoded_gradient(offset: u8, invert: bool) -> Vec<u8> {
    let img = image::RgbImage::from_fn(64, 64, |x, _y| {
        let mut v = ((x * 4) as u8).saturating_add(offset);
        if invert {
            v = 255 - v;
        }
        image::Rgb([v; 3])
    });
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    png
}

#[tokio::test]
async fn test_screen_ocr_gating() {
    use listend::manager::{ScreenConfig, ScreenProcessor};
    use listend::memory::{BatcherConfig, MemoryBatcher};
    use listend::screen::ScreenCapturer;

    let stub = Arc::new(StubInference::new());
    stub.set_ocr_text("the same stable text");
    let client = Arc::new(InferenceClient::new(stub.clone(), quiet_options()));
    let batcher = MemoryBatcher::new(client.clone(), BatcherConfig::default());

    let base = encoded_gradient(0, false);
    let frames = Frames {
        frames: vec![
            base.clone(),
            base.clone(),                  // identical bytes: fast-hash gate
            encoded_gradient(1, false),    // new bytes, visually equivalent: phash gate
            encoded_gradient(0, true),     // visually different: OCR again
        ],
        next: 0,
    };
    let processor = ScreenProcessor::new(
        ScreenCapturer::new(Box::new(frames)),
        ScreenConfig {
            stable_count_threshold: 1,
            min_text_length: 5,
            ..ScreenConfig::default()
        },
    );

    for _ in 0..4 {
        processor.tick(&client, &batcher, true).await.unwrap();
    }

    let ocr_calls = stub.count(|c| matches!(c, Call::ExtractText { .. }));
    assert_eq!(ocr_calls, 2, "only the first and the visually new frame OCR");
    assert_eq!(processor.latest_text(), "the same stable text");

    // Second OCR returned identical text: stable threshold reached, stored.
    batcher.stop().await;
    let batched = stub
        .calls()
        .iter()
        .find_map(|c| match c {
            Call::BatchStore { items } => Some(items.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(batched[0].text, "the same stable text");
    assert_eq!(batched[0].source, MemorySource::Screen);

    client.stop().await;
}

#[tokio::test]
async fn test_trace_id_reaches_the_wire() {
    let stub = Arc::new(StubInference::new());
    stub.set_transcription("ok");
    let client = InferenceClient::new(stub.clone(), quiet_options());

    let trace_id = "a".repeat(32);
    let ctx = TraceContext::with_trace_id(&trace_id);
    client.transcribe(&ctx, &[0.0; 512], 16000).await.unwrap();

    let seen = stub
        .calls()
        .iter()
        .find_map(|c| match c {
            Call::Transcribe { trace_id, .. } => Some(trace_id.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(seen, trace_id);
    client.stop().await;
}
