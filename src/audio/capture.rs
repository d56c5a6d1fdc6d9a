//! Audio device capture
//!
//! Enumerates input-capable devices, classifies each by name as the user's
//! microphone or a system-loopback device, and starts one reader per
//! selected device. Readers publish fixed-size mono f32 chunks onto a shared
//! bounded channel with try-send semantics.

use crate::config::CAPTURE_FRAME_SAMPLES;
use crate::types::{AudioSource, DropCounters};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Name substrings marking a loopback / virtual output-tap device.
const SYSTEM_DEVICE_MARKERS: [&str; 5] =
    ["blackhole", "vb-cable", "loopback", "monitor", "soundflower"];

/// Name substrings marking a plausible user microphone.
const USER_DEVICE_MARKERS: [&str; 4] = ["microphone", "input", "mic", "built-in"];

/// Among user devices, prefer the laptop's own mic.
const PREFERRED_USER_MARKERS: [&str; 2] = ["macbook", "built-in"];

/// One capture frame from one device.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Exactly one capture frame of mono samples in [-1, 1]
    pub samples: Vec<f32>,
    pub device_id: String,
    pub source: AudioSource,
    pub timestamp_ns: i64,
}

/// Capturer configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Capacity of the shared chunk channel
    pub channel_capacity: usize,
    pub capture_system_audio: bool,
    /// Lowercased name substrings to never open
    pub excluded_devices: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channel_capacity: 100,
            capture_system_audio: true,
            excluded_devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceClass {
    User,
    System,
    Ignored,
}

/// Owns the reader threads for every started device.
pub struct AudioCapturer {
    config: CaptureConfig,
    drops: Arc<DropCounters>,
    stop: Arc<AtomicBool>,
    readers: Vec<std::thread::JoinHandle<()>>,
}

impl AudioCapturer {
    pub fn new(config: CaptureConfig, drops: Arc<DropCounters>) -> Self {
        Self {
            config,
            drops,
            stop: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
        }
    }

    /// Enumerate, classify, and start devices; returns the chunk channel.
    ///
    /// A device that fails to open is logged and skipped. Enumeration
    /// failure is fatal: without the host there is nothing to capture.
    pub fn start(&mut self) -> Result<mpsc::Receiver<Chunk>> {
        let host = cpal::default_host();
        let devices: Vec<(String, cpal::Device)> = host
            .input_devices()
            .context("failed to enumerate audio input devices")?
            .filter_map(|device| device.name().ok().map(|name| (name, device)))
            .collect();

        let mut user_devices = Vec::new();
        let mut system_devices = Vec::new();
        for (name, device) in devices {
            if is_excluded(&name, &self.config.excluded_devices) {
                debug!(device = %name, "audio device excluded by configuration");
                continue;
            }
            match classify_device(&name) {
                DeviceClass::User => user_devices.push((name, device)),
                DeviceClass::System => system_devices.push((name, device)),
                DeviceClass::Ignored => debug!(device = %name, "audio device ignored"),
            }
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);

        if let Some(best) = select_user_device(user_devices.iter().map(|(n, _)| n.as_str())) {
            let (name, device) = user_devices.swap_remove(best);
            info!(device = %name, "starting user microphone");
            self.spawn_reader(name, device, AudioSource::User, tx.clone());
        } else {
            warn!("no user microphone found");
        }

        if self.config.capture_system_audio {
            for (name, device) in system_devices {
                info!(device = %name, "starting system audio device");
                self.spawn_reader(name, device, AudioSource::System, tx.clone());
            }
        }

        Ok(rx)
    }

    /// Signal cancellation and join every reader thread.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        info!("audio capture stopped");
    }

    fn spawn_reader(
        &mut self,
        name: String,
        device: cpal::Device,
        source: AudioSource,
        tx: mpsc::Sender<Chunk>,
    ) {
        let stop = self.stop.clone();
        let drops = self.drops.clone();
        let sample_rate = self.config.sample_rate;
        let thread = std::thread::Builder::new()
            .name(format!("audio-{}", name.to_lowercase().replace(' ', "-")))
            .spawn(move || {
                if let Err(err) = run_device(&name, &device, source, sample_rate, tx, stop, drops)
                {
                    warn!(device = %name, error = %err, "audio device failed, skipping");
                }
            });
        match thread {
            Ok(handle) => self.readers.push(handle),
            Err(err) => warn!(error = %err, "failed to spawn audio reader thread"),
        }
    }
}

impl Drop for AudioCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reader body: negotiate a stream config, run the cpal stream, and park
/// until cancellation. The cpal stream is released on every exit path when
/// the thread unwinds.
fn run_device(
    name: &str,
    device: &cpal::Device,
    source: AudioSource,
    sample_rate: u32,
    tx: mpsc::Sender<Chunk>,
    stop: Arc<AtomicBool>,
    drops: Arc<DropCounters>,
) -> Result<()> {
    let default_config = device
        .default_input_config()
        .context("failed to read default input config")?;
    let channels = default_config.channels();

    let mut supported = device
        .supported_input_configs()
        .context("failed to get supported input configs")?;
    let supported_config = supported
        .find(|c| {
            c.sample_format() == cpal::SampleFormat::F32
                || c.sample_format() == cpal::SampleFormat::I16
        })
        .context("no supported sample format found")?;
    let device_rate = supported_config
        .min_sample_rate()
        .0
        .max(sample_rate)
        .min(supported_config.max_sample_rate().0);

    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(device_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(device = %name, rate = device_rate, channels, "input stream config");

    let device_id = name.to_string();
    let mut publisher = FramePublisher::new(device_id, source, channels as usize, tx, drops);
    let err_name = name.to_string();
    let err_fn = move |err| warn!(device = %err_name, error = %err, "audio input error");

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| publisher.push(data),
            err_fn,
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|&s| (s as f32 / i16::MAX as f32).clamp(-1.0, 1.0))
                    .collect();
                publisher.push(&samples);
            },
            err_fn,
            None,
        )?,
        format => anyhow::bail!("unsupported sample format: {format:?}"),
    };

    stream.play().context("failed to start input stream")?;

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Accumulates interleaved callback data into fixed-size mono frames and
/// try-sends them; overflow drops the frame.
struct FramePublisher {
    device_id: String,
    source: AudioSource,
    channels: usize,
    pending: Vec<f32>,
    tx: mpsc::Sender<Chunk>,
    drops: Arc<DropCounters>,
}

impl FramePublisher {
    fn new(
        device_id: String,
        source: AudioSource,
        channels: usize,
        tx: mpsc::Sender<Chunk>,
        drops: Arc<DropCounters>,
    ) -> Self {
        Self {
            device_id,
            source,
            channels: channels.max(1),
            pending: Vec::with_capacity(CAPTURE_FRAME_SAMPLES * 2),
            tx,
            drops,
        }
    }

    fn push(&mut self, data: &[f32]) {
        if self.channels == 1 {
            self.pending.extend_from_slice(data);
        } else {
            // Downmix interleaved frames to mono by averaging channels.
            for frame in data.chunks_exact(self.channels) {
                let sum: f32 = frame.iter().sum();
                self.pending.push(sum / self.channels as f32);
            }
        }
        while self.pending.len() >= CAPTURE_FRAME_SAMPLES {
            let samples: Vec<f32> = self.pending.drain(..CAPTURE_FRAME_SAMPLES).collect();
            let chunk = Chunk {
                samples,
                device_id: self.device_id.clone(),
                source: self.source,
                timestamp_ns: now_ns(),
            };
            if self.tx.try_send(chunk).is_err() {
                self.drops
                    .audio
                    .fetch_add(1, Ordering::Relaxed);
                debug!(device = %self.device_id, "audio channel full, dropping chunk");
            }
        }
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn classify_device(name: &str) -> DeviceClass {
    let lower = name.to_lowercase();
    if SYSTEM_DEVICE_MARKERS.iter().any(|m| lower.contains(m)) {
        DeviceClass::System
    } else if USER_DEVICE_MARKERS.iter().any(|m| lower.contains(m)) {
        DeviceClass::User
    } else {
        DeviceClass::Ignored
    }
}

fn is_excluded(name: &str, excluded: &[String]) -> bool {
    let lower = name.to_lowercase();
    excluded.iter().any(|m| lower.contains(m))
}

/// Pick the single best user microphone: prefer the built-in one.
fn select_user_device<'a>(names: impl Iterator<Item = &'a str>) -> Option<usize> {
    let names: Vec<&str> = names.collect();
    if names.is_empty() {
        return None;
    }
    for marker in PREFERRED_USER_MARKERS {
        if let Some(idx) = names
            .iter()
            .position(|n| n.to_lowercase().contains(marker))
        {
            return Some(idx);
        }
    }
    Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_system_devices() {
        for name in ["BlackHole 2ch", "VB-Cable", "Monitor of Built-in", "Soundflower (2ch)"] {
            // "Monitor of Built-in" matches the system marker first.
            assert_eq!(classify_device(name), DeviceClass::System, "{name}");
        }
    }

    #[test]
    fn test_classify_user_devices() {
        for name in ["MacBook Pro Microphone", "USB Mic", "Line Input"] {
            assert_eq!(classify_device(name), DeviceClass::User, "{name}");
        }
    }

    #[test]
    fn test_classify_ignored() {
        assert_eq!(classify_device("HDMI Output"), DeviceClass::Ignored);
    }

    #[test]
    fn test_exclusion_is_case_insensitive() {
        let excluded = vec!["iphone".to_string(), "teams".to_string()];
        assert!(is_excluded("iPhone Microphone", &excluded));
        assert!(is_excluded("Microsoft Teams Audio", &excluded));
        assert!(!is_excluded("MacBook Pro Microphone", &excluded));
    }

    #[test]
    fn test_select_prefers_builtin() {
        let names = ["USB Mic", "MacBook Pro Microphone", "Line Input"];
        assert_eq!(select_user_device(names.iter().copied()), Some(1));

        let names = ["USB Mic", "Built-in Microphone"];
        assert_eq!(select_user_device(names.iter().copied()), Some(1));

        let names = ["USB Mic", "Line Input"];
        assert_eq!(select_user_device(names.iter().copied()), Some(0));

        assert_eq!(select_user_device(std::iter::empty()), None);
    }

    #[tokio::test]
    async fn test_publisher_frames_and_drops() {
        let drops = Arc::new(DropCounters::default());
        let (tx, mut rx) = mpsc::channel(2);
        let mut publisher = FramePublisher::new(
            "test".to_string(),
            AudioSource::User,
            1,
            tx,
            drops.clone(),
        );

        // 3.5 frames in: 2 delivered, 1 dropped (capacity 2), half pending.
        publisher.push(&vec![0.1; CAPTURE_FRAME_SAMPLES * 3 + CAPTURE_FRAME_SAMPLES / 2]);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.samples.len(), CAPTURE_FRAME_SAMPLES);
        assert_eq!(first.device_id, "test");
        assert!(rx.recv().await.is_some());
        assert_eq!(drops.snapshot().audio, 1);
        assert_eq!(publisher.pending.len(), CAPTURE_FRAME_SAMPLES / 2);
    }

    #[test]
    fn test_downmix_stereo() {
        let drops = Arc::new(DropCounters::default());
        let (tx, _rx) = mpsc::channel(1);
        let mut publisher =
            FramePublisher::new("test".to_string(), AudioSource::User, 2, tx, drops);
        publisher.push(&[1.0, 0.0, 0.5, 0.5]);
        assert_eq!(publisher.pending, vec![0.5, 0.5]);
    }
}
