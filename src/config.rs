//! Configuration management
//!
//! All runtime configuration arrives through environment variables and is
//! validated in one pass at startup. Every violation is collected so the
//! operator sees a single report instead of fixing variables one at a time.

use anyhow::{bail, Result};
use serde::Serialize;
use std::time::Duration;

/// Sample rates the speech stack accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 16000, 22050, 44100, 48000];

/// Samples per capture frame published by a device reader (~23 ms at 44.1 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 1024;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Main configuration structure, built from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WebSocket listen address (":8000" binds all interfaces)
    pub http_addr: String,
    /// Upstream inference endpoint (host:port)
    pub inference_addr: String,
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Speech probability threshold for the VAD decision
    pub vad_threshold: f32,
    /// Trailing silent windows before a speech segment is finalized
    pub max_silence_chunks: u32,
    /// Whether to start loopback/system audio devices
    pub capture_system_audio: bool,
    /// Case-insensitive device-name substrings to never open
    pub excluded_audio_devices: Vec<String>,
    /// Screen capture rate in Hz
    pub screen_capture_rate: f64,
    /// Identical-OCR ticks required before screen text is stored
    pub screen_stable_count_threshold: u32,
    /// Minimum OCR text length worth storing
    pub screen_min_text_length: usize,
    /// Perceptual-hash similarity above which OCR is skipped
    pub screen_phash_threshold: f64,
    /// Auto-answer feature gate
    pub auto_answer_enabled: bool,
    /// Minimum interval between auto-answer firings
    pub auto_answer_cooldown: Duration,
    /// Minimum text length before the question classifier is consulted
    pub min_question_length: usize,
    /// Memory batch size that forces a synchronous flush
    pub memory_batch_max_size: usize,
    /// Idle delay before a partial memory batch flushes
    pub memory_batch_flush_delay: Duration,
    /// Default log directive (TRACE/DEBUG/INFO/WARN/ERROR)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: ":8000".to_string(),
            inference_addr: "localhost:50051".to_string(),
            sample_rate: 16000,
            vad_threshold: 0.5,
            max_silence_chunks: 15,
            capture_system_audio: true,
            excluded_audio_devices: vec!["iphone".to_string(), "teams".to_string()],
            screen_capture_rate: 1.0,
            screen_stable_count_threshold: 2,
            screen_min_text_length: 10,
            screen_phash_threshold: 0.95,
            auto_answer_enabled: true,
            auto_answer_cooldown: Duration::from_secs(10),
            min_question_length: 10,
            memory_batch_max_size: 50,
            memory_batch_flush_delay: Duration::from_millis(2000),
            log_level: "INFO".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load configuration from the environment, validating every variable.
    ///
    /// On failure the error message is a multi-line report naming each
    /// offending variable; callers print it and exit with code 1.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        let mut problems: Vec<String> = Vec::new();

        if let Some(v) = read("HTTP_ADDR") {
            if parse_listen_addr(&v).is_none() {
                problems.push(format!(
                    "HTTP_ADDR: {v:?} is not a listen address (expected host:port or :port)"
                ));
            } else {
                cfg.http_addr = v;
            }
        }
        if let Some(v) = read("INFERENCE_ADDR") {
            if v.trim().is_empty() {
                problems.push("INFERENCE_ADDR: must not be empty".to_string());
            } else {
                cfg.inference_addr = v;
            }
        }
        parse_into(&mut cfg.sample_rate, "SAMPLE_RATE", &mut problems, |rate| {
            if SUPPORTED_SAMPLE_RATES.contains(&rate) {
                Ok(())
            } else {
                Err(format!("must be one of {SUPPORTED_SAMPLE_RATES:?}"))
            }
        });
        parse_into(&mut cfg.vad_threshold, "VAD_THRESHOLD", &mut problems, |t| {
            if (0.0..=1.0).contains(&t) {
                Ok(())
            } else {
                Err("must be within [0, 1]".to_string())
            }
        });
        parse_into(
            &mut cfg.max_silence_chunks,
            "MAX_SILENCE_CHUNKS",
            &mut problems,
            |n| {
                if n >= 1 {
                    Ok(())
                } else {
                    Err("must be >= 1".to_string())
                }
            },
        );
        parse_bool_into(
            &mut cfg.capture_system_audio,
            "CAPTURE_SYSTEM_AUDIO",
            &mut problems,
        );
        if let Some(v) = read("EXCLUDED_AUDIO_DEVICES") {
            cfg.excluded_audio_devices = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        parse_into(
            &mut cfg.screen_capture_rate,
            "SCREEN_CAPTURE_RATE",
            &mut problems,
            |hz| {
                if hz > 0.1 && hz <= 10.0 {
                    Ok(())
                } else {
                    Err("must be within (0.1, 10] Hz".to_string())
                }
            },
        );
        parse_into(
            &mut cfg.screen_stable_count_threshold,
            "SCREEN_STABLE_COUNT_THRESHOLD",
            &mut problems,
            |n| {
                if n >= 1 {
                    Ok(())
                } else {
                    Err("must be >= 1".to_string())
                }
            },
        );
        parse_into(
            &mut cfg.screen_min_text_length,
            "SCREEN_MIN_TEXT_LENGTH",
            &mut problems,
            |_| Ok(()),
        );
        parse_into(
            &mut cfg.screen_phash_threshold,
            "SCREEN_PHASH_THRESHOLD",
            &mut problems,
            |t| {
                if (0.0..=1.0).contains(&t) {
                    Ok(())
                } else {
                    Err("must be within [0, 1]".to_string())
                }
            },
        );
        parse_bool_into(
            &mut cfg.auto_answer_enabled,
            "AUTO_ANSWER_ENABLED",
            &mut problems,
        );
        if let Some(v) = read("AUTO_ANSWER_COOLDOWN") {
            match v.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => {
                    cfg.auto_answer_cooldown = Duration::from_secs_f64(secs);
                }
                Ok(_) => problems.push("AUTO_ANSWER_COOLDOWN: must be >= 0".to_string()),
                Err(_) => problems.push(format!(
                    "AUTO_ANSWER_COOLDOWN: {v:?} is not a number of seconds"
                )),
            }
        }
        parse_into(
            &mut cfg.min_question_length,
            "MIN_QUESTION_LENGTH",
            &mut problems,
            |_| Ok(()),
        );
        parse_into(
            &mut cfg.memory_batch_max_size,
            "MEMORY_BATCH_MAX_SIZE",
            &mut problems,
            |n| {
                if n >= 1 {
                    Ok(())
                } else {
                    Err("must be >= 1".to_string())
                }
            },
        );
        if let Some(v) = read("MEMORY_BATCH_FLUSH_DELAY_MS") {
            match v.parse::<u64>() {
                Ok(ms) => cfg.memory_batch_flush_delay = Duration::from_millis(ms),
                Err(_) => problems.push(format!(
                    "MEMORY_BATCH_FLUSH_DELAY_MS: {v:?} is not a millisecond count"
                )),
            }
        }
        if let Some(v) = read("LOG_LEVEL") {
            let upper = v.to_uppercase();
            match upper.as_str() {
                "TRACE" | "DEBUG" | "INFO" | "WARN" | "ERROR" => cfg.log_level = upper,
                _ => problems.push(format!(
                    "LOG_LEVEL: {v:?} is not one of TRACE, DEBUG, INFO, WARN, ERROR"
                )),
            }
        }
        if let Some(v) = read("LOG_FORMAT") {
            match v.to_lowercase().as_str() {
                "text" => cfg.log_format = LogFormat::Text,
                "json" => cfg.log_format = LogFormat::Json,
                _ => problems.push(format!("LOG_FORMAT: {v:?} is not \"text\" or \"json\"")),
            }
        }

        if !problems.is_empty() {
            bail!("invalid configuration:\n  - {}", problems.join("\n  - "));
        }
        Ok(cfg)
    }

    /// Listen address normalized for `TcpListener::bind` (":8000" → "0.0.0.0:8000").
    pub fn bind_addr(&self) -> String {
        match parse_listen_addr(&self.http_addr) {
            Some(addr) => addr,
            None => self.http_addr.clone(),
        }
    }

    /// Maximum pHash Hamming distance still treated as "the same frame".
    ///
    /// A similarity threshold of 0.95 over a 64-bit hash allows 3 differing bits.
    pub fn max_phash_distance(&self) -> u32 {
        ((1.0 - self.screen_phash_threshold) * 64.0).round() as u32
    }

    /// Shortest speech buffer worth transcribing (half a second of audio).
    pub fn min_speech_samples(&self) -> usize {
        (self.sample_rate / 2) as usize
    }
}

fn read(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Accepts "host:port" or ":port"; returns the bindable form.
fn parse_listen_addr(value: &str) -> Option<String> {
    let (host, port) = value.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    if host.is_empty() {
        Some(format!("0.0.0.0:{port}"))
    } else {
        Some(value.to_string())
    }
}

fn parse_into<T: std::str::FromStr + Copy>(
    slot: &mut T,
    key: &str,
    problems: &mut Vec<String>,
    validate: impl FnOnce(T) -> Result<(), String>,
) {
    if let Some(v) = read(key) {
        match v.parse::<T>() {
            Ok(parsed) => match validate(parsed) {
                Ok(()) => *slot = parsed,
                Err(why) => problems.push(format!("{key}: {why} (got {v:?})")),
            },
            Err(_) => problems.push(format!("{key}: {v:?} could not be parsed")),
        }
    }
}

fn parse_bool_into(slot: &mut bool, key: &str, problems: &mut Vec<String>) {
    if let Some(v) = read(key) {
        match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => *slot = true,
            "false" | "0" | "no" => *slot = false,
            _ => problems.push(format!("{key}: {v:?} is not a boolean")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.sample_rate, 16000);
        assert_eq!(cfg.max_phash_distance(), 3);
        assert_eq!(cfg.min_speech_samples(), 8000);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn test_listen_addr_forms() {
        assert_eq!(parse_listen_addr(":8000").as_deref(), Some("0.0.0.0:8000"));
        assert_eq!(
            parse_listen_addr("127.0.0.1:9001").as_deref(),
            Some("127.0.0.1:9001")
        );
        assert!(parse_listen_addr("no-port").is_none());
        assert!(parse_listen_addr(":not-a-port").is_none());
    }

    #[test]
    fn test_phash_distance_rounding() {
        let mut cfg = Config::default();
        cfg.screen_phash_threshold = 1.0;
        assert_eq!(cfg.max_phash_distance(), 0);
        cfg.screen_phash_threshold = 0.90;
        assert_eq!(cfg.max_phash_distance(), 6);
    }
}
