//! Screen capture with cheap change detection
//!
//! A platform [`FrameSource`] produces encoded JPEG frames; the capturer
//! gates them with a fast hash over the first 4 KiB of encoded bytes so an
//! unchanged desktop costs almost nothing per tick. The much stronger (and
//! more expensive) perceptual-hash comparison happens later, in the screen
//! processor, to decide whether OCR is worth running.

pub mod phash;

pub use phash::{hamming_distance, perceptual_hash};

use anyhow::Result;
use std::hash::{Hash, Hasher};

/// Bytes of the encoded frame fed to the fast change hash.
const FAST_HASH_PREFIX: usize = 4096;

/// Platform-specific frame grabber returning encoded JPEG bytes.
pub trait FrameSource: Send {
    fn grab(&mut self) -> Result<Vec<u8>>;

    /// Encoding of the grabbed bytes, as named on the OCR wire.
    fn format(&self) -> &'static str {
        "jpeg"
    }
}

/// Change-gated screen capturer.
pub struct ScreenCapturer {
    source: Box<dyn FrameSource>,
    last_hash: Option<u64>,
}

impl ScreenCapturer {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self {
            source,
            last_hash: None,
        }
    }

    /// Grab a frame; `None` means the screen is byte-identical to the last
    /// grab (same 4 KiB prefix hash).
    pub fn capture(&mut self) -> Result<Option<Vec<u8>>> {
        let bytes = self.source.grab()?;
        let hash = prefix_hash(&bytes);
        if self.last_hash == Some(hash) {
            return Ok(None);
        }
        self.last_hash = Some(hash);
        Ok(Some(bytes))
    }

    /// Grab unconditionally, still updating the change hash.
    pub fn capture_always(&mut self) -> Result<Vec<u8>> {
        let bytes = self.source.grab()?;
        self.last_hash = Some(prefix_hash(&bytes));
        Ok(bytes)
    }

    pub fn format(&self) -> &'static str {
        self.source.format()
    }
}

fn prefix_hash(bytes: &[u8]) -> u64 {
    let prefix = &bytes[..bytes.len().min(FAST_HASH_PREFIX)];
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    prefix.hash(&mut hasher);
    hasher.finish()
}

/// Primary-display frame source backed by the `screenshots` crate.
#[cfg(feature = "desktop")]
pub struct PrimaryDisplay;

#[cfg(feature = "desktop")]
impl FrameSource for PrimaryDisplay {
    fn grab(&mut self) -> Result<Vec<u8>> {
        use anyhow::Context;
        use screenshots::Screen;

        let screens = Screen::all().context("failed to get screen list")?;
        let screen = screens
            .into_iter()
            .next()
            .context("no primary screen available")?;
        let captured = screen.capture().context("failed to capture screen")?;

        let width = captured.width();
        let height = captured.height();
        let buffer: image::ImageBuffer<image::Rgba<u8>, Vec<u8>> =
            image::ImageBuffer::from_raw(width, height, captured.as_raw().clone())
                .context("failed to build image buffer from capture")?;

        // JPEG has no alpha channel; flatten before encoding.
        let rgb = image::DynamicImage::ImageRgba8(buffer).to_rgb8();
        let mut jpeg = Vec::new();
        rgb.write_to(
            &mut std::io::Cursor::new(&mut jpeg),
            image::ImageFormat::Jpeg,
        )
        .context("failed to encode frame as JPEG")?;
        Ok(jpeg)
    }
}
