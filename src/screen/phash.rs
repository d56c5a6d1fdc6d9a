//! 64-bit perceptual hash
//!
//! Mean-threshold hash over an 8×8 grayscale downscale. Hamming distance
//! between two hashes approximates perceptual similarity: 3 differing bits
//! corresponds to roughly 95% similar frames, which is the gate in front of
//! OCR.

use anyhow::{Context, Result};
use image::imageops::FilterType;

/// Hash encoded image bytes (any format the `image` crate can sniff).
pub fn perceptual_hash(bytes: &[u8]) -> Result<u64> {
    let img = image::load_from_memory(bytes).context("failed to decode frame for phash")?;
    Ok(hash_image(&img))
}

/// Hash an already-decoded image.
pub fn hash_image(img: &image::DynamicImage) -> u64 {
    let gray = img.resize_exact(8, 8, FilterType::Triangle).to_luma8();
    let total: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    let mean = (total / 64) as u8;

    let mut hash = 0u64;
    for (i, pixel) in gray.pixels().enumerate() {
        if pixel.0[0] > mean {
            hash |= 1 << i;
        }
    }
    hash
}

/// Number of differing bits between two hashes.
pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};

    #[test]
    fn test_hamming() {
        assert_eq!(hamming_distance(0, 0), 0);
        assert_eq!(hamming_distance(0b1011, 0b0011), 1);
        assert_eq!(hamming_distance(u64::MAX, 0), 64);
    }

    #[test]
    fn test_identical_images_distance_zero() {
        let img = gradient(0);
        assert_eq!(hamming_distance(hash_image(&img), hash_image(&img)), 0);
    }

    #[test]
    fn test_different_images_distance_large() {
        let a = hash_image(&gradient(0));
        let b = hash_image(&inverse_gradient());
        assert!(hamming_distance(a, b) > 3, "distance {}", hamming_distance(a, b));
    }

    #[test]
    fn test_small_noise_small_distance() {
        let a = hash_image(&gradient(0));
        let b = hash_image(&gradient(2));
        assert!(hamming_distance(a, b) <= 3);
    }

    #[test]
    fn test_roundtrip_through_encoding() {
        let img = gradient(0);
        let mut png = Vec::new();
        img.to_rgb8()
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let decoded = perceptual_hash(&png).unwrap();
        assert_eq!(hamming_distance(decoded, hash_image(&img)), 0);
    }

    fn gradient(offset: u8) -> DynamicImage {
        let img = RgbImage::from_fn(64, 64, |x, _y| {
            let v = (x * 4) as u8 % 255;
            Rgb([v.saturating_add(offset); 3])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn inverse_gradient() -> DynamicImage {
        let img = RgbImage::from_fn(64, 64, |x, _y| {
            let v = 255u8.saturating_sub((x * 4) as u8 % 255);
            Rgb([v; 3])
        });
        DynamicImage::ImageRgb8(img)
    }
}
