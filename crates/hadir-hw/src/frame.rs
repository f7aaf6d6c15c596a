//! Frame type and pixel analysis: downscale, gray levels, Laplacian blur
//! metric, JPEG snapshots.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Build a frame from raw RGB8 bytes, checking the buffer length.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Wrap a decoded RGB image.
    pub fn from_rgb(image: RgbImage, sequence: u32) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    /// View the frame as an `image` buffer.
    pub fn rgb_image(&self) -> Result<RgbImage, FrameError> {
        RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width as usize) * (self.height as usize) * 3,
                actual: self.data.len(),
            },
        )
    }

    /// Resize to exactly `width` x `height` with a triangle (bilinear) filter.
    ///
    /// Used to bring every frame to the same small analysis size so that the
    /// quality metrics are comparable across cameras.
    pub fn downscale(&self, width: u32, height: u32) -> Result<Frame, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyTarget);
        }
        let resized = imageops::resize(&self.rgb_image()?, width, height, FilterType::Triangle);
        Ok(Frame {
            data: resized.into_raw(),
            width,
            height,
            timestamp: self.timestamp,
            sequence: self.sequence,
        })
    }

    /// Per-pixel gray level: mean of the three colour channels.
    pub fn gray_levels(&self) -> Vec<f32> {
        self.data
            .chunks_exact(3)
            .map(|px| (px[0] as f32 + px[1] as f32 + px[2] as f32) / 3.0)
            .collect()
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let gray = self.gray_levels();
        if gray.is_empty() {
            return 0.0;
        }
        gray.iter().sum::<f32>() / gray.len() as f32
    }

    /// Encode a JPEG scaled to `target_width`, keeping the aspect ratio.
    pub fn encode_jpeg(&self, target_width: u32, quality: u8) -> Result<Vec<u8>, FrameError> {
        if self.width == 0 || self.height == 0 || target_width == 0 {
            return Err(FrameError::EmptyTarget);
        }
        let scale = target_width as f32 / self.width as f32;
        let target_height = ((self.height as f32 * scale).round() as u32).max(1);

        let source = self.rgb_image()?;
        let scaled = if target_width == self.width && target_height == self.height {
            source
        } else {
            imageops::resize(&source, target_width, target_height, FilterType::Triangle)
        };

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality).encode_image(&scaled)?;
        Ok(out)
    }
}

/// Variance of the 4-neighbour discrete Laplacian over interior pixels.
///
/// Sharp images have strong second derivatives at edges, so a low variance
/// means a blurry frame. Returns 0.0 when the image has no interior.
pub fn laplacian_variance(gray: &[f32], width: u32, height: u32) -> f32 {
    let w = width as usize;
    let h = height as usize;
    if w < 3 || h < 3 || gray.len() < w * h {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sq_sum = 0.0f64;
    let mut count = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            let lap = -4.0 * gray[idx] as f64
                + gray[idx - 1] as f64
                + gray[idx + 1] as f64
                + gray[idx - w] as f64
                + gray[idx + w] as f64;
            sum += lap;
            sq_sum += lap * lap;
            count += 1;
        }
    }

    let mean = sum / count as f64;
    (sq_sum / count as f64 - mean * mean).max(0.0) as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid RGB length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("cannot scale to an empty image")]
    EmptyTarget,
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}
