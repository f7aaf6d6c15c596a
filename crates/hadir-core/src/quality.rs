//! Frame quality gate.
//!
//! Scores a frame with a detected face for usability before its descriptor
//! is accepted into a sample set. All metrics are computed on a fixed small
//! analysis copy of the frame so results do not depend on camera resolution.

use crate::types::FaceDetection;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hadir_hw::{laplacian_variance, Frame, FrameError};
use std::fmt;

const ANALYSIS_WIDTH: u32 = 160;
const ANALYSIS_HEIGHT: u32 = 120;
const SNAPSHOT_WIDTH: u32 = 640;
const SNAPSHOT_QUALITY: u8 = 90;
/// Brightness the snapshot score is centred on.
const IDEAL_BRIGHTNESS: f32 = 140.0;

/// Rejection thresholds. Defaults were tuned on laptop webcams.
#[derive(Debug, Clone)]
pub struct QualityThresholds {
    /// Minimum face width (and height) as a fraction of the frame.
    pub min_face_ratio: f32,
    pub min_brightness: f32,
    pub max_brightness: f32,
    /// Minimum Laplacian variance.
    pub min_blur: f32,
    /// Maximum absolute head roll in degrees.
    pub max_roll_degrees: f32,
    pub analysis_width: u32,
    pub analysis_height: u32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_face_ratio: 0.22,
            min_brightness: 60.0,
            max_brightness: 210.0,
            min_blur: 80.0,
            max_roll_degrees: 15.0,
            analysis_width: ANALYSIS_WIDTH,
            analysis_height: ANALYSIS_HEIGHT,
        }
    }
}

/// Why a frame was not accepted. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    FaceTooSmall,
    TooDark,
    TooBright,
    TooBlurry,
    TooTilted,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Rejection::FaceTooSmall => "face too small, move closer to the camera",
            Rejection::TooDark => "lighting too dark",
            Rejection::TooBright => "lighting too bright",
            Rejection::TooBlurry => "image too blurry, hold still",
            Rejection::TooTilted => "head tilted too far, keep it level",
        };
        f.write_str(msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityMetrics {
    pub brightness: f32,
    pub blur: f32,
    pub roll_degrees: f32,
    pub face_width_ratio: f32,
    pub face_height_ratio: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub metrics: QualityMetrics,
    /// First failing check, `None` when the frame passed.
    pub rejection: Option<Rejection>,
    /// Snapshot ranking score; higher is better.
    pub score: f32,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.rejection.is_none()
    }
}

/// A downsampled JPEG of an accepted frame, candidate reference photo.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub jpeg: Vec<u8>,
}

impl Snapshot {
    pub fn to_data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", STANDARD.encode(&self.jpeg))
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    pub thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    /// Measure a frame and decide whether its face is usable.
    pub fn assess(&self, frame: &Frame, face: &FaceDetection) -> Result<QualityReport, FrameError> {
        let t = &self.thresholds;

        let analysis = frame.downscale(t.analysis_width, t.analysis_height)?;
        let brightness = analysis.avg_brightness();
        let gray = analysis.gray_levels();
        let blur = laplacian_variance(&gray, analysis.width, analysis.height);

        let roll_degrees = face.landmarks.roll_degrees().unwrap_or_else(|| {
            tracing::debug!(sequence = frame.sequence, "no eye landmarks; assuming level head");
            0.0
        });

        let face_width_ratio = face.bbox.width / frame.width.max(1) as f32;
        let face_height_ratio = face.bbox.height / frame.height.max(1) as f32;

        let metrics = QualityMetrics {
            brightness,
            blur,
            roll_degrees,
            face_width_ratio,
            face_height_ratio,
        };

        Ok(QualityReport {
            rejection: self.first_rejection(&metrics),
            score: snapshot_score(&metrics),
            metrics,
        })
    }

    fn first_rejection(&self, m: &QualityMetrics) -> Option<Rejection> {
        let t = &self.thresholds;
        if m.face_width_ratio < t.min_face_ratio || m.face_height_ratio < t.min_face_ratio {
            Some(Rejection::FaceTooSmall)
        } else if m.brightness < t.min_brightness {
            Some(Rejection::TooDark)
        } else if m.brightness > t.max_brightness {
            Some(Rejection::TooBright)
        } else if m.blur < t.min_blur {
            Some(Rejection::TooBlurry)
        } else if m.roll_degrees.abs() > t.max_roll_degrees {
            Some(Rejection::TooTilted)
        } else {
            None
        }
    }

    /// Encode the reference-photo candidate for an accepted frame.
    pub fn snapshot(&self, frame: &Frame) -> Result<Snapshot, FrameError> {
        Ok(Snapshot {
            jpeg: frame.encode_jpeg(SNAPSHOT_WIDTH, SNAPSHOT_QUALITY)?,
        })
    }
}

/// `blur*2 + faceWidthRatio*200 - |roll|*2 - |brightness-140|`
pub fn snapshot_score(m: &QualityMetrics) -> f32 {
    m.blur * 2.0 + m.face_width_ratio * 200.0
        - m.roll_degrees.abs() * 2.0
        - (m.brightness - IDEAL_BRIGHTNESS).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_at, textured_frame};
    use crate::types::Landmarks;

    fn metrics(brightness: f32, blur: f32, roll: f32, ratio: f32) -> QualityMetrics {
        QualityMetrics {
            brightness,
            blur,
            roll_degrees: roll,
            face_width_ratio: ratio,
            face_height_ratio: ratio,
        }
    }

    #[test]
    fn test_good_frame_passes() {
        let frame = textured_frame(320, 240, 90, 190, 4);
        let report = QualityGate::default().assess(&frame, &face_at(100.0, 60.0, 120.0, 0.0)).unwrap();
        assert!(report.passed(), "unexpected rejection: {:?}", report);
        assert!((report.metrics.brightness - 140.0).abs() < 2.0);
        assert!(report.metrics.blur > 80.0);
        assert!(report.metrics.roll_degrees.abs() < 1e-4);
    }

    #[test]
    fn test_small_face_rejected() {
        let frame = textured_frame(320, 240, 90, 190, 4);
        let report = QualityGate::default().assess(&frame, &face_at(10.0, 10.0, 40.0, 0.0)).unwrap();
        assert_eq!(report.rejection, Some(Rejection::FaceTooSmall));
    }

    #[test]
    fn test_small_height_alone_rejected() {
        let frame = textured_frame(320, 240, 90, 190, 4);
        let mut face = face_at(10.0, 10.0, 120.0, 0.0);
        face.bbox.height = 40.0;
        let report = QualityGate::default().assess(&frame, &face).unwrap();
        assert_eq!(report.rejection, Some(Rejection::FaceTooSmall));
    }

    #[test]
    fn test_dark_frame_rejected() {
        let frame = textured_frame(320, 240, 0, 60, 4);
        let report = QualityGate::default().assess(&frame, &face_at(100.0, 60.0, 120.0, 0.0)).unwrap();
        assert_eq!(report.rejection, Some(Rejection::TooDark));
    }

    #[test]
    fn test_bright_frame_rejected() {
        let frame = textured_frame(320, 240, 200, 255, 4);
        let report = QualityGate::default().assess(&frame, &face_at(100.0, 60.0, 120.0, 0.0)).unwrap();
        assert_eq!(report.rejection, Some(Rejection::TooBright));
    }

    #[test]
    fn test_flat_frame_is_blurry() {
        let frame = textured_frame(320, 240, 140, 140, 4);
        let report = QualityGate::default().assess(&frame, &face_at(100.0, 60.0, 120.0, 0.0)).unwrap();
        assert_eq!(report.rejection, Some(Rejection::TooBlurry));
    }

    #[test]
    fn test_tilted_face_rejected() {
        let frame = textured_frame(320, 240, 90, 190, 4);
        // Eyes 48 px apart horizontally, 30 px vertical offset: ~32 degrees.
        let report = QualityGate::default().assess(&frame, &face_at(100.0, 60.0, 120.0, 30.0)).unwrap();
        assert_eq!(report.rejection, Some(Rejection::TooTilted));
        assert!(report.metrics.roll_degrees > 15.0);
    }

    #[test]
    fn test_rejection_order() {
        let gate = QualityGate::default();
        // Every check fails: size wins.
        assert_eq!(gate.first_rejection(&metrics(10.0, 1.0, 40.0, 0.1)), Some(Rejection::FaceTooSmall));
        // Dark beats blur and tilt.
        assert_eq!(gate.first_rejection(&metrics(10.0, 1.0, 40.0, 0.5)), Some(Rejection::TooDark));
        // Bright beats blur and tilt.
        assert_eq!(gate.first_rejection(&metrics(250.0, 1.0, 40.0, 0.5)), Some(Rejection::TooBright));
        // Blur beats tilt.
        assert_eq!(gate.first_rejection(&metrics(140.0, 1.0, 40.0, 0.5)), Some(Rejection::TooBlurry));
        assert_eq!(gate.first_rejection(&metrics(140.0, 100.0, -40.0, 0.5)), Some(Rejection::TooTilted));
        assert_eq!(gate.first_rejection(&metrics(140.0, 100.0, 5.0, 0.5)), None);
    }

    #[test]
    fn test_assess_is_deterministic() {
        let gate = QualityGate::default();
        let frame = textured_frame(320, 240, 40, 120, 3);
        let face = face_at(100.0, 60.0, 120.0, 12.0);
        let a = gate.assess(&frame, &face).unwrap();
        let b = gate.assess(&frame, &face).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_landmarks_assume_level() {
        let frame = textured_frame(320, 240, 90, 190, 4);
        let mut face = face_at(100.0, 60.0, 120.0, 0.0);
        face.landmarks = Landmarks::default();
        let report = QualityGate::default().assess(&frame, &face).unwrap();
        assert_eq!(report.metrics.roll_degrees, 0.0);
    }

    #[test]
    fn test_snapshot_score_prefers_sharp_level_faces() {
        let sharp = snapshot_score(&metrics(140.0, 200.0, 0.0, 0.4));
        let soft = snapshot_score(&metrics(140.0, 100.0, 0.0, 0.4));
        let tilted = snapshot_score(&metrics(140.0, 200.0, 10.0, 0.4));
        let dim = snapshot_score(&metrics(90.0, 200.0, 0.0, 0.4));
        assert!(sharp > soft);
        assert!(sharp > tilted);
        assert!(sharp > dim);
        assert!((sharp - (400.0 + 80.0)).abs() < 1e-3);
    }

    #[test]
    fn test_snapshot_data_url() {
        let frame = textured_frame(64, 48, 90, 190, 4);
        let snap = QualityGate::default().snapshot(&frame).unwrap();
        assert!(snap.to_data_url().starts_with("data:image/jpeg;base64,/9j/"));
    }
}
