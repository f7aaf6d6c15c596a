//! hadir-core: face enrollment and recognition pipeline.
//!
//! Frames pass through the quality gate before their descriptors are
//! aggregated into a stored template (enrollment) or averaged into a probe
//! (recognition). The matcher compares a probe against a class roster.

pub mod enroll;
pub mod extractor;
pub mod matcher;
pub mod probe;
pub mod quality;
pub mod template;
pub mod types;

#[cfg(test)]
mod testing;

pub use enroll::{
    capture_enrollment, AttemptOutcome, CaptureEvent, EnrolledFace, EnrollmentConfig,
    EnrollmentOutcome, EnrollmentSession, SessionState,
};
pub use extractor::{
    DescriptorExtractor, ExtractorError, LazyExtractor, ModelLoader, ReplayExtractor, ReplayLoader,
};
pub use matcher::{Candidate, EuclideanMatcher, MatchResult, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use probe::{average_descriptors, capture_probe, ProbeConfig, ProbeOutcome};
pub use quality::{QualityGate, QualityReport, QualityThresholds, Rejection, Snapshot};
pub use template::{FaceTemplate, TemplateError};
pub use types::{BoundingBox, Embedding, FaceDetection, Landmarks, Point};

use hadir_hw::SourceError;
use thiserror::Error;

/// Failure to start a capture session at all.
///
/// Per-attempt problems (no face, rejected frame, extractor hiccup) never
/// surface here; they are reported as capture events instead.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to acquire frame source: {0}")]
    Source(#[from] SourceError),
    #[error("invalid capture configuration: {0}")]
    InvalidConfig(String),
}
