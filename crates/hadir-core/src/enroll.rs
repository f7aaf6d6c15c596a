//! Enrollment capture: turns a live feed into a stored face template.
//!
//! Each attempt pulls one frame, asks the extractor for a face, runs the
//! quality gate and, if the frame passes, keeps its descriptor. The session
//! also watches the face centre move between accepted samples: a photo held
//! up to the camera does not move, so enrollment requires at least one
//! displacement above the movement threshold.

use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::quality::{QualityGate, Rejection, Snapshot};
use crate::template::FaceTemplate;
use crate::types::{Embedding, FaceDetection, Point};
use crate::CaptureError;
use hadir_hw::{CaptureLease, Frame, FrameSource, SourceError};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    /// Samples to collect before stopping.
    pub target_samples: usize,
    /// Fewest samples a template may be built from.
    pub min_samples: usize,
    /// Attempt budget per target sample.
    pub attempts_per_sample: usize,
    /// Delay between attempts, spreads samples over time.
    pub interval: Duration,
    /// Face-centre displacement in pixels that counts as movement.
    pub movement_threshold: f32,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            target_samples: 6,
            min_samples: 4,
            attempts_per_sample: 10,
            interval: Duration::from_millis(150),
            movement_threshold: 12.0,
        }
    }
}

impl EnrollmentConfig {
    pub fn max_attempts(&self) -> usize {
        self.target_samples * self.attempts_per_sample
    }

    fn validate(&self) -> Result<(), CaptureError> {
        if self.min_samples == 0 || self.min_samples > self.target_samples {
            return Err(CaptureError::InvalidConfig(format!(
                "need 0 < min_samples ({}) <= target_samples ({})",
                self.min_samples, self.target_samples
            )));
        }
        if self.attempts_per_sample == 0 {
            return Err(CaptureError::InvalidConfig("attempts_per_sample must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    Succeeded,
    InsufficientSamples,
    NoMovement,
    Cancelled,
}

/// What happened on one attempt. `Display` gives the guidance shown to the
/// person in front of the camera.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    NotDetected,
    FrameFailed(String),
    ExtractorFailed(String),
    Rejected(Rejection),
    Accepted { collected: usize, target: usize },
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::NotDetected => f.write_str("face not detected"),
            AttemptOutcome::FrameFailed(_) => f.write_str("camera frame unavailable, retrying"),
            AttemptOutcome::ExtractorFailed(_) => f.write_str("face model busy, retrying"),
            AttemptOutcome::Rejected(r) => write!(f, "{r}"),
            AttemptOutcome::Accepted { collected, target } => {
                write!(f, "sample {collected}/{target} saved")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureEvent {
    pub attempt: usize,
    pub outcome: AttemptOutcome,
}

/// A successful enrollment, ready to be persisted.
#[derive(Debug, Clone)]
pub struct EnrolledFace {
    pub template: FaceTemplate,
    pub samples: Vec<Embedding>,
    /// Best-scoring accepted frame.
    pub snapshot: Option<Snapshot>,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub enum EnrollmentOutcome {
    Succeeded(EnrolledFace),
    InsufficientSamples { collected: usize, required: usize },
    NoMovement { collected: usize },
    Cancelled,
}

/// Enrollment state machine, independent of any camera or clock.
pub struct EnrollmentSession {
    config: EnrollmentConfig,
    state: SessionState,
    samples: Vec<Embedding>,
    attempts: usize,
    last_center: Option<Point>,
    movement_detected: bool,
    best_score: f32,
    best_snapshot: Option<Snapshot>,
}

impl EnrollmentSession {
    pub fn new(config: EnrollmentConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            samples: Vec::new(),
            attempts: 0,
            last_center: None,
            movement_detected: false,
            best_score: f32::NEG_INFINITY,
            best_snapshot: None,
        }
    }

    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Capturing;
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn movement_detected(&self) -> bool {
        self.movement_detected
    }

    /// Whether another attempt should be made.
    pub fn wants_more(&self) -> bool {
        self.state == SessionState::Capturing
            && self.samples.len() < self.config.target_samples
            && self.attempts < self.config.max_attempts()
    }

    pub fn begin_attempt(&mut self) -> usize {
        self.attempts += 1;
        self.attempts
    }

    /// Keep a descriptor from a frame that passed the quality gate.
    pub fn accept(&mut self, descriptor: Embedding, center: Point) -> AttemptOutcome {
        if let Some(first) = self.samples.first() {
            if first.len() != descriptor.len() {
                return AttemptOutcome::ExtractorFailed(format!(
                    "descriptor has {} values, session started with {}",
                    descriptor.len(),
                    first.len()
                ));
            }
        }

        if let Some(last) = self.last_center {
            if last.distance(&center) > self.config.movement_threshold {
                self.movement_detected = true;
            }
        }
        self.last_center = Some(center);
        self.samples.push(descriptor);

        AttemptOutcome::Accepted {
            collected: self.samples.len(),
            target: self.config.target_samples,
        }
    }

    /// Whether a frame with this score would replace the current photo.
    pub fn improves_snapshot(&self, score: f32) -> bool {
        score > self.best_score
    }

    pub fn offer_snapshot(&mut self, score: f32, snapshot: Snapshot) {
        if self.improves_snapshot(score) {
            self.best_score = score;
            self.best_snapshot = Some(snapshot);
        }
    }

    pub fn cancel(&mut self) {
        if matches!(self.state, SessionState::Idle | SessionState::Capturing) {
            self.state = SessionState::Cancelled;
        }
    }

    /// Close the session and decide its outcome. Samples are handed over on
    /// success and discarded otherwise.
    pub fn finish(&mut self) -> EnrollmentOutcome {
        if self.state == SessionState::Cancelled {
            self.samples.clear();
            return EnrollmentOutcome::Cancelled;
        }

        let collected = self.samples.len();
        if collected < self.config.min_samples {
            self.state = SessionState::InsufficientSamples;
            self.samples.clear();
            return EnrollmentOutcome::InsufficientSamples {
                collected,
                required: self.config.min_samples,
            };
        }
        if !self.movement_detected {
            self.state = SessionState::NoMovement;
            self.samples.clear();
            return EnrollmentOutcome::NoMovement { collected };
        }

        let samples = std::mem::take(&mut self.samples);
        match FaceTemplate::aggregate(&samples) {
            Ok(template) => {
                self.state = SessionState::Succeeded;
                EnrollmentOutcome::Succeeded(EnrolledFace {
                    template,
                    samples,
                    snapshot: self.best_snapshot.take(),
                    attempts: self.attempts,
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "enrollment samples could not be aggregated");
                self.state = SessionState::InsufficientSamples;
                EnrollmentOutcome::InsufficientSamples {
                    collected: 0,
                    required: self.config.min_samples,
                }
            }
        }
    }
}

/// Sleep for `interval` unless cancelled first. Returns `false` on cancel.
pub(crate) async fn pause(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

/// Run an enrollment capture session.
///
/// The frame source is held for the duration of the call and released on
/// every exit path. Nothing is persisted here; the caller stores the
/// template from [`EnrollmentOutcome::Succeeded`].
pub async fn capture_enrollment<S, E>(
    source: &mut S,
    extractor: &E,
    gate: &QualityGate,
    config: EnrollmentConfig,
    cancel: &CancellationToken,
    mut on_event: impl FnMut(&CaptureEvent),
) -> Result<EnrollmentOutcome, CaptureError>
where
    S: FrameSource + ?Sized,
    E: DescriptorExtractor + ?Sized,
{
    config.validate()?;
    let interval = config.interval;
    let mut lease = CaptureLease::acquire(source)?;
    let mut session = EnrollmentSession::new(config);
    session.start();

    while session.wants_more() {
        if cancel.is_cancelled() {
            session.cancel();
            break;
        }
        let attempt = session.begin_attempt();

        let outcome = match lease.next_frame() {
            Ok(frame) => {
                let extracted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = extractor.extract(&frame) => Some(result),
                };
                let Some(extracted) = extracted else {
                    session.cancel();
                    break;
                };
                evaluate(&mut session, gate, &frame, extracted)
            }
            Err(SourceError::Exhausted) => {
                tracing::info!(attempt, "frame source exhausted");
                break;
            }
            Err(e) => AttemptOutcome::FrameFailed(e.to_string()),
        };

        tracing::debug!(attempt, outcome = %outcome, "enroll attempt");
        on_event(&CaptureEvent { attempt, outcome });

        if session.wants_more() && !pause(interval, cancel).await {
            session.cancel();
        }
    }

    drop(lease);
    let outcome = session.finish();
    match &outcome {
        EnrollmentOutcome::Succeeded(face) => tracing::info!(
            samples = face.samples.len(),
            attempts = face.attempts,
            has_photo = face.snapshot.is_some(),
            "enrollment capture succeeded"
        ),
        other => tracing::info!(outcome = ?other, "enrollment capture did not succeed"),
    }
    Ok(outcome)
}

fn evaluate(
    session: &mut EnrollmentSession,
    gate: &QualityGate,
    frame: &Frame,
    extracted: Result<Option<FaceDetection>, ExtractorError>,
) -> AttemptOutcome {
    let face = match extracted {
        Ok(Some(face)) => face,
        Ok(None) => return AttemptOutcome::NotDetected,
        Err(e) => {
            tracing::warn!(error = %e, sequence = frame.sequence, "extractor failed; retrying");
            return AttemptOutcome::ExtractorFailed(e.to_string());
        }
    };

    let report = match gate.assess(frame, &face) {
        Ok(report) => report,
        Err(e) => return AttemptOutcome::FrameFailed(e.to_string()),
    };
    if let Some(rejection) = report.rejection {
        return AttemptOutcome::Rejected(rejection);
    }

    let outcome = session.accept(face.descriptor, face.bbox.center());
    if matches!(outcome, AttemptOutcome::Accepted { .. }) && session.improves_snapshot(report.score) {
        match gate.snapshot(frame) {
            Ok(snapshot) => session.offer_snapshot(report.score, snapshot),
            Err(e) => tracing::warn!(error = %e, "failed to encode enrollment snapshot"),
        }
    }
    outcome
}
