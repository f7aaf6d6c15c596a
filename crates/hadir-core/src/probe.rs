//! Recognition probe: several extractor calls averaged into one descriptor
//! to smooth out single-frame noise.

use crate::enroll::pause;
use crate::extractor::DescriptorExtractor;
use crate::types::Embedding;
use crate::CaptureError;
use hadir_hw::{CaptureLease, FrameSource, SourceError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Extractor attempts per probe.
    pub samples: usize,
    /// Usable descriptors required to build a probe.
    pub min_samples: usize,
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            samples: 6,
            min_samples: 3,
            interval: Duration::from_millis(150),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Ready { probe: Embedding, used: usize },
    /// Too few attempts produced a face.
    FaceNotDetected { usable: usize, required: usize },
    Cancelled,
}

/// Element-wise mean of the descriptors that share the first one's length.
pub fn average_descriptors(descriptors: &[Embedding]) -> Option<Embedding> {
    let dim = descriptors.first()?.len();
    let usable: Vec<Embedding> = descriptors
        .iter()
        .filter(|d| {
            let keep = d.len() == dim;
            if !keep {
                tracing::warn!(expected = dim, actual = d.len(), "dropping descriptor of unexpected length");
            }
            keep
        })
        .cloned()
        .collect();
    Embedding::mean(&usable).ok()
}

/// Capture a probe descriptor for recognition.
pub async fn capture_probe<S, E>(
    source: &mut S,
    extractor: &E,
    config: &ProbeConfig,
    cancel: &CancellationToken,
) -> Result<ProbeOutcome, CaptureError>
where
    S: FrameSource + ?Sized,
    E: DescriptorExtractor + ?Sized,
{
    if config.min_samples == 0 || config.min_samples > config.samples {
        return Err(CaptureError::InvalidConfig(format!(
            "need 0 < min_samples ({}) <= samples ({})",
            config.min_samples, config.samples
        )));
    }

    let mut lease = CaptureLease::acquire(source)?;
    let mut descriptors = Vec::with_capacity(config.samples);

    for attempt in 0..config.samples {
        if cancel.is_cancelled() {
            return Ok(ProbeOutcome::Cancelled);
        }

        match lease.next_frame() {
            Ok(frame) => {
                let extracted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(ProbeOutcome::Cancelled),
                    result = extractor.extract(&frame) => result,
                };
                match extracted {
                    Ok(Some(face)) => descriptors.push(face.descriptor),
                    Ok(None) => tracing::debug!(attempt, "probe: no face"),
                    Err(e) => tracing::warn!(attempt, error = %e, "probe: extractor failed"),
                }
            }
            Err(SourceError::Exhausted) => break,
            Err(e) => tracing::warn!(attempt, error = %e, "probe: frame unavailable"),
        }

        if attempt + 1 < config.samples && !pause(config.interval, cancel).await {
            return Ok(ProbeOutcome::Cancelled);
        }
    }
    drop(lease);

    if descriptors.len() < config.min_samples {
        tracing::info!(usable = descriptors.len(), required = config.min_samples, "probe: not enough faces");
        return Ok(ProbeOutcome::FaceNotDetected {
            usable: descriptors.len(),
            required: config.min_samples,
        });
    }

    match average_descriptors(&descriptors) {
        Some(probe) => Ok(ProbeOutcome::Ready {
            probe,
            used: descriptors.len(),
        }),
        None => Ok(ProbeOutcome::FaceNotDetected {
            usable: 0,
            required: config.min_samples,
        }),
    }
}
