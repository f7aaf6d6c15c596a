//! Stored face templates.
//!
//! Two shapes exist in stored data: a bare descriptor from the first
//! generation of enrollments, and the aggregated `{mean, samples}` object
//! written by the capture loop. Both are resolved once, at the storage
//! boundary, into [`FaceTemplate`].

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("no samples")]
    Empty,
    #[error("sample {index} is empty")]
    EmptyVector { index: usize },
    #[error("sample {index} has {actual} values, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("sample {index} contains a non-finite value")]
    NonFinite { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FaceTemplate {
    /// A single descriptor.
    Legacy(Vec<f32>),
    /// Mean of the enrollment samples, plus the samples themselves.
    Aggregated { mean: Vec<f32>, samples: Vec<Vec<f32>> },
}

impl FaceTemplate {
    /// Reduce an enrollment sample set to a template.
    pub fn aggregate(samples: &[Embedding]) -> Result<Self, TemplateError> {
        let mean = Embedding::mean(samples)?;
        Ok(FaceTemplate::Aggregated {
            mean: mean.values,
            samples: samples.iter().map(|s| s.values.clone()).collect(),
        })
    }

    /// Leniently interpret stored JSON.
    ///
    /// Vectors that are empty or hold anything other than numbers are
    /// dropped. Returns `None` when nothing comparable is left.
    pub fn resolve(value: &Value) -> Option<Self> {
        match value {
            Value::Array(_) => numeric_vector(value).map(FaceTemplate::Legacy),
            Value::Object(map) => {
                let samples: Vec<Vec<f32>> = map
                    .get("samples")
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(numeric_vector).collect())
                    .unwrap_or_default();
                let mean = map.get("mean").and_then(numeric_vector);

                match (mean, samples.is_empty()) {
                    (None, true) => None,
                    (Some(mean), _) => Some(FaceTemplate::Aggregated { mean, samples }),
                    // Samples without a usable mean: rebuild it from the samples
                    // that share the first sample's dimension.
                    (None, false) => {
                        let dim = samples[0].len();
                        let usable: Vec<Embedding> = samples
                            .iter()
                            .filter(|s| s.len() == dim)
                            .map(|s| Embedding::new(s.clone()))
                            .collect();
                        let mean = Embedding::mean(&usable).ok()?.values;
                        Some(FaceTemplate::Aggregated { mean, samples })
                    }
                }
            }
            _ => None,
        }
    }

    /// Vectors a probe is compared against: every raw sample, or the mean
    /// when no sample survived.
    pub fn comparison_vectors(&self) -> Vec<&[f32]> {
        match self {
            FaceTemplate::Legacy(v) => vec![v.as_slice()],
            FaceTemplate::Aggregated { mean, samples } => {
                if samples.is_empty() {
                    vec![mean.as_slice()]
                } else {
                    samples.iter().map(Vec::as_slice).collect()
                }
            }
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            FaceTemplate::Legacy(_) => 1,
            FaceTemplate::Aggregated { samples, .. } => samples.len(),
        }
    }

    /// Descriptor dimensionality.
    pub fn dimension(&self) -> usize {
        match self {
            FaceTemplate::Legacy(v) => v.len(),
            FaceTemplate::Aggregated { mean, .. } => mean.len(),
        }
    }
}

fn numeric_vector(value: &Value) -> Option<Vec<f32>> {
    let items = value.as_array()?;
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).filter(|f| f.is_finite()))
        .collect()
}
