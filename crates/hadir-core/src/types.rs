use crate::template::TemplateError;
use serde::{Deserialize, Serialize};

/// A 2-D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// Centroid of a set of points, `None` when empty.
    pub fn centroid(points: &[Point]) -> Option<Point> {
        if points.is_empty() {
            return None;
        }
        let n = points.len() as f32;
        let (sx, sy) = points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Some(Point { x: sx / n, y: sy / n })
    }
}

/// Bounding box for a detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

impl BoundingBox {
    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }
}

/// Eye landmark contours. Detectors with 68-point models report six points
/// per eye; five-point models report one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Landmarks {
    pub left_eye: Vec<Point>,
    pub right_eye: Vec<Point>,
}

impl Landmarks {
    /// Head roll in degrees: angle of the line from the left-eye centroid to
    /// the right-eye centroid. `None` if either eye has no points.
    pub fn roll_degrees(&self) -> Option<f32> {
        let left = Point::centroid(&self.left_eye)?;
        let right = Point::centroid(&self.right_eye)?;
        Some((right.y - left.y).atan2(right.x - left.x).to_degrees())
    }
}

/// Face embedding vector (commonly 128-dimensional).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance, or `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &[f32]) -> Option<f32> {
        euclidean_distance(&self.values, other)
    }

    /// Element-wise mean of equally sized embeddings.
    pub fn mean(samples: &[Embedding]) -> Result<Embedding, TemplateError> {
        let first = samples.first().ok_or(TemplateError::Empty)?;
        let dim = first.len();
        if dim == 0 {
            return Err(TemplateError::EmptyVector { index: 0 });
        }

        let mut acc = vec![0.0f64; dim];
        for (index, sample) in samples.iter().enumerate() {
            if sample.len() != dim {
                return Err(TemplateError::DimensionMismatch {
                    index,
                    expected: dim,
                    actual: sample.len(),
                });
            }
            if sample.values.iter().any(|v| !v.is_finite()) {
                return Err(TemplateError::NonFinite { index });
            }
            for (a, v) in acc.iter_mut().zip(&sample.values) {
                *a += *v as f64;
            }
        }

        let n = samples.len() as f64;
        Ok(Embedding {
            values: acc.into_iter().map(|a| (a / n) as f32).collect(),
        })
    }
}

/// Euclidean distance between two vectors, `None` on length mismatch.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f32>()
            .sqrt(),
    )
}

/// Output of the external descriptor extractor for a single face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    #[serde(default)]
    pub landmarks: Landmarks,
    pub descriptor: Embedding,
}
