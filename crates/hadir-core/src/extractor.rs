//! Face descriptor extraction contract.
//!
//! The embedding model is a pre-trained black box: given a frame it finds at
//! most one face and returns its box, eye landmarks and descriptor. Models
//! are loaded once per process through [`LazyExtractor`].

use crate::types::FaceDetection;
use async_trait::async_trait;
use hadir_hw::Frame;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid detection data: {0}")]
    InvalidData(#[from] serde_json::Error),
}

/// Detects at most one face in a frame and describes it.
#[async_trait]
pub trait DescriptorExtractor: Send + Sync {
    /// `Ok(None)` when no face is visible.
    async fn extract(&self, frame: &Frame) -> Result<Option<FaceDetection>, ExtractorError>;
}

/// Loads the model behind a [`LazyExtractor`].
#[async_trait]
pub trait ModelLoader: Send + Sync {
    type Model: DescriptorExtractor;

    async fn load(&self) -> Result<Self::Model, ExtractorError>;
}

/// Extractor whose model is loaded on first use.
///
/// Concurrent first callers share a single in-flight load. A failed load
/// leaves the cell empty, so the next call tries again.
pub struct LazyExtractor<L: ModelLoader> {
    loader: L,
    model: OnceCell<L::Model>,
}

impl<L: ModelLoader> LazyExtractor<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
        }
    }

    /// Load the model if nobody has yet, and return it.
    pub async fn ensure_loaded(&self) -> Result<&L::Model, ExtractorError> {
        self.model
            .get_or_try_init(|| async {
                let model = self.loader.load().await?;
                tracing::info!("face model loaded");
                Ok(model)
            })
            .await
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }
}

#[async_trait]
impl<L: ModelLoader> DescriptorExtractor for LazyExtractor<L> {
    async fn extract(&self, frame: &Frame) -> Result<Option<FaceDetection>, ExtractorError> {
        self.ensure_loaded().await?.extract(frame).await
    }
}

/// One recorded extractor result.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordedDetection {
    pub sequence: u32,
    pub face: Option<FaceDetection>,
}

/// Replays detections recorded for a frame sequence.
///
/// Frames without a recording are reported as "no face".
#[derive(Debug, Default)]
pub struct ReplayExtractor {
    detections: HashMap<u32, FaceDetection>,
}

impl ReplayExtractor {
    pub fn new(recorded: Vec<RecordedDetection>) -> Self {
        let detections = recorded
            .into_iter()
            .filter_map(|r| r.face.map(|face| (r.sequence, face)))
            .collect();
        Self { detections }
    }

    pub fn from_json(json: &str) -> Result<Self, ExtractorError> {
        let recorded: Vec<RecordedDetection> = serde_json::from_str(json)?;
        Ok(Self::new(recorded))
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[async_trait]
impl DescriptorExtractor for ReplayExtractor {
    async fn extract(&self, frame: &Frame) -> Result<Option<FaceDetection>, ExtractorError> {
        Ok(self.detections.get(&frame.sequence).cloned())
    }
}

/// Loads a [`ReplayExtractor`] from a JSON recording on disk.
pub struct ReplayLoader {
    pub path: PathBuf,
}

#[async_trait]
impl ModelLoader for ReplayLoader {
    type Model = ReplayExtractor;

    async fn load(&self) -> Result<ReplayExtractor, ExtractorError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Err(ExtractorError::ModelNotLoaded(format!(
                "detection recording not found: {}",
                self.path.display()
            )));
        }
        let json = tokio::fs::read_to_string(&self.path).await?;
        let extractor = ReplayExtractor::from_json(&json)?;
        tracing::debug!(path = %self.path.display(), faces = extractor.len(), "loaded detection recording");
        Ok(extractor)
    }
}
