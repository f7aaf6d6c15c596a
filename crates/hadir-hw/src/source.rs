//! Frame sources for the capture loops.
//!
//! A capture loop never talks to a device directly: it borrows a
//! [`FrameSource`] through a [`CaptureLease`], which opens the source when
//! the session starts and closes it when the lease is dropped, whatever
//! path the loop exits through.

use crate::frame::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "bmp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("source busy")]
    Busy,
    #[error("source is not open")]
    NotOpen,
    #[error("no more frames")]
    Exhausted,
    #[error("failed to decode frame {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can hand out frames one at a time.
pub trait FrameSource {
    /// Acquire the underlying device or resource.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Pull the next frame. `SourceError::Exhausted` means no frame will
    /// ever follow; every other error is worth retrying.
    fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the underlying resource. Must be idempotent.
    fn close(&mut self);

    /// Human-readable name for logs.
    fn name(&self) -> &str;
}

/// Scoped acquisition of a frame source.
///
/// Opening happens in [`CaptureLease::acquire`]; closing happens in `Drop`.
pub struct CaptureLease<'a, S: FrameSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: FrameSource + ?Sized> CaptureLease<'a, S> {
    pub fn acquire(source: &'a mut S) -> Result<Self, SourceError> {
        source.open()?;
        tracing::debug!(source = source.name(), "frame source acquired");
        Ok(Self { source })
    }

    pub fn next_frame(&mut self) -> Result<Frame, SourceError> {
        self.source.next_frame()
    }
}

impl<S: FrameSource + ?Sized> Drop for CaptureLease<'_, S> {
    fn drop(&mut self) {
        self.source.close();
        tracing::debug!(source = self.source.name(), "frame source released");
    }
}

/// Replays the images of a directory in lexical file-name order.
///
/// Frame sequence numbers are the zero-based position in that order, which
/// is what recorded detections are keyed on.
pub struct DirectoryFrameSource {
    dir: PathBuf,
    name: String,
    files: Vec<PathBuf>,
    cursor: usize,
    open: bool,
}

impl DirectoryFrameSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let name = dir.display().to_string();
        Self {
            dir,
            name,
            files: Vec::new(),
            cursor: 0,
            open: false,
        }
    }

    /// Image files found at the last `open`.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for DirectoryFrameSource {
    fn open(&mut self) -> Result<(), SourceError> {
        if self.open {
            return Err(SourceError::Busy);
        }
        if !self.dir.is_dir() {
            return Err(SourceError::NotFound(self.name.clone()));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        files.sort();

        tracing::info!(dir = %self.name, count = files.len(), "opened frame directory");
        self.files = files;
        self.cursor = 0;
        self.open = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.open {
            return Err(SourceError::NotOpen);
        }
        let Some(path) = self.files.get(self.cursor) else {
            return Err(SourceError::Exhausted);
        };
        let sequence = self.cursor as u32;
        self.cursor += 1;

        let image = image::open(path).map_err(|e| SourceError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Frame::from_rgb(image.to_rgb8(), sequence))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn name(&self) -> &str {
        &self.name
    }
}
