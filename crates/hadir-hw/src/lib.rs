//! hadir-hw: frame handling for the capture loops.
//!
//! Provides the RGB frame type with the pixel statistics used by the
//! quality gate, and the frame-source abstraction the capture loops pull
//! from (with scoped acquisition so the device is always released).

pub mod frame;
pub mod source;

pub use frame::{laplacian_variance, Frame, FrameError};
pub use source::{CaptureLease, DirectoryFrameSource, FrameSource, SourceError};
