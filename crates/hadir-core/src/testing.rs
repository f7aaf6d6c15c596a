//! Fixtures shared by the capture-loop tests.

use crate::types::{BoundingBox, Embedding, FaceDetection, Landmarks, Point};
use hadir_hw::{Frame, FrameSource, SourceError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Checkerboard of `lo`/`hi` cells, sharp enough to pass the blur check at
/// the default analysis size.
pub(crate) fn textured_frame(width: u32, height: u32, lo: u8, hi: u8, cell: u32) -> Frame {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = if ((x / cell) + (y / cell)) % 2 == 0 { lo } else { hi };
            data.extend([v, v, v]);
        }
    }
    Frame::new(data, width, height, 0).unwrap()
}

/// Square face at (`x`, `y`); `roll_dy` lowers the right eye.
pub(crate) fn face_at(x: f32, y: f32, size: f32, roll_dy: f32) -> FaceDetection {
    FaceDetection {
        bbox: BoundingBox { x, y, width: size, height: size, confidence: 0.9 },
        landmarks: Landmarks {
            left_eye: vec![Point { x: x + size * 0.3, y: y + size * 0.4 }],
            right_eye: vec![Point { x: x + size * 0.7, y: y + size * 0.4 + roll_dy }],
        },
        descriptor: Embedding::new(vec![0.0; 4]),
    }
}

/// `base` plus uniform noise in `[-amplitude, amplitude]`.
pub(crate) fn noisy(base: &[f32], amplitude: f32, rng: &mut StdRng) -> Embedding {
    Embedding::new(base.iter().map(|v| v + rng.gen_range(-amplitude..=amplitude)).collect())
}

pub(crate) fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// A 128-d unit-ish base descriptor derived from `seed`.
pub(crate) fn base_descriptor(seed: u64) -> Vec<f32> {
    let mut r = rng(seed);
    (0..128).map(|_| r.gen_range(-0.15..0.15)).collect()
}

/// Endless (or `limit`-bounded) stream of copies of one frame, counting
/// opens and closes.
pub(crate) struct ScriptedSource {
    frame: Frame,
    limit: Option<u32>,
    next: u32,
    is_open: bool,
    pub opened: usize,
    pub closed: usize,
}

impl ScriptedSource {
    pub fn new(frame: Frame) -> Self {
        Self { frame, limit: None, next: 0, is_open: false, opened: 0, closed: 0 }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn frames_served(&self) -> u32 {
        self.next
    }
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<(), SourceError> {
        if self.is_open {
            return Err(SourceError::Busy);
        }
        self.is_open = true;
        self.opened += 1;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.is_open {
            return Err(SourceError::NotOpen);
        }
        if self.limit.is_some_and(|l| self.next >= l) {
            return Err(SourceError::Exhausted);
        }
        let mut frame = self.frame.clone();
        frame.sequence = self.next;
        self.next += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        if self.is_open {
            self.is_open = false;
            self.closed += 1;
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
