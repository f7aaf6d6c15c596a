//! Nearest-template matching of a probe against a class roster.

use crate::template::FaceTemplate;
use crate::types::Embedding;

/// Largest Euclidean distance still accepted as the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.55;

/// An enrolled student the probe may be compared against.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub template: FaceTemplate,
}

/// Result of matching a probe against a set of candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched candidate, `None` when the nearest one is too far.
    pub candidate_id: Option<String>,
    /// Smallest distance found, `None` when nothing was comparable.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.candidate_id.is_some()
    }
}

/// Strategy for comparing a probe against enrolled candidates.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, candidates: &[Candidate]) -> MatchResult;
}

/// Minimum Euclidean distance over every stored sample of every candidate.
///
/// A distance equal to the threshold is a match. Vectors whose length
/// differs from the probe are skipped. On exactly equal distances the
/// candidate seen first wins.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    pub threshold: f32,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn best_match(&self, probe: &Embedding, candidates: &[Candidate]) -> MatchResult {
        let mut best: Option<(f32, usize)> = None;
        let mut skipped = 0usize;

        for (i, candidate) in candidates.iter().enumerate() {
            for vector in candidate.template.comparison_vectors() {
                let Some(d) = probe.euclidean_distance(vector) else {
                    skipped += 1;
                    continue;
                };
                if best.map_or(true, |(best_d, _)| d < best_d) {
                    best = Some((d, i));
                }
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, probe_len = probe.len(), "skipped vectors of mismatched length");
        }

        match best {
            Some((d, idx)) if d <= self.threshold => MatchResult {
                candidate_id: Some(candidates[idx].id.clone()),
                distance: Some(d),
            },
            Some((d, _)) => MatchResult {
                candidate_id: None,
                distance: Some(d),
            },
            None => MatchResult {
                candidate_id: None,
                distance: None,
            },
        }
    }
}
