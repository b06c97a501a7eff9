use crate::matcher::MatchAlgorithm;
use serde::Deserialize;

/// Tuning shared by every front end (daemon, CLI).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Minimum detector confidence for a face region.
    pub detection_threshold: f32,
    /// Scale applied to detected boxes around their center before embedding.
    pub roi_scale: f32,
    /// Maximum cosine distance for a gallery match.
    pub match_threshold: f32,
    pub match_algo: MatchAlgorithm,
    /// Faces beyond this count in one frame are dropped.
    pub max_faces: usize,
    /// Allow adding unknown faces to the gallery at runtime.
    pub allow_grow: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detection_threshold: 0.6,
            roi_scale: 1.15,
            match_threshold: 0.6,
            match_algo: MatchAlgorithm::Optimal,
            max_faces: 16,
            allow_grow: false,
        }
    }
}
