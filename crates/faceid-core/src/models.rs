//! ONNX model locations and the production analyzer.

use crate::alignment::KeypointAligner;
use crate::config::PipelineSettings;
use crate::detector::{DetectorError, DetectorOptions, FaceDetector};
use crate::pipeline::FaceAnalyzer;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// SCRFD detection, keypoint alignment and ArcFace embedding.
pub type OnnxAnalyzer = FaceAnalyzer<FaceDetector, KeypointAligner, FaceRecognizer>;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Default model directory: `$FACEID_MODEL_DIR`, else `~/.local/share/faceid/models`.
pub fn default_model_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("FACEID_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".local/share/faceid/models")
}

/// Paths of the two ONNX models.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPaths {
    /// Standard model file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            recognizer: dir.join(RECOGNIZER_MODEL_FILE),
        }
    }
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self::in_dir(&default_model_dir())
    }
}

/// Load both models, failing fast if either is missing.
pub fn load_analyzer(paths: &ModelPaths, settings: &PipelineSettings) -> Result<OnnxAnalyzer, ModelError> {
    let detector = FaceDetector::load(
        &paths.detector,
        DetectorOptions {
            confidence_threshold: settings.detection_threshold,
            roi_scale: settings.roi_scale,
        },
    )?;
    let recognizer = FaceRecognizer::load(&paths.recognizer)?;
    Ok(FaceAnalyzer::new(detector, KeypointAligner, recognizer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_in_dir() {
        let paths = ModelPaths::in_dir(Path::new("/opt/models"));
        assert_eq!(paths.detector, PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(paths.recognizer, PathBuf::from("/opt/models/w600k_r50.onnx"));
    }

    #[test]
    fn test_missing_models_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_analyzer(&ModelPaths::in_dir(dir.path()), &PipelineSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::Detector(DetectorError::ModelNotFound(_))));
    }
}
