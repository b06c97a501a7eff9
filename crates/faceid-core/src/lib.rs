//! faceid-core: face identification engine.
//!
//! SCRFD detection and ArcFace embedding run via ONNX Runtime. Embeddings
//! are matched against a labeled gallery, and per-face labels are voted
//! over a session to produce one identity.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod enroll;
pub mod gallery;
pub mod matcher;
pub mod models;
pub mod pipeline;
pub mod recognizer;
pub mod session;
pub mod types;

pub use config::PipelineSettings;
pub use enroll::{build_gallery, GalleryBuildOptions};
pub use gallery::{DirectoryPersist, Gallery, GalleryError};
pub use matcher::{match_embeddings, MatchAlgorithm, Matcher};
pub use models::{default_model_dir, load_analyzer, ModelError, ModelPaths, OnnxAnalyzer};
pub use pipeline::{
    identify, run_session, FaceAnalyzer, FaceResult, FrameProcessor, FrameSink, FrameSource, GrowPolicy,
    PipelineError, RunOptions, RunStats,
};
pub use session::{normalize_label, SessionTally};
pub use types::{BoundingBox, Embedding, GalleryEntry, Identity, MatchResult, UNKNOWN_LABEL};
