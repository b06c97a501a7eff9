//! Frame-sequential detect → align → embed → match pipeline.
//!
//! Inference collaborators sit behind small traits so the matching and
//! voting logic runs the same with ONNX models or test doubles. One frame
//! is fully processed before the next one is read.

use crate::config::PipelineSettings;
use crate::gallery::{Gallery, GalleryError};
use crate::matcher::Matcher;
use crate::session::{SessionError, SessionTally};
use crate::types::{BoundingBox, Embedding, Identity, MatchResult};
use image::RgbImage;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Error type used at collaborator boundaries that have no typed error of their own.
pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("can't read an image from the input")]
    UnreadableInput,
    #[error("invalid crop size {width}x{height}: both dimensions must be positive, or both zero")]
    InvalidCropGeometry { width: i64, height: i64 },
    #[error("inference failed: {0}")]
    Inference(BoxError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl PipelineError {
    /// Short, stable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnreadableInput => "UnreadableInput",
            PipelineError::InvalidCropGeometry { .. } => "InvalidCropGeometry",
            PipelineError::Inference(_) => "InferenceError",
            PipelineError::Gallery(GalleryError::Immutable) => "GalleryImmutable",
            PipelineError::Gallery(_) => "GalleryError",
            PipelineError::Session(SessionError::Empty) => "EmptySession",
        }
    }
}

fn inference<E: StdError + Send + Sync + 'static>(err: E) -> PipelineError {
    PipelineError::Inference(Box::new(err))
}

/// Finds face regions in a frame.
pub trait Detector {
    type Error: StdError + Send + Sync + 'static;

    /// Regions above the confidence threshold, in frame pixel coordinates.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, Self::Error>;
}

/// Locates facial landmarks inside a region.
pub trait Aligner {
    type Error: StdError + Send + Sync + 'static;

    /// Landmarks normalized to the region (0..1 on both axes).
    fn landmarks(&mut self, frame: &RgbImage, region: &BoundingBox) -> Result<Vec<(f32, f32)>, Self::Error>;
}

/// Produces an identity embedding for an aligned face.
pub trait Embedder {
    type Error: StdError + Send + Sync + 'static;

    fn embed(
        &mut self,
        frame: &RgbImage,
        region: &BoundingBox,
        landmarks: &[(f32, f32)],
    ) -> Result<Embedding, Self::Error>;
}

/// Source of frames. `Ok(None)` marks the end of the stream.
pub trait FrameSource {
    type Error: StdError + Send + Sync + 'static;

    fn read(&mut self) -> Result<Option<RgbImage>, Self::Error>;
    fn fps(&self) -> f32;
}

/// Receives every processed frame with its faces.
pub trait FrameSink {
    fn present(&mut self, frame: &RgbImage, faces: &[FaceResult]) -> Result<(), BoxError>;
}

/// Decides whether an unknown face should join the gallery, and under which name.
pub trait GrowPolicy {
    /// Name to store `face` under, or `None` to skip it.
    fn ask_to_save(&mut self, face: &RgbImage) -> Option<String>;
}

impl<F> GrowPolicy for F
where
    F: FnMut(&RgbImage) -> Option<String>,
{
    fn ask_to_save(&mut self, face: &RgbImage) -> Option<String> {
        self(face)
    }
}

/// One analyzed face in a frame.
#[derive(Debug, Clone)]
pub struct FaceResult {
    pub region: BoundingBox,
    /// Landmarks normalized to `region`.
    pub landmarks: Vec<(f32, f32)>,
    pub embedding: Embedding,
    pub matched: MatchResult,
}

impl FaceResult {
    pub fn label(&self) -> String {
        self.matched.display_label()
    }
}

/// Detector, aligner and embedder used together.
pub struct FaceAnalyzer<D, A, E> {
    pub detector: D,
    pub aligner: A,
    pub embedder: E,
}

impl<D: Detector, A: Aligner, E: Embedder> FaceAnalyzer<D, A, E> {
    pub fn new(detector: D, aligner: A, embedder: E) -> Self {
        Self { detector, aligner, embedder }
    }

    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, PipelineError> {
        self.detector.detect(frame).map_err(inference)
    }

    /// Landmarks and embedding for one region.
    pub fn describe(
        &mut self,
        frame: &RgbImage,
        region: &BoundingBox,
    ) -> Result<(Vec<(f32, f32)>, Embedding), PipelineError> {
        let landmarks = self.aligner.landmarks(frame, region).map_err(inference)?;
        let embedding = self.embedder.embed(frame, region, &landmarks).map_err(inference)?;
        Ok((landmarks, embedding))
    }
}

/// Runs the full per-frame analysis against a shared gallery.
pub struct FrameProcessor<D, A, E> {
    analyzer: FaceAnalyzer<D, A, E>,
    gallery: Arc<Gallery>,
    matcher: Box<dyn Matcher + Send + Sync>,
    match_threshold: f32,
    max_faces: usize,
    grow: Option<Box<dyn GrowPolicy + Send>>,
}

impl<D: Detector, A: Aligner, E: Embedder> FrameProcessor<D, A, E> {
    pub fn new(analyzer: FaceAnalyzer<D, A, E>, gallery: Arc<Gallery>, settings: &PipelineSettings) -> Self {
        Self {
            analyzer,
            gallery,
            matcher: settings.match_algo.matcher(),
            match_threshold: settings.match_threshold,
            max_faces: settings.max_faces,
            grow: None,
        }
    }

    /// Ask `policy` about unknown faces. Only effective if the gallery allows growth.
    pub fn with_grow_policy(mut self, policy: impl GrowPolicy + Send + 'static) -> Self {
        self.grow = Some(Box::new(policy));
        self
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Detect, describe and identify every face in `frame`.
    pub fn process(&mut self, frame: &RgbImage) -> Result<Vec<FaceResult>, PipelineError> {
        let mut regions = self.analyzer.detect(frame)?;
        if regions.len() > self.max_faces {
            tracing::warn!(
                found = regions.len(),
                kept = self.max_faces,
                "too many faces for processing; extra faces dropped"
            );
            regions.truncate(self.max_faces);
        }

        let mut landmarks = Vec::with_capacity(regions.len());
        let mut embeddings = Vec::with_capacity(regions.len());
        for region in &regions {
            let (points, embedding) = self.analyzer.describe(frame, region)?;
            landmarks.push(points);
            embeddings.push(embedding);
        }

        let snapshot = self.gallery.snapshot();
        let matches = self.matcher.assign(&embeddings, &snapshot, self.match_threshold);

        let mut faces: Vec<FaceResult> = regions
            .into_iter()
            .zip(landmarks)
            .zip(embeddings)
            .zip(matches)
            .map(|(((region, landmarks), embedding), matched)| FaceResult {
                region,
                landmarks,
                embedding,
                matched,
            })
            .collect();

        if self.gallery.growth_enabled() {
            if let Some(policy) = self.grow.as_deref_mut() {
                grow_unknowns(&self.gallery, policy, frame, &mut faces);
            }
        }

        Ok(faces)
    }
}

/// Offer unknown faces fully inside the frame to the grow policy.
fn grow_unknowns(gallery: &Gallery, policy: &mut dyn GrowPolicy, frame: &RgbImage, faces: &mut [FaceResult]) {
    for face in faces.iter_mut().filter(|f| f.matched.identity.is_unknown()) {
        // Faces cut by the frame border make poor references.
        if face.region.touches_border(frame.width(), frame.height()) {
            continue;
        }
        let Some(crop) = crop_region(frame, &face.region) else {
            continue;
        };
        let Some(name) = policy.ask_to_save(&crop) else {
            continue;
        };

        match gallery.add(&name, face.embedding.clone(), &crop) {
            Ok(id) => {
                tracing::info!(label = %name.trim(), id, "unknown face added to gallery");
                face.matched.identity = Identity::Known(name.trim().to_string());
                face.matched.distance = 0.0;
            }
            Err(err) => tracing::warn!(error = %err, "could not grow gallery"),
        }
    }
}

/// Copy of the frame area covered by `region`, or `None` if it is empty.
pub fn crop_region(frame: &RgbImage, region: &BoundingBox) -> Option<RgbImage> {
    let (x, y, width, height) = region.pixel_rect(frame.width(), frame.height())?;
    Some(image::imageops::crop_imm(frame, x, y, width, height).to_image())
}

/// Validate a requested crop size. `(0, 0)` disables cropping.
pub fn validate_crop(width: i64, height: i64) -> Result<Option<(u32, u32)>, PipelineError> {
    match (width, height) {
        (0, 0) => Ok(None),
        (w, h) if w > 0 && h > 0 && w <= u32::MAX as i64 && h <= u32::MAX as i64 => {
            Ok(Some((w as u32, h as u32)))
        }
        _ => Err(PipelineError::InvalidCropGeometry { width, height }),
    }
}

/// Centered crop, limited to the frame size.
pub fn center_crop(frame: &RgbImage, width: u32, height: u32) -> RgbImage {
    let width = width.min(frame.width());
    let height = height.min(frame.height());
    let x = (frame.width() - width) / 2;
    let y = (frame.height() - height) / 2;
    image::imageops::crop_imm(frame, x, y, width, height).to_image()
}

/// Per-run options for [`run_session`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Center crop applied to every frame.
    pub crop: Option<(u32, u32)>,
    /// Stop after this many frames; `None` or `Some(0)` reads to the end.
    pub max_frames: Option<usize>,
}

/// Frame counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: usize,
    pub dropped: usize,
    pub faces: usize,
}

/// Reads failing back to back this many times end a run.
const MAX_CONSECUTIVE_READ_FAILURES: usize = 10;

/// Process every frame of `source`, recording each face's label in `tally`.
///
/// Failing to read the first frame is fatal. Later read or inference
/// failures drop the frame and the run continues, unless the source fails
/// [`MAX_CONSECUTIVE_READ_FAILURES`] times in a row.
pub fn run_session<S, D, A, E>(
    source: &mut S,
    processor: &mut FrameProcessor<D, A, E>,
    mut sink: Option<&mut dyn FrameSink>,
    options: &RunOptions,
    tally: &mut SessionTally,
) -> Result<RunStats, PipelineError>
where
    S: FrameSource,
    D: Detector,
    A: Aligner,
    E: Embedder,
{
    let limit = options.max_frames.filter(|&max| max > 0);
    let mut stats = RunStats::default();
    let mut read_failures = 0;

    loop {
        if limit.is_some_and(|max| stats.frames >= max) {
            break;
        }

        let frame = match source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) if stats.frames == 0 => return Err(PipelineError::UnreadableInput),
            Ok(None) => break,
            Err(err) if stats.frames == 0 => {
                tracing::warn!(error = %err, "failed to read first frame");
                return Err(PipelineError::UnreadableInput);
            }
            Err(err) => {
                stats.frames += 1;
                stats.dropped += 1;
                read_failures += 1;
                if read_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    tracing::warn!(frame = stats.frames, error = %err, failures = read_failures, "source keeps failing; ending run");
                    break;
                }
                tracing::warn!(frame = stats.frames, error = %err, "frame read failed; dropping frame");
                continue;
            }
        };
        read_failures = 0;
        stats.frames += 1;

        let frame = match options.crop {
            Some((width, height)) => center_crop(&frame, width, height),
            None => frame,
        };

        let faces = match processor.process(&frame) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(frame = stats.frames, error = %err, "dropping frame");
                stats.dropped += 1;
                continue;
            }
        };

        for face in &faces {
            let label = face.label();
            tracing::debug!(frame = stats.frames, label = %label, "face identified");
            tally.record(&label);
        }
        stats.faces += faces.len();

        if let Some(sink) = sink.as_deref_mut() {
            if let Err(err) = sink.present(&frame, &faces) {
                tracing::warn!(frame = stats.frames, error = %err, "failed to present frame");
            }
        }
    }

    tracing::info!(
        frames = stats.frames,
        dropped = stats.dropped,
        faces = stats.faces,
        fps = source.fps(),
        "run finished"
    );
    Ok(stats)
}

/// Run one session over `source` and return the majority identity.
pub fn identify<S, D, A, E>(
    source: &mut S,
    processor: &mut FrameProcessor<D, A, E>,
    sink: Option<&mut dyn FrameSink>,
    options: &RunOptions,
) -> Result<String, PipelineError>
where
    S: FrameSource,
    D: Detector,
    A: Aligner,
    E: Embedder,
{
    let mut tally = SessionTally::new();
    run_session(source, processor, sink, options, &mut tally)?;
    Ok(tally.finalize()?)
}
