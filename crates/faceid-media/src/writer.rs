//! Annotated frame output as a numbered image sequence.

use crate::render::{annotate, OutputTransform};
use faceid_core::pipeline::BoxError;
use faceid_core::{FaceResult, FrameSink};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("can't create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Writes annotated frames as `<stem>_000001.<ext>`, `<stem>_000002.<ext>`...
///
/// `output` naming an image file (`out/run.png`) sets directory, stem and
/// format; any other path is a directory receiving `frame_NNNNNN.jpg`.
#[derive(Debug)]
pub struct FrameWriter {
    dir: PathBuf,
    stem: String,
    extension: String,
    /// Frames to keep; 0 keeps all.
    limit: usize,
    written: usize,
    transform: Option<OutputTransform>,
}

impl FrameWriter {
    pub fn new(output: &Path, limit: usize, transform: Option<OutputTransform>) -> Result<Self, WriterError> {
        let extension = output
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .filter(|ext| image::ImageFormat::from_extension(ext).is_some());

        let (dir, stem, extension) = match extension {
            Some(extension) => (
                output.parent().map(Path::to_path_buf).unwrap_or_default(),
                output.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "frame".into()),
                extension,
            ),
            None => (output.to_path_buf(), "frame".to_string(), "jpg".to_string()),
        };

        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(&dir).map_err(|source| WriterError::CreateDir { path: dir.clone(), source })?;
        }
        tracing::info!(dir = %dir.display(), stem = %stem, extension = %extension, limit, "writing annotated frames");

        Ok(Self { dir, stem, extension, limit, written: 0, transform })
    }

    pub fn written(&self) -> usize {
        self.written
    }

    fn next_path(&self) -> PathBuf {
        self.dir.join(format!("{}_{:06}.{}", self.stem, self.written + 1, self.extension))
    }

    /// Annotate, resize and save one frame. Frames past the limit are skipped.
    pub fn write(&mut self, frame: &RgbImage, faces: &[FaceResult]) -> Result<bool, WriterError> {
        if self.limit > 0 && self.written >= self.limit {
            return Ok(false);
        }

        let annotated = annotate(frame, faces);
        let annotated = match &self.transform {
            Some(transform) => transform.apply(&annotated),
            None => annotated,
        };

        let path = self.next_path();
        annotated.save(&path).map_err(|source| WriterError::Write { path: path.clone(), source })?;
        self.written += 1;
        tracing::trace!(path = %path.display(), "frame written");

        if self.written == self.limit {
            tracing::info!(limit = self.limit, "output limit reached; further frames are not saved");
        }
        Ok(true)
    }
}

impl FrameSink for FrameWriter {
    fn present(&mut self, frame: &RgbImage, faces: &[FaceResult]) -> Result<(), BoxError> {
        self.write(frame, faces)?;
        Ok(())
    }
}
