//! Input resolution: camera, single image or image folder.

use crate::camera::{Camera, CameraError};
use faceid_core::FrameSource;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mkv", "mov", "webm", "m4v", "wmv", "flv", "mpg", "mpeg"];

/// Requested camera resolution; the driver may pick another.
pub const CAMERA_WIDTH: u32 = 640;
pub const CAMERA_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("unsupported input {0}: expected a camera, an image or a folder of images")]
    UnsupportedInput(String),
    #[error("input not found: {0}")]
    NotFound(PathBuf),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("can't decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What an input string refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputKind {
    Camera(String),
    Image(PathBuf),
    Folder(PathBuf),
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

fn is_image(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Classify `input`: a bare number is a camera index, `/dev/video*` a
/// camera device, otherwise an image file or a directory of images.
pub fn classify_input(input: &str) -> Result<InputKind, CaptureError> {
    let input = input.trim();
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
        return Ok(InputKind::Camera(format!("/dev/video{input}")));
    }
    if input.starts_with("/dev/video") {
        return Ok(InputKind::Camera(input.to_string()));
    }

    let path = Path::new(input);
    if extension_of(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str())) {
        return Err(CaptureError::UnsupportedInput(input.to_string()));
    }
    if path.is_dir() {
        return Ok(InputKind::Folder(path.to_path_buf()));
    }
    if !path.exists() {
        return Err(CaptureError::NotFound(path.to_path_buf()));
    }
    if is_image(path) {
        return Ok(InputKind::Image(path.to_path_buf()));
    }
    Err(CaptureError::UnsupportedInput(input.to_string()))
}

/// Still images read in order, optionally repeating forever.
///
/// Folder sequences skip files that fail to decode; a failure is only
/// returned once every path in the sequence has failed in a row.
#[derive(Debug)]
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
    looping: bool,
    skip_unreadable: bool,
}

impl ImageSequence {
    pub fn new(paths: Vec<PathBuf>, looping: bool) -> Self {
        Self { paths, next: 0, looping, skip_unreadable: false }
    }

    /// Every image file in `dir`, sorted by name.
    pub fn from_folder(dir: &Path, looping: bool) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir).map_err(|source| CaptureError::Io { path: dir.to_path_buf(), source })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        paths.sort();
        tracing::debug!(dir = %dir.display(), images = paths.len(), "image folder input");
        Ok(Self { skip_unreadable: true, ..Self::new(paths, looping) })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequence {
    type Error = CaptureError;

    fn read(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let mut failed = 0;
        loop {
            if self.next >= self.paths.len() {
                if !self.looping || self.paths.is_empty() {
                    return Ok(None);
                }
                self.next = 0;
            }

            let path = &self.paths[self.next];
            self.next += 1;
            match image::open(path) {
                Ok(image) => return Ok(Some(image.to_rgb8())),
                Err(source) => {
                    let err = CaptureError::Decode { path: path.clone(), source };
                    failed += 1;
                    if !self.skip_unreadable || failed >= self.paths.len() {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "skipping unreadable image");
                }
            }
        }
    }

    /// Still images have no frame rate.
    fn fps(&self) -> f32 {
        0.0
    }
}

/// Any supported frame source.
pub enum Capture {
    Camera(Camera),
    Images(ImageSequence),
}

/// Open `input` as a frame source. `looping` repeats image inputs.
pub fn open_capture(input: &str, looping: bool) -> Result<Capture, CaptureError> {
    let capture = match classify_input(input)? {
        InputKind::Camera(device) => {
            if looping {
                tracing::debug!("--loop has no effect on camera input");
            }
            Capture::Camera(Camera::open(&device, CAMERA_WIDTH, CAMERA_HEIGHT)?)
        }
        InputKind::Image(path) => Capture::Images(ImageSequence::new(vec![path], looping)),
        InputKind::Folder(dir) => Capture::Images(ImageSequence::from_folder(&dir, looping)?),
    };
    tracing::info!(input, "input opened");
    Ok(capture)
}

impl FrameSource for Capture {
    type Error = CaptureError;

    fn read(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        match self {
            Capture::Camera(camera) => Ok(camera.read()?),
            Capture::Images(images) => images.read(),
        }
    }

    fn fps(&self) -> f32 {
        match self {
            Capture::Camera(camera) => camera.fps(),
            Capture::Images(images) => images.fps(),
        }
    }
}
