//! faceid-media: frame sources and annotated output.
//!
//! V4L2 cameras, still images and image folders behind the core
//! `FrameSource` trait, plus rendering of identified faces and a numbered
//! image-sequence writer implementing `FrameSink`.

pub mod camera;
pub mod frame;
pub mod render;
pub mod source;
pub mod writer;

pub use camera::{Camera, CameraError, PixelFormat};
pub use render::{annotate, parse_resolution, OutputTransform};
pub use source::{classify_input, open_capture, Capture, CaptureError, ImageSequence, InputKind};
pub use writer::{FrameWriter, WriterError};
