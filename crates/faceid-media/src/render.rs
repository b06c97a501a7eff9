//! Drawing detected faces onto frames.

use faceid_core::FaceResult;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const BOX_COLOR: Rgb<u8> = Rgb([0, 220, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([220, 0, 0]);
const LANDMARK_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

/// Frame with a box around every face and a dot on every landmark.
/// Known faces are boxed in green, unknown ones in red.
pub fn annotate(frame: &RgbImage, faces: &[FaceResult]) -> RgbImage {
    let mut annotated = frame.clone();
    let radius = ((frame.width().min(frame.height()) / 200) as i32).max(1);

    for face in faces {
        let Some((x, y, width, height)) = face.region.pixel_rect(frame.width(), frame.height()) else {
            continue;
        };
        let color = if face.matched.identity.is_unknown() { UNKNOWN_COLOR } else { BOX_COLOR };
        let rect = Rect::at(x as i32, y as i32).of_size(width, height);
        draw_hollow_rect_mut(&mut annotated, rect, color);
        // Double stroke for visibility on large frames.
        if width > 2 && height > 2 {
            let inner = Rect::at(x as i32 + 1, y as i32 + 1).of_size(width - 2, height - 2);
            draw_hollow_rect_mut(&mut annotated, inner, color);
        }

        for &(lx, ly) in &face.landmarks {
            let px = face.region.x + lx * face.region.width;
            let py = face.region.y + ly * face.region.height;
            draw_filled_circle_mut(&mut annotated, (px.round() as i32, py.round() as i32), radius, LANDMARK_COLOR);
        }
    }
    annotated
}

/// Resize frames to fit within a target resolution, keeping aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputTransform {
    pub max_width: u32,
    pub max_height: u32,
}

impl OutputTransform {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self { max_width, max_height }
    }

    /// Output size for a `width`×`height` frame.
    pub fn fitted_size(&self, width: u32, height: u32) -> (u32, u32) {
        if width == 0 || height == 0 {
            return (width, height);
        }
        let scale = (self.max_width as f32 / width as f32).min(self.max_height as f32 / height as f32);
        (
            ((width as f32 * scale).round() as u32).max(1),
            ((height as f32 * scale).round() as u32).max(1),
        )
    }

    pub fn apply(&self, frame: &RgbImage) -> RgbImage {
        let (width, height) = self.fitted_size(frame.width(), frame.height());
        if (width, height) == frame.dimensions() {
            return frame.clone();
        }
        imageops::resize(frame, width, height, FilterType::Triangle)
    }
}

/// Parse `WxH` (e.g. `1280x720`).
pub fn parse_resolution(text: &str) -> Option<OutputTransform> {
    let (width, height) = text.trim().split_once(['x', 'X'])?;
    let width: u32 = width.trim().parse().ok()?;
    let height: u32 = height.trim().parse().ok()?;
    (width > 0 && height > 0).then(|| OutputTransform::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::{BoundingBox, Embedding, Identity, MatchResult};

    fn face(identity: Identity) -> FaceResult {
        FaceResult {
            region: BoundingBox { x: 10.0, y: 10.0, width: 20.0, height: 20.0, confidence: 0.9, landmarks: None },
            landmarks: vec![(0.5, 0.5)],
            embedding: Embedding::new(vec![1.0]),
            matched: MatchResult { detection_index: 0, identity, distance: 0.1 },
        }
    }

    #[test]
    fn test_annotate_draws_box_and_landmarks() {
        let frame = RgbImage::new(64, 64);
        let out = annotate(&frame, &[face(Identity::Known("Alice".into()))]);
        assert_eq!(out.get_pixel(10, 10).0, BOX_COLOR.0);
        assert_eq!(out.get_pixel(20, 20).0, LANDMARK_COLOR.0);
        assert_eq!(out.get_pixel(5, 5).0, [0, 0, 0]);
        // Source frame untouched.
        assert_eq!(frame.get_pixel(10, 10).0, [0, 0, 0]);
    }

    #[test]
    fn test_unknown_faces_use_distinct_color() {
        let out = annotate(&RgbImage::new(64, 64), &[face(Identity::Unknown)]);
        assert_eq!(out.get_pixel(10, 10).0, UNKNOWN_COLOR.0);
    }

    #[test]
    fn test_output_transform_fits() {
        let transform = OutputTransform::new(1280, 720);
        assert_eq!(transform.fitted_size(640, 480), (960, 720));
        assert_eq!(transform.fitted_size(1920, 1080), (1280, 720));
        assert_eq!(transform.apply(&RgbImage::new(320, 240)).dimensions(), (960, 720));
    }

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1280x720"), Some(OutputTransform::new(1280, 720)));
        assert_eq!(parse_resolution(" 640X480 "), Some(OutputTransform::new(640, 480)));
        assert_eq!(parse_resolution("0x480"), None);
        assert_eq!(parse_resolution("wide"), None);
    }
}
