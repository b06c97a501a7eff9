//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 position using the five
//! InsightFace reference landmarks and least-squares estimation.

use crate::pipeline::Aligner;
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use std::convert::Infallible;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Landmarks from the detector's keypoints.
///
/// Regions without keypoints (whole-image references) get the canonical
/// reference layout stretched over the region, so the warp reduces to a
/// plain resize of the region.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeypointAligner;

impl Aligner for KeypointAligner {
    type Error = Infallible;

    fn landmarks(&mut self, _frame: &RgbImage, region: &BoundingBox) -> Result<Vec<(f32, f32)>, Infallible> {
        let width = region.width.max(f32::EPSILON);
        let height = region.height.max(f32::EPSILON);
        let points = match &region.landmarks {
            Some(points) => points
                .iter()
                .map(|&(x, y)| ((x - region.x) / width, (y - region.y) / height))
                .collect(),
            None => REFERENCE_LANDMARKS_112
                .iter()
                .map(|&(x, y)| (x / ALIGNED_SIZE as f32, y / ALIGNED_SIZE as f32))
                .collect(),
        };
        Ok(points)
    }
}

/// Map region-normalized landmarks back to frame coordinates.
/// Returns `None` unless exactly five points are given.
pub fn denormalize(region: &BoundingBox, landmarks: &[(f32, f32)]) -> Option<[(f32, f32); 5]> {
    let points: &[(f32, f32); 5] = landmarks.try_into().ok()?;
    Some(points.map(|(x, y)| (region.x + x * region.width, region.y + y * region.height)))
}

/// Estimate a 2×3 similarity transform (scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations for
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];
        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting. A singular system yields the identity transform.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Apply a 2×3 similarity warp with bilinear sampling. Pixels mapped
/// from outside the frame are black.
fn warp_affine(frame: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    let (width, height) = (frame.width() as i64, frame.height() as i64);
    let sample = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && x < width && y >= 0 && y < height {
            frame.get_pixel(x as u32, y as u32).0[c] as f32
        } else {
            0.0
        }
    };

    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        // src = M⁻¹ · (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        Rgb(std::array::from_fn(|c| {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            val.round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Align a face to a canonical 112×112 RGB crop from its five frame-space landmarks.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(frame, &matrix, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);
        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_align_face_output_size() {
        let frame = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.dimensions(), (112, 112));
        assert_eq!(aligned.get_pixel(56, 56).0, [128, 128, 128]);
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A colored patch at the left eye lands near the reference left eye.
        let mut frame = RgbImage::new(200, 200);
        let src: [(f32, f32); 5] = [(80.0, 60.0), (120.0, 60.0), (100.0, 85.0), (85.0, 110.0), (115.0, 110.0)];
        for y in 58..63 {
            for x in 78..83 {
                frame.put_pixel(x, y, Rgb([0, 0, 255]));
            }
        }

        let aligned = align_face(&frame, &src);
        let (rx, ry) = (REFERENCE_LANDMARKS_112[0].0.round() as u32, REFERENCE_LANDMARKS_112[0].1.round() as u32);
        let brightest = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0)
            .max_by_key(|p| p[2])
            .unwrap();
        assert!(brightest[2] > 100 && brightest[0] == 0, "got {brightest:?}");
    }

    #[test]
    fn test_keypoint_aligner_normalizes_to_region() {
        let region = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 50.0,
            confidence: 0.9,
            landmarks: Some([(60.0, 45.0); 5]),
        };
        let frame = RgbImage::new(1, 1);
        let points = KeypointAligner.landmarks(&frame, &region).unwrap();
        assert_eq!(points, vec![(0.5, 0.5); 5]);
        assert_eq!(denormalize(&region, &points), Some([(60.0, 45.0); 5]));
    }

    #[test]
    fn test_keypoint_aligner_falls_back_to_reference_layout() {
        let region = BoundingBox::full_frame(224, 224);
        let points = KeypointAligner.landmarks(&RgbImage::new(1, 1), &region).unwrap();
        let frame_points = denormalize(&region, &points).unwrap();
        for (got, reference) in frame_points.iter().zip(REFERENCE_LANDMARKS_112) {
            assert!((got.0 - reference.0 * 2.0).abs() < 1e-3);
            assert!((got.1 - reference.1 * 2.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_denormalize_requires_five_points() {
        let region = BoundingBox::full_frame(10, 10);
        assert!(denormalize(&region, &[(0.5, 0.5)]).is_none());
    }
}
