use serde::{Deserialize, Serialize};

/// Label shown for faces that did not match any gallery identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Largest possible cosine distance (opposite vectors).
pub const MAX_DISTANCE: f32 = 2.0;

/// Face region in frame pixel coordinates, with optional five-point keypoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Keypoints in frame coordinates: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Region covering a whole `width`×`height` frame.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            confidence: 1.0,
            landmarks: None,
        }
    }

    /// Grow (or shrink) the box by `factor` around its center. Keypoints are kept.
    pub fn scaled(&self, factor: f32) -> Self {
        let cx = self.x + self.width / 2.0;
        let cy = self.y + self.height / 2.0;
        let width = self.width * factor;
        let height = self.height * factor;
        Self {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
            ..self.clone()
        }
    }

    /// Clip the box to the frame bounds.
    pub fn clipped(&self, frame_width: u32, frame_height: u32) -> Self {
        let x1 = self.x.clamp(0.0, frame_width as f32);
        let y1 = self.y.clamp(0.0, frame_height as f32);
        let x2 = (self.x + self.width).clamp(0.0, frame_width as f32);
        let y2 = (self.y + self.height).clamp(0.0, frame_height as f32);
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            ..self.clone()
        }
    }

    /// Whether the box touches or crosses the frame border.
    pub fn touches_border(&self, frame_width: u32, frame_height: u32) -> bool {
        self.x <= 0.0
            || self.y <= 0.0
            || self.x + self.width >= frame_width as f32
            || self.y + self.height >= frame_height as f32
    }

    /// Integer pixel rectangle `(x, y, width, height)` inside the frame,
    /// or `None` if the clipped box is empty.
    pub fn pixel_rect(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let clipped = self.clipped(frame_width, frame_height);
        let x = clipped.x.floor() as u32;
        let y = clipped.y.floor() as u32;
        let width = (clipped.width.round() as u32).min(frame_width.saturating_sub(x));
        let height = (clipped.height.round() as u32).min(frame_height.saturating_sub(y));
        (width > 0 && height > 0).then_some((x, y, width, height))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. A zero vector is similar to nothing (0.0).
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance `1 - similarity`, clamped to [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let distance = 1.0 - self.similarity(other);
        if distance.is_nan() {
            MAX_DISTANCE
        } else {
            distance.clamp(0.0, MAX_DISTANCE)
        }
    }

    /// Copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// One labeled reference sample in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub label: String,
    pub embedding: Embedding,
}

/// Identity assigned to a detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn label(&self) -> &str {
        match self {
            Identity::Known(label) => label,
            Identity::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Identity::Unknown)
    }
}

/// Outcome of matching one detection against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Index of the detection this result belongs to.
    pub detection_index: usize,
    pub identity: Identity,
    /// Cosine distance to the chosen (or nearest) identity, in [0, 2].
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(detection_index: usize, distance: f32) -> Self {
        Self {
            detection_index,
            identity: Identity::Unknown,
            distance,
        }
    }

    /// Label as rendered on frames: `"Alice 92.00%"` for known faces, `"Unknown"` otherwise.
    pub fn display_label(&self) -> String {
        match &self.identity {
            Identity::Known(label) => format!("{label} {:.2}%", 100.0 * (1.0 - self.distance)),
            Identity::Unknown => UNKNOWN_LABEL.to_string(),
        }
    }
}
