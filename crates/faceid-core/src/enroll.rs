//! Gallery construction from a directory of reference images.

use crate::gallery::{reference_images, Gallery, GalleryError};
use crate::matcher::{GreedyMatcher, Matcher};
use crate::pipeline::{crop_region, Aligner, Detector, Embedder, FaceAnalyzer, GrowPolicy, PipelineError};
use crate::types::{BoundingBox, GalleryEntry};
use std::path::Path;

/// How reference images are turned into gallery entries.
#[derive(Debug, Clone)]
pub struct GalleryBuildOptions {
    /// Detect faces on reference images instead of using the whole image.
    pub run_detector: bool,
    /// Distance under which a detected face counts as already enrolled.
    pub match_threshold: f32,
    /// Allow runtime growth of the resulting gallery.
    pub allow_grow: bool,
}

/// Build a gallery from every `*.jpg` / `*.png` in `dir`.
///
/// Without `run_detector`, each image is one face labeled by its file stem.
/// With it, every detected face that is not already enrolled is added,
/// named by `policy` when given, else by the file stem.
pub fn build_gallery<D, A, E>(
    dir: &Path,
    analyzer: &mut FaceAnalyzer<D, A, E>,
    options: &GalleryBuildOptions,
    mut policy: Option<&mut dyn GrowPolicy>,
) -> Result<Gallery, PipelineError>
where
    D: Detector,
    A: Aligner,
    E: Embedder,
{
    tracing::info!(dir = %dir.display(), "building faces database");
    let paths = reference_images(dir)?;
    if paths.is_empty() {
        tracing::warn!(dir = %dir.display(), "no reference images found; gallery starts empty");
    }

    let mut entries: Vec<GalleryEntry> = Vec::new();

    for path in &paths {
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().trim().to_string()) else {
            continue;
        };
        if stem.is_empty() {
            tracing::warn!(path = %path.display(), "skipping reference image without a name");
            continue;
        }

        let image = image::open(path).map_err(GalleryError::from)?.to_rgb8();

        if !options.run_detector {
            let region = BoundingBox::full_frame(image.width(), image.height());
            let (_, embedding) = analyzer.describe(&image, &region)?;
            tracing::debug!(label = %stem, "adding reference face");
            entries.push(GalleryEntry { label: stem, embedding });
            continue;
        }

        let regions = analyzer.detect(&image)?;
        if regions.is_empty() {
            tracing::warn!(path = %path.display(), "no faces found on reference image");
            continue;
        }

        for region in &regions {
            let (_, embedding) = analyzer.describe(&image, region)?;

            let known = GreedyMatcher.assign(std::slice::from_ref(&embedding), &entries, options.match_threshold);
            if known.first().is_some_and(|m| !m.identity.is_unknown()) {
                tracing::debug!(path = %path.display(), "face already enrolled");
                continue;
            }

            let asked = match (policy.as_deref_mut(), crop_region(&image, region)) {
                (Some(policy), Some(crop)) => policy.ask_to_save(&crop),
                _ => None,
            };
            let label = asked
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| stem.clone());

            tracing::debug!(label = %label, "adding detected reference face");
            entries.push(GalleryEntry { label, embedding });
        }
    }

    let gallery = Gallery::new(entries, options.allow_grow)?;
    tracing::info!(
        identities = gallery.identity_count(),
        samples = gallery.size(),
        "database is built"
    );
    Ok(gallery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::*;
    use image::RgbImage;

    fn save(dir: &Path, name: &str, color: [u8; 3]) {
        RgbImage::from_pixel(40, 40, image::Rgb(color))
            .save(dir.join(name))
            .unwrap();
    }

    fn analyzer(boxes: Vec<BoundingBox>) -> FaceAnalyzer<FixedDetector, CenterAligner, ColorEmbedder> {
        FaceAnalyzer::new(FixedDetector::new(boxes), CenterAligner, ColorEmbedder)
    }

    fn options(run_detector: bool) -> GalleryBuildOptions {
        GalleryBuildOptions { run_detector, match_threshold: 0.3, allow_grow: false }
    }

    #[test]
    fn test_whole_image_references() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "alice.png", [255, 0, 0]);
        save(dir.path(), "bob.png", [0, 255, 0]);
        std::fs::write(dir.path().join("readme.txt"), "not a face").unwrap();

        let gallery = build_gallery(dir.path(), &mut analyzer(vec![]), &options(false), None).unwrap();
        assert_eq!(gallery.labels(), vec!["alice", "bob"]);
        assert_eq!(gallery.lookup("alice")[0].values, vec![1.0, 0.0, 0.0]);
        assert!(!gallery.growth_enabled());
    }

    #[test]
    fn test_run_detector_skips_known_faces_and_asks_for_names() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "a.png", [255, 0, 0]);
        save(dir.path(), "b.png", [250, 5, 0]);
        save(dir.path(), "c.png", [0, 0, 255]);

        let mut names = vec!["Carol".to_string(), "Alice".to_string()];
        let mut policy = move |_: &RgbImage| names.pop();
        let gallery = build_gallery(
            dir.path(),
            &mut analyzer(vec![square(10.0, 10.0, 20.0)]),
            &options(true),
            Some(&mut policy as &mut dyn GrowPolicy),
        )
        .unwrap();

        // b.png is the same face as a.png and is not enrolled twice.
        assert_eq!(gallery.labels(), vec!["Alice", "Carol"]);
        assert_eq!(gallery.size(), 2);
    }

    #[test]
    fn test_run_detector_falls_back_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "dave.png", [0, 0, 255]);
        let gallery = build_gallery(
            dir.path(),
            &mut analyzer(vec![square(10.0, 10.0, 20.0)]),
            &options(true),
            None,
        )
        .unwrap();
        assert_eq!(gallery.labels(), vec!["dave"]);
    }

    #[test]
    fn test_empty_directory_gives_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = build_gallery(dir.path(), &mut analyzer(vec![]), &options(false), None).unwrap();
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_gallery(&dir.path().join("missing"), &mut analyzer(vec![]), &options(false), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Gallery(GalleryError::NoReferenceImages(_))));
    }

    #[test]
    fn test_corrupt_reference_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let err = build_gallery(dir.path(), &mut analyzer(vec![]), &options(false), None).unwrap_err();
        assert!(matches!(err, PipelineError::Gallery(GalleryError::Image(_))));
    }
}
