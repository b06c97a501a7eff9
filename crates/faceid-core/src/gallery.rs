//! In-memory gallery of labeled reference embeddings.
//!
//! Readers take an [`Arc`] snapshot of the entry list; growing the gallery
//! builds a new list and swaps it in, so a snapshot taken for one frame is
//! never resized underneath the matcher.

use crate::matcher::{GreedyMatcher, Matcher};
use crate::types::{Embedding, GalleryEntry, Identity};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery is immutable: growth is disabled")]
    Immutable,
    #[error("gallery labels must not be empty")]
    EmptyLabel,
    #[error("face gallery directory not found: {0}")]
    NoReferenceImages(PathBuf),
    #[error("gallery io: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery image: {0}")]
    Image(#[from] image::ImageError),
}

/// Backing storage for faces added at runtime.
pub trait GalleryPersist: Send + Sync {
    /// Store `image` as sample number `sample` of `label`.
    fn persist(&self, label: &str, sample: usize, image: &RgbImage) -> Result<(), GalleryError>;
}

/// Writes grown faces as `<label>-<sample>.jpg` into a directory.
pub struct DirectoryPersist {
    dir: PathBuf,
}

impl DirectoryPersist {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, label: &str, sample: usize) -> PathBuf {
        self.dir.join(format!("{label}-{sample}.jpg"))
    }
}

impl GalleryPersist for DirectoryPersist {
    fn persist(&self, label: &str, sample: usize, image: &RgbImage) -> Result<(), GalleryError> {
        let path = self.path_for(label, sample);
        if path.exists() {
            tracing::warn!(path = %path.display(), "file with the same name already exists; face not stored");
            return Ok(());
        }
        image.save(&path)?;
        tracing::debug!(path = %path.display(), "saved grown face");
        Ok(())
    }
}

/// Labeled face embeddings; several samples may share one label.
pub struct Gallery {
    entries: RwLock<Arc<Vec<GalleryEntry>>>,
    growth: bool,
    persist: Option<Box<dyn GalleryPersist>>,
}

impl Gallery {
    /// Build a gallery from existing entries. Labels are trimmed the same
    /// way [`add`](Self::add) trims them; empty labels are rejected.
    pub fn new(mut entries: Vec<GalleryEntry>, growth: bool) -> Result<Self, GalleryError> {
        for entry in &mut entries {
            let trimmed = entry.label.trim();
            if trimmed.is_empty() {
                return Err(GalleryError::EmptyLabel);
            }
            if trimmed.len() != entry.label.len() {
                entry.label = trimmed.to_string();
            }
        }
        Ok(Self {
            entries: RwLock::new(Arc::new(entries)),
            growth,
            persist: None,
        })
    }

    pub fn empty(growth: bool) -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            growth,
            persist: None,
        }
    }

    /// Attach a persistence sink used by [`add`](Self::add).
    pub fn with_persist(mut self, persist: impl GalleryPersist + 'static) -> Self {
        self.persist = Some(Box::new(persist));
        self
    }

    pub fn growth_enabled(&self) -> bool {
        self.growth
    }

    /// Current entry list. Later growth does not affect a snapshot.
    pub fn snapshot(&self) -> Arc<Vec<GalleryEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of stored samples.
    pub fn size(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Distinct labels in first-seen order. A label's position is its identity id.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for entry in self.snapshot().iter() {
            if !labels.contains(&entry.label) {
                labels.push(entry.label.clone());
            }
        }
        labels
    }

    pub fn identity_count(&self) -> usize {
        self.labels().len()
    }

    pub fn label_of(&self, id: usize) -> Option<String> {
        self.labels().into_iter().nth(id)
    }

    /// All samples stored under `label`.
    pub fn lookup(&self, label: &str) -> Vec<Embedding> {
        self.snapshot()
            .iter()
            .filter(|e| e.label == label)
            .map(|e| e.embedding.clone())
            .collect()
    }

    /// Identity id of the nearest label within `threshold`, if any.
    pub fn find_match(&self, embedding: &Embedding, threshold: f32) -> Option<usize> {
        let snapshot = self.snapshot();
        let result = GreedyMatcher.assign(std::slice::from_ref(embedding), &snapshot, threshold);
        match result.first().map(|r| &r.identity) {
            Some(Identity::Known(label)) => identity_index(&snapshot, label),
            _ => None,
        }
    }

    /// Append a sample at runtime and return the identity id of `label`.
    ///
    /// Fails with [`GalleryError::Immutable`] when growth is disabled. The
    /// in-memory view is updated before the persistence sink runs; a sink
    /// failure is logged and does not undo the addition.
    pub fn add(&self, label: &str, embedding: Embedding, image: &RgbImage) -> Result<usize, GalleryError> {
        if !self.growth {
            return Err(GalleryError::Immutable);
        }
        let label = label.trim();
        if label.is_empty() {
            return Err(GalleryError::EmptyLabel);
        }

        let (id, sample) = {
            let mut current = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let sample = current.iter().filter(|e| e.label == label).count();

            let mut grown = Vec::with_capacity(current.len() + 1);
            grown.extend(current.iter().cloned());
            grown.push(GalleryEntry {
                label: label.to_string(),
                embedding,
            });
            let id = identity_index(&grown, label).unwrap_or(0);
            *current = Arc::new(grown);
            (id, sample)
        };

        if let Some(persist) = &self.persist {
            if let Err(err) = persist.persist(label, sample, image) {
                tracing::warn!(label, error = %err, "failed to persist grown face");
            }
        }

        tracing::info!(label, id, sample, "gallery grown");
        Ok(id)
    }
}

impl std::fmt::Debug for Gallery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gallery")
            .field("size", &self.size())
            .field("growth", &self.growth)
            .field("persist", &self.persist.is_some())
            .finish()
    }
}

fn identity_index(entries: &[GalleryEntry], label: &str) -> Option<usize> {
    let mut seen: Vec<&str> = Vec::new();
    for entry in entries {
        if !seen.contains(&entry.label.as_str()) {
            if entry.label == label {
                return Some(seen.len());
            }
            seen.push(&entry.label);
        }
    }
    None
}

/// Reference images (`*.jpg`, `*.jpeg`, `*.png`) in `dir`, sorted by path.
pub fn reference_images(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    if !dir.is_dir() {
        return Err(GalleryError::NoReferenceImages(dir.to_path_buf()));
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"));
        if is_image && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
