use crate::config::Config;
use faceid_core::pipeline::{Aligner, Detector, Embedder};
use faceid_core::{
    build_gallery, load_analyzer, run_session, FrameProcessor, GalleryBuildOptions, ModelError, PipelineError,
    RunOptions, SessionTally,
};
use faceid_media::{open_capture, CaptureError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("no media files in request")]
    NoMedia,
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Short, stable name of the failure kind, reported to HTTP clients.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Model(_) => "ModelError",
            EngineError::Pipeline(err) => err.kind(),
            EngineError::Capture(CaptureError::UnsupportedInput(_)) => "UnsupportedInput",
            EngineError::Capture(CaptureError::Decode { .. }) => "UnreadableInput",
            EngineError::Capture(_) => "CaptureError",
            EngineError::NoMedia => "NoMedia",
            EngineError::Spawn(_) | EngineError::ChannelClosed => "EngineUnavailable",
        }
    }
}

/// Messages sent from HTTP handlers to the engine thread.
pub(crate) enum EngineRequest {
    /// Identify the person across all media files, as one session.
    Recognize {
        media: Vec<PathBuf>,
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<EngineRequest>) -> Self {
        Self { tx }
    }

    /// Majority identity over every frame of every file in `media`.
    pub async fn recognize(&self, media: Vec<PathBuf>) -> Result<String, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { media, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load models and build the gallery, then start the engine thread.
///
/// Fails fast at startup if models or the gallery directory are unusable.
/// Gallery growth is never enabled in the daemon.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let settings = faceid_core::PipelineSettings { allow_grow: false, ..config.pipeline.clone() };

    let mut analyzer = load_analyzer(&config.model_paths(), &settings)?;

    let options = GalleryBuildOptions {
        run_detector: config.run_detector,
        match_threshold: settings.match_threshold,
        allow_grow: false,
    };
    let gallery = build_gallery(&config.gallery_dir, &mut analyzer, &options, None)?;
    tracing::info!(
        dir = %config.gallery_dir.display(),
        identities = gallery.identity_count(),
        algorithm = %settings.match_algo,
        "gallery ready"
    );

    spawn_worker(FrameProcessor::new(analyzer, Arc::new(gallery), &settings))
}

/// Run `processor` on a dedicated OS thread serving recognition requests.
pub fn spawn_worker<D, A, E>(mut processor: FrameProcessor<D, A, E>) -> Result<EngineHandle, EngineError>
where
    D: Detector + Send + 'static,
    A: Aligner + Send + 'static,
    E: Embedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceid-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { media, reply } => {
                        let result = run_recognize(&mut processor, &media);
                        match &result {
                            Ok(label) => tracing::info!(files = media.len(), label = %label, "person identified"),
                            Err(err) => tracing::warn!(files = media.len(), error = %err, "recognition failed"),
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle::new(tx))
}

/// One session over all files: every frame of every file votes.
fn run_recognize<D, A, E>(processor: &mut FrameProcessor<D, A, E>, media: &[PathBuf]) -> Result<String, EngineError>
where
    D: Detector,
    A: Aligner,
    E: Embedder,
{
    if media.is_empty() {
        return Err(EngineError::NoMedia);
    }

    let mut tally = SessionTally::new();
    for path in media {
        let mut capture = open_capture(&path.to_string_lossy(), false)?;
        let stats = run_session(&mut capture, processor, None, &RunOptions::default(), &mut tally)?;
        tracing::debug!(path = %path.display(), frames = stats.frames, faces = stats.faces, "media processed");
    }
    Ok(tally.finalize().map_err(PipelineError::from)?)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_recognize_votes_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let media = vec![
            write_image(dir.path(), "1.png", [0, 255, 0]),
            write_image(dir.path(), "2.png", [255, 0, 0]),
            write_image(dir.path(), "3.png", [250, 10, 0]),
        ];
        assert_eq!(run_recognize(&mut processor(), &media).unwrap(), "Alice");
    }

    #[test]
    fn test_recognize_error_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor();

        assert_eq!(run_recognize(&mut processor, &[]).unwrap_err().kind(), "NoMedia");

        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"\0").unwrap();
        assert_eq!(run_recognize(&mut processor, &[video]).unwrap_err().kind(), "UnsupportedInput");

        let broken = dir.path().join("broken.jpg");
        std::fs::write(&broken, b"not a jpeg").unwrap();
        assert_eq!(run_recognize(&mut processor, &[broken]).unwrap_err().kind(), "UnreadableInput");
    }

    #[test]
    fn test_folder_input_skips_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "a.png", [0, 255, 0]);
        std::fs::write(dir.path().join("b_broken.jpg"), b"not a jpeg").unwrap();
        write_image(dir.path(), "c.png", [255, 0, 0]);
        write_image(dir.path(), "d.png", [250, 10, 0]);

        let mut capture = open_capture(&dir.path().to_string_lossy(), false).unwrap();
        let label = faceid_core::identify(&mut capture, &mut processor(), None, &RunOptions::default()).unwrap();
        assert_eq!(label, "Alice");
    }

    #[tokio::test]
    async fn test_worker_thread_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let media = vec![write_image(dir.path(), "bob.png", [0, 200, 0])];

        let engine = spawn_worker(processor()).unwrap();
        assert_eq!(engine.recognize(media).await.unwrap(), "Bob");
        assert_eq!(engine.recognize(Vec::new()).await.unwrap_err().kind(), "NoMedia");
    }

    #[tokio::test]
    async fn test_closed_engine() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = EngineHandle::new(tx).recognize(vec![PathBuf::from("x.jpg")]).await.unwrap_err();
        assert_eq!(err.kind(), "EngineUnavailable");
    }
}
