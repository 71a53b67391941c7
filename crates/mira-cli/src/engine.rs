use image::RgbImage;
use mira_core::{FrameProcessingError, GalleryEntry, RecognitionPipeline, RecognitionResult};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Frame(#[from] FrameProcessingError),
    #[error("frame processing exceeded {0:?}")]
    Timeout(Duration),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

type FrameReply = oneshot::Sender<Result<Vec<RecognitionResult>, FrameProcessingError>>;

/// Messages sent from the async drivers to the engine thread.
enum EngineRequest {
    Recognize { frame: RgbImage, reply: FrameReply },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Option<Duration>,
}

impl EngineHandle {
    /// Recognize every face in `frame` against the engine's gallery snapshot.
    ///
    /// A frame that runs past the timeout is abandoned; the engine finishes it
    /// in the background and discards the result.
    pub async fn recognize(&self, frame: RgbImage) -> Result<Vec<RecognitionResult>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| EngineError::Timeout(limit))?,
            None => reply_rx.await,
        };
        Ok(reply.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the pipeline (inference sessions are blocking and `!Sync`)
/// and a snapshot of the gallery. It exits once every handle is dropped.
pub fn spawn_engine(
    mut pipeline: RecognitionPipeline,
    gallery: Vec<GalleryEntry>,
    timeout: Option<Duration>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(2);

    std::thread::Builder::new()
        .name("mira-engine".into())
        .spawn(move || {
            tracing::info!(gallery = gallery.len(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { frame, reply } => {
                        let started = std::time::Instant::now();
                        let result = pipeline.process_frame(&frame, &gallery);
                        tracing::debug!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            ok = result.is_ok(),
                            "frame done"
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}
